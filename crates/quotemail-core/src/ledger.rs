//! Durable send ledger backed by redb.
//!
//! # Tables
//!
//! ```text
//! SENDS      "<sha256(recipient)>:<fingerprint>"  -> SendEntry (JSON)
//! LOCKS      "<sha256(recipient)>:<fingerprint>"  -> Reservation (JSON, in progress or unknown)
//! EVENTS     [ ts_ms BE (8) | uuid (16) ]          -> LedgerEvent (JSON)
//! OVERRIDES  [ ts_ms BE (8) | uuid (16) ]          -> Override (JSON)
//! ```
//!
//! `EVENTS` and `OVERRIDES` use a timestamp-prefixed composite key, so key
//! order is chronological and history reads are a reverse scan.
//!
//! The check for a prior send and the write of the reservation happen in one
//! write transaction. redb admits a single writer at a time and holds an
//! exclusive lock on the file, so two processes cannot both reserve the same
//! key; commits are crash-atomic.
//!
//! A reservation that was never settled means the outcome of that attempt
//! is unknown: the message may have gone out. Such keys (an expired
//! in-progress reservation, or one explicitly held with
//! [`Ledger::mark_unknown_sent`]) are never taken over silently. They need an
//! override or a confirmed re-send.
//!
//! Entries are never deleted implicitly. [`Ledger::cleanup`] removes entries
//! older than a caller-supplied cutoff.

use crate::config::RerunScope;
use crate::error::{QuoteError, Result};
use crate::fingerprint::{normalize_recipient, recipient_hash};
use crate::mask::mask_email;
use chrono::{DateTime, Duration, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

const SENDS: TableDefinition<&str, &[u8]> = TableDefinition::new("sends");
const LOCKS: TableDefinition<&str, &[u8]> = TableDefinition::new("locks");
const EVENTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("events");
const OVERRIDES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("overrides");

pub const MIN_OVERRIDE_MINUTES: i64 = 1;
pub const MAX_OVERRIDE_MINUTES: i64 = 30;
const MIN_RESERVATION_SECS: i64 = 60;
const MIN_UNKNOWN_HOLD_SECS: i64 = 300;

fn ledger_err(e: impl std::fmt::Display) -> QuoteError {
    QuoteError::Ledger(e.to_string())
}

fn time_key(ts: DateTime<Utc>, id: Uuid) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = ts.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key[8..].copy_from_slice(id.as_bytes());
    key
}

// ---------------------------------------------------------------------------
// Keys and records
// ---------------------------------------------------------------------------

/// Ledger key for one (recipient, payload) pair. The address itself is only
/// kept hashed and masked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerKey {
    pub recipient_hash: String,
    pub recipient_masked: String,
    pub fingerprint: String,
}

impl LedgerKey {
    pub fn new(recipient: &str, fingerprint: &str) -> Self {
        let norm = normalize_recipient(recipient);
        Self {
            recipient_hash: recipient_hash(&norm),
            recipient_masked: mask_email(&norm),
            fingerprint: fingerprint.to_string(),
        }
    }

    /// Stable string form; also the target of a request-key override.
    pub fn id(&self) -> String {
        format!("{}:{}", self.recipient_hash, self.fingerprint)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendEntry {
    pub recipient_hash: String,
    pub fingerprint: String,
    pub sent_at: DateTime<Utc>,
    pub run_id: String,
    pub message_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    /// A send is under way.
    #[default]
    InProgress,
    /// The message was handed to the transport but the send could not be
    /// recorded.
    UnknownSent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub run_id: String,
    pub reserved_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub status: ReservationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Sent,
    Skipped,
    Failed,
    Unknown,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub id: Uuid,
    pub at: DateTime<Utc>,
    pub kind: EventKind,
    pub key: String,
    pub recipient_masked: String,
    pub run_id: String,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub detail: String,
    #[serde(default)]
    pub decision_trace: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideKind {
    /// Matches one (recipient, payload) key.
    RequestKey,
    /// Matches every payload for one recipient.
    Recipient,
}

impl OverrideKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequestKey => "request_key",
            Self::Recipient => "recipient",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Override {
    pub id: Uuid,
    pub kind: OverrideKind,
    pub target: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub reason: String,
    pub operator: String,
}

impl Override {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at >= now
    }
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// Inputs to a ledger decision that come from the running batch.
#[derive(Debug, Clone)]
pub struct CheckContext {
    pub run_id: String,
    pub scope: RerunScope,
    pub window: Duration,
    pub now: DateTime<Utc>,
}

impl CheckContext {
    fn matches(&self, entry: &SendEntry) -> bool {
        let in_scope = match self.scope {
            RerunScope::Global => true,
            RerunScope::Run => entry.run_id == self.run_id,
        };
        in_scope && entry.sent_at + self.window > self.now
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// No matching prior send (or an override applies): go ahead.
    Send { trace: Vec<String> },
    /// A matching send inside the rerun window, no override.
    Duplicate {
        previous: SendEntry,
        trace: Vec<String>,
    },
    /// Another reservation for this key is still live.
    Locked { reservation: Reservation },
    /// An earlier attempt was never settled, so it may have been delivered.
    /// Sending again needs an override or a confirmed re-send.
    Unknown {
        reservation: Reservation,
        trace: Vec<String>,
    },
}

impl Decision {
    pub fn trace(&self) -> &[String] {
        match self {
            Self::Send { trace } | Self::Duplicate { trace, .. } | Self::Unknown { trace, .. } => {
                trace.as_slice()
            }
            Self::Locked { .. } => &[],
        }
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

pub struct Ledger {
    db: Database,
}

impl Ledger {
    /// Open or create the ledger at `path`, creating every table.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(ledger_err)?;
        let wt = db.begin_write().map_err(ledger_err)?;
        wt.open_table(SENDS).map_err(ledger_err)?;
        wt.open_table(LOCKS).map_err(ledger_err)?;
        wt.open_table(EVENTS).map_err(ledger_err)?;
        wt.open_table(OVERRIDES).map_err(ledger_err)?;
        wt.commit().map_err(ledger_err)?;
        Ok(Self { db })
    }

    pub fn entry(&self, key: &LedgerKey) -> Result<Option<SendEntry>> {
        let rt = self.db.begin_read().map_err(ledger_err)?;
        let table = rt.open_table(SENDS).map_err(ledger_err)?;
        let value = table.get(key.id().as_str()).map_err(ledger_err)?;
        value
            .map(|v| serde_json::from_slice(v.value()).map_err(ledger_err))
            .transpose()
    }

    /// Read-only decision. Used by dry runs and to decide whether to ask
    /// for rerun confirmation before reserving.
    pub fn check(&self, key: &LedgerKey, ctx: &CheckContext) -> Result<Decision> {
        let rt = self.db.begin_read().map_err(ledger_err)?;
        let sends = rt.open_table(SENDS).map_err(ledger_err)?;
        let locks = rt.open_table(LOCKS).map_err(ledger_err)?;
        let overrides = rt.open_table(OVERRIDES).map_err(ledger_err)?;
        let id = key.id();

        let lock = read_json::<Reservation>(locks.get(id.as_str()).map_err(ledger_err)?)?;
        let previous = read_json::<SendEntry>(sends.get(id.as_str()).map_err(ledger_err)?)?;
        let all_overrides = scan_overrides(&overrides)?;
        Ok(decide(key, ctx, lock, previous, &all_overrides, false))
    }

    /// Check and reserve in one write transaction. On [`Decision::Send`] a
    /// reservation row now exists and must be settled with
    /// [`mark_sent`](Self::mark_sent) or [`release`](Self::release).
    ///
    /// `force` skips the prior-send check and releases an unsettled
    /// reservation; the caller has obtained explicit confirmation.
    pub fn reserve(
        &self,
        key: &LedgerKey,
        ctx: &CheckContext,
        ttl_secs: u64,
        force: bool,
    ) -> Result<Decision> {
        let id = key.id();
        let wt = self.db.begin_write().map_err(ledger_err)?;
        let decision = {
            let sends = wt.open_table(SENDS).map_err(ledger_err)?;
            let mut locks = wt.open_table(LOCKS).map_err(ledger_err)?;
            let overrides = wt.open_table(OVERRIDES).map_err(ledger_err)?;

            let lock = read_json::<Reservation>(locks.get(id.as_str()).map_err(ledger_err)?)?;
            let previous = read_json::<SendEntry>(sends.get(id.as_str()).map_err(ledger_err)?)?;
            let all_overrides = scan_overrides(&overrides)?;
            let decision = decide(key, ctx, lock, previous, &all_overrides, force);

            if matches!(decision, Decision::Send { .. }) {
                let ttl = i64::try_from(ttl_secs).unwrap_or(i64::MAX).max(MIN_RESERVATION_SECS);
                let reservation = Reservation {
                    run_id: ctx.run_id.clone(),
                    reserved_at: ctx.now,
                    expires_at: ctx.now + Duration::seconds(ttl),
                    status: ReservationStatus::InProgress,
                    message_id: None,
                };
                let value = serde_json::to_vec(&reservation)?;
                locks
                    .insert(id.as_str(), value.as_slice())
                    .map_err(ledger_err)?;
            }
            decision
        };
        wt.commit().map_err(ledger_err)?;
        Ok(decision)
    }

    /// Settle a reservation as sent: the entry is written (replacing a stale
    /// one) and a `sent` event appended.
    pub fn mark_sent(
        &self,
        key: &LedgerKey,
        ctx: &CheckContext,
        message_id: &str,
        trace: &[String],
    ) -> Result<()> {
        let id = key.id();
        let entry = SendEntry {
            recipient_hash: key.recipient_hash.clone(),
            fingerprint: key.fingerprint.clone(),
            sent_at: ctx.now,
            run_id: ctx.run_id.clone(),
            message_id: message_id.to_string(),
        };
        let event = self.event(key, ctx, EventKind::Sent, Some(message_id), "", trace);

        let wt = self.db.begin_write().map_err(ledger_err)?;
        {
            let mut sends = wt.open_table(SENDS).map_err(ledger_err)?;
            let value = serde_json::to_vec(&entry)?;
            sends
                .insert(id.as_str(), value.as_slice())
                .map_err(ledger_err)?;
            let mut locks = wt.open_table(LOCKS).map_err(ledger_err)?;
            locks.remove(id.as_str()).map_err(ledger_err)?;
            let mut events = wt.open_table(EVENTS).map_err(ledger_err)?;
            insert_event(&mut events, &event)?;
        }
        wt.commit().map_err(ledger_err)?;
        Ok(())
    }

    /// Hold a key whose message was handed to the transport but could not be
    /// recorded as sent. The hold lasts at least five minutes and keeps the
    /// key out of automatic sends until an override or confirmation.
    pub fn mark_unknown_sent(
        &self,
        key: &LedgerKey,
        ctx: &CheckContext,
        hold_secs: u64,
        message_id: Option<&str>,
        reason: &str,
        trace: &[String],
    ) -> Result<()> {
        let id = key.id();
        let hold = i64::try_from(hold_secs).unwrap_or(i64::MAX).max(MIN_UNKNOWN_HOLD_SECS);
        let reservation = Reservation {
            run_id: ctx.run_id.clone(),
            reserved_at: ctx.now,
            expires_at: ctx.now + Duration::seconds(hold),
            status: ReservationStatus::UnknownSent,
            message_id: message_id.map(str::to_string),
        };
        let event = self.event(key, ctx, EventKind::Unknown, message_id, reason, trace);
        let wt = self.db.begin_write().map_err(ledger_err)?;
        {
            let mut locks = wt.open_table(LOCKS).map_err(ledger_err)?;
            let value = serde_json::to_vec(&reservation)?;
            locks
                .insert(id.as_str(), value.as_slice())
                .map_err(ledger_err)?;
            let mut events = wt.open_table(EVENTS).map_err(ledger_err)?;
            insert_event(&mut events, &event)?;
        }
        wt.commit().map_err(ledger_err)?;
        tracing::warn!(recipient = %key.recipient_masked, run_id = %ctx.run_id, "send outcome unknown; key held");
        Ok(())
    }

    /// Drop a reservation after a failed send and record why.
    pub fn release(&self, key: &LedgerKey, ctx: &CheckContext, reason: &str, trace: &[String]) -> Result<()> {
        let id = key.id();
        let event = self.event(key, ctx, EventKind::Failed, None, reason, trace);
        let wt = self.db.begin_write().map_err(ledger_err)?;
        {
            let mut locks = wt.open_table(LOCKS).map_err(ledger_err)?;
            locks.remove(id.as_str()).map_err(ledger_err)?;
            let mut events = wt.open_table(EVENTS).map_err(ledger_err)?;
            insert_event(&mut events, &event)?;
        }
        wt.commit().map_err(ledger_err)?;
        Ok(())
    }

    /// Append a `skipped` event. The send entry is left untouched.
    pub fn record_skip(&self, key: &LedgerKey, ctx: &CheckContext, reason: &str, trace: &[String]) -> Result<()> {
        let event = self.event(key, ctx, EventKind::Skipped, None, reason, trace);
        let wt = self.db.begin_write().map_err(ledger_err)?;
        {
            let mut events = wt.open_table(EVENTS).map_err(ledger_err)?;
            insert_event(&mut events, &event)?;
        }
        wt.commit().map_err(ledger_err)?;
        Ok(())
    }

    fn event(
        &self,
        key: &LedgerKey,
        ctx: &CheckContext,
        kind: EventKind,
        message_id: Option<&str>,
        detail: &str,
        trace: &[String],
    ) -> LedgerEvent {
        LedgerEvent {
            id: Uuid::new_v4(),
            at: ctx.now,
            kind,
            key: key.id(),
            recipient_masked: key.recipient_masked.clone(),
            run_id: ctx.run_id.clone(),
            message_id: message_id.map(str::to_string),
            detail: detail.to_string(),
            decision_trace: trace.to_vec(),
        }
    }

    /// Most recent events first; `limit` of 0 means all.
    pub fn history(&self, limit: usize) -> Result<Vec<LedgerEvent>> {
        let rt = self.db.begin_read().map_err(ledger_err)?;
        let table = rt.open_table(EVENTS).map_err(ledger_err)?;
        let mut result = Vec::new();
        for entry in table.iter().map_err(ledger_err)?.rev() {
            let (_, v) = entry.map_err(ledger_err)?;
            result.push(serde_json::from_slice(v.value()).map_err(ledger_err)?);
            if limit > 0 && result.len() >= limit {
                break;
            }
        }
        Ok(result)
    }

    /// Remove send entries last sent before `cutoff` and reservations that
    /// expired before it. Returns (entries removed, reservations removed).
    pub fn cleanup(&self, cutoff: DateTime<Utc>) -> Result<(usize, usize)> {
        let wt = self.db.begin_write().map_err(ledger_err)?;
        let counts = {
            let mut sends = wt.open_table(SENDS).map_err(ledger_err)?;
            let mut stale = Vec::new();
            for entry in sends.iter().map_err(ledger_err)? {
                let (k, v) = entry.map_err(ledger_err)?;
                let send: SendEntry = serde_json::from_slice(v.value()).map_err(ledger_err)?;
                if send.sent_at < cutoff {
                    stale.push(k.value().to_string());
                }
            }
            for k in &stale {
                sends.remove(k.as_str()).map_err(ledger_err)?;
            }

            let mut locks = wt.open_table(LOCKS).map_err(ledger_err)?;
            let mut expired = Vec::new();
            for entry in locks.iter().map_err(ledger_err)? {
                let (k, v) = entry.map_err(ledger_err)?;
                let lock: Reservation = serde_json::from_slice(v.value()).map_err(ledger_err)?;
                if lock.expires_at < cutoff {
                    expired.push(k.value().to_string());
                }
            }
            for k in &expired {
                locks.remove(k.as_str()).map_err(ledger_err)?;
            }
            (stale.len(), expired.len())
        };
        wt.commit().map_err(ledger_err)?;
        tracing::info!(entries = counts.0, reservations = counts.1, %cutoff, "ledger cleanup");
        Ok(counts)
    }

    // -----------------------------------------------------------------------
    // Overrides
    // -----------------------------------------------------------------------

    /// Register a time-limited rerun override. The TTL is clamped to
    /// 1..=30 minutes and a reason is mandatory.
    pub fn add_override(
        &self,
        kind: OverrideKind,
        target: &str,
        ttl_minutes: i64,
        reason: &str,
        operator: &str,
        now: DateTime<Utc>,
    ) -> Result<Override> {
        if reason.trim().is_empty() {
            return Err(QuoteError::InvalidInput("an override needs a reason".to_string()));
        }
        if target.trim().is_empty() {
            return Err(QuoteError::InvalidInput("an override needs a target".to_string()));
        }
        let ttl = ttl_minutes.clamp(MIN_OVERRIDE_MINUTES, MAX_OVERRIDE_MINUTES);
        let ov = Override {
            id: Uuid::new_v4(),
            kind,
            target: target.trim().to_string(),
            created_at: now,
            expires_at: now + Duration::minutes(ttl),
            reason: reason.trim().to_string(),
            operator: operator.to_string(),
        };
        let key = time_key(ov.created_at, ov.id);
        let value = serde_json::to_vec(&ov)?;
        let wt = self.db.begin_write().map_err(ledger_err)?;
        {
            let mut table = wt.open_table(OVERRIDES).map_err(ledger_err)?;
            table
                .insert(key.as_slice(), value.as_slice())
                .map_err(ledger_err)?;
        }
        wt.commit().map_err(ledger_err)?;
        tracing::info!(kind = kind.as_str(), ttl_minutes = ttl, "override registered");
        Ok(ov)
    }

    /// Active overrides, newest first.
    pub fn override_status(&self, now: DateTime<Utc>) -> Result<Vec<Override>> {
        let rt = self.db.begin_read().map_err(ledger_err)?;
        let table = rt.open_table(OVERRIDES).map_err(ledger_err)?;
        let mut active: Vec<Override> = scan_overrides(&table)?
            .into_iter()
            .filter(|o| o.is_active(now))
            .collect();
        active.reverse();
        Ok(active)
    }

    pub fn clear_overrides(&self) -> Result<usize> {
        let wt = self.db.begin_write().map_err(ledger_err)?;
        let count = {
            let mut table = wt.open_table(OVERRIDES).map_err(ledger_err)?;
            let mut keys = Vec::new();
            for entry in table.iter().map_err(ledger_err)? {
                let (k, _) = entry.map_err(ledger_err)?;
                keys.push(k.value().to_vec());
            }
            for k in &keys {
                table.remove(k.as_slice()).map_err(ledger_err)?;
            }
            keys.len()
        };
        wt.commit().map_err(ledger_err)?;
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Decision logic
// ---------------------------------------------------------------------------

fn read_json<T: serde::de::DeserializeOwned>(
    guard: Option<redb::AccessGuard<'_, &'static [u8]>>,
) -> Result<Option<T>> {
    guard
        .map(|g| serde_json::from_slice(g.value()).map_err(ledger_err))
        .transpose()
}

fn scan_overrides(table: &impl ReadableTable<&'static [u8], &'static [u8]>) -> Result<Vec<Override>> {
    let mut result = Vec::new();
    for entry in table.iter().map_err(ledger_err)? {
        let (_, v) = entry.map_err(ledger_err)?;
        result.push(serde_json::from_slice(v.value()).map_err(ledger_err)?);
    }
    Ok(result)
}

fn insert_event(
    table: &mut redb::Table<'_, &'static [u8], &'static [u8]>,
    event: &LedgerEvent,
) -> Result<()> {
    let key = time_key(event.at, event.id);
    let value = serde_json::to_vec(event)?;
    table
        .insert(key.as_slice(), value.as_slice())
        .map_err(ledger_err)?;
    Ok(())
}

/// Latest override of `kind` for `target`: (active one, any one).
fn lookup_override<'o>(
    overrides: &'o [Override],
    kind: OverrideKind,
    target: &str,
    now: DateTime<Utc>,
) -> (Option<&'o Override>, Option<&'o Override>) {
    let matching = || {
        overrides
            .iter()
            .rev()
            .filter(move |o| o.kind == kind && o.target == target)
    };
    (matching().find(|o| o.is_active(now)), matching().next())
}

/// Override evaluation: request key first, then recipient. The trace names
/// each check and its result.
fn evaluate_overrides(
    key: &LedgerKey,
    overrides: &[Override],
    now: DateTime<Utc>,
) -> (Option<OverrideKind>, Vec<String>) {
    let mut trace = Vec::new();
    let id = key.id();
    for (kind, target) in [
        (OverrideKind::RequestKey, id.as_str()),
        (OverrideKind::Recipient, key.recipient_hash.as_str()),
    ] {
        let (active, latest) = lookup_override(overrides, kind, target, now);
        if active.is_some() {
            trace.push(format!("override_check:{}=matched_active", kind.as_str()));
            trace.push(format!("override_applied:{}", kind.as_str()));
            return (Some(kind), trace);
        }
        let state = if latest.is_some() {
            "expired_or_inactive"
        } else {
            "not_found"
        };
        trace.push(format!("override_check:{}={state}", kind.as_str()));
    }
    trace.push("override_applied:none".to_string());
    (None, trace)
}

fn decide(
    key: &LedgerKey,
    ctx: &CheckContext,
    lock: Option<Reservation>,
    previous: Option<SendEntry>,
    overrides: &[Override],
    force: bool,
) -> Decision {
    if let Some(reservation) = lock {
        let live = reservation.expires_at > ctx.now;
        let state = match reservation.status {
            ReservationStatus::InProgress if live => return Decision::Locked { reservation },
            ReservationStatus::InProgress => "reservation:in_progress_expired",
            ReservationStatus::UnknownSent if live => "reservation:unknown_sent_hold_active",
            ReservationStatus::UnknownSent => "reservation:unknown_sent_hold_expired",
        };
        let mut trace = vec![state.to_string()];
        if force {
            trace.push("rerun:confirmed".to_string());
        } else {
            let (applied, override_trace) = evaluate_overrides(key, overrides, ctx.now);
            trace.extend(override_trace);
            if applied.is_none() {
                return Decision::Unknown { reservation, trace };
            }
        }
        tracing::warn!(
            recipient = %key.recipient_masked,
            run_id = %reservation.run_id,
            "taking over unsettled reservation"
        );
        trace.push("reservation:expired_takeover".to_string());
        return Decision::Send { trace };
    }

    let Some(previous) = previous.filter(|p| ctx.matches(p)) else {
        return Decision::Send {
            trace: vec!["ledger:unseen_or_outside_window".to_string()],
        };
    };

    let mut trace = vec!["ledger:seen_within_window".to_string()];
    if force {
        trace.push("rerun:confirmed".to_string());
        return Decision::Send { trace };
    }
    let (applied, override_trace) = evaluate_overrides(key, overrides, ctx.now);
    trace.extend(override_trace);
    match applied {
        Some(_) => Decision::Send { trace },
        None => Decision::Duplicate { previous, trace },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TTL: u64 = 2700;

    fn open_tmp() -> (TempDir, Ledger) {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::open(&dir.path().join("nested/ledger.redb")).unwrap();
        (dir, ledger)
    }

    fn ctx(run: &str, now: DateTime<Utc>) -> CheckContext {
        CheckContext {
            run_id: run.to_string(),
            scope: RerunScope::Global,
            window: Duration::hours(24),
            now,
        }
    }

    fn key() -> LedgerKey {
        LedgerKey::new("Tanaka@Example.com", "fp:v1:abc")
    }

    fn send(ledger: &Ledger, key: &LedgerKey, c: &CheckContext) {
        let d = ledger.reserve(key, c, TTL, false).unwrap();
        assert!(matches!(d, Decision::Send { .. }), "{d:?}");
        ledger.mark_sent(key, c, "<m1@example.com>", d.trace()).unwrap();
    }

    #[test]
    fn key_normalizes_and_hides_recipient() {
        let a = LedgerKey::new(" TANAKA@example.com ", "fp");
        let b = LedgerKey::new("tanaka@example.com", "fp");
        assert_eq!(a, b);
        assert!(!a.id().contains("tanaka"));
        assert_eq!(a.recipient_masked, "tan***@example.com");
    }

    #[test]
    fn unseen_key_sends_and_records_entry() {
        let (_dir, ledger) = open_tmp();
        let now = Utc::now();
        send(&ledger, &key(), &ctx("run-1", now));
        let entry = ledger.entry(&key()).unwrap().unwrap();
        assert_eq!(entry.sent_at, now);
        assert_eq!(entry.run_id, "run-1");
        assert_eq!(entry.message_id, "<m1@example.com>");
    }

    #[test]
    fn rerun_within_window_is_duplicate_and_entry_unchanged() {
        let (_dir, ledger) = open_tmp();
        let t0 = Utc::now();
        send(&ledger, &key(), &ctx("run-1", t0));

        let later = ctx("run-2", t0 + Duration::hours(1));
        let d = ledger.reserve(&key(), &later, TTL, false).unwrap();
        match &d {
            Decision::Duplicate { previous, trace } => {
                assert_eq!(previous.sent_at, t0);
                assert!(trace.contains(&"override_applied:none".to_string()));
            }
            other => panic!("expected duplicate, got {other:?}"),
        }
        ledger.record_skip(&key(), &later, "duplicate", d.trace()).unwrap();
        assert_eq!(ledger.entry(&key()).unwrap().unwrap().sent_at, t0);
    }

    #[test]
    fn entry_outside_window_is_overwritten() {
        let (_dir, ledger) = open_tmp();
        let t0 = Utc::now();
        send(&ledger, &key(), &ctx("run-1", t0));
        let t1 = t0 + Duration::hours(25);
        send(&ledger, &key(), &ctx("run-2", t1));
        let entry = ledger.entry(&key()).unwrap().unwrap();
        assert_eq!(entry.sent_at, t1);
        assert_eq!(entry.run_id, "run-2");
    }

    #[test]
    fn different_fingerprint_is_not_blocked() {
        let (_dir, ledger) = open_tmp();
        let now = Utc::now();
        send(&ledger, &key(), &ctx("run-1", now));
        let other = LedgerKey::new("tanaka@example.com", "fp:v1:other");
        assert!(matches!(
            ledger.check(&other, &ctx("run-1", now)).unwrap(),
            Decision::Send { .. }
        ));
    }

    #[test]
    fn run_scope_ignores_other_runs() {
        let (_dir, ledger) = open_tmp();
        let now = Utc::now();
        send(&ledger, &key(), &ctx("run-1", now));
        let mut scoped = ctx("run-2", now + Duration::minutes(5));
        scoped.scope = RerunScope::Run;
        assert!(matches!(ledger.check(&key(), &scoped).unwrap(), Decision::Send { .. }));
        scoped.run_id = "run-1".into();
        assert!(matches!(ledger.check(&key(), &scoped).unwrap(), Decision::Duplicate { .. }));
    }

    #[test]
    fn live_reservation_blocks_second_reserve() {
        let (_dir, ledger) = open_tmp();
        let now = Utc::now();
        let d = ledger.reserve(&key(), &ctx("run-1", now), TTL, false).unwrap();
        assert!(matches!(d, Decision::Send { .. }));
        let second = ledger.reserve(&key(), &ctx("run-2", now), TTL, false).unwrap();
        assert!(matches!(second, Decision::Locked { .. }));
    }

    #[test]
    fn expired_reservation_is_unknown_not_taken_over() {
        let (_dir, ledger) = open_tmp();
        let now = Utc::now();
        ledger.reserve(&key(), &ctx("crashed", now), TTL, false).unwrap();

        let much_later = ctx("run-2", now + Duration::hours(1));
        match ledger.reserve(&key(), &much_later, TTL, false).unwrap() {
            Decision::Unknown { reservation, trace } => {
                assert_eq!(reservation.run_id, "crashed");
                assert_eq!(trace[0], "reservation:in_progress_expired");
                assert!(trace.contains(&"override_applied:none".to_string()));
            }
            other => panic!("expected unknown, got {other:?}"),
        }

        // A confirmed re-send takes the key over and says so.
        let d = ledger.reserve(&key(), &much_later, TTL, true).unwrap();
        assert!(matches!(d, Decision::Send { .. }));
        assert_eq!(
            d.trace(),
            ["reservation:in_progress_expired", "rerun:confirmed", "reservation:expired_takeover"]
        );
        assert!(matches!(
            ledger.reserve(&key(), &ctx("run-3", now + Duration::hours(1)), TTL, false).unwrap(),
            Decision::Locked { .. }
        ));
    }

    #[test]
    fn unknown_sent_hold_blocks_until_override() {
        let (_dir, ledger) = open_tmp();
        let t0 = Utc::now();
        let c = ctx("run-1", t0);
        ledger.reserve(&key(), &c, TTL, false).unwrap();
        ledger
            .mark_unknown_sent(&key(), &c, 60, Some("<m1@example.com>"), "ledger write failed", &[])
            .unwrap();
        assert!(ledger.entry(&key()).unwrap().is_none());
        assert_eq!(ledger.history(1).unwrap()[0].kind, EventKind::Unknown);

        // Still held after the hold period ends; the minimum hold is five minutes.
        for minutes in [1, 10] {
            let d = ledger.check(&key(), &ctx("run-2", t0 + Duration::minutes(minutes))).unwrap();
            let Decision::Unknown { reservation, trace } = d else {
                panic!("expected unknown at +{minutes}m");
            };
            assert_eq!(reservation.status, ReservationStatus::UnknownSent);
            assert_eq!(reservation.message_id.as_deref(), Some("<m1@example.com>"));
            let expected = if minutes == 1 { "active" } else { "expired" };
            assert_eq!(trace[0], format!("reservation:unknown_sent_hold_{expected}"));
        }

        ledger
            .add_override(OverrideKind::Recipient, &key().recipient_hash, 10, "bounced", "ops", t0)
            .unwrap();
        let d = ledger.reserve(&key(), &ctx("run-2", t0 + Duration::minutes(2)), TTL, false).unwrap();
        assert!(matches!(d, Decision::Send { .. }));
        assert!(d.trace().contains(&"override_applied:recipient".to_string()));
        assert_eq!(d.trace().last().unwrap(), "reservation:expired_takeover");
    }

    #[test]
    fn release_frees_the_key_without_an_entry() {
        let (_dir, ledger) = open_tmp();
        let c = ctx("run-1", Utc::now());
        ledger.reserve(&key(), &c, TTL, false).unwrap();
        ledger.release(&key(), &c, "smtp 550", &[]).unwrap();
        assert!(ledger.entry(&key()).unwrap().is_none());
        assert!(matches!(ledger.check(&key(), &c).unwrap(), Decision::Send { .. }));
        assert_eq!(ledger.history(0).unwrap()[0].kind, EventKind::Failed);
    }

    #[test]
    fn force_bypasses_prior_send() {
        let (_dir, ledger) = open_tmp();
        let t0 = Utc::now();
        send(&ledger, &key(), &ctx("run-1", t0));
        let d = ledger
            .reserve(&key(), &ctx("run-2", t0 + Duration::minutes(1)), TTL, true)
            .unwrap();
        assert!(d.trace().contains(&"rerun:confirmed".to_string()));
    }

    #[test]
    fn request_key_override_wins_and_is_traced() {
        let (_dir, ledger) = open_tmp();
        let t0 = Utc::now();
        send(&ledger, &key(), &ctx("run-1", t0));
        ledger
            .add_override(OverrideKind::RequestKey, &key().id(), 10, "customer asked again", "ops", t0)
            .unwrap();
        let d = ledger.check(&key(), &ctx("run-2", t0 + Duration::minutes(5))).unwrap();
        assert!(matches!(d, Decision::Send { .. }));
        assert_eq!(
            d.trace(),
            [
                "ledger:seen_within_window",
                "override_check:request_key=matched_active",
                "override_applied:request_key",
            ]
        );
    }

    #[test]
    fn recipient_override_and_expiry() {
        let (_dir, ledger) = open_tmp();
        let t0 = Utc::now();
        send(&ledger, &key(), &ctx("run-1", t0));
        ledger
            .add_override(OverrideKind::Recipient, &key().recipient_hash, 120, "resend", "ops", t0)
            .unwrap();

        // TTL clamps to 30 minutes.
        let status = ledger.override_status(t0).unwrap();
        assert_eq!(status[0].expires_at, t0 + Duration::minutes(30));

        let d = ledger.check(&key(), &ctx("run-2", t0 + Duration::minutes(10))).unwrap();
        assert!(d.trace().contains(&"override_applied:recipient".to_string()));

        let d = ledger.check(&key(), &ctx("run-2", t0 + Duration::minutes(31))).unwrap();
        assert!(matches!(d, Decision::Duplicate { .. }));
        assert!(d
            .trace()
            .contains(&"override_check:recipient=expired_or_inactive".to_string()));
        assert!(ledger.override_status(t0 + Duration::minutes(31)).unwrap().is_empty());
    }

    #[test]
    fn override_requires_reason_and_clear_removes_all() {
        let (_dir, ledger) = open_tmp();
        let now = Utc::now();
        assert!(matches!(
            ledger.add_override(OverrideKind::Recipient, "h", 5, "  ", "ops", now),
            Err(QuoteError::InvalidInput(_))
        ));
        ledger.add_override(OverrideKind::Recipient, "h", 5, "r", "ops", now).unwrap();
        ledger.add_override(OverrideKind::RequestKey, "k", 5, "r", "ops", now).unwrap();
        assert_eq!(ledger.clear_overrides().unwrap(), 2);
        assert!(ledger.override_status(now).unwrap().is_empty());
    }

    #[test]
    fn history_is_newest_first_and_limited() {
        let (_dir, ledger) = open_tmp();
        let t0 = Utc::now();
        send(&ledger, &key(), &ctx("run-1", t0));
        let later = ctx("run-2", t0 + Duration::seconds(5));
        ledger.record_skip(&key(), &later, "duplicate", &[]).unwrap();

        let all = ledger.history(0).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].kind, EventKind::Skipped);
        assert_eq!(all[1].kind, EventKind::Sent);
        assert_eq!(all[1].recipient_masked, "tan***@example.com");
        assert_eq!(ledger.history(1).unwrap().len(), 1);
    }

    #[test]
    fn cleanup_is_explicit_and_cutoff_based() {
        let (_dir, ledger) = open_tmp();
        let t0 = Utc::now() - Duration::days(10);
        send(&ledger, &key(), &ctx("run-1", t0));
        let recent = LedgerKey::new("sato@example.com", "fp:v1:abc");
        send(&ledger, &recent, &ctx("run-2", Utc::now()));

        let (entries, _) = ledger.cleanup(Utc::now() - Duration::days(7)).unwrap();
        assert_eq!(entries, 1);
        assert!(ledger.entry(&key()).unwrap().is_none());
        assert!(ledger.entry(&recent).unwrap().is_some());
    }

    #[test]
    fn survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.redb");
        let now = Utc::now();
        {
            let ledger = Ledger::open(&path).unwrap();
            send(&ledger, &key(), &ctx("run-1", now));
        }
        let ledger = Ledger::open(&path).unwrap();
        assert!(matches!(
            ledger.check(&key(), &ctx("run-2", now)).unwrap(),
            Decision::Duplicate { .. }
        ));
    }
}
