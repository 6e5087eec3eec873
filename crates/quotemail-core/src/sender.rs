//! Bulk send orchestration.
//!
//! [`BulkSender::run`] takes a loaded contact batch through pre-flight gates
//! (recipient limit, template variables, product URL, search-query screen,
//! confirmation), then per recipient: in-run dedup, domain policy, render,
//! ledger reservation, transport with retry, ledger settlement. Audit
//! artifacts are written once the batch ends.
//!
//! Only pre-flight conditions return `Err`. Once sending starts, every
//! recipient ends as a [`SendOutcome`] in the summary.
//!
//! [`BulkSender::send_test`] delivers one rendered message to an operator
//! address without touching the ledger or the audit log.

use crate::audit::{format_summary, AuditLogger, OutcomeStatus, SendOutcome};
use crate::config::{Config, RerunPolicy};
use crate::contact::{self, ContactRecord};
use crate::crypto::Cipher;
use crate::domain::DomainFilter;
use crate::error::{QuoteError, Result};
use crate::fingerprint::{normalize_recipient, normalize_subject, payload_fingerprint, ProductInfo};
use crate::ledger::{CheckContext, Decision, Ledger, LedgerKey, Reservation, SendEntry};
use crate::mask::{mask_email, mask_emails_in_text};
use crate::pii::PiiScreener;
use crate::retry::{retry, Delay, RetryPolicy};
use crate::template::{Template, Variables};
use crate::transport::{fallback_message_id, MailTransport, OutgoingMail};
use crate::url_check::UrlValidator;
use chrono::Utc;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Instant;
use uuid::Uuid;

/// Addresses shown to the confirmation gate.
const PREVIEW_LIMIT: usize = 5;

const TEST_SUBJECT_PREFIX: &str = "[テスト] ";
const TEST_COMPANY: &str = "テスト送信";

// ---------------------------------------------------------------------------
// Confirmation
// ---------------------------------------------------------------------------

/// Operator confirmation, supplied by the caller.
pub trait ConfirmGate {
    /// Approve a batch of `count` recipients. `preview` holds masked
    /// addresses of the first few.
    fn confirm_batch(&self, count: usize, preview: &[String]) -> bool;

    /// Approve a re-send to a recipient already sent this payload inside
    /// the rerun window. Only asked under [`RerunPolicy::Block`].
    fn confirm_rerun(&self, recipient_masked: &str, previous: &SendEntry) -> bool;

    /// Approve a re-send to a recipient whose earlier attempt may or may not
    /// have been delivered. Refused unless the gate asks a person.
    fn confirm_unknown(&self, _recipient_masked: &str, _reservation: &Reservation) -> bool {
        false
    }
}

/// Approves batches and re-sends. Backs `send --yes`. An unknown delivery
/// outcome still needs a person or an override.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeYes;

impl ConfirmGate for AssumeYes {
    fn confirm_batch(&self, _count: usize, _preview: &[String]) -> bool {
        true
    }

    fn confirm_rerun(&self, _recipient_masked: &str, _previous: &SendEntry) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Request / summary
// ---------------------------------------------------------------------------

pub struct BulkRequest<'a> {
    pub contacts: &'a [ContactRecord],
    pub subject: &'a Template,
    pub body: &'a Template,
    pub product: ProductInfo,
    /// Outbound search text to screen for PII before anything is sent.
    pub search_query: Option<String>,
    /// Source file name for the audit record.
    pub input_file: String,
}

#[derive(Debug, Clone)]
pub struct BulkSummary {
    pub run_id: Uuid,
    pub dry_run: bool,
    pub outcomes: Vec<SendOutcome>,
    pub warnings: Vec<String>,
    pub artifacts: Vec<PathBuf>,
}

impl BulkSummary {
    pub fn count(&self, status: OutcomeStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    pub fn sent(&self) -> usize {
        self.count(OutcomeStatus::Sent)
    }

    pub fn skipped(&self) -> usize {
        self.count(OutcomeStatus::Skipped)
    }

    pub fn failed(&self) -> usize {
        self.count(OutcomeStatus::Failed)
    }

    pub fn render(&self) -> String {
        format_summary(&self.outcomes)
    }
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

pub struct BulkSender<'a> {
    config: &'a Config,
    transport: &'a dyn MailTransport,
    ledger: &'a Ledger,
    delay: &'a dyn Delay,
    cipher: Option<&'a Cipher>,
    gate: Option<&'a dyn ConfirmGate>,
    url_validator: Option<&'a UrlValidator>,
    audit: Option<AuditLogger>,
    run_id: Uuid,
    dry_run: bool,
}

impl<'a> BulkSender<'a> {
    pub fn new(
        config: &'a Config,
        transport: &'a dyn MailTransport,
        ledger: &'a Ledger,
        delay: &'a dyn Delay,
    ) -> Self {
        Self {
            config,
            transport,
            ledger,
            delay,
            cipher: None,
            gate: None,
            url_validator: None,
            audit: None,
            run_id: Uuid::new_v4(),
            dry_run: config.dry_run,
        }
    }

    pub fn with_cipher(mut self, cipher: &'a Cipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn with_gate(mut self, gate: &'a dyn ConfirmGate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_url_validator(mut self, validator: &'a UrlValidator) -> Self {
        self.url_validator = Some(validator);
        self
    }

    /// Write audit artifacts into `log_dir` when the batch ends.
    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.audit = Some(AuditLogger::new(log_dir, self.run_id, Utc::now()));
        self
    }

    /// The transport is expected to be a dry-run transport when this is set;
    /// the ledger is then only read.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn run(&self, req: &BulkRequest<'_>) -> Result<BulkSummary> {
        let mut warnings = self.preflight(req)?;
        tracing::info!(
            run_id = %self.run_id,
            recipients = req.contacts.len(),
            dry_run = self.dry_run,
            transport = self.transport.name(),
            "bulk send started"
        );

        let outcomes = self.send_all(req, &mut warnings);
        let mut summary = BulkSummary {
            run_id: self.run_id,
            dry_run: self.dry_run,
            outcomes,
            warnings,
            artifacts: Vec::new(),
        };
        self.write_artifacts(req, &mut summary);

        tracing::info!(
            run_id = %self.run_id,
            sent = summary.sent(),
            skipped = summary.skipped(),
            failed = summary.failed(),
            "bulk send finished"
        );
        Ok(summary)
    }

    // -----------------------------------------------------------------------
    // Pre-flight
    // -----------------------------------------------------------------------

    fn preflight(&self, req: &BulkRequest<'_>) -> Result<Vec<String>> {
        let count = req.contacts.len();
        if count > self.config.max_recipients {
            tracing::warn!(count, max = self.config.max_recipients, "recipient limit exceeded");
            return Err(QuoteError::RecipientLimit {
                count,
                max: self.config.max_recipients,
            });
        }
        if count == 0 {
            return Err(QuoteError::InvalidInput("no recipients to send to".to_string()));
        }

        let mut warnings = Vec::new();

        if self.config.template_strict {
            let vars = Variables::for_request(&req.contacts[0], &req.product);
            let mut missing = req.subject.missing(&vars);
            for name in req.body.missing(&vars) {
                if !missing.contains(&name) {
                    missing.push(name);
                }
            }
            if !missing.is_empty() {
                return Err(QuoteError::MissingVariables(missing));
            }
        }

        if !req.product.url.trim().is_empty() {
            let owned;
            let validator = match self.url_validator {
                Some(v) => v,
                None => {
                    owned = UrlValidator::new(self.config.url.clone())?;
                    &owned
                }
            };
            let result = validator.validate(&req.product.url);
            if !result.valid {
                let reason = result.error.unwrap_or_else(|| "invalid".to_string());
                return Err(QuoteError::PolicyViolation(format!("product URL rejected: {reason}")));
            }
            warnings.extend(result.warning);
        }

        if let Some(query) = req.search_query.as_deref() {
            let screener = PiiScreener::new(self.config.pii.clone())
                .with_organizations(self.config.organization_names.iter().cloned())
                .with_organizations(req.contacts.iter().map(|c| c.company_name.clone()));
            let screened = screener.gate(query)?;
            warnings.extend(screened.warnings().iter().cloned());
        }

        if !self.dry_run && self.cipher.is_none() {
            return Err(QuoteError::KeyNotFound);
        }

        if !self.dry_run && count >= self.config.confirmation_threshold {
            let preview: Vec<String> = req
                .contacts
                .iter()
                .take(PREVIEW_LIMIT)
                .map(|c| mask_email(&c.email))
                .collect();
            let approved = self
                .gate
                .map(|g| g.confirm_batch(count, &preview))
                .unwrap_or(false);
            if !approved {
                return Err(QuoteError::Cancelled(format!(
                    "{count} recipient(s) need confirmation (threshold {})",
                    self.config.confirmation_threshold
                )));
            }
        }

        Ok(warnings)
    }

    // -----------------------------------------------------------------------
    // Per-recipient loop
    // -----------------------------------------------------------------------

    fn send_all(&self, req: &BulkRequest<'_>, warnings: &mut Vec<String>) -> Vec<SendOutcome> {
        let domains = DomainFilter::new(&self.config.domain_whitelist, &self.config.domain_blacklist);
        let fingerprint = payload_fingerprint(&req.product, &self.config.fingerprint_fields);
        let policy = RetryPolicy {
            retries: self.config.send_retry_count,
            interval: self.config.send_retry_interval(),
        };
        let mut seen = HashSet::new();
        let mut last_send: Option<Instant> = None;
        let mut outcomes = Vec::with_capacity(req.contacts.len());

        for contact in req.contacts {
            let mut outcome = SendOutcome::new(
                &contact.email,
                &contact.company_name,
                &contact.contact_name,
                OutcomeStatus::Failed,
            );
            let masked = outcome.masked_email();

            let recipient = normalize_recipient(&contact.email);
            if seen.contains(&recipient) {
                outcome.status = OutcomeStatus::Skipped;
                outcome.error = Some("already attempted in this run".to_string());
                outcomes.push(outcome);
                continue;
            }

            let domain = domains.check(&contact.email);
            if !domain.allowed {
                tracing::warn!(recipient = %masked, reason = %domain.reason, "domain policy block");
                outcome.error = Some(domain.reason);
                outcomes.push(outcome);
                continue;
            }

            let vars = Variables::for_request(contact, &req.product);
            let rendered = req
                .subject
                .render(&vars, self.config.template_strict)
                .and_then(|s| Ok((s, req.body.render(&vars, self.config.template_strict)?)));
            let (subject, body) = match rendered {
                Ok((s, b)) => (normalize_subject(&s), b),
                Err(e) => {
                    outcome.error = Some(e.to_string());
                    outcomes.push(outcome);
                    continue;
                }
            };

            let key = LedgerKey::new(&contact.email, &fingerprint);
            outcome.request_key = key.id();
            let ctx = self.context();

            let trace = match self.clear_with_ledger(&key, &ctx, &mut outcome) {
                Some(trace) => trace,
                None => {
                    outcomes.push(outcome);
                    continue;
                }
            };

            if let Some(at) = last_send.filter(|_| !self.dry_run) {
                let interval = self.config.send_interval();
                let elapsed = at.elapsed();
                if elapsed < interval {
                    self.delay.wait(interval - elapsed);
                }
            }

            seen.insert(recipient);
            let mail = OutgoingMail {
                to: contact.email.clone(),
                subject,
                body,
            };
            let result = retry(policy, self.delay, |_| true, |attempt| {
                if attempt > 1 {
                    tracing::debug!(recipient = %masked, attempt, "retrying send");
                }
                self.transport.send(&mail)
            });
            last_send = Some(Instant::now());

            let done = self.context();
            match result {
                Ok((id, attempts)) => {
                    let message_id = id.unwrap_or_else(|| fallback_message_id(&mail.subject, done.now));
                    outcome.status = OutcomeStatus::Sent;
                    outcome.attempts = attempts;
                    outcome.sent_at = Some(done.now);
                    if !self.dry_run {
                        if let Err(e) = self.ledger.mark_sent(&key, &done, &message_id, &trace) {
                            tracing::error!(recipient = %masked, error = %e, "ledger write failed after send");
                            warnings.push(self.hold_unknown(&key, &done, &message_id, &e, &trace));
                        }
                    }
                    outcome.message_id = Some(message_id);
                }
                Err(e) => {
                    let reason = mask_emails_in_text(&e.to_string());
                    tracing::warn!(recipient = %masked, attempts = e.attempts, error = %reason, "send failed");
                    outcome.attempts = e.attempts;
                    outcome.error = Some(e.to_string());
                    if !self.dry_run {
                        if let Err(le) = self.ledger.release(&key, &done, &reason, &trace) {
                            warnings.push(format!("{masked}: reservation not released: {le}"));
                        }
                    }
                }
            }
            outcome.decision_trace = trace;
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Hold a key whose send went out but could not be recorded, so later
    /// runs ask before sending again. Returns the summary warning.
    fn hold_unknown(
        &self,
        key: &LedgerKey,
        ctx: &CheckContext,
        message_id: &str,
        error: &QuoteError,
        trace: &[String],
    ) -> String {
        let masked = &key.recipient_masked;
        let mut trace = trace.to_vec();
        trace.push("sent_commit:unknown".to_string());
        let reason = format!("sent but not recorded in ledger: {error}");
        match self.ledger.mark_unknown_sent(
            key,
            ctx,
            self.config.unknown_sent_hold_secs,
            Some(message_id),
            &reason,
            &trace,
        ) {
            Ok(()) => format!("{masked}: {reason}; held as unknown until confirmed"),
            Err(e) => format!("{masked}: {reason}; hold not recorded either: {e}"),
        }
    }

    fn context(&self) -> CheckContext {
        CheckContext {
            run_id: self.run_id.to_string(),
            scope: self.config.rerun_scope,
            window: self.config.rerun_window(),
            now: Utc::now(),
        }
    }

    /// Ask the ledger whether this key may be sent. Returns the decision
    /// trace when cleared; otherwise fills `outcome` as skipped or failed.
    fn clear_with_ledger(
        &self,
        key: &LedgerKey,
        ctx: &CheckContext,
        outcome: &mut SendOutcome,
    ) -> Option<Vec<String>> {
        let first = if self.dry_run {
            self.ledger.check(key, ctx)
        } else {
            self.ledger.reserve(key, ctx, self.config.reservation_ttl_secs, false)
        };
        let decision = match first {
            Ok(d) => d,
            Err(e) => {
                outcome.error = Some(e.to_string());
                return None;
            }
        };

        match decision {
            Decision::Send { trace } => Some(trace),
            Decision::Unknown { reservation, trace } => {
                outcome.decision_trace = trace.clone();
                let confirmed = !self.dry_run
                    && self
                        .gate
                        .map(|g| g.confirm_unknown(&key.recipient_masked, &reservation))
                        .unwrap_or(false);
                if confirmed {
                    return self.force_reserve(key, ctx, outcome);
                }
                let reason = format!(
                    "outcome of an earlier send (run {}) is unknown; confirm or add an override to send again",
                    reservation.run_id
                );
                tracing::warn!(recipient = %key.recipient_masked, %reason, "skipping unsettled key");
                self.skip(key, ctx, outcome, reason, &trace);
                None
            }
            Decision::Locked { reservation } => {
                outcome.status = OutcomeStatus::Skipped;
                outcome.error = Some(format!(
                    "reserved by run {} until {}",
                    reservation.run_id,
                    reservation.expires_at.to_rfc3339()
                ));
                None
            }
            Decision::Duplicate { previous, trace } => {
                outcome.decision_trace = trace.clone();
                let confirmed = self.config.rerun_policy == RerunPolicy::Block
                    && !self.dry_run
                    && self
                        .gate
                        .map(|g| g.confirm_rerun(&key.recipient_masked, &previous))
                        .unwrap_or(false);
                if confirmed {
                    return self.force_reserve(key, ctx, outcome);
                }

                let reason = match self.config.rerun_policy {
                    RerunPolicy::AutoSkip => format!(
                        "already sent at {} (run {})",
                        previous.sent_at.to_rfc3339(),
                        previous.run_id
                    ),
                    RerunPolicy::Block => "re-send within rerun window not confirmed".to_string(),
                };
                tracing::warn!(recipient = %key.recipient_masked, %reason, "skipping duplicate");
                self.skip(key, ctx, outcome, reason, &trace);
                None
            }
        }
    }

    /// Reserve after explicit confirmation.
    fn force_reserve(
        &self,
        key: &LedgerKey,
        ctx: &CheckContext,
        outcome: &mut SendOutcome,
    ) -> Option<Vec<String>> {
        match self
            .ledger
            .reserve(key, ctx, self.config.reservation_ttl_secs, true)
        {
            Ok(Decision::Send { trace }) => Some(trace),
            Ok(_) => {
                outcome.status = OutcomeStatus::Skipped;
                outcome.error = Some("reserved by another run".to_string());
                None
            }
            Err(e) => {
                outcome.error = Some(e.to_string());
                None
            }
        }
    }

    fn skip(
        &self,
        key: &LedgerKey,
        ctx: &CheckContext,
        outcome: &mut SendOutcome,
        reason: String,
        trace: &[String],
    ) {
        if !self.dry_run {
            if let Err(e) = self.ledger.record_skip(key, ctx, &reason, trace) {
                tracing::error!(error = %e, "ledger skip event not recorded");
            }
        }
        outcome.status = OutcomeStatus::Skipped;
        outcome.error = Some(reason);
    }

    // -----------------------------------------------------------------------
    // Test mail
    // -----------------------------------------------------------------------

    /// Send one message to `to`, rendered against the first contact of the
    /// batch (or a placeholder contact) with a `[テスト]` subject prefix.
    /// Retries like a batch send; the ledger and audit log are not touched.
    pub fn send_test(&self, to: &str, req: &BulkRequest<'_>) -> Result<SendOutcome> {
        let to = to.trim();
        if !contact::is_valid_email(to) {
            return Err(QuoteError::InvalidInput(format!(
                "test address is not a valid email: {}",
                mask_email(to)
            )));
        }
        let placeholder;
        let sample = match req.contacts.first() {
            Some(c) => c,
            None => {
                placeholder = ContactRecord::new(TEST_COMPANY, to);
                &placeholder
            }
        };
        let vars = Variables::for_request(sample, &req.product);
        let subject = req.subject.render(&vars, self.config.template_strict)?;
        let body = req.body.render(&vars, self.config.template_strict)?;
        let mail = OutgoingMail {
            to: to.to_string(),
            subject: format!("{TEST_SUBJECT_PREFIX}{}", normalize_subject(&subject)),
            body,
        };

        let mut outcome = SendOutcome::new(to, TEST_COMPANY, &sample.contact_name, OutcomeStatus::Failed);
        let policy = RetryPolicy {
            retries: self.config.send_retry_count,
            interval: self.config.send_retry_interval(),
        };
        match retry(policy, self.delay, |_| true, |_| self.transport.send(&mail)) {
            Ok((id, attempts)) => {
                let now = Utc::now();
                outcome.status = OutcomeStatus::Sent;
                outcome.attempts = attempts;
                outcome.sent_at = Some(now);
                outcome.message_id = Some(id.unwrap_or_else(|| fallback_message_id(&mail.subject, now)));
                tracing::info!(recipient = %outcome.masked_email(), "test mail sent");
            }
            Err(e) => {
                tracing::warn!(recipient = %outcome.masked_email(), attempts = e.attempts, "test mail failed");
                outcome.attempts = e.attempts;
                outcome.error = Some(e.to_string());
            }
        }
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Artifacts
    // -----------------------------------------------------------------------

    fn write_artifacts(&self, req: &BulkRequest<'_>, summary: &mut BulkSummary) {
        let Some(logger) = &self.audit else {
            return;
        };
        let Some(cipher) = self.cipher else {
            summary
                .warnings
                .push("no encryption key: audit artifacts not written".to_string());
            return;
        };
        let product = Some(&req.product);
        let written = logger
            .build_record(cipher, &req.input_file, &summary.outcomes, product, self.dry_run)
            .and_then(|record| logger.write_record(&record))
            .and_then(|record_path| {
                let sent = logger.write_sent_list(cipher, &summary.outcomes)?;
                let unsent = logger.write_unsent_list(cipher, &summary.outcomes)?;
                Ok(vec![record_path, sent, unsent])
            });
        match written {
            Ok(paths) => summary.artifacts = paths,
            Err(e) => {
                tracing::error!(error = %e, "audit artifacts not written");
                summary.warnings.push(format!("audit artifacts not written: {e}"));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
