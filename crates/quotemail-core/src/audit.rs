//! Per-run audit artifacts.
//!
//! Every execution writes one JSON record plus sent/unsent CSV lists into
//! the log directory. Addresses never appear in clear: persisted fields are
//! encrypted with the run's [`Cipher`], display fields are masked. Files are
//! created once and never rewritten.

use crate::crypto::{encrypted_column_name, Cipher};
use crate::contact::{COL_COMPANY, COL_CONTACT, COL_EMAIL};
use crate::error::{QuoteError, Result};
use crate::fingerprint::ProductInfo;
use crate::io::write_new;
use crate::mask::{mask_email, mask_email_domain_only, mask_emails_in_text};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const COL_SENT_AT: &str = "送信日時";
const COL_MESSAGE_ID: &str = "Message-ID";
const COL_MASKED: &str = "宛先(マスク)";
const COL_ERROR: &str = "エラー内容";

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Sent,
    Skipped,
    Failed,
}

impl OutcomeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Sent => "✓",
            Self::Skipped => "-",
            Self::Failed => "✗",
        }
    }
}

/// Result for one recipient. Holds the plaintext address, so it is not
/// serializable; the audit record carries encrypted and masked forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub email: String,
    pub company_name: String,
    pub contact_name: String,
    pub status: OutcomeStatus,
    pub message_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    /// Ledger key id (`<recipient hash>:<fingerprint>`), the target of a
    /// request-key override.
    pub request_key: String,
    pub attempts: u32,
    pub error: Option<String>,
    pub decision_trace: Vec<String>,
}

impl SendOutcome {
    pub fn new(email: &str, company_name: &str, contact_name: &str, status: OutcomeStatus) -> Self {
        Self {
            email: email.to_string(),
            company_name: company_name.to_string(),
            contact_name: contact_name.to_string(),
            status,
            message_id: None,
            sent_at: None,
            request_key: String::new(),
            attempts: 0,
            error: None,
            decision_trace: Vec::new(),
        }
    }

    pub fn masked_email(&self) -> String {
        mask_email(&self.email)
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditDetail {
    pub email_enc: String,
    pub email_masked: String,
    pub company_name: String,
    pub status: OutcomeStatus,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub request_key: String,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub decision_trace: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditError {
    /// `***@domain`.
    pub email_masked: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub execution_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub operator: String,
    pub input_file: String,
    pub dry_run: bool,
    pub total_count: usize,
    pub sent_count: usize,
    pub skipped_count: usize,
    pub failed_count: usize,
    pub details: Vec<AuditDetail>,
    pub errors: Vec<AuditError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_info: Option<ProductInfo>,
}

impl AuditRecord {
    /// Decrypt every detail's address. Fails on the first value the cipher
    /// cannot open.
    pub fn decrypt_emails(&self, cipher: &Cipher) -> Result<Vec<String>> {
        self.details
            .iter()
            .map(|d| cipher.decrypt(&d.email_enc))
            .collect()
    }
}

/// Read a record written by [`AuditLogger::write_record`].
pub fn load_record(path: &Path) -> Result<AuditRecord> {
    if !path.exists() {
        return Err(QuoteError::FileNotFound(path.display().to_string()));
    }
    let data = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}

/// Login name of whoever runs the batch.
pub fn current_operator() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

// ---------------------------------------------------------------------------
// Logger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AuditLogger {
    log_dir: PathBuf,
    execution_id: Uuid,
    start_time: DateTime<Utc>,
    operator: String,
}

impl AuditLogger {
    pub fn new(log_dir: impl Into<PathBuf>, execution_id: Uuid, start_time: DateTime<Utc>) -> Self {
        Self {
            log_dir: log_dir.into(),
            execution_id,
            start_time,
            operator: current_operator(),
        }
    }

    pub fn with_operator(mut self, operator: impl Into<String>) -> Self {
        self.operator = operator.into();
        self
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// `<YYYYmmdd_HHMMSS>_<first 8 of execution id>`, shared by every
    /// artifact of the run.
    fn stem(&self) -> String {
        let id = self.execution_id.to_string();
        format!("{}_{}", self.start_time.format("%Y%m%d_%H%M%S"), &id[..8])
    }

    pub fn record_path(&self) -> PathBuf {
        self.log_dir.join(format!("audit_{}.json", self.stem()))
    }

    pub fn sent_list_path(&self) -> PathBuf {
        self.log_dir.join(format!("sent_list_{}.csv", self.stem()))
    }

    pub fn unsent_list_path(&self) -> PathBuf {
        self.log_dir.join(format!("unsent_list_{}.csv", self.stem()))
    }

    pub fn build_record(
        &self,
        cipher: &Cipher,
        input_file: &str,
        outcomes: &[SendOutcome],
        product: Option<&ProductInfo>,
        dry_run: bool,
    ) -> Result<AuditRecord> {
        let count = |s: OutcomeStatus| outcomes.iter().filter(|o| o.status == s).count();

        let details = outcomes
            .iter()
            .map(|o| {
                Ok(AuditDetail {
                    email_enc: cipher.encrypt(&o.email)?,
                    email_masked: o.masked_email(),
                    company_name: o.company_name.clone(),
                    status: o.status,
                    message_id: o.message_id.clone().unwrap_or_default(),
                    sent_at: o.sent_at,
                    request_key: o.request_key.clone(),
                    attempts: o.attempts,
                    decision_trace: o.decision_trace.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let errors = outcomes
            .iter()
            .filter(|o| o.status == OutcomeStatus::Failed)
            .map(|o| AuditError {
                email_masked: mask_email_domain_only(&o.email),
                error: mask_emails_in_text(o.error.as_deref().unwrap_or_default()),
            })
            .collect();

        let input_file = Path::new(input_file)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| input_file.to_string());

        Ok(AuditRecord {
            execution_id: self.execution_id.to_string(),
            start_time: self.start_time,
            end_time: Utc::now(),
            operator: self.operator.clone(),
            input_file,
            dry_run,
            total_count: outcomes.len(),
            sent_count: count(OutcomeStatus::Sent),
            skipped_count: count(OutcomeStatus::Skipped),
            failed_count: count(OutcomeStatus::Failed),
            details,
            errors,
            product_info: product.filter(|p| !p.is_empty()).cloned(),
        })
    }

    /// Write the run's JSON record. Refuses to overwrite.
    pub fn write_record(&self, record: &AuditRecord) -> Result<PathBuf> {
        let path = self.record_path();
        let data = serde_json::to_string_pretty(record)?;
        write_new(&path, data.as_bytes())?;
        tracing::info!(path = %path.display(), "audit record written");
        Ok(path)
    }

    pub fn write_sent_list(&self, cipher: &Cipher, outcomes: &[SendOutcome]) -> Result<PathBuf> {
        let mut w = csv::Writer::from_writer(Vec::new());
        w.write_record([
            encrypted_column_name(COL_EMAIL).as_str(),
            COL_COMPANY,
            COL_CONTACT,
            COL_SENT_AT,
            COL_MESSAGE_ID,
        ])?;
        for o in outcomes.iter().filter(|o| o.status == OutcomeStatus::Sent) {
            let sent_at = o.sent_at.map(|t| t.to_rfc3339()).unwrap_or_default();
            w.write_record([
                cipher.encrypt(&o.email)?.as_str(),
                o.company_name.as_str(),
                o.contact_name.as_str(),
                sent_at.as_str(),
                o.message_id.as_deref().unwrap_or_default(),
            ])?;
        }
        self.finish_csv(w, self.sent_list_path())
    }

    /// Failed and skipped recipients, with the reason masked.
    pub fn write_unsent_list(&self, cipher: &Cipher, outcomes: &[SendOutcome]) -> Result<PathBuf> {
        let mut w = csv::Writer::from_writer(Vec::new());
        w.write_record([
            encrypted_column_name(COL_EMAIL).as_str(),
            COL_MASKED,
            COL_COMPANY,
            COL_CONTACT,
            COL_ERROR,
        ])?;
        for o in outcomes.iter().filter(|o| o.status != OutcomeStatus::Sent) {
            let reason = mask_emails_in_text(o.error.as_deref().unwrap_or(o.status.as_str()));
            w.write_record([
                cipher.encrypt(&o.email)?.as_str(),
                mask_email_domain_only(&o.email).as_str(),
                o.company_name.as_str(),
                o.contact_name.as_str(),
                reason.as_str(),
            ])?;
        }
        self.finish_csv(w, self.unsent_list_path())
    }

    fn finish_csv(&self, w: csv::Writer<Vec<u8>>, path: PathBuf) -> Result<PathBuf> {
        let data = w
            .into_inner()
            .map_err(|e| QuoteError::Io(std::io::Error::other(e.to_string())))?;
        write_new(&path, &data)?;
        Ok(path)
    }
}

// ---------------------------------------------------------------------------
// Screen output
// ---------------------------------------------------------------------------

/// Human-readable run summary. Addresses are masked.
pub fn format_summary(outcomes: &[SendOutcome]) -> String {
    let count = |s: OutcomeStatus| outcomes.iter().filter(|o| o.status == s).count();
    let rule = "=".repeat(50);
    let thin = "-".repeat(50);

    let mut lines = vec![
        rule.clone(),
        "Send summary".to_string(),
        rule.clone(),
        format!("Total:   {}", outcomes.len()),
        format!("Sent:    {}", count(OutcomeStatus::Sent)),
        format!("Skipped: {}", count(OutcomeStatus::Skipped)),
        format!("Failed:  {}", count(OutcomeStatus::Failed)),
        thin,
    ];
    for o in outcomes {
        let mut line = format!("{} {} ({})", o.status.symbol(), o.company_name, o.masked_email());
        if let Some(at) = o.sent_at {
            line.push_str(&format!(" - {}", at.format("%H:%M:%S")));
        }
        if o.status != OutcomeStatus::Sent {
            let reason = o.error.as_deref().unwrap_or("unknown");
            line.push_str(&format!(" [{}]", mask_emails_in_text(reason)));
        }
        lines.push(line);
    }
    lines.push(rule);
    lines.join("\n")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
