//! Outbound mail transports.
//!
//! The sender only sees [`MailTransport`]: given a message, deliver it and
//! return the message id when there is one. [`CommandTransport`] builds the
//! message with lettre and hands it to a local mail program such as
//! `sendmail -t`; [`DryRunTransport`] records messages without delivering
//! anything.

use crate::error::{QuoteError, Result};
use chrono::{DateTime, Utc};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::Message;
use sha2::{Digest, Sha256};
use std::cell::RefCell;
use std::io::Write as _;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct TransportError(pub String);

pub trait MailTransport {
    /// Deliver `mail`. `Ok(None)` means delivered without a message id.
    fn send(&self, mail: &OutgoingMail) -> std::result::Result<Option<String>, TransportError>;

    fn name(&self) -> &'static str;
}

/// `FALLBACK:{uuid}:{unix seconds}:{first 8 hex of sha256(subject)}`.
pub fn fallback_message_id(subject: &str, at: DateTime<Utc>) -> String {
    let digest = hex::encode(Sha256::digest(subject.as_bytes()));
    format!("FALLBACK:{}:{}:{}", Uuid::new_v4(), at.timestamp(), &digest[..8])
}

pub fn is_fallback_id(id: &str) -> bool {
    id.starts_with("FALLBACK:")
}

// ---------------------------------------------------------------------------
// DryRunTransport
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct DryRunTransport {
    sent: RefCell<Vec<OutgoingMail>>,
}

impl DryRunTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<OutgoingMail> {
        self.sent.borrow().clone()
    }
}

impl MailTransport for DryRunTransport {
    fn send(&self, mail: &OutgoingMail) -> std::result::Result<Option<String>, TransportError> {
        self.sent.borrow_mut().push(mail.clone());
        Ok(None)
    }

    fn name(&self) -> &'static str {
        "dry-run"
    }
}

// ---------------------------------------------------------------------------
// CommandTransport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CommandTransport {
    program: PathBuf,
    args: Vec<String>,
    from: Mailbox,
}

impl CommandTransport {
    /// Find `program` on `PATH`. `from` becomes the `From:` header of every
    /// message.
    pub fn locate(program: &str, args: &[String], from: &str) -> Result<Self> {
        let from: Mailbox = from.trim().parse().map_err(|e| {
            QuoteError::InvalidInput(format!("mailer.from '{from}' is not a valid address: {e}"))
        })?;
        let program = which::which(program).map_err(|_| {
            QuoteError::InvalidInput(format!("mail program '{program}' not found on PATH"))
        })?;
        Ok(Self {
            program,
            args: args.to_vec(),
            from,
        })
    }

    /// RFC 5322 message for `mail`, with a fresh `Message-ID` on the sender's
    /// domain. Header encoding and line folding are lettre's.
    pub fn build_message(&self, mail: &OutgoingMail) -> std::result::Result<Message, TransportError> {
        let to: Mailbox = mail
            .to
            .parse()
            .map_err(|e| TransportError(format!("invalid recipient address: {e}")))?;
        let message_id = format!("<{}.quotemail@{}>", Uuid::new_v4().simple(), self.from.email.domain());
        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(mail.subject.as_str())
            .message_id(Some(message_id))
            .header(ContentType::TEXT_PLAIN)
            .body(mail.body.clone())
            .map_err(|e| TransportError(format!("failed to build message: {e}")))
    }
}

impl MailTransport for CommandTransport {
    fn send(&self, mail: &OutgoingMail) -> std::result::Result<Option<String>, TransportError> {
        let message = self.build_message(mail)?;
        let message_id = message.headers().get_raw("Message-ID").map(str::to_string);

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TransportError(format!("failed to start {}: {e}", self.program.display())))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&message.formatted())
                .map_err(|e| TransportError(format!("failed to write message: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| TransportError(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TransportError(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                stderr.trim()
            )));
        }
        Ok(message_id)
    }

    fn name(&self) -> &'static str {
        "command"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
