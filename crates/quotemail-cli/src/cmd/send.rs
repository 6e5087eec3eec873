use crate::cmd::{load_cipher, load_contacts, load_templates, ProductArgs};
use crate::output::print_json;
use anyhow::Context;
use quotemail_core::{
    audit::SendOutcome,
    config::Config,
    mask::mask_emails_in_text,
    ledger::{Ledger, Reservation, SendEntry},
    retry::ThreadDelay,
    sender::{AssumeYes, BulkRequest, BulkSender, ConfirmGate},
    transport::{CommandTransport, DryRunTransport, MailTransport},
    QuoteError,
};
use std::io::{BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};

pub struct SendArgs {
    pub file: PathBuf,
    pub template: Option<PathBuf>,
    pub subject: Option<String>,
    pub product: ProductArgs,
    pub query: Option<String>,
    pub encoding: Option<String>,
    pub dry_run: bool,
    pub yes: bool,
    pub test_to: Option<String>,
}

// ---------------------------------------------------------------------------
// Terminal confirmation
// ---------------------------------------------------------------------------

struct PromptGate;

impl PromptGate {
    fn ask(question: &str) -> bool {
        eprint!("{question} [y/N] ");
        let _ = std::io::stderr().flush();
        let mut answer = String::new();
        if std::io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
    }
}

impl ConfirmGate for PromptGate {
    fn confirm_batch(&self, count: usize, preview: &[String]) -> bool {
        eprintln!("About to send {count} mail(s):");
        for p in preview {
            eprintln!("  {p}");
        }
        if count > preview.len() {
            eprintln!("  ... and {} more", count - preview.len());
        }
        Self::ask("Send?")
    }

    fn confirm_rerun(&self, recipient_masked: &str, previous: &SendEntry) -> bool {
        Self::ask(&format!(
            "{recipient_masked} was already sent this request at {}. Send again?",
            previous.sent_at.to_rfc3339()
        ))
    }

    fn confirm_unknown(&self, recipient_masked: &str, reservation: &Reservation) -> bool {
        Self::ask(&format!(
            "An earlier send to {recipient_masked} (run {}, {}) may already have been delivered. Send again?",
            reservation.run_id,
            reservation.reserved_at.to_rfc3339()
        ))
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(root: &Path, args: SendArgs, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let dry_run = args.dry_run || config.dry_run;

    let cipher = load_cipher(root, &config)?;
    let loaded = load_contacts(&args.file, cipher.as_ref(), args.encoding.as_deref())?;
    for w in &loaded.warnings {
        eprintln!("warning: {w}");
    }
    for e in &loaded.errors {
        eprintln!("skipped: {e}");
    }

    let (subject, body) = load_templates(args.template.as_deref(), args.subject.as_deref())?;
    let ledger = Ledger::open(&config.ledger_path(root)).context("failed to open send ledger")?;

    let dry_transport = DryRunTransport::new();
    let command_transport;
    let transport: &dyn MailTransport = if dry_run {
        &dry_transport
    } else {
        let from = config.mailer.from.as_deref().ok_or_else(|| {
            QuoteError::InvalidInput("mailer.from is not set in the config".to_string())
        })?;
        command_transport = CommandTransport::locate(&config.mailer.command, &config.mailer.args, from)?;
        &command_transport
    };

    let gate: Option<&dyn ConfirmGate> = if args.yes {
        Some(&AssumeYes)
    } else if std::io::stdin().is_terminal() {
        Some(&PromptGate)
    } else {
        None
    };

    let delay = ThreadDelay;
    let mut sender = BulkSender::new(&config, transport, &ledger, &delay)
        .dry_run(dry_run)
        .with_log_dir(config.log_dir(root));
    if let Some(c) = cipher.as_ref() {
        sender = sender.with_cipher(c);
    }
    if let Some(g) = gate {
        sender = sender.with_gate(g);
    }

    let request = BulkRequest {
        contacts: &loaded.records,
        subject: &subject,
        body: &body,
        product: args.product.into(),
        search_query: args.query,
        input_file: args.file.display().to_string(),
    };

    if let Some(to) = args.test_to.as_deref() {
        let outcome = sender.send_test(to, &request)?;
        return report_test(&outcome, dry_run, json);
    }
    let summary = sender.run(&request)?;

    if json {
        let outcomes: Vec<_> = summary
            .outcomes
            .iter()
            .map(|o| {
                serde_json::json!({
                    "email": o.masked_email(),
                    "company_name": o.company_name,
                    "status": o.status,
                    "message_id": o.message_id,
                    "attempts": o.attempts,
                    "error": o.error.as_deref().map(mask_emails_in_text),
                    "request_key": o.request_key,
                })
            })
            .collect();
        print_json(&serde_json::json!({
            "run_id": summary.run_id,
            "dry_run": summary.dry_run,
            "sent": summary.sent(),
            "skipped": summary.skipped(),
            "failed": summary.failed(),
            "outcomes": outcomes,
            "warnings": summary.warnings,
            "artifacts": summary.artifacts,
        }))?;
    } else {
        if summary.dry_run {
            println!("(dry run: nothing was sent)");
        }
        println!("{}", summary.render());
        for w in &summary.warnings {
            eprintln!("warning: {w}");
        }
        for p in &summary.artifacts {
            println!("wrote {}", p.display());
        }
    }

    if summary.failed() > 0 {
        anyhow::bail!("{} recipient(s) failed", summary.failed());
    }
    Ok(())
}

fn report_test(outcome: &SendOutcome, dry_run: bool, json: bool) -> anyhow::Result<()> {
    if json {
        print_json(&serde_json::json!({
            "email": outcome.masked_email(),
            "dry_run": dry_run,
            "status": outcome.status,
            "message_id": outcome.message_id,
            "attempts": outcome.attempts,
            "error": outcome.error.as_deref().map(mask_emails_in_text),
        }))?;
    } else {
        if dry_run {
            println!("(dry run: nothing was sent)");
        }
        println!(
            "Test mail {} {} {}",
            outcome.status.symbol(),
            outcome.masked_email(),
            outcome.message_id.as_deref().unwrap_or("")
        );
    }
    if let Some(e) = &outcome.error {
        anyhow::bail!("test mail failed: {}", mask_emails_in_text(e));
    }
    Ok(())
}
