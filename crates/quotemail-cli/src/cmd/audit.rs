use crate::cmd::load_cipher;
use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use quotemail_core::{audit::load_record, config::Config, QuoteError};
use std::path::{Path, PathBuf};

#[derive(Subcommand)]
pub enum AuditSubcommand {
    /// List audit records in the log directory
    List,
    /// Show one audit record
    Show {
        /// Record file, or its name inside the log directory
        record: PathBuf,
        /// Decrypt recipient addresses (needs the key)
        #[arg(long)]
        reveal: bool,
    },
}

pub fn run(root: &Path, subcmd: AuditSubcommand, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let log_dir = config.log_dir(root);
    match subcmd {
        AuditSubcommand::List => list(&log_dir, json),
        AuditSubcommand::Show { record, reveal } => {
            let path = if record.exists() {
                record
            } else {
                log_dir.join(&record)
            };
            show(root, &config, &path, reveal, json)
        }
    }
}

fn list(log_dir: &Path, json: bool) -> anyhow::Result<()> {
    let mut names: Vec<String> = match std::fs::read_dir(log_dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("audit_") && n.ends_with(".json"))
            .collect(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", log_dir.display())),
    };
    names.sort();
    names.reverse();

    if json {
        return print_json(&names);
    }
    if names.is_empty() {
        println!("No audit records.");
    }
    for n in names {
        println!("{n}");
    }
    Ok(())
}

fn show(root: &Path, config: &Config, path: &Path, reveal: bool, json: bool) -> anyhow::Result<()> {
    let record = load_record(path)?;
    let revealed = if reveal {
        let cipher = load_cipher(root, config)?.ok_or(QuoteError::KeyNotFound)?;
        Some(record.decrypt_emails(&cipher)?)
    } else {
        None
    };

    if json {
        let mut value = serde_json::to_value(&record)?;
        if let (Some(emails), Some(details)) = (&revealed, value["details"].as_array_mut()) {
            for (d, email) in details.iter_mut().zip(emails) {
                d["email"] = serde_json::Value::String(email.clone());
            }
        }
        return print_json(&value);
    }

    println!("Execution: {}", record.execution_id);
    println!(
        "Started:   {}  Ended: {}",
        record.start_time.to_rfc3339(),
        record.end_time.to_rfc3339()
    );
    println!("Operator:  {}", record.operator);
    println!("Input:     {}", record.input_file);
    if record.dry_run {
        println!("Mode:      dry run");
    }
    println!(
        "Total: {}  Sent: {}  Skipped: {}  Failed: {}",
        record.total_count, record.sent_count, record.skipped_count, record.failed_count
    );
    if let Some(p) = &record.product_info {
        println!("Product:   {} {}", p.name, p.maker_code);
    }
    println!();

    let rows = record
        .details
        .iter()
        .enumerate()
        .map(|(i, d)| {
            let email = revealed
                .as_ref()
                .and_then(|r| r.get(i).cloned())
                .unwrap_or_else(|| d.email_masked.clone());
            vec![
                d.status.as_str().to_string(),
                d.company_name.clone(),
                email,
                d.message_id.clone(),
            ]
        })
        .collect();
    print_table(&["STATUS", "COMPANY", "EMAIL", "MESSAGE-ID"], rows);

    for e in &record.errors {
        println!("error: {} {}", e.email_masked, e.error);
    }
    Ok(())
}
