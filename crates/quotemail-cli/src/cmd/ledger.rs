use crate::output::{print_json, print_table};
use anyhow::Context;
use chrono::{Duration, Utc};
use clap::Subcommand;
use quotemail_core::{config::Config, ledger::Ledger};
use std::path::Path;

#[derive(Subcommand)]
pub enum LedgerSubcommand {
    /// Show recent ledger events, newest first
    History {
        /// Maximum events to show (0 = all)
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Remove send entries older than the given age
    Cleanup {
        /// Age in days
        #[arg(long, default_value = "90")]
        older_than_days: i64,
    },
}

pub fn run(root: &Path, subcmd: LedgerSubcommand, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let ledger = Ledger::open(&config.ledger_path(root)).context("failed to open send ledger")?;

    match subcmd {
        LedgerSubcommand::History { limit } => {
            let events = ledger.history(limit)?;
            if json {
                return print_json(&events);
            }
            if events.is_empty() {
                println!("No ledger events.");
                return Ok(());
            }
            let rows = events
                .iter()
                .map(|e| {
                    vec![
                        e.at.format("%Y-%m-%d %H:%M:%S").to_string(),
                        e.kind.as_str().to_string(),
                        e.recipient_masked.clone(),
                        e.key.clone(),
                        e.detail.clone(),
                    ]
                })
                .collect();
            print_table(&["AT", "EVENT", "RECIPIENT", "REQUEST KEY", "DETAIL"], rows);
            Ok(())
        }
        LedgerSubcommand::Cleanup { older_than_days } => {
            if older_than_days < 1 {
                anyhow::bail!("--older-than-days must be at least 1");
            }
            let cutoff = Utc::now() - Duration::days(older_than_days);
            let (entries, reservations) = ledger.cleanup(cutoff)?;
            if json {
                print_json(&serde_json::json!({
                    "cutoff": cutoff,
                    "entries": entries,
                    "reservations": reservations,
                }))?;
            } else {
                println!(
                    "Removed {entries} entr{} and {reservations} stale reservation(s) before {}.",
                    if entries == 1 { "y" } else { "ies" },
                    cutoff.format("%Y-%m-%d")
                );
            }
            Ok(())
        }
    }
}
