use crate::output::{print_json, print_table};
use anyhow::Context;
use chrono::Utc;
use clap::Subcommand;
use quotemail_core::{
    audit::current_operator,
    config::Config,
    fingerprint::{normalize_recipient, recipient_hash},
    ledger::{Ledger, OverrideKind},
    mask::mask_email,
};
use std::path::Path;

#[derive(Subcommand)]
pub enum OverrideSubcommand {
    /// Allow re-sends of one request key until the override expires (keys: `ledger history`)
    AllowKey {
        /// Request key: <recipient hash>:<fingerprint>
        key: String,
        #[command(flatten)]
        grant: Grant,
    },
    /// Allow re-sends of any request to one recipient until the override expires
    AllowRecipient {
        email: String,
        #[command(flatten)]
        grant: Grant,
    },
    /// List active overrides
    Status,
    /// Remove every override
    Clear,
}

#[derive(clap::Args)]
pub struct Grant {
    /// Why the re-send is needed (required)
    #[arg(long)]
    reason: String,
    /// Lifetime in minutes, clamped to 1..=30
    #[arg(long, default_value = "10")]
    ttl_minutes: i64,
}

pub fn run(root: &Path, subcmd: OverrideSubcommand, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let ledger = Ledger::open(&config.ledger_path(root)).context("failed to open send ledger")?;
    let now = Utc::now();

    match subcmd {
        OverrideSubcommand::AllowKey { key, grant } => {
            let ov = ledger.add_override(
                OverrideKind::RequestKey,
                &key,
                grant.ttl_minutes,
                &grant.reason,
                &current_operator(),
                now,
            )?;
            report(&ov, &key, json)
        }
        OverrideSubcommand::AllowRecipient { email, grant } => {
            let target = recipient_hash(&normalize_recipient(&email));
            let ov = ledger.add_override(
                OverrideKind::Recipient,
                &target,
                grant.ttl_minutes,
                &grant.reason,
                &current_operator(),
                now,
            )?;
            report(&ov, &mask_email(&email), json)
        }
        OverrideSubcommand::Status => {
            let active = ledger.override_status(now)?;
            if json {
                return print_json(&active);
            }
            if active.is_empty() {
                println!("No active overrides.");
                return Ok(());
            }
            let rows = active
                .iter()
                .map(|o| {
                    vec![
                        o.kind.as_str().to_string(),
                        o.target.clone(),
                        o.expires_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                        o.operator.clone(),
                        o.reason.clone(),
                    ]
                })
                .collect();
            print_table(&["KIND", "TARGET", "EXPIRES", "OPERATOR", "REASON"], rows);
            Ok(())
        }
        OverrideSubcommand::Clear => {
            let n = ledger.clear_overrides()?;
            if json {
                print_json(&serde_json::json!({ "cleared": n }))?;
            } else {
                println!("Cleared {n} override(s).");
            }
            Ok(())
        }
    }
}

fn report(ov: &quotemail_core::ledger::Override, shown: &str, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(ov);
    }
    println!(
        "Override {} for {shown} active until {}.",
        ov.kind.as_str(),
        ov.expires_at.format("%Y-%m-%d %H:%M:%S")
    );
    Ok(())
}
