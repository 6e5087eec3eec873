use crate::cmd::{load_cipher, load_contacts};
use crate::output::print_json;
use quotemail_core::{config::Config, pii::PiiScreener, QuoteError};
use std::path::Path;

pub fn run(root: &Path, query: &str, contacts: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let config = Config::load_or_default(root)?;
    let mut screener = PiiScreener::new(config.pii.clone())
        .with_organizations(config.organization_names.iter().cloned());
    if let Some(file) = contacts {
        let cipher = load_cipher(root, &config)?;
        let loaded = load_contacts(file, cipher.as_ref(), None)?;
        screener = screener.with_organizations(loaded.company_names().map(str::to_string));
    }

    let report = screener.screen(query);
    if json {
        print_json(&serde_json::json!({
            "blocking": report.is_blocking(),
            "findings": report.findings,
        }))?;
    } else if report.is_clean() {
        println!("No personal data found.");
    } else {
        println!("{}", report.message());
    }

    if report.is_blocking() {
        return Err(QuoteError::PolicyViolation("search query contains personal data".into()).into());
    }
    Ok(())
}
