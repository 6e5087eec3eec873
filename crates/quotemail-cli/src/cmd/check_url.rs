use crate::output::print_json;
use quotemail_core::{config::Config, url_check::UrlValidator, QuoteError};
use std::path::Path;

pub fn run(root: &Path, url: &str, json: bool) -> anyhow::Result<()> {
    let config = Config::load_or_default(root)?;
    let validator = UrlValidator::new(config.url.clone())?;
    let result = validator.validate(url);

    if json {
        print_json(&result)?;
    } else {
        let status = result
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("URL:       {}", result.url);
        println!("Valid:     {}", if result.valid { "yes" } else { "no" });
        println!("Status:    {status}");
        if !result.final_url.is_empty() && result.final_url != result.url {
            println!("Final URL: {}", result.final_url);
        }
        println!("Redirects: {}", result.redirects);
        if let Some(w) = &result.warning {
            println!("Warning:   {w}");
        }
    }

    if !result.valid {
        let reason = result.error.unwrap_or_else(|| "invalid".to_string());
        return Err(QuoteError::PolicyViolation(format!("URL rejected: {reason}")).into());
    }
    Ok(())
}
