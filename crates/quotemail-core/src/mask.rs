//! Address masking for screen output, logs and error fields.

use regex::Regex;
use std::sync::OnceLock;

static EMBEDDED_EMAIL_RE: OnceLock<Regex> = OnceLock::new();

fn embedded_email_re() -> &'static Regex {
    EMBEDDED_EMAIL_RE
        .get_or_init(|| Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").unwrap())
}

/// `tanaka@example.com` → `tan***@example.com`.
pub fn mask_email(email: &str) -> String {
    let Some((local, domain)) = email.split_once('@') else {
        return "***".to_string();
    };
    let visible = if local.chars().count() <= 3 { 1 } else { 3 };
    let keep: String = local.chars().take(visible).collect();
    format!("{keep}***@{domain}")
}

/// `tanaka@example.com` → `***@example.com`.
pub fn mask_email_domain_only(email: &str) -> String {
    match email.split_once('@') {
        Some((_, domain)) => format!("***@{domain}"),
        None => "***".to_string(),
    }
}

/// Replace every address embedded in free text with its domain-only mask.
pub fn mask_emails_in_text(text: &str) -> String {
    embedded_email_re()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            mask_email_domain_only(&caps[0])
        })
        .into_owned()
}
