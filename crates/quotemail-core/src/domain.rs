//! Recipient domain allow/deny lists.
//!
//! Precedence: blacklist match rejects; an empty whitelist allows; a
//! whitelist match allows; anything else rejects. A list entry matches the
//! domain itself and every subdomain of it.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainDecision {
    pub allowed: bool,
    pub domain: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct DomainFilter {
    whitelist: Vec<String>,
    blacklist: Vec<String>,
}

impl DomainFilter {
    pub fn new(whitelist: &[String], blacklist: &[String]) -> Self {
        Self {
            whitelist: normalize_list(whitelist),
            blacklist: normalize_list(blacklist),
        }
    }

    pub fn check(&self, email: &str) -> DomainDecision {
        let domain = email
            .split_once('@')
            .map(|(_, d)| d.trim().to_lowercase())
            .unwrap_or_default();

        let (allowed, reason) = if matches_any(&domain, &self.blacklist) {
            (false, format!("domain blacklist: {domain} is denied"))
        } else if self.whitelist.is_empty() {
            (true, "no domain whitelist configured".to_string())
        } else if matches_any(&domain, &self.whitelist) {
            (true, format!("domain whitelist: {domain} is allowed"))
        } else {
            (false, format!("domain whitelist: {domain} is not listed"))
        };

        DomainDecision {
            allowed,
            domain,
            reason,
        }
    }
}

fn normalize_list(list: &[String]) -> Vec<String> {
    list.iter()
        .map(|d| d.trim().trim_start_matches('.').to_lowercase())
        .filter(|d| !d.is_empty())
        .collect()
}

fn matches_any(domain: &str, list: &[String]) -> bool {
    !domain.is_empty()
        && list.iter().any(|pattern| {
            domain == pattern
                || domain
                    .strip_suffix(pattern.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
}
