//! PII screening of outbound search queries.
//!
//! Email addresses and phone numbers block the query; occurrences of an
//! organization name only warn. [`PiiScreener::gate`] is the sole
//! constructor of [`ScreenedQuery`], so any function that takes a
//! `ScreenedQuery` cannot be reached with an unscreened string.

use crate::config::PiiConfig;
use crate::error::{QuoteError, Result};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::OnceLock;

const MIN_PHONE_DIGITS: usize = 10;

static EMAIL_RE: OnceLock<Regex> = OnceLock::new();
static PHONE_RE: OnceLock<Regex> = OnceLock::new();

fn email_re() -> &'static Regex {
    EMAIL_RE.get_or_init(|| Regex::new(r"(?i)[a-z0-9._%+\-]+@[a-z0-9.\-]+\.[a-z]{2,}").unwrap())
}

fn phone_re() -> &'static Regex {
    PHONE_RE.get_or_init(|| Regex::new(r"\d[\d\-\s()]{8,}\d").unwrap())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    Email,
    Phone,
    Organization,
}

impl FindingKind {
    pub fn blocks(self) -> bool {
        !matches!(self, Self::Organization)
    }

    fn reason(self) -> &'static str {
        match self {
            Self::Email => "email address detected",
            Self::Phone => "phone number detected",
            Self::Organization => "organization name detected",
        }
    }

    fn remediation(self) -> &'static str {
        match self {
            Self::Email | Self::Phone => "remove it from the query and run again",
            Self::Organization => "confirm the query before continuing",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub kind: FindingKind,
    pub matched: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScreenReport {
    pub findings: Vec<Finding>,
}

impl ScreenReport {
    pub fn is_blocking(&self) -> bool {
        self.findings.iter().any(|f| f.kind.blocks())
    }

    pub fn has_warnings(&self) -> bool {
        self.findings.iter().any(|f| !f.kind.blocks())
    }

    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    /// One paragraph per finding kind, blocking kinds first.
    pub fn message(&self) -> String {
        let mut parts = Vec::new();
        for kind in [FindingKind::Email, FindingKind::Phone, FindingKind::Organization] {
            let matched: Vec<&str> = self
                .findings
                .iter()
                .filter(|f| f.kind == kind)
                .map(|f| f.matched.as_str())
                .collect();
            if !matched.is_empty() {
                parts.push(format!(
                    "{}: {}\n-> {}",
                    kind.reason(),
                    matched.join(", "),
                    kind.remediation()
                ));
            }
        }
        parts.join("\n\n")
    }
}

/// A query that passed the screen. Only [`PiiScreener::gate`] creates one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenedQuery {
    text: String,
    warnings: Vec<String>,
}

impl ScreenedQuery {
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Non-blocking findings that were present when the query passed.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

#[derive(Debug, Clone, Default)]
pub struct PiiScreener {
    config: PiiConfig,
    organizations: BTreeSet<String>,
}

impl PiiScreener {
    pub fn new(config: PiiConfig) -> Self {
        Self {
            config,
            organizations: BTreeSet::new(),
        }
    }

    pub fn with_organizations<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.organizations.extend(
            names
                .into_iter()
                .map(Into::into)
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty()),
        );
        self
    }

    pub fn screen(&self, text: &str) -> ScreenReport {
        let mut findings = Vec::new();

        if self.config.detect_email {
            findings.extend(email_re().find_iter(text).map(|m| Finding {
                kind: FindingKind::Email,
                matched: m.as_str().to_string(),
            }));
        }

        if self.config.detect_phone {
            findings.extend(
                phone_re()
                    .find_iter(text)
                    .map(|m| m.as_str())
                    .filter(|c| c.chars().filter(char::is_ascii_digit).count() >= MIN_PHONE_DIGITS)
                    .map(|c| Finding {
                        kind: FindingKind::Phone,
                        matched: c.trim().to_string(),
                    }),
            );
        }

        if self.config.detect_company {
            findings.extend(
                self.organizations
                    .iter()
                    .filter(|name| text.contains(name.as_str()))
                    .map(|name| Finding {
                        kind: FindingKind::Organization,
                        matched: name.clone(),
                    }),
            );
        }

        ScreenReport { findings }
    }

    /// Screen `text` and hand back a [`ScreenedQuery`] only when nothing
    /// blocking was found.
    pub fn gate(&self, text: &str) -> Result<ScreenedQuery> {
        let report = self.screen(text);
        if report.is_blocking() {
            tracing::warn!(findings = report.findings.len(), "search query blocked by PII screen");
            return Err(QuoteError::PolicyViolation(format!(
                "PII screen: {}",
                report.message()
            )));
        }
        let warnings = if report.has_warnings() {
            vec![report.message()]
        } else {
            Vec::new()
        };
        Ok(ScreenedQuery {
            text: text.to_string(),
            warnings,
        })
    }
}
