use crate::error::{QuoteError, Result};
use crate::fingerprint::FingerprintField;
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// Rerun policy / scope
// ---------------------------------------------------------------------------

/// What happens when the ledger already holds a send inside the rerun window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RerunPolicy {
    /// Skip silently and report the recipient as skipped.
    #[default]
    AutoSkip,
    /// Hold the recipient unless an override is active or the caller's
    /// rerun gate approves.
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RerunScope {
    /// Entries from any run count as prior sends.
    #[default]
    Global,
    /// Only entries written by the current run count.
    Run,
}

// ---------------------------------------------------------------------------
// UrlCheckConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlCheckConfig {
    #[serde(default = "default_url_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_url_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_url_retry_interval")]
    pub retry_interval_secs: f64,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: u32,
}

fn default_url_timeout() -> u64 {
    10
}

fn default_url_retry_count() -> u32 {
    2
}

fn default_url_retry_interval() -> f64 {
    3.0
}

fn default_max_redirects() -> u32 {
    5
}

impl Default for UrlCheckConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_url_timeout(),
            retry_count: default_url_retry_count(),
            retry_interval_secs: default_url_retry_interval(),
            max_redirects: default_max_redirects(),
        }
    }
}

// ---------------------------------------------------------------------------
// PiiConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PiiConfig {
    #[serde(default = "default_true")]
    pub detect_email: bool,
    #[serde(default = "default_true")]
    pub detect_phone: bool,
    #[serde(default = "default_true")]
    pub detect_company: bool,
}

fn default_true() -> bool {
    true
}

impl Default for PiiConfig {
    fn default() -> Self {
        Self {
            detect_email: true,
            detect_phone: true,
            detect_company: true,
        }
    }
}

// ---------------------------------------------------------------------------
// MailerConfig
// ---------------------------------------------------------------------------

/// External program that accepts an RFC 5322 message on stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailerConfig {
    #[serde(default = "default_mailer_command")]
    pub command: String,
    #[serde(default = "default_mailer_args")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

fn default_mailer_command() -> String {
    "sendmail".to_string()
}

fn default_mailer_args() -> Vec<String> {
    vec!["-t".to_string(), "-i".to_string()]
}

impl Default for MailerConfig {
    fn default() -> Self {
        Self {
            command: default_mailer_command(),
            args: default_mailer_args(),
            from: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_max_recipients")]
    pub max_recipients: usize,
    #[serde(default = "default_confirmation_threshold")]
    pub confirmation_threshold: usize,
    #[serde(default = "default_send_interval")]
    pub send_interval_secs: f64,
    #[serde(default = "default_send_retry_count")]
    pub send_retry_count: u32,
    #[serde(default = "default_send_retry_interval")]
    pub send_retry_interval_secs: f64,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub domain_whitelist: Vec<String>,
    #[serde(default)]
    pub domain_blacklist: Vec<String>,
    #[serde(default)]
    pub rerun_policy: RerunPolicy,
    #[serde(default)]
    pub rerun_scope: RerunScope,
    #[serde(default = "default_rerun_window")]
    pub rerun_window_hours: u32,
    #[serde(default = "default_reservation_ttl")]
    pub reservation_ttl_secs: u64,
    /// How long a key whose send outcome is unknown stays marked as held.
    #[serde(default = "default_unknown_sent_hold")]
    pub unknown_sent_hold_secs: u64,
    #[serde(default = "FingerprintField::defaults")]
    pub fingerprint_fields: Vec<FingerprintField>,
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,
    #[serde(default)]
    pub template_strict: bool,
    /// Organization names the PII screener warns about in search queries,
    /// in addition to the company names of the loaded contacts.
    #[serde(default)]
    pub organization_names: Vec<String>,
    #[serde(default)]
    pub url: UrlCheckConfig,
    #[serde(default)]
    pub pii: PiiConfig,
    #[serde(default)]
    pub mailer: MailerConfig,
}

fn default_max_recipients() -> usize {
    50
}

fn default_confirmation_threshold() -> usize {
    5
}

fn default_send_interval() -> f64 {
    3.0
}

fn default_send_retry_count() -> u32 {
    3
}

fn default_send_retry_interval() -> f64 {
    3.0
}

fn default_rerun_window() -> u32 {
    24
}

fn default_reservation_ttl() -> u64 {
    2700
}

fn default_unknown_sent_hold() -> u64 {
    1800
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from(paths::LEDGER_FILE)
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(paths::LOGS_DIR)
}

fn default_key_path() -> PathBuf {
    PathBuf::from(paths::KEY_FILE)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_recipients: default_max_recipients(),
            confirmation_threshold: default_confirmation_threshold(),
            send_interval_secs: default_send_interval(),
            send_retry_count: default_send_retry_count(),
            send_retry_interval_secs: default_send_retry_interval(),
            dry_run: false,
            domain_whitelist: Vec::new(),
            domain_blacklist: Vec::new(),
            rerun_policy: RerunPolicy::default(),
            rerun_scope: RerunScope::default(),
            rerun_window_hours: default_rerun_window(),
            reservation_ttl_secs: default_reservation_ttl(),
            unknown_sent_hold_secs: default_unknown_sent_hold(),
            fingerprint_fields: FingerprintField::defaults(),
            ledger_path: default_ledger_path(),
            log_dir: default_log_dir(),
            key_path: default_key_path(),
            template_strict: false,
            organization_names: Vec::new(),
            url: UrlCheckConfig::default(),
            pii: PiiConfig::default(),
            mailer: MailerConfig::default(),
        }
    }
}

impl Config {
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(QuoteError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    /// Load the config if present, otherwise fall back to defaults.
    pub fn load_or_default(root: &Path) -> Result<Self> {
        match Self::load(root) {
            Err(QuoteError::NotInitialized) => Ok(Self::default()),
            other => other,
        }
    }

    /// Write this config unless a config file already exists. Returns true
    /// if the file was written.
    pub fn save_if_missing(&self, root: &Path) -> Result<bool> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::write_if_missing(&path, data.as_bytes())
    }

    pub fn send_interval(&self) -> Duration {
        secs_f64(self.send_interval_secs)
    }

    pub fn send_retry_interval(&self) -> Duration {
        secs_f64(self.send_retry_interval_secs)
    }

    pub fn rerun_window(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.rerun_window_hours))
    }

    pub fn ledger_path(&self, root: &Path) -> PathBuf {
        paths::resolve(root, &self.ledger_path)
    }

    pub fn log_dir(&self, root: &Path) -> PathBuf {
        paths::resolve(root, &self.log_dir)
    }

    pub fn key_path(&self, root: &Path) -> PathBuf {
        paths::resolve(root, &self.key_path)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.max_recipients == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "max_recipients is 0: every batch will be rejected".to_string(),
            });
        }

        if self.confirmation_threshold > self.max_recipients {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "confirmation_threshold {} is above max_recipients {}: confirmation never triggers",
                    self.confirmation_threshold, self.max_recipients
                ),
            });
        }

        for (name, value) in [
            ("send_interval_secs", self.send_interval_secs),
            ("send_retry_interval_secs", self.send_retry_interval_secs),
            ("url.retry_interval_secs", self.url.retry_interval_secs),
        ] {
            if !value.is_finite() || value < 0.0 {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!("{name} must be a non-negative number, got {value}"),
                });
            }
        }

        if self.rerun_window_hours == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "rerun_window_hours is 0: re-run detection is disabled".to_string(),
            });
        }

        if self.fingerprint_fields.is_empty() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "fingerprint_fields is empty: every request to a recipient \
                          shares one ledger key"
                    .to_string(),
            });
        }

        for domain in &self.domain_whitelist {
            if self
                .domain_blacklist
                .iter()
                .any(|b| b.trim().eq_ignore_ascii_case(domain.trim()))
            {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!(
                        "domain '{domain}' is in both lists; the blacklist wins"
                    ),
                });
            }
        }

        if self.mailer.command.trim().is_empty() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "mailer.command is empty".to_string(),
            });
        }

        if self.send_retry_count > 10 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "send_retry_count={} (>10 is unusual)",
                    self.send_retry_count
                ),
            });
        }

        warnings
    }
}

fn secs_f64(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn empty_yaml_yields_defaults() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.max_recipients, 50);
        assert_eq!(cfg.confirmation_threshold, 5);
        assert_eq!(cfg.rerun_window_hours, 24);
        assert_eq!(cfg.unknown_sent_hold_secs, 1800);
        assert_eq!(cfg.rerun_policy, RerunPolicy::AutoSkip);
        assert_eq!(cfg.rerun_scope, RerunScope::Global);
        assert_eq!(cfg.url.max_redirects, 5);
        assert_eq!(cfg.url.retry_count, 2);
        assert!(cfg.pii.detect_phone);
        assert_eq!(cfg.fingerprint_fields, FingerprintField::defaults());
        assert_eq!(cfg.mailer.command, "sendmail");
        assert_eq!(cfg.mailer.args, vec!["-t", "-i"]);
    }

    #[test]
    fn parses_snake_case_enums() {
        let cfg: Config =
            serde_yaml::from_str("rerun_policy: block\nrerun_scope: run\n").unwrap();
        assert_eq!(cfg.rerun_policy, RerunPolicy::Block);
        assert_eq!(cfg.rerun_scope, RerunScope::Run);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let cfg = Config {
            max_recipients: 7,
            domain_blacklist: vec!["spam.example".into()],
            ..Config::default()
        };
        assert!(cfg.save_if_missing(dir.path()).unwrap());
        let loaded = Config::load(dir.path()).unwrap();
        assert_eq!(loaded.max_recipients, 7);
        assert_eq!(loaded.domain_blacklist, vec!["spam.example".to_string()]);

        // An existing config is never overwritten.
        assert!(!Config::default().save_if_missing(dir.path()).unwrap());
        assert_eq!(Config::load(dir.path()).unwrap().max_recipients, 7);
    }

    #[test]
    fn load_missing_is_not_initialized() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Config::load(dir.path()),
            Err(QuoteError::NotInitialized)
        ));
        assert_eq!(Config::load_or_default(dir.path()).unwrap().max_recipients, 50);
    }

    #[test]
    fn default_config_has_no_warnings() {
        assert!(Config::default().validate().is_empty());
    }

    #[test]
    fn validate_flags_zero_max_recipients() {
        let cfg = Config {
            max_recipients: 0,
            confirmation_threshold: 0,
            ..Config::default()
        };
        let warnings = cfg.validate();
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Error && w.message.contains("max_recipients")));
    }

    #[test]
    fn validate_flags_domain_in_both_lists() {
        let cfg = Config {
            domain_whitelist: vec!["example.com".into()],
            domain_blacklist: vec!["EXAMPLE.com".into()],
            ..Config::default()
        };
        let warnings = cfg.validate();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("blacklist wins"));
    }

    #[test]
    fn negative_interval_is_an_error_and_clamps_to_zero() {
        let cfg = Config {
            send_interval_secs: -1.0,
            ..Config::default()
        };
        assert!(cfg
            .validate()
            .iter()
            .any(|w| w.message.contains("send_interval_secs")));
        assert_eq!(cfg.send_interval(), Duration::ZERO);
    }
}
