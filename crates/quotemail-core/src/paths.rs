use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const QUOTEMAIL_DIR: &str = ".quotemail";
pub const CONFIG_FILE: &str = ".quotemail/config.yaml";
pub const LEDGER_FILE: &str = ".quotemail/ledger.redb";
pub const KEY_FILE: &str = ".quotemail/keys/email.key";
pub const LOGS_DIR: &str = ".quotemail/logs";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn quotemail_dir(root: &Path) -> PathBuf {
    root.join(QUOTEMAIL_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

/// Resolve a configured path: absolute paths are kept, relative ones are
/// anchored at the project root.
pub fn resolve(root: &Path, configured: &Path) -> PathBuf {
    if configured.is_absolute() {
        configured.to_path_buf()
    } else {
        root.join(configured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_anchors_relative_paths() {
        let root = Path::new("/srv/quotes");
        assert_eq!(
            resolve(root, Path::new(LEDGER_FILE)),
            PathBuf::from("/srv/quotes/.quotemail/ledger.redb")
        );
    }

    #[test]
    fn resolve_keeps_absolute_paths() {
        let root = Path::new("/srv/quotes");
        assert_eq!(
            resolve(root, Path::new("/var/lib/ledger.redb")),
            PathBuf::from("/var/lib/ledger.redb")
        );
    }
}
