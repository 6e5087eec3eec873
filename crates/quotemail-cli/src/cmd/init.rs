use anyhow::Context;
use quotemail_core::{config::Config, crypto::FileKeyStore, io, paths};
use std::path::Path;

pub fn run(root: &Path, no_key: bool) -> anyhow::Result<()> {
    println!("Initializing quotemail in: {}", root.display());

    let dir = paths::quotemail_dir(root);
    io::ensure_dir(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

    // 1. Config
    let created = Config::default()
        .save_if_missing(root)
        .context("failed to write config.yaml")?;
    if created {
        println!("  created: {}", paths::CONFIG_FILE);
        println!("           set mailer.from before sending for real");
    } else {
        println!("  exists:  {}", paths::CONFIG_FILE);
    }
    let config = Config::load(root).context("failed to load config")?;

    // 2. Audit log directory
    let log_dir = config.log_dir(root);
    io::ensure_dir(&log_dir).with_context(|| format!("failed to create {}", log_dir.display()))?;

    // 3. Encryption key
    let store = FileKeyStore::new(config.key_path(root));
    if store.exists() {
        println!("  exists:  {}", store.path().display());
    } else if no_key {
        println!("  skipped: encryption key (run 'quotemail key generate' before sending)");
    } else {
        store.generate(false).context("failed to generate encryption key")?;
        println!("  created: {}", store.path().display());
        println!();
        println!("Back up the key: audit records written with it cannot be read without it.");
    }

    Ok(())
}
