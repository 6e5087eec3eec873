use crate::output::print_json;
use anyhow::Context;
use clap::Subcommand;
use quotemail_core::{config::Config, crypto::FileKeyStore};
use std::path::{Path, PathBuf};

#[derive(Subcommand)]
pub enum KeySubcommand {
    /// Generate a new encryption key
    Generate {
        /// Replace an existing key (records encrypted with it become unreadable)
        #[arg(long)]
        force: bool,
    },
    /// Copy the key to a file for backup
    Export { dest: PathBuf },
    /// Install a key from a backup file
    Import {
        src: PathBuf,
        /// Replace an existing key
        #[arg(long)]
        force: bool,
    },
}

pub fn run(root: &Path, subcmd: KeySubcommand, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let store = FileKeyStore::new(config.key_path(root));

    let (action, path) = match subcmd {
        KeySubcommand::Generate { force } => {
            store.generate(force)?;
            ("generated", store.path().to_path_buf())
        }
        KeySubcommand::Export { dest } => {
            store.export(&dest)?;
            ("exported", dest)
        }
        KeySubcommand::Import { src, force } => {
            store.import(&src, force)?;
            ("imported", store.path().to_path_buf())
        }
    };

    if json {
        print_json(&serde_json::json!({ "action": action, "path": path }))?;
    } else {
        println!("Key {action}: {}", path.display());
    }
    Ok(())
}
