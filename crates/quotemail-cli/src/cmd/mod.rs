pub mod audit;
pub mod check_url;
pub mod config;
pub mod init;
pub mod key;
pub mod ledger;
pub mod load;
pub mod overrides;
pub mod render;
pub mod screen;
pub mod send;

use anyhow::Context;
use clap::Args;
use quotemail_core::config::Config;
use quotemail_core::contact::{ContactLoader, LoadResult};
use quotemail_core::crypto::{Cipher, FileKeyStore};
use quotemail_core::fingerprint::ProductInfo;
use quotemail_core::template::Template;
use std::path::Path;

/// Product block shared by `render` and `send`.
#[derive(Args, Debug, Clone, Default)]
pub struct ProductArgs {
    /// Product name
    #[arg(long = "product-name", default_value = "")]
    pub name: String,
    /// Product features
    #[arg(long, default_value = "")]
    pub features: String,
    /// Product page URL (validated before sending)
    #[arg(long = "product-url", default_value = "")]
    pub url: String,
    /// Maker name
    #[arg(long = "maker-name", default_value = "")]
    pub maker_name: String,
    /// Maker part number
    #[arg(long = "maker-code", default_value = "")]
    pub maker_code: String,
    /// Requested quantity
    #[arg(long, default_value = "")]
    pub quantity: String,
}

impl From<ProductArgs> for ProductInfo {
    fn from(a: ProductArgs) -> Self {
        ProductInfo {
            name: a.name,
            features: a.features,
            url: a.url,
            maker_name: a.maker_name,
            maker_code: a.maker_code,
            quantity: a.quantity,
        }
    }
}

/// The configured key as a cipher, or `None` when no key exists yet.
pub fn load_cipher(root: &Path, config: &Config) -> anyhow::Result<Option<Cipher>> {
    let store = FileKeyStore::new(config.key_path(root));
    if !store.exists() {
        return Ok(None);
    }
    let cipher = Cipher::from_provider(&store)
        .with_context(|| format!("failed to read key {}", store.path().display()))?;
    Ok(Some(cipher))
}

pub fn load_contacts(
    file: &Path,
    cipher: Option<&Cipher>,
    encoding: Option<&str>,
) -> anyhow::Result<LoadResult> {
    let mut loader = ContactLoader::new();
    if let Some(c) = cipher {
        loader = loader.with_cipher(c);
    }
    if let Some(label) = encoding {
        loader = loader.with_encoding(label);
    }
    Ok(loader.load(file)?)
}

pub fn load_templates(
    template: Option<&Path>,
    subject: Option<&str>,
) -> anyhow::Result<(Template, Template)> {
    let subject = subject
        .map(Template::new)
        .unwrap_or_else(Template::default_subject);
    let body = match template {
        Some(p) => Template::load(p)?,
        None => Template::default_body(),
    };
    Ok((subject, body))
}
