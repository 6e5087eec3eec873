//! Mail templates.
//!
//! One tokenizer accepts `≪name≫`, `«name»` and `{{name}}`; all three
//! resolve against the same [`Variables`] table. Sources are `.txt` files
//! (UTF-8 or CP932) and `.docx` documents, whose paragraph text runs are
//! joined with newlines.

use crate::contact::ContactRecord;
use crate::encoding;
use crate::error::{QuoteError, Result};
use crate::fingerprint::ProductInfo;
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::sync::OnceLock;

pub const VAR_COMPANY: &str = "会社名";
pub const VAR_CONTACT: &str = "担当者名";
pub const VAR_SURNAME: &str = "姓";
pub const VAR_PRODUCT_NAME: &str = "製品名";
pub const VAR_PRODUCT_FEATURES: &str = "製品特徴";
pub const VAR_PRODUCT_URL: &str = "製品URL";
pub const VAR_MAKER_NAME: &str = "メーカー名";
pub const VAR_MAKER_CODE: &str = "メーカーコード";
pub const VAR_QUANTITY: &str = "数量";

pub const BUILTIN_VARIABLES: &[&str] = &[
    VAR_COMPANY,
    VAR_CONTACT,
    VAR_SURNAME,
    VAR_PRODUCT_NAME,
    VAR_PRODUCT_FEATURES,
    VAR_PRODUCT_URL,
    VAR_MAKER_NAME,
    VAR_MAKER_CODE,
    VAR_QUANTITY,
];

const DEFAULT_SUBJECT: &str = "【お見積りのお願い】≪製品名≫";

const DEFAULT_BODY: &str = "≪会社名≫
≪担当者名≫ 様

お世話になっております。

下記製品のお見積りをお願いしたく、ご連絡いたしました。

■ 製品情報
製品名: ≪製品名≫
特徴: ≪製品特徴≫
製品ページ: ≪製品URL≫
メーカー: ≪メーカー名≫ (≪メーカーコード≫)
数量: ≪数量≫

ご検討のほど、よろしくお願いいたします。
";

static PLACEHOLDER_RE: OnceLock<Regex> = OnceLock::new();

fn placeholder_re() -> &'static Regex {
    PLACEHOLDER_RE.get_or_init(|| {
        Regex::new(r"≪([^≪≫]+)≫|«([^«»]+)»|\{\{([^{}]+)\}\}").unwrap()
    })
}

fn placeholder_name<'t>(caps: &Captures<'t>) -> &'t str {
    caps.get(1)
        .or_else(|| caps.get(2))
        .or_else(|| caps.get(3))
        .map_or("", |m| m.as_str().trim())
}

// ---------------------------------------------------------------------------
// Variables
// ---------------------------------------------------------------------------

/// Variable table. Every built-in name is present (empty by default), so a
/// template written for an older field set still renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variables {
    values: BTreeMap<String, String>,
}

impl Default for Variables {
    fn default() -> Self {
        Self {
            values: BUILTIN_VARIABLES
                .iter()
                .map(|name| (name.to_string(), String::new()))
                .collect(),
        }
    }
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Variables for one quote request.
    pub fn for_request(contact: &ContactRecord, product: &ProductInfo) -> Self {
        Self::new()
            .with(VAR_COMPANY, &contact.company_name)
            .with(VAR_CONTACT, &contact.contact_name)
            .with(VAR_SURNAME, contact.surname())
            .with(VAR_PRODUCT_NAME, &product.name)
            .with(VAR_PRODUCT_FEATURES, &product.features)
            .with(VAR_PRODUCT_URL, &product.url)
            .with(VAR_MAKER_NAME, &product.maker_name)
            .with(VAR_MAKER_CODE, &product.maker_code)
            .with(VAR_QUANTITY, &product.quantity)
    }

    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.values.insert(name.trim().to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    text: String,
}

impl Template {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn default_body() -> Self {
        Self::new(DEFAULT_BODY)
    }

    pub fn default_subject() -> Self {
        Self::new(DEFAULT_SUBJECT)
    }

    /// Load a `.txt` or `.docx` template.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(QuoteError::FileNotFound(path.display().to_string()));
        }
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "txt" => {
                let bytes = std::fs::read(path)?;
                Ok(Self::new(encoding::decode(&bytes, None)?.text))
            }
            "docx" => read_docx(path).map(Self::new),
            _ => Err(QuoteError::UnsupportedTemplate(if ext.is_empty() {
                "(none)".to_string()
            } else {
                format!(".{ext}")
            })),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Placeholder names in order of first appearance.
    pub fn variables(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for caps in placeholder_re().captures_iter(&self.text) {
            let name = placeholder_name(&caps);
            if !name.is_empty() && !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
        names
    }

    /// Names used by the template but absent from `vars`.
    pub fn missing(&self, vars: &Variables) -> Vec<String> {
        self.variables()
            .into_iter()
            .filter(|name| vars.get(name).is_none())
            .collect()
    }

    /// Substitute placeholders. Unknown names stay verbatim unless `strict`,
    /// in which case rendering fails listing all of them.
    pub fn render(&self, vars: &Variables, strict: bool) -> Result<String> {
        if strict {
            let missing = self.missing(vars);
            if !missing.is_empty() {
                return Err(QuoteError::MissingVariables(missing));
            }
        }
        let rendered = placeholder_re().replace_all(&self.text, |caps: &Captures<'_>| {
            match vars.get(placeholder_name(caps)) {
                Some(value) => value.to_string(),
                None => caps[0].to_string(),
            }
        });
        Ok(rendered.into_owned())
    }
}

// ---------------------------------------------------------------------------
// .docx
// ---------------------------------------------------------------------------

static PARAGRAPH_RE: OnceLock<Regex> = OnceLock::new();
static RUN_RE: OnceLock<Regex> = OnceLock::new();
static ENTITY_RE: OnceLock<Regex> = OnceLock::new();

fn read_docx(path: &Path) -> Result<String> {
    let file = std::fs::File::open(path)?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| QuoteError::Template(format!("{}: {e}", path.display())))?;
    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|e| QuoteError::Template(format!("{}: {e}", path.display())))?
        .read_to_string(&mut xml)?;
    Ok(docx_paragraphs(&xml).join("\n"))
}

/// Text of each `<w:p>` in document order: `<w:t>` runs concatenated,
/// `<w:tab/>` as a tab, `<w:br/>` as a newline.
fn docx_paragraphs(xml: &str) -> Vec<String> {
    let paragraph_re = PARAGRAPH_RE.get_or_init(|| {
        Regex::new(r"(?s)<w:p(?:\s[^>]*)?/>|<w:p(?:\s[^>]*)?>(.*?)</w:p>").unwrap()
    });
    let run_re = RUN_RE.get_or_init(|| {
        Regex::new(r"(?s)<w:t(?:\s[^>]*)?>(.*?)</w:t>|<w:tab\s*/>|<w:br\s*/>").unwrap()
    });

    paragraph_re
        .captures_iter(xml)
        .map(|p| {
            let body = p.get(1).map_or("", |m| m.as_str());
            run_re
                .captures_iter(body)
                .map(|r| match r.get(1) {
                    Some(text) => unescape_xml(text.as_str()),
                    None if r[0].starts_with("<w:tab") => "\t".to_string(),
                    None => "\n".to_string(),
                })
                .collect::<String>()
        })
        .collect()
}

fn unescape_xml(text: &str) -> String {
    let re = ENTITY_RE.get_or_init(|| Regex::new(r"&(lt|gt|amp|quot|apos|#x[0-9A-Fa-f]+|#[0-9]+);").unwrap());
    re.replace_all(text, |caps: &Captures<'_>| {
        let entity = &caps[1];
        let decoded = match entity {
            "lt" => Some('<'),
            "gt" => Some('>'),
            "amp" => Some('&'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .map(|h| u32::from_str_radix(h, 16))
                .unwrap_or_else(|| entity[1..].parse::<u32>())
                .ok()
                .and_then(char::from_u32),
        };
        decoded.map_or_else(|| caps[0].to_string(), String::from)
    })
    .into_owned()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
