//! Normalization and hashing of the fields that identify "the same request".
//!
//! The ledger keys every send by `(recipient, fingerprint)`. Which product
//! fields feed the fingerprint is configuration ([`FingerprintField`]); the
//! values are normalized first so cosmetic differences (full-width digits,
//! `1,000` vs `1000`, tracking parameters on a URL) do not defeat dedup.

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::OnceLock;
use unicode_normalization::UnicodeNormalization;

pub const FINGERPRINT_VERSION: &str = "v1";

const TRACKING_QUERY_PREFIXES: &[&str] = &["utm_"];
const TRACKING_QUERY_KEYS: &[&str] = &[
    "gclid", "fbclid", "msclkid", "mc_cid", "mc_eid", "_ga", "_gl", "yclid",
];

// ---------------------------------------------------------------------------
// ProductInfo
// ---------------------------------------------------------------------------

/// Product block carried by a quote request. Every field defaults to empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub features: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub maker_name: String,
    #[serde(default)]
    pub maker_code: String,
    #[serde(default)]
    pub quantity: String,
}

impl ProductInfo {
    pub fn is_empty(&self) -> bool {
        [
            &self.name,
            &self.features,
            &self.url,
            &self.maker_name,
            &self.maker_code,
            &self.quantity,
        ]
        .iter()
        .all(|v| v.trim().is_empty())
    }

    /// Normalized value of one fingerprint field.
    pub fn normalized(&self, field: FingerprintField) -> String {
        match field {
            FingerprintField::ProductName => normalize_text(&self.name),
            FingerprintField::ProductFeatures => normalize_text(&self.features),
            FingerprintField::ProductUrl => canonical_url(&self.url),
            FingerprintField::MakerName => normalize_text(&self.maker_name),
            FingerprintField::MakerCode => normalize_maker_code(&self.maker_code),
            FingerprintField::Quantity => normalize_quantity(&self.quantity),
        }
    }
}

// ---------------------------------------------------------------------------
// FingerprintField
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintField {
    ProductName,
    ProductFeatures,
    ProductUrl,
    MakerName,
    MakerCode,
    Quantity,
}

impl FingerprintField {
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::ProductName,
            Self::MakerCode,
            Self::ProductUrl,
            Self::Quantity,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProductName => "product_name",
            Self::ProductFeatures => "product_features",
            Self::ProductUrl => "product_url",
            Self::MakerName => "maker_name",
            Self::MakerCode => "maker_code",
            Self::Quantity => "quantity",
        }
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// NFKC, line endings folded to `\n`, surrounding whitespace trimmed.
pub fn normalize_text(value: &str) -> String {
    let folded: String = value.nfkc().collect();
    folded.replace("\r\n", "\n").replace('\r', "\n").trim().to_string()
}

pub fn normalize_maker_code(value: &str) -> String {
    normalize_text(value).to_lowercase()
}

/// Subject lines compare with runs of whitespace collapsed.
pub fn normalize_subject(value: &str) -> String {
    normalize_text(value)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

static EMAIL_IN_TEXT_RE: OnceLock<Regex> = OnceLock::new();
static DECIMAL_RE: OnceLock<Regex> = OnceLock::new();

/// Lowercased address; `"Tanaka <T@Example.com>"` → `t@example.com`.
pub fn normalize_recipient(value: &str) -> String {
    let raw = normalize_text(value).to_lowercase();
    let re = EMAIL_IN_TEXT_RE.get_or_init(|| {
        Regex::new(r"[a-z0-9._%+\-]+@[a-z0-9.\-]+\.[a-z]{2,}").unwrap()
    });
    match re.find(&raw) {
        Some(m) => m.as_str().to_string(),
        None => raw,
    }
}

/// Canonical decimal form: `"1,000"` → `1000`, `"２．５０"` → `2.5`.
/// Non-numeric quantities are kept as lowercased text.
pub fn normalize_quantity(value: &str) -> String {
    let normalized = normalize_text(value);
    if normalized.is_empty() {
        return normalized;
    }
    let compact = normalized.replace(',', "");
    let re = DECIMAL_RE
        .get_or_init(|| Regex::new(r"^([+-]?)(\d*)(?:\.(\d*))?$").unwrap());
    let Some(caps) = re.captures(&compact) else {
        return normalized.to_lowercase();
    };
    let int_part = caps.get(2).map_or("", |m| m.as_str());
    let frac_part = caps.get(3).map_or("", |m| m.as_str());
    if int_part.is_empty() && frac_part.is_empty() {
        return normalized.to_lowercase();
    }

    let int_part = int_part.trim_start_matches('0');
    let int_part = if int_part.is_empty() { "0" } else { int_part };
    let frac_part = frac_part.trim_end_matches('0');
    let sign = match &caps[1] {
        "-" if int_part != "0" || !frac_part.is_empty() => "-",
        _ => "",
    };
    if frac_part.is_empty() {
        format!("{sign}{int_part}")
    } else {
        format!("{sign}{int_part}.{frac_part}")
    }
}

fn is_tracking_param(key: &str) -> bool {
    let key = key.trim().to_ascii_lowercase();
    TRACKING_QUERY_KEYS.contains(&key.as_str())
        || TRACKING_QUERY_PREFIXES.iter().any(|p| key.starts_with(p))
}

/// Canonical product URL for fingerprinting.
///
/// Scheme and host are lowercased, default ports and the fragment dropped,
/// tracking parameters removed and the remaining query pairs sorted. Input
/// that does not parse as an absolute URL falls back to [`normalize_text`].
pub fn canonical_url(value: &str) -> String {
    let raw = normalize_text(value);
    if raw.is_empty() {
        return raw;
    }
    let Ok(mut url) = url::Url::parse(&raw) else {
        return raw;
    };
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }
    url.set_fragment(None);
    if url.path().is_empty() && !url.cannot_be_a_base() {
        url.set_path("/");
    }
    url.to_string()
}

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

pub fn sha256_hex(data: &str) -> String {
    hex::encode(Sha256::digest(data.as_bytes()))
}

/// Payload fingerprint over the configured fields.
///
/// Fields are deduplicated and hashed in a fixed order, so the order they are
/// listed in configuration does not change the result.
pub fn payload_fingerprint(product: &ProductInfo, fields: &[FingerprintField]) -> String {
    let fields: BTreeSet<FingerprintField> = fields.iter().copied().collect();
    let payload = fields
        .into_iter()
        .map(|f| format!("{}={}", f.as_str(), product.normalized(f)))
        .collect::<Vec<_>>()
        .join("\n");
    format!("fp:{FINGERPRINT_VERSION}:{}", sha256_hex(&payload))
}

/// Hash of a normalized recipient, used wherever the address itself must not
/// be stored in clear.
pub fn recipient_hash(recipient_norm: &str) -> String {
    sha256_hex(recipient_norm)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn product() -> ProductInfo {
        ProductInfo {
            name: "ステンレスボルト M8".into(),
            features: "耐食性".into(),
            url: "https://Shop.Example.com/item/42?color=red".into(),
            maker_name: "Example工業".into(),
            maker_code: "SB-M8-30".into(),
            quantity: "1,000".into(),
        }
    }

    #[test]
    fn text_normalization_folds_width_and_newlines() {
        assert_eq!(normalize_text("  ＡＢＣ１２３\r\nx "), "ABC123\nx");
    }

    #[test]
    fn quantity_canonical_forms() {
        assert_eq!(normalize_quantity("1,000"), "1000");
        assert_eq!(normalize_quantity("１０００"), "1000");
        assert_eq!(normalize_quantity("007"), "7");
        assert_eq!(normalize_quantity("2.50"), "2.5");
        assert_eq!(normalize_quantity("3.0"), "3");
        assert_eq!(normalize_quantity(".5"), "0.5");
        assert_eq!(normalize_quantity("-0"), "0");
        assert_eq!(normalize_quantity("10 Pcs"), "10 pcs");
        assert_eq!(normalize_quantity(""), "");
    }

    #[test]
    fn recipient_is_extracted_and_lowercased() {
        assert_eq!(normalize_recipient(" Tanaka <T.Tanaka@Example.COM> "), "t.tanaka@example.com");
        assert_eq!(normalize_recipient("not-an-address"), "not-an-address");
    }

    #[test]
    fn subject_whitespace_collapses() {
        assert_eq!(normalize_subject(" 見積依頼 \n  ボルト "), "見積依頼 ボルト");
    }

    #[test]
    fn canonical_url_drops_tracking_and_sorts_query() {
        assert_eq!(
            canonical_url("HTTPS://Shop.Example.com:443/item?b=2&utm_source=mail&a=1&gclid=x#top"),
            "https://shop.example.com/item?a=1&b=2"
        );
        assert_eq!(canonical_url("https://example.com"), "https://example.com/");
        assert_eq!(canonical_url("http://example.com:8080/x"), "http://example.com:8080/x");
        assert_eq!(canonical_url("not a url"), "not a url");
    }

    #[test]
    fn fingerprint_is_stable_under_cosmetic_changes() {
        let fields = FingerprintField::defaults();
        let a = product();
        let b = ProductInfo {
            url: "https://shop.example.com/item/42?utm_campaign=q3&color=red".into(),
            maker_code: "sb-m8-30".into(),
            quantity: "１０００".into(),
            ..product()
        };
        assert_eq!(payload_fingerprint(&a, &fields), payload_fingerprint(&b, &fields));
    }

    #[test]
    fn fingerprint_changes_with_each_default_field() {
        let fields = FingerprintField::defaults();
        let base = payload_fingerprint(&product(), &fields);
        let variants = [
            ProductInfo { name: "別製品".into(), ..product() },
            ProductInfo { maker_code: "SB-M10".into(), ..product() },
            ProductInfo { url: "https://shop.example.com/item/43".into(), ..product() },
            ProductInfo { quantity: "500".into(), ..product() },
        ];
        for v in variants {
            assert_ne!(payload_fingerprint(&v, &fields), base, "{v:?}");
        }
    }

    #[test]
    fn fields_outside_the_set_do_not_affect_fingerprint() {
        let fields = FingerprintField::defaults();
        let base = payload_fingerprint(&product(), &fields);
        let changed = ProductInfo {
            features: "別の特徴".into(),
            maker_name: "別メーカー".into(),
            ..product()
        };
        assert_eq!(payload_fingerprint(&changed, &fields), base);

        let wider = [FingerprintField::ProductFeatures];
        assert_ne!(
            payload_fingerprint(&changed, &wider),
            payload_fingerprint(&product(), &wider)
        );
    }

    #[test]
    fn field_order_is_irrelevant() {
        let p = product();
        let forward = FingerprintField::defaults();
        let mut reversed = forward.clone();
        reversed.reverse();
        assert_eq!(payload_fingerprint(&p, &forward), payload_fingerprint(&p, &reversed));
        assert!(payload_fingerprint(&p, &forward).starts_with("fp:v1:"));
    }
}
