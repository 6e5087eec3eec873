//! Contact file loading.
//!
//! Reads a delimited contact list, resolves column aliases, decrypts `_enc`
//! columns and validates each row. Row-level problems are collected in
//! [`LoadResult::errors`] while the valid rows still load; only file-level
//! problems (missing file, empty file, missing required columns, corrupt
//! encrypted columns, missing key) are returned as errors.

use crate::crypto::{self, Cipher};
use crate::encoding;
use crate::error::{QuoteError, Result};
use crate::mask::mask_email;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::OnceLock;

pub const COL_COMPANY: &str = "会社名";
pub const COL_EMAIL: &str = "メールアドレス";
pub const COL_DEPARTMENT: &str = "部署名";
pub const COL_PHONE: &str = "電話番号";
pub const COL_CONTACT: &str = "担当者名";

/// Used when no name column yields a value.
pub const DEFAULT_CONTACT_NAME: &str = "ご担当者様";

const COMPANY_ALIASES: &[&str] = &[COL_COMPANY, "勤務先", "Company", "会社"];
const EMAIL_ALIASES: &[&str] = &[COL_EMAIL, "電子メール アドレス", "電子メール", "Email", "E-mail"];
const DEPARTMENT_ALIASES: &[&str] = &[COL_DEPARTMENT, "部署", "Department"];
const PHONE_ALIASES: &[&str] = &[COL_PHONE, "会社電話", "電話番号 (会社)", "勤務先電話", "Phone"];

const FULL_NAME_COLUMNS: &[&str] = &[COL_CONTACT, "氏名"];
const SURNAME_ALIASES: &[&str] = &["姓", "Last Name", "LastName"];
const GIVEN_NAME_ALIASES: &[&str] = &["名", "First Name", "FirstName"];
const MIDDLE_NAME_ALIASES: &[&str] = &["ミドル ネーム", "Middle Name", "MiddleName"];

static EMAIL_RE: OnceLock<Regex> = OnceLock::new();

/// Syntactic address check: one `@`, a dotted domain, an alphabetic TLD.
pub fn is_valid_email(email: &str) -> bool {
    let re = EMAIL_RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~\-]+@[A-Za-z0-9](?:[A-Za-z0-9\-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9\-]*[A-Za-z0-9])?)*\.[A-Za-z]{2,}$").unwrap()
    });
    re.is_match(email)
        && !email.contains("..")
        && email
            .split_once('@')
            .is_some_and(|(local, _)| !local.starts_with('.') && !local.ends_with('.'))
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContactRecord {
    pub company_name: String,
    pub contact_name: String,
    pub email: String,
    pub department: String,
    pub phone: String,
    /// The row as read, with encrypted columns decrypted under their
    /// original names.
    pub raw: BTreeMap<String, String>,
}

impl ContactRecord {
    pub fn new(company_name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            company_name: company_name.into(),
            contact_name: DEFAULT_CONTACT_NAME.to_string(),
            email: email.into(),
            department: String::new(),
            phone: String::new(),
            raw: BTreeMap::new(),
        }
    }

    pub fn with_contact_name(mut self, name: impl Into<String>) -> Self {
        self.contact_name = name.into();
        self
    }

    /// First whitespace-separated token of the contact name.
    pub fn surname(&self) -> &str {
        self.contact_name
            .split_whitespace()
            .next()
            .unwrap_or(&self.contact_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowError {
    /// 1-based data row (the header is not counted).
    pub row: usize,
    pub message: String,
}

impl std::fmt::Display for RowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "row {}: {}", self.row, self.message)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadResult {
    pub records: Vec<ContactRecord>,
    pub errors: Vec<RowError>,
    pub warnings: Vec<String>,
    pub encoding: String,
}

impl LoadResult {
    pub fn company_names(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|r| r.company_name.as_str())
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
pub struct ContactLoader<'a> {
    cipher: Option<&'a Cipher>,
    encoding: Option<String>,
}

/// Header positions resolved once per file.
struct Columns {
    company: usize,
    email: usize,
    department: Option<usize>,
    phone: Option<usize>,
    full_name: Vec<usize>,
    surname: Option<usize>,
    given: Option<usize>,
    middle: Option<usize>,
}

fn header_key(name: &str) -> String {
    name.trim().to_lowercase()
}

fn find_column(headers: &[String], aliases: &[&str]) -> Option<usize> {
    aliases.iter().find_map(|alias| {
        let wanted = header_key(alias);
        headers.iter().position(|h| header_key(h) == wanted)
    })
}

impl<'a> ContactLoader<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cipher for `_enc` columns. Without one, a file that has encrypted
    /// columns fails to load.
    pub fn with_cipher(mut self, cipher: &'a Cipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn with_encoding(mut self, label: impl Into<String>) -> Self {
        self.encoding = Some(label.into());
        self
    }

    pub fn load(&self, path: &Path) -> Result<LoadResult> {
        if !path.exists() {
            let resolved = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
            return Err(QuoteError::FileNotFound(resolved.display().to_string()));
        }
        let bytes = std::fs::read(path)?;
        self.parse(&bytes, &path.display().to_string())
    }

    /// Parse raw file content. `source` names the input in error messages.
    pub fn parse(&self, bytes: &[u8], source: &str) -> Result<LoadResult> {
        let decoded = encoding::decode(bytes, self.encoding.as_deref())?;
        if decoded.text.trim().is_empty() {
            return Err(QuoteError::EmptyInput(source.to_string()));
        }

        let mut result = LoadResult {
            encoding: decoded.encoding.to_string(),
            ..LoadResult::default()
        };
        if decoded.lossy || encoding::looks_garbled(&decoded.text) {
            result.warnings.push(format!(
                "possible garbled text (read as {}): check the file encoding",
                decoded.encoding
            ));
        }

        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(decoded.text.as_bytes());
        let raw_headers: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();
        let rows: Vec<csv::StringRecord> = reader.records().collect::<std::result::Result<_, _>>()?;

        // Encrypted columns are addressed by their original names from here on.
        let headers: Vec<String> = raw_headers
            .iter()
            .map(|h| crypto::original_column_name(h).to_string())
            .collect();
        let encrypted: Vec<usize> = (0..raw_headers.len())
            .filter(|&i| crypto::is_encrypted_column(&raw_headers[i]))
            .collect();

        let columns = self.resolve_columns(&headers)?;

        if let Some(first) = rows.first() {
            for (i, name) in raw_headers.iter().enumerate() {
                crypto::check_encrypted_column(name, first.get(i).unwrap_or("").trim())?;
            }
        }
        let cipher = match (encrypted.is_empty(), self.cipher) {
            (true, _) => None,
            (false, Some(c)) => Some(c),
            (false, None) => return Err(QuoteError::KeyNotFound),
        };

        let mut seen: HashSet<String> = HashSet::new();
        for (idx, record) in rows.iter().enumerate() {
            let row_no = idx + 1;
            let mut values: Vec<String> = (0..headers.len())
                .map(|i| record.get(i).unwrap_or("").trim().to_string())
                .collect();
            if values.iter().all(String::is_empty) {
                continue;
            }

            if let Some(cipher) = cipher {
                if let Err(e) = decrypt_columns(cipher, &encrypted, &mut values) {
                    result.errors.push(RowError {
                        row: row_no,
                        message: e.to_string(),
                    });
                    continue;
                }
            }

            match build_record(&headers, &columns, values) {
                Ok(contact) => {
                    let key = contact.email.to_lowercase();
                    if !seen.insert(key) {
                        result.warnings.push(format!(
                            "row {row_no}: duplicate email address {} skipped",
                            mask_email(&contact.email)
                        ));
                        continue;
                    }
                    result.records.push(contact);
                }
                Err(message) => result.errors.push(RowError {
                    row: row_no,
                    message,
                }),
            }
        }

        tracing::info!(
            records = result.records.len(),
            errors = result.errors.len(),
            warnings = result.warnings.len(),
            encoding = %result.encoding,
            "loaded contacts"
        );
        Ok(result)
    }

    fn resolve_columns(&self, headers: &[String]) -> Result<Columns> {
        let company = find_column(headers, COMPANY_ALIASES);
        let email = find_column(headers, EMAIL_ALIASES);
        let (Some(company), Some(email)) = (company, email) else {
            let mut missing = Vec::new();
            if company.is_none() {
                missing.push(COL_COMPANY.to_string());
            }
            if email.is_none() {
                missing.push(COL_EMAIL.to_string());
            }
            return Err(QuoteError::Schema(missing));
        };
        Ok(Columns {
            company,
            email,
            department: find_column(headers, DEPARTMENT_ALIASES),
            phone: find_column(headers, PHONE_ALIASES),
            full_name: FULL_NAME_COLUMNS
                .iter()
                .filter_map(|c| find_column(headers, &[*c]))
                .collect(),
            surname: find_column(headers, SURNAME_ALIASES),
            given: find_column(headers, GIVEN_NAME_ALIASES),
            middle: find_column(headers, MIDDLE_NAME_ALIASES),
        })
    }
}

fn decrypt_columns(cipher: &Cipher, encrypted: &[usize], values: &mut [String]) -> Result<()> {
    for &i in encrypted {
        if let Some(value) = values.get_mut(i) {
            if !value.is_empty() {
                *value = cipher.decrypt(value)?;
            }
        }
    }
    Ok(())
}

fn build_record(
    headers: &[String],
    columns: &Columns,
    values: Vec<String>,
) -> std::result::Result<ContactRecord, String> {
    let get = |i: Option<usize>| i.and_then(|i| values.get(i)).cloned().unwrap_or_default();

    let company_name = get(Some(columns.company));
    if company_name.is_empty() {
        return Err(format!("{COL_COMPANY} is empty"));
    }
    let email = get(Some(columns.email));
    if email.is_empty() {
        return Err(format!("{COL_EMAIL} is empty"));
    }
    if !is_valid_email(&email) {
        return Err(format!("invalid email address format: {}", mask_email(&email)));
    }

    let contact_name = resolve_contact_name(columns, &get);
    let raw = headers
        .iter()
        .cloned()
        .zip(values.iter().cloned())
        .collect();

    Ok(ContactRecord {
        company_name,
        contact_name,
        email,
        department: get(columns.department),
        phone: get(columns.phone),
        raw,
    })
}

/// Contact name, first non-empty of: an explicit name column, the full-name
/// column, surname + (middle) + given name, surname alone, the default.
fn resolve_contact_name(columns: &Columns, get: &dyn Fn(Option<usize>) -> String) -> String {
    if let Some(name) = columns
        .full_name
        .iter()
        .map(|&i| get(Some(i)))
        .find(|v| !v.is_empty())
    {
        return name;
    }

    let surname = get(columns.surname);
    let given = get(columns.given);
    let middle = get(columns.middle);
    match (surname.is_empty(), given.is_empty(), middle.is_empty()) {
        (false, false, false) => format!("{surname} {middle} {given}"),
        (false, false, true) => format!("{surname} {given}"),
        (false, true, _) => surname,
        _ => DEFAULT_CONTACT_NAME.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KEY_LEN;
    use tempfile::TempDir;

    fn parse(csv: &str) -> Result<LoadResult> {
        ContactLoader::new().parse(csv.as_bytes(), "contacts.csv")
    }

    #[test]
    fn invalid_email_is_a_row_error_and_valid_rows_load() {
        let result = parse("会社名,メールアドレス\nA社,a@example.com\nB社,bad-email\n").unwrap();
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].company_name, "A社");
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].row, 2);
        assert!(result.errors[0].message.contains("email address format"));
    }

    #[test]
    fn n_well_formed_rows_yield_n_records() {
        let mut csv = String::from("会社名,メールアドレス\n");
        for i in 0..20 {
            csv.push_str(&format!("会社{i},user{i}@example.com\n"));
        }
        let result = parse(&csv).unwrap();
        assert_eq!(result.records.len(), 20);
        assert!(result.errors.is_empty());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn duplicates_keep_first_and_warn_masked() {
        let result = parse(
            "会社名,メールアドレス\nA社,tanaka@example.com\nB社,TANAKA@example.com\nC社,c@example.com\n",
        )
        .unwrap();
        assert_eq!(result.records.len(), 2);
        assert_eq!(result.records[0].company_name, "A社");
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("TAN***@example.com"));
        assert!(!result.warnings[0].contains("TANAKA@"));
    }

    #[test]
    fn aliases_match_case_and_whitespace_insensitively() {
        let result = parse(" company , E-MAIL ,department,Phone\nX社,x@example.com,営業,03-0000-0000\n").unwrap();
        let r = &result.records[0];
        assert_eq!(r.company_name, "X社");
        assert_eq!(r.department, "営業");
        assert_eq!(r.phone, "03-0000-0000");
        assert_eq!(r.contact_name, DEFAULT_CONTACT_NAME);
    }

    #[test]
    fn schema_error_names_every_missing_column() {
        match parse("氏名,電話番号\n田中,03\n") {
            Err(QuoteError::Schema(missing)) => {
                assert_eq!(missing, vec![COL_COMPANY.to_string(), COL_EMAIL.to_string()])
            }
            other => panic!("expected schema error, got {other:?}"),
        }
    }

    #[test]
    fn contact_name_priority_chain() {
        let csv = "会社名,メールアドレス,担当者名,氏名,姓,名,ミドル ネーム\n\
                   A,a@example.com,山田太郎,無視,無視,無視,\n\
                   B,b@example.com,,佐藤花子,無視,無視,\n\
                   C,c@example.com,,,Smith,John,Q\n\
                   D,d@example.com,,,鈴木,一郎,\n\
                   E,e@example.com,,,高橋,,\n\
                   F,f@example.com,,,,,\n";
        let names: Vec<String> = parse(csv)
            .unwrap()
            .records
            .into_iter()
            .map(|r| r.contact_name)
            .collect();
        assert_eq!(
            names,
            vec!["山田太郎", "佐藤花子", "Smith Q John", "鈴木 一郎", "高橋", DEFAULT_CONTACT_NAME]
        );
    }

    #[test]
    fn empty_required_field_is_row_error() {
        let result = parse("会社名,メールアドレス\n,a@example.com\nB社,\n").unwrap();
        assert!(result.records.is_empty());
        assert_eq!(result.errors.len(), 2);
        assert!(result.errors[0].message.contains(COL_COMPANY));
        assert!(result.errors[1].message.contains(COL_EMAIL));
    }

    #[test]
    fn empty_and_missing_files() {
        assert!(matches!(parse("  \n"), Err(QuoteError::EmptyInput(_))));
        let dir = TempDir::new().unwrap();
        let err = ContactLoader::new().load(&dir.path().join("nope.csv")).unwrap_err();
        match err {
            QuoteError::FileNotFound(p) => assert!(p.ends_with("nope.csv")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn header_only_file_has_no_records() {
        let result = parse("会社名,メールアドレス\n").unwrap();
        assert!(result.records.is_empty());
        assert!(result.errors.is_empty());
    }

    #[test]
    fn shift_jis_file_loads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sjis.csv");
        let (bytes, _, _) = encoding_rs::SHIFT_JIS.encode("会社名,メールアドレス\nＡ社,a@example.com\n");
        std::fs::write(&path, &bytes).unwrap();
        let result = ContactLoader::new().load(&path).unwrap();
        assert_eq!(result.encoding, "Shift_JIS");
        assert_eq!(result.records[0].company_name, "Ａ社");
    }

    #[test]
    fn garbled_text_warns_but_loads() {
        let result = parse("会社名,メールアドレス\nA\u{FFFD}社,a@example.com\n").unwrap();
        assert_eq!(result.records.len(), 1);
        assert!(result.warnings.iter().any(|w| w.contains("garbled")));
    }

    #[test]
    fn encrypted_email_column_is_decrypted() {
        let cipher = Cipher::from_key([9; KEY_LEN]);
        let enc = cipher.encrypt("sato@example.com").unwrap();
        let csv = format!("メールアドレス_enc,会社名\n{enc},S社\n");
        let result = ContactLoader::new()
            .with_cipher(&cipher)
            .parse(csv.as_bytes(), "sent.csv")
            .unwrap();
        assert_eq!(result.records[0].email, "sato@example.com");
        assert_eq!(result.records[0].raw.get(COL_EMAIL).unwrap(), "sato@example.com");
    }

    #[test]
    fn encrypted_column_with_plain_value_is_corrupt() {
        let cipher = Cipher::from_key([9; KEY_LEN]);
        let result = ContactLoader::new()
            .with_cipher(&cipher)
            .parse("メールアドレス_enc,会社名\nsato@example.com,S社\n".as_bytes(), "x.csv");
        assert!(matches!(result, Err(QuoteError::CorruptData(_))));
    }

    #[test]
    fn encrypted_column_without_key_is_fatal() {
        let enc = Cipher::from_key([9; KEY_LEN]).encrypt("a@example.com").unwrap();
        let csv = format!("メールアドレス_enc,会社名\n{enc},S社\n");
        assert!(matches!(parse(&csv), Err(QuoteError::KeyNotFound)));
    }

    #[test]
    fn wrong_key_rows_become_errors() {
        let enc = Cipher::from_key([1; KEY_LEN]).encrypt("a@example.com").unwrap();
        let other = Cipher::from_key([2; KEY_LEN]);
        let csv = format!("メールアドレス_enc,会社名\n{enc},S社\n");
        let result = ContactLoader::new()
            .with_cipher(&other)
            .parse(csv.as_bytes(), "x.csv")
            .unwrap();
        assert!(result.records.is_empty());
        assert!(result.errors[0].message.contains("decryption failed"));
    }

    #[test]
    fn email_syntax() {
        assert!(is_valid_email("a.b+c@sub.example.co.jp"));
        for bad in ["bad-email", "a@b", "a@@b.com", ".a@b.com", "a..b@c.com", "a@-b.com", "a b@c.com"] {
            assert!(!is_valid_email(bad), "{bad}");
        }
    }
}
