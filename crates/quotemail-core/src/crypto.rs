//! Field encryption for persisted artifacts.
//!
//! Encrypted values are self-describing strings:
//!
//! ```text
//! enc:v1:<base64(nonce[12] || aes-256-gcm ciphertext+tag)>
//! ```
//!
//! CSV columns holding such values carry an `_enc` suffix. A column whose
//! name and first value disagree about being encrypted is treated as
//! corrupt rather than silently read as plaintext.
//!
//! Key material is obtained through a [`KeyProvider`]. The default provider
//! is [`FileKeyStore`], a base64 key file readable only by its owner.

use crate::error::{QuoteError, Result};
use crate::io;
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use std::path::{Path, PathBuf};

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

pub const ENCRYPTION_VERSION: &str = "v1";
pub const ENCRYPTED_PREFIX: &str = "enc:v1:";
pub const ENCRYPTED_COLUMN_SUFFIX: &str = "_enc";

// ---------------------------------------------------------------------------
// Key providers
// ---------------------------------------------------------------------------

/// Source of the process-wide encryption key.
pub trait KeyProvider {
    /// Return the key, or `None` when no key has been provisioned yet.
    fn load_key(&self) -> Result<Option<[u8; KEY_LEN]>>;
}

/// A key held in memory. Used by tests and by callers that manage key
/// material themselves.
pub struct StaticKey(pub [u8; KEY_LEN]);

impl KeyProvider for StaticKey {
    fn load_key(&self) -> Result<Option<[u8; KEY_LEN]>> {
        Ok(Some(self.0))
    }
}

/// Key stored as base64 in a single file.
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    path: PathBuf,
}

impl FileKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Generate a fresh random key. Refuses to replace an existing key
    /// unless `force` is set: records encrypted under the old key become
    /// unreadable.
    pub fn generate(&self, force: bool) -> Result<()> {
        if self.exists() && !force {
            return Err(QuoteError::KeyExists(self.path.display().to_string()));
        }
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        self.store(&key)?;
        tracing::info!(path = %self.path.display(), "generated encryption key");
        Ok(())
    }

    /// Copy the key file to `dest`.
    pub fn export(&self, dest: &Path) -> Result<()> {
        let key = self.load_key()?.ok_or(QuoteError::KeyNotFound)?;
        let encoded = format!("{}\n", BASE64.encode(key));
        io::atomic_write(dest, encoded.as_bytes())?;
        io::restrict_permissions(dest)
    }

    /// Install the key found in `src` after validating its format.
    pub fn import(&self, src: &Path, force: bool) -> Result<()> {
        if self.exists() && !force {
            return Err(QuoteError::KeyExists(self.path.display().to_string()));
        }
        if !src.exists() {
            return Err(QuoteError::FileNotFound(src.display().to_string()));
        }
        let key = decode_key(&std::fs::read_to_string(src)?)?;
        self.store(&key)
    }

    fn store(&self, key: &[u8; KEY_LEN]) -> Result<()> {
        let encoded = format!("{}\n", BASE64.encode(key));
        io::atomic_write(&self.path, encoded.as_bytes())?;
        io::restrict_permissions(&self.path)
    }
}

impl KeyProvider for FileKeyStore {
    fn load_key(&self) -> Result<Option<[u8; KEY_LEN]>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)?;
        decode_key(&content).map(Some)
    }
}

fn decode_key(content: &str) -> Result<[u8; KEY_LEN]> {
    let bytes = BASE64
        .decode(content.trim())
        .map_err(|e| QuoteError::InvalidKey(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| QuoteError::InvalidKey(format!("expected {KEY_LEN} bytes, got {}", b.len())))
}

// ---------------------------------------------------------------------------
// Cipher
// ---------------------------------------------------------------------------

/// Encrypts and decrypts individual field values.
///
/// A `Cipher` can only be built from an existing key, so a missing key is
/// reported when the cipher is constructed, never halfway through a batch.
#[derive(Clone)]
pub struct Cipher {
    key: [u8; KEY_LEN],
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").finish_non_exhaustive()
    }
}

impl Cipher {
    pub fn from_provider(provider: &dyn KeyProvider) -> Result<Self> {
        let key = provider.load_key()?.ok_or(QuoteError::KeyNotFound)?;
        Ok(Self { key })
    }

    pub fn from_key(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    fn aead(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key).map_err(|e| QuoteError::InvalidKey(e.to_string()))
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let aead = self.aead()?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = aead
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| QuoteError::Encryption)?;
        let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(&nonce_bytes);
        payload.extend_from_slice(&ciphertext);
        Ok(format!("{ENCRYPTED_PREFIX}{}", BASE64.encode(payload)))
    }

    pub fn decrypt(&self, value: &str) -> Result<String> {
        if !is_encrypted_value(value) {
            return Err(QuoteError::Decryption(format!(
                "value is not in '{ENCRYPTED_PREFIX}...' format"
            )));
        }
        match encryption_version(value) {
            Some(ENCRYPTION_VERSION) => {}
            other => {
                return Err(QuoteError::Decryption(format!(
                    "unsupported encryption version: expected {ENCRYPTION_VERSION}, got {}",
                    other.unwrap_or("none")
                )))
            }
        }
        let payload = BASE64
            .decode(&value[ENCRYPTED_PREFIX.len()..])
            .map_err(|e| QuoteError::Decryption(format!("malformed ciphertext: {e}")))?;
        if payload.len() <= NONCE_LEN {
            return Err(QuoteError::Decryption("ciphertext too short".to_string()));
        }
        let (nonce, ciphertext) = payload.split_at(NONCE_LEN);
        let plaintext = self
            .aead()?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                QuoteError::Decryption("wrong key or corrupted data".to_string())
            })?;
        String::from_utf8(plaintext)
            .map_err(|_| QuoteError::Decryption("plaintext is not UTF-8".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Value / column conventions
// ---------------------------------------------------------------------------

pub fn is_encrypted_value(value: &str) -> bool {
    value
        .strip_prefix("enc:v")
        .is_some_and(|rest| rest.contains(':'))
}

/// `enc:v1:...` → `Some("v1")`.
pub fn encryption_version(value: &str) -> Option<&str> {
    let mut parts = value.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("enc"), Some(version), Some(_)) => Some(version),
        _ => None,
    }
}

pub fn is_encrypted_column(name: &str) -> bool {
    name.trim().ends_with(ENCRYPTED_COLUMN_SUFFIX)
}

/// `メールアドレス_enc` → `メールアドレス`.
pub fn original_column_name(name: &str) -> &str {
    let name = name.trim();
    name.strip_suffix(ENCRYPTED_COLUMN_SUFFIX).unwrap_or(name)
}

/// `メールアドレス` → `メールアドレス_enc`.
pub fn encrypted_column_name(name: &str) -> String {
    if is_encrypted_column(name) {
        name.to_string()
    } else {
        format!("{name}{ENCRYPTED_COLUMN_SUFFIX}")
    }
}

/// Column name and value must agree on whether the column is encrypted.
pub fn check_encrypted_column(name: &str, first_value: &str) -> Result<()> {
    let named = is_encrypted_column(name);
    let valued = !first_value.is_empty() && is_encrypted_value(first_value);
    match (named, valued) {
        (true, false) => Err(QuoteError::CorruptData(format!(
            "column '{name}' is marked encrypted but its value is not in \
             '{ENCRYPTED_PREFIX}...' format; the file may be damaged"
        ))),
        (false, true) => Err(QuoteError::CorruptData(format!(
            "column '{name}' is a plain column but holds an encrypted value; \
             the file may be damaged"
        ))),
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cipher(seed: u8) -> Cipher {
        Cipher::from_key([seed; KEY_LEN])
    }

    #[test]
    fn decrypt_inverts_encrypt() {
        let c = cipher(7);
        for plain in ["tanaka@example.co.jp", "", "会社名,メール", "enc:v1:looks-encrypted"] {
            let enc = c.encrypt(plain).unwrap();
            assert!(enc.starts_with(ENCRYPTED_PREFIX));
            assert_eq!(c.decrypt(&enc).unwrap(), plain);
        }
    }

    #[test]
    fn encrypt_is_randomized() {
        let c = cipher(1);
        assert_ne!(c.encrypt("a@example.com").unwrap(), c.encrypt("a@example.com").unwrap());
    }

    #[test]
    fn wrong_key_fails_instead_of_returning_garbage() {
        let enc = cipher(1).encrypt("a@example.com").unwrap();
        let err = cipher(2).decrypt(&enc).unwrap_err();
        assert!(matches!(err, QuoteError::Decryption(_)), "{err}");
    }

    #[test]
    fn rejects_plaintext_and_unknown_version() {
        let c = cipher(3);
        assert!(matches!(c.decrypt("a@example.com"), Err(QuoteError::Decryption(_))));
        let err = c.decrypt("enc:v9:AAAA").unwrap_err();
        assert!(err.to_string().contains("v9"), "{err}");
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let c = cipher(4);
        let enc = c.encrypt("a@example.com").unwrap();
        let mut payload = BASE64.decode(&enc[ENCRYPTED_PREFIX.len()..]).unwrap();
        let last = payload.len() - 1;
        payload[last] ^= 0x01;
        let tampered = format!("{ENCRYPTED_PREFIX}{}", BASE64.encode(payload));
        assert!(c.decrypt(&tampered).is_err());
    }

    #[test]
    fn cipher_requires_a_key() {
        let dir = TempDir::new().unwrap();
        let store = FileKeyStore::new(dir.path().join("missing.key"));
        assert!(matches!(
            Cipher::from_provider(&store),
            Err(QuoteError::KeyNotFound)
        ));
    }

    #[test]
    fn key_store_generate_refuses_overwrite_without_force() {
        let dir = TempDir::new().unwrap();
        let store = FileKeyStore::new(dir.path().join("keys/email.key"));
        store.generate(false).unwrap();
        let first = store.load_key().unwrap().unwrap();
        assert!(matches!(store.generate(false), Err(QuoteError::KeyExists(_))));
        store.generate(true).unwrap();
        assert_ne!(store.load_key().unwrap().unwrap(), first);
    }

    #[test]
    fn export_then_import_preserves_decryptability() {
        let dir = TempDir::new().unwrap();
        let source = FileKeyStore::new(dir.path().join("a.key"));
        source.generate(false).unwrap();
        let enc = Cipher::from_provider(&source)
            .unwrap()
            .encrypt("sato@example.com")
            .unwrap();

        let exported = dir.path().join("backup.key");
        source.export(&exported).unwrap();
        let target = FileKeyStore::new(dir.path().join("b.key"));
        target.import(&exported, false).unwrap();

        let restored = Cipher::from_provider(&target).unwrap();
        assert_eq!(restored.decrypt(&enc).unwrap(), "sato@example.com");
    }

    #[test]
    fn import_rejects_malformed_key() {
        let dir = TempDir::new().unwrap();
        let bad = dir.path().join("bad.key");
        std::fs::write(&bad, "c2hvcnQ=\n").unwrap();
        let store = FileKeyStore::new(dir.path().join("email.key"));
        assert!(matches!(store.import(&bad, false), Err(QuoteError::InvalidKey(_))));
        assert!(!store.exists());
    }

    #[test]
    fn column_conventions() {
        assert!(is_encrypted_column("メールアドレス_enc"));
        assert_eq!(original_column_name("メールアドレス_enc"), "メールアドレス");
        assert_eq!(encrypted_column_name("メールアドレス"), "メールアドレス_enc");
        assert_eq!(encryption_version("enc:v1:abc"), Some("v1"));
        assert_eq!(encryption_version("plain"), None);
    }

    #[test]
    fn column_and_value_must_agree() {
        assert!(check_encrypted_column("メールアドレス_enc", "enc:v1:abc").is_ok());
        assert!(check_encrypted_column("会社名", "A社").is_ok());
        assert!(matches!(
            check_encrypted_column("メールアドレス_enc", "a@example.com"),
            Err(QuoteError::CorruptData(_))
        ));
        assert!(matches!(
            check_encrypted_column("メールアドレス", "enc:v1:abc"),
            Err(QuoteError::CorruptData(_))
        ));
    }
}
