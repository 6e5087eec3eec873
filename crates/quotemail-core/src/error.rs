use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuoteError {
    #[error("not initialized: run 'quotemail init'")]
    NotInitialized,

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("input file is empty: {0}")]
    EmptyInput(String),

    #[error("missing required column(s): {}", .0.join(", "))]
    Schema(Vec<String>),

    #[error("corrupt data: {0}")]
    CorruptData(String),

    #[error("unsupported file type: '{0}' (expected .txt or .docx)")]
    UnsupportedTemplate(String),

    #[error("undefined template variable(s): {}", .0.join(", "))]
    MissingVariables(Vec<String>),

    #[error("template read error: {0}")]
    Template(String),

    #[error("encryption key not found: run 'quotemail key generate'")]
    KeyNotFound,

    #[error("encryption key already exists at {0}: pass --force to overwrite")]
    KeyExists(String),

    #[error("invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("encryption failed")]
    Encryption,

    #[error("recipient count {count} exceeds max_recipients {max}")]
    RecipientLimit { count: usize, max: usize },

    #[error("send cancelled: {0}")]
    Cancelled(String),

    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("http client error: {0}")]
    Http(String),

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error("audit record already exists: {0}")]
    AuditExists(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, QuoteError>;
