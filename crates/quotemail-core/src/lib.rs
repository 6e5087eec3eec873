pub mod audit;
pub mod config;
pub mod contact;
pub mod crypto;
pub mod domain;
pub mod encoding;
pub mod error;
pub mod fingerprint;
pub mod io;
pub mod ledger;
pub mod mask;
pub mod paths;
pub mod pii;
pub mod retry;
pub mod sender;
pub mod template;
pub mod transport;
pub mod url_check;

pub use error::{QuoteError, Result};
