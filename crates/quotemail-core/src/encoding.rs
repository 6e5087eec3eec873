//! Character-set detection for contact files and text templates.

use crate::error::{QuoteError, Result};
use encoding_rs::{Encoding, SHIFT_JIS, UTF_8};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Clone)]
pub struct Decoded {
    pub text: String,
    /// WHATWG name of the encoding that produced `text`.
    pub encoding: &'static str,
    /// True when undecodable bytes were replaced with U+FFFD.
    pub lossy: bool,
}

/// Decode `bytes` using `hint` when given, otherwise: UTF-8 with BOM, strict
/// UTF-8, then Shift_JIS (encoding_rs treats CP932 as Shift_JIS).
pub fn decode(bytes: &[u8], hint: Option<&str>) -> Result<Decoded> {
    if let Some(label) = hint {
        let label = label.trim();
        // encoding_rs follows the WHATWG label table, which lacks the Windows code page name.
        let whatwg = if label.eq_ignore_ascii_case("cp932") { "windows-31j" } else { label };
        let encoding = Encoding::for_label(whatwg.as_bytes())
            .ok_or_else(|| QuoteError::InvalidInput(format!("unknown encoding '{label}'")))?;
        let (text, used, lossy) = encoding.decode(bytes);
        return Ok(Decoded {
            text: text.into_owned(),
            encoding: used.name(),
            lossy,
        });
    }

    if let Some(rest) = bytes.strip_prefix(UTF8_BOM) {
        let (text, lossy) = UTF_8.decode_without_bom_handling(rest);
        return Ok(Decoded {
            text: text.into_owned(),
            encoding: UTF_8.name(),
            lossy,
        });
    }

    if let Ok(text) = std::str::from_utf8(bytes) {
        return Ok(Decoded {
            text: text.to_string(),
            encoding: UTF_8.name(),
            lossy: false,
        });
    }

    let (text, lossy) = SHIFT_JIS.decode_without_bom_handling(bytes);
    Ok(Decoded {
        text: text.into_owned(),
        encoding: SHIFT_JIS.name(),
        lossy,
    })
}

/// Replacement characters, NULs and `□` usually mean the file was read with
/// the wrong encoding.
pub fn looks_garbled(text: &str) -> bool {
    text.contains(['\u{FFFD}', '\0', '□'])
}
