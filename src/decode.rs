//! RFC 2047 encoded-word decoding for display of `From` header values.

use base64::{engine::general_purpose, Engine as _};
use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

lazy_static! {
    static ref ENCODED_WORD: Regex =
        Regex::new(r"=\?([^?\s]+)\?([BbQq])\?([^?\s]*)\?=").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unsupported charset: {0}")]
    UnsupportedCharset(String),
    #[error("invalid base64 in encoded word: {0}")]
    InvalidBase64(String),
    #[error("invalid quoted-printable in encoded word: {0}")]
    InvalidQuotedPrintable(String),
    #[error("decoded text is not valid {0}")]
    InvalidText(String),
}

/// Decodes every encoded word of a header value. Whitespace separating two
/// adjacent encoded words is dropped, anything else is kept verbatim.
pub fn decode_header(raw: &str) -> Result<String, DecodeError> {
    let mut out = String::with_capacity(raw.len());
    let mut last_end = 0;
    let mut previous_was_word = false;

    for caps in ENCODED_WORD.captures_iter(raw) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        let gap = &raw[last_end..whole.start()];
        if !(previous_was_word && gap.chars().all(char::is_whitespace)) {
            out.push_str(gap);
        }

        let bytes = match &caps[2] {
            "B" | "b" => decode_b(&caps[3])?,
            _ => decode_q(&caps[3])?,
        };
        out.push_str(&to_text(&caps[1], bytes)?);

        last_end = whole.end();
        previous_was_word = true;
    }
    out.push_str(&raw[last_end..]);

    Ok(out)
}

/// Display form of a raw `From` value. Never fails: undecodable input is
/// returned unchanged.
pub fn display_from(raw: &str) -> String {
    match decode_header(raw) {
        Ok(decoded) => decoded,
        Err(e) => {
            log::debug!("Keeping raw From value, decoding failed: {}", e);
            raw.to_string()
        }
    }
}

fn decode_b(text: &str) -> Result<Vec<u8>, DecodeError> {
    general_purpose::STANDARD_NO_PAD
        .decode(text.trim_end_matches('='))
        .map_err(|_| DecodeError::InvalidBase64(text.to_string()))
}

fn decode_q(text: &str) -> Result<Vec<u8>, DecodeError> {
    let invalid = || DecodeError::InvalidQuotedPrintable(text.to_string());
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'_' => out.push(b' '),
            b'=' => {
                let hex = bytes.get(i + 1..i + 3).ok_or_else(invalid)?;
                if !hex.iter().all(u8::is_ascii_hexdigit) {
                    return Err(invalid());
                }
                let hex = std::str::from_utf8(hex).map_err(|_| invalid())?;
                out.push(u8::from_str_radix(hex, 16).map_err(|_| invalid())?);
                i += 2;
            }
            b => out.push(b),
        }
        i += 1;
    }

    Ok(out)
}

fn to_text(charset: &str, bytes: Vec<u8>) -> Result<String, DecodeError> {
    // RFC 2231 allows a language suffix: "utf-8*en".
    let charset = charset.split('*').next().unwrap_or_default().to_ascii_lowercase();
    match charset.as_str() {
        "utf-8" | "utf8" => {
            String::from_utf8(bytes).map_err(|_| DecodeError::InvalidText(charset.clone()))
        }
        "us-ascii" | "ascii" => {
            if bytes.is_ascii() {
                String::from_utf8(bytes).map_err(|_| DecodeError::InvalidText(charset.clone()))
            } else {
                Err(DecodeError::InvalidText(charset.clone()))
            }
        }
        "iso-8859-1" | "latin1" | "l1" => Ok(bytes.into_iter().map(char::from).collect()),
        _ => Err(DecodeError::UnsupportedCharset(charset.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_value_is_unchanged() {
        assert_eq!(
            decode_header("John Doe <john@example.com>").unwrap(),
            "John Doe <john@example.com>"
        );
    }

    #[test]
    fn test_decode_base64_word() {
        assert_eq!(
            decode_header("=?utf-8?B?SsOpcsO0bWU=?= <jerome@example.com>").unwrap(),
            "Jérôme <jerome@example.com>"
        );
    }

    #[test]
    fn test_decode_q_word() {
        assert_eq!(
            decode_header("=?ISO-8859-1?Q?Andr=E9_Pirard?= <PIRARD@vm1.ulg.ac.be>").unwrap(),
            "André Pirard <PIRARD@vm1.ulg.ac.be>"
        );
    }

    #[test]
    fn test_adjacent_words_are_joined() {
        assert_eq!(decode_header("=?utf-8?Q?a?= =?utf-8?Q?b?=").unwrap(), "ab");
        assert_eq!(decode_header("=?utf-8?Q?a?= b").unwrap(), "a b");
    }

    #[test]
    fn test_language_suffix() {
        assert_eq!(decode_header("=?US-ASCII*EN?Q?Keith_Moore?=").unwrap(), "Keith Moore");
    }

    #[test]
    fn test_unknown_charset_fails() {
        assert_eq!(
            decode_header("=?UTF-42?Q?Broken?= <x@y>").unwrap_err(),
            DecodeError::UnsupportedCharset("utf-42".to_string())
        );
    }

    #[test]
    fn test_broken_q_escape_fails() {
        assert!(matches!(
            decode_header("=?utf-8?Q?bad=Z?=").unwrap_err(),
            DecodeError::InvalidQuotedPrintable(_)
        ));
    }

    #[test]
    fn test_signed_q_escape_fails() {
        assert_eq!(
            decode_header("=?utf-8?Q?=+1?=").unwrap_err(),
            DecodeError::InvalidQuotedPrintable("=+1".to_string())
        );
        assert_eq!(display_from("=?utf-8?Q?=+1?= <x@y>"), "=?utf-8?Q?=+1?= <x@y>");
    }

    #[test]
    fn test_display_from_falls_back_to_raw() {
        let raw = "=?UTF-42?Q?Broken?= <x@y>";
        assert_eq!(display_from(raw), raw);
        assert_eq!(display_from("=?utf-8?Q?Ok?= <x@y>"), "Ok <x@y>");
    }
}
