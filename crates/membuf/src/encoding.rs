//! Text encodings for binary payloads.
//!
//! Four reversible encodings are supported. The forward direction is
//! canonical (uppercase hex digits, padded Base64, no line breaks); the
//! reverse direction optionally tolerates whitespace but fails the whole
//! operation on any other illegal input.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;

use crate::error::BufferError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncodingType {
    Base64,
    Hex,
    Url,
    CString,
}

/// Encodes `data` and appends the text to `out`.
pub fn encode(data: &[u8], encoding: EncodingType, out: &mut String) -> Result<(), BufferError> {
    match encoding {
        EncodingType::Base64 => {
            BASE64_STANDARD.encode_string(data, out);
        }
        EncodingType::Hex => {
            for &b in data {
                out.push(HEX_DIGITS[(b >> 4) as usize] as char);
                out.push(HEX_DIGITS[(b & 0xF) as usize] as char);
            }
        }
        EncodingType::Url => {
            for &b in data {
                if is_url_unreserved(b) {
                    out.push(b as char);
                } else {
                    out.push('%');
                    out.push(HEX_DIGITS[(b >> 4) as usize] as char);
                    out.push(HEX_DIGITS[(b & 0xF) as usize] as char);
                }
            }
        }
        EncodingType::CString => {
            for &b in data {
                match cstring_shorthand(b) {
                    Some(esc) => {
                        out.push('\\');
                        out.push(esc as char);
                    }
                    None if (0x20..=0x7F).contains(&b) => out.push(b as char),
                    None => {
                        out.push_str("\\x");
                        out.push(HEX_DIGITS[(b >> 4) as usize] as char);
                        out.push(HEX_DIGITS[(b & 0xF) as usize] as char);
                    }
                }
            }
        }
    }
    Ok(())
}

/// Decodes `text` and appends the bytes to `out`. With `allow_whitespace`,
/// whitespace between encoded units is skipped (Base64, Hex and URL only;
/// a space is payload in the C-string form).
pub fn decode(
    text: &str,
    encoding: EncodingType,
    out: &mut Vec<u8>,
    allow_whitespace: bool,
) -> Result<(), BufferError> {
    match encoding {
        EncodingType::Base64 => {
            let cleaned: String = if allow_whitespace {
                text.chars().filter(|c| !c.is_ascii_whitespace()).collect()
            } else {
                text.to_string()
            };
            let bytes = BASE64_STANDARD
                .decode(cleaned.as_bytes())
                .map_err(|e| BufferError::Decoding(format!("invalid Base64 input: {e}")))?;
            out.extend_from_slice(&bytes);
        }
        EncodingType::Hex => {
            let mut high: Option<u8> = None;
            for c in text.chars() {
                if allow_whitespace && c.is_ascii_whitespace() {
                    continue;
                }
                let digit = hex_value(c)
                    .ok_or_else(|| BufferError::Decoding(format!("invalid hex character '{c}'")))?;
                match high.take() {
                    None => high = Some(digit),
                    Some(h) => out.push((h << 4) | digit),
                }
            }
            if high.is_some() {
                return Err(BufferError::Decoding("odd hex input length".into()));
            }
        }
        EncodingType::Url => {
            let mut chars = text.chars();
            while let Some(c) = chars.next() {
                if allow_whitespace && c.is_ascii_whitespace() {
                    continue;
                }
                match c {
                    '%' => {
                        let hi = chars
                            .next()
                            .and_then(hex_value)
                            .ok_or_else(|| BufferError::Decoding("truncated %XX escape".into()))?;
                        let lo = chars
                            .next()
                            .and_then(hex_value)
                            .ok_or_else(|| BufferError::Decoding("truncated %XX escape".into()))?;
                        out.push((hi << 4) | lo);
                    }
                    '+' => out.push(b' '),
                    c if c.is_ascii() && is_url_unreserved(c as u8) => out.push(c as u8),
                    c => {
                        return Err(BufferError::Decoding(format!(
                            "illegal URL-encoded character '{c}'"
                        )))
                    }
                }
            }
        }
        EncodingType::CString => {
            let mut chars = text.chars();
            while let Some(c) = chars.next() {
                if c == '\\' {
                    let esc = chars
                        .next()
                        .ok_or_else(|| BufferError::Decoding("truncated escape".into()))?;
                    match esc {
                        'x' => {
                            let hi = chars.next().and_then(hex_value).ok_or_else(|| {
                                BufferError::Decoding("truncated \\xHH escape".into())
                            })?;
                            let lo = chars.next().and_then(hex_value).ok_or_else(|| {
                                BufferError::Decoding("truncated \\xHH escape".into())
                            })?;
                            out.push((hi << 4) | lo);
                        }
                        _ => match cstring_unescape(esc) {
                            Some(b) => out.push(b),
                            None => {
                                return Err(BufferError::Decoding(format!(
                                    "unknown escape '\\{esc}'"
                                )))
                            }
                        },
                    }
                } else if c.is_ascii() {
                    out.push(c as u8);
                } else {
                    return Err(BufferError::Decoding(format!(
                        "non-ASCII character '{c}' in C-string input"
                    )));
                }
            }
        }
    }
    Ok(())
}

const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

fn hex_value(c: char) -> Option<u8> {
    c.to_digit(16).map(|d| d as u8)
}

fn is_url_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~')
}

fn cstring_shorthand(b: u8) -> Option<u8> {
    match b {
        0x00 => Some(b'0'),
        0x07 => Some(b'a'),
        0x08 => Some(b'b'),
        0x0C => Some(b'f'),
        0x0A => Some(b'n'),
        0x0D => Some(b'r'),
        0x09 => Some(b't'),
        0x0B => Some(b'v'),
        b'\\' => Some(b'\\'),
        b'\'' => Some(b'\''),
        b'"' => Some(b'"'),
        b'?' => Some(b'?'),
        _ => None,
    }
}

fn cstring_unescape(esc: char) -> Option<u8> {
    match esc {
        '0' => Some(0x00),
        'a' => Some(0x07),
        'b' => Some(0x08),
        'f' => Some(0x0C),
        'n' => Some(0x0A),
        'r' => Some(0x0D),
        't' => Some(0x09),
        'v' => Some(0x0B),
        '\\' => Some(b'\\'),
        '\'' => Some(b'\''),
        '"' => Some(b'"'),
        '?' => Some(b'?'),
        _ => None,
    }
}
