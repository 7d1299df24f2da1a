//! Quoting for byte-string bodies.
//!
//! Renderers show PV bodies in source-like form: printable ASCII strings are
//! single-quoted with minimal escaping, anything with control or high bytes
//! falls back to a double-quoted form with `\xNN` escapes.

use std::fmt::Write;

/// Quotes a byte string for display.
///
/// Strings consisting only of printable ASCII render single-quoted, escaping
/// `'` and `\`. Otherwise the string renders double-quoted with C-style
/// escapes for tab/newline/return and `\xNN` for every other non-printable
/// byte.
#[must_use]
pub fn pv_quote(pv: &[u8]) -> String {
    pv_quote_limited(pv, usize::MAX)
}

/// Like [`pv_quote`], but elides everything past `max` bytes, appending
/// `...` after the closing quote when elision happened.
#[must_use]
pub fn pv_quote_limited(pv: &[u8], max: usize) -> String {
    let (shown, elided) = if pv.len() > max {
        (&pv[..max], true)
    } else {
        (pv, false)
    };

    let mut out = String::with_capacity(shown.len() + 2);
    if shown.iter().all(|&b| (0x20..=0x7e).contains(&b)) {
        out.push('\'');
        for &b in shown {
            match b {
                b'\'' | b'\\' => {
                    out.push('\\');
                    out.push(b as char);
                }
                _ => out.push(b as char),
            }
        }
        out.push('\'');
    } else {
        out.push('"');
        for &b in shown {
            match b {
                b'"' | b'\\' => {
                    out.push('\\');
                    out.push(b as char);
                }
                b'\t' => out.push_str("\\t"),
                b'\n' => out.push_str("\\n"),
                b'\r' => out.push_str("\\r"),
                0x20..=0x7e => out.push(b as char),
                _ => {
                    // Infallible for String targets.
                    let _ = write!(out, "\\x{b:02x}");
                }
            }
        }
        out.push('"');
    }
    if elided {
        out.push_str("...");
    }
    out
}
