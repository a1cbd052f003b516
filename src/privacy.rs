//! PII scrubbing for text that is about to be logged.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref EMAIL_PATTERN: Regex =
        Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").expect("email pattern");
    static ref PHONE_PATTERNS: Vec<Regex> = vec![
        // +62812-3456-7890, 6281234567890
        Regex::new(r"\+?62\s?8\d{2}[\s-]?\d{3,4}[\s-]?\d{3,4}").expect("mobile pattern"),
        // 021-1234-5678
        Regex::new(r"0\d{2,3}[\s-]?\d{3,4}[\s-]?\d{3,4}").expect("landline pattern"),
        // (021) 1234-5678
        Regex::new(r"\(\d{2,3}\)\s?\d{3,4}[\s-]?\d{3,4}").expect("area code pattern"),
    ];
}

pub const EMAIL_PLACEHOLDER: &str = "[EMAIL]";
pub const PHONE_PLACEHOLDER: &str = "[PHONE]";

/// Replace e-mail addresses and phone numbers; the flag reports whether
/// anything was replaced.
pub fn anonymize_pii(text: &str) -> (String, bool) {
    let mut found = false;

    let mut out = if EMAIL_PATTERN.is_match(text) {
        found = true;
        EMAIL_PATTERN.replace_all(text, EMAIL_PLACEHOLDER).into_owned()
    } else {
        text.to_string()
    };

    for pattern in PHONE_PATTERNS.iter() {
        if pattern.is_match(&out) {
            found = true;
            out = pattern.replace_all(&out, PHONE_PLACEHOLDER).into_owned();
        }
    }

    (out, found)
}
