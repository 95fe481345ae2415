//! Language code validation.
//!
//! Accepts BCP 47-style tags: a 2-3 letter primary subtag followed by optional
//! alphanumeric subtags (`en`, `pt-BR`, `zh-Hant`).

use std::sync::LazyLock;

use regex::Regex;

use crate::Error;

static LANGUAGE_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z]{2,3}(-[A-Za-z0-9]{2,8})*$").unwrap_or_else(|e| panic!("language regex: {e}"))
});

/// Whether `code` is an acceptable language tag.
pub fn is_valid(code: &str) -> bool {
    LANGUAGE_TAG.is_match(code)
}

/// Trim and validate a language tag, lowercasing the primary subtag.
///
/// # Errors
///
/// Returns `Error::InvalidInput` if the trimmed value is not a language tag.
pub fn normalize(code: &str) -> Result<String, Error> {
    let trimmed = code.trim();
    if !is_valid(trimmed) {
        return Err(Error::InvalidInput(format!("invalid language code: '{code}'")));
    }

    let mut parts = trimmed.splitn(2, '-');
    let primary = parts.next().unwrap_or_default().to_ascii_lowercase();
    Ok(match parts.next() {
        Some(rest) => format!("{primary}-{rest}"),
        None => primary,
    })
}
