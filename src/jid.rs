//! Recipient identity handling for the WhatsApp network.
//!
//! Business code addresses recipients by phone number; the network
//! addresses them by JID (`<digits>@s.whatsapp.net` for individual
//! accounts, `<id>@g.us` for groups). This module owns the mapping in
//! one place so adapters and session tooling agree on the canonical
//! form.

use thiserror::Error;

/// Server suffix for individual-account JIDs.
pub const USER_SERVER: &str = "s.whatsapp.net";

/// Server suffix for group JIDs.
pub const GROUP_SERVER: &str = "g.us";

/// Accepted phone-number shape after digit extraction: 8 to 15 digits,
/// optional leading `+` in the raw input.
const NUMBER_PATTERN: &str = r"^[0-9]{8,15}$";

/// Errors from recipient-identity normalization.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JidError {
    /// The input contained no digits at all.
    #[error("no digits in recipient identity: {0:?}")]
    Empty(String),
    /// The digit count falls outside the accepted phone-number range.
    #[error("recipient number {0:?} is not a plausible phone number")]
    Implausible(String),
}

/// Extract the digits of a raw recipient identity, dropping `+`,
/// spaces, punctuation and any JID suffix.
pub fn digits(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).collect()
}

/// Normalize a raw phone number (e.g. `+55 31 98765-4321`) to the
/// canonical individual JID `5531987654321@s.whatsapp.net`.
///
/// Inputs already in JID form pass through with the digit part
/// re-validated. Group JIDs are returned unchanged.
///
/// # Errors
///
/// Returns [`JidError`] when the input has no digits or an implausible
/// digit count.
pub fn normalize_number(raw: &str) -> Result<String, JidError> {
    let trimmed = raw.trim();
    if is_group_jid(trimmed) {
        return Ok(trimmed.to_owned());
    }

    let bare = trimmed.split('@').next().unwrap_or(trimmed);
    let number = digits(bare);
    if number.is_empty() {
        return Err(JidError::Empty(raw.to_owned()));
    }
    let plausible = regex::Regex::new(NUMBER_PATTERN)
        .ok()
        .is_some_and(|re| re.is_match(&number));
    if !plausible {
        return Err(JidError::Implausible(raw.to_owned()));
    }

    Ok(format!("{number}@{USER_SERVER}"))
}

/// Whether a JID addresses an individual account.
pub fn is_user_jid(jid: &str) -> bool {
    jid.ends_with(&format!("@{USER_SERVER}"))
}

/// Whether a JID addresses a group.
pub fn is_group_jid(jid: &str) -> bool {
    jid.ends_with(&format!("@{GROUP_SERVER}"))
}
