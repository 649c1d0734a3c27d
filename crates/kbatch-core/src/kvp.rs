//! Well-known kbatch annotation/label keys and label-value escaping.

use std::fmt::Write as _;

/// The kbatch identity key `kbatch.jupyter.org/username`. It is set as an
/// annotation (raw identity) and as a label (escaped identity) on every
/// resource the proxy creates, so all members of a resource group can be
/// traced back to the submitting user.
pub const USERNAME_KEY: &str = "kbatch.jupyter.org/username";

/// Escapes an arbitrary identity so it is usable as a label value.
///
/// Every byte outside `[a-z0-9]` is replaced with `-` followed by its two
/// lowercase hex digits, one escape per byte of the UTF-8 encoding. This is
/// the same transform JupyterHub applies to usernames, so kbatch labels line
/// up with the labels a user's notebook pods already carry.
///
/// ```
/// use kbatch_core::kvp::escape_label_value;
///
/// assert_eq!(escape_label_value("alice"), "alice");
/// assert_eq!(escape_label_value("test-user"), "test-2duser");
/// ```
pub fn escape_label_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_lowercase() || byte.is_ascii_digit() {
            escaped.push(char::from(byte));
        } else {
            let _ = write!(escaped, "-{byte:02x}");
        }
    }
    escaped
}
