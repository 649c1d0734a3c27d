//! Derives the per-user Kubernetes namespace from an identity string.
//!
//! Identities coming out of JupyterHub are close to free-form (email
//! addresses are common), while namespace names must be DNS labels. The
//! mapping is deterministic: re-authenticating the same principal always
//! yields the same namespace.

use std::{fmt::Write as _, sync::LazyLock};

use regex::Regex;
use sha2::{Digest, Sha256};

/// Every user namespace starts with this literal.
pub const NAMESPACE_PREFIX: &str = "kbatch-";

/// Sanitized identities longer than this are cut off before hashing.
const SANITIZED_MAX_LENGTH: usize = 40;

/// Number of hex characters of the SHA-256 digest appended on lossy
/// sanitization.
const DIGEST_SUFFIX_LENGTH: usize = 7;

// See apimachinery/pkg/util/validation/validation.go in the Kubernetes
// source; namespace names are DNS labels (RFC 1123).
const RFC_1123_LABEL_FMT: &str = "[a-z0-9]([-a-z0-9]*[a-z0-9])?";
const RFC_1123_LABEL_MAX_LENGTH: usize = 63;

static RFC_1123_LABEL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^{RFC_1123_LABEL_FMT}$")).expect("failed to compile RFC 1123 label regex")
});

/// Returns the namespace a user's workloads live in.
///
/// The identity is lowercased, every run of characters outside `[a-z0-9]`
/// collapses into a single `-`, and the result is truncated to
/// [`SANITIZED_MAX_LENGTH`] characters. Whenever that transform loses
/// information, the first [`DIGEST_SUFFIX_LENGTH`] hex characters of the
/// identity's SHA-256 digest are appended behind a `--` separator, so two
/// identities that sanitize to the same string still land in different
/// namespaces.
///
/// ```
/// use kbatch_core::namespace::namespace_for_username;
///
/// assert_eq!(namespace_for_username("alice"), "kbatch-alice");
/// assert_eq!(
///     namespace_for_username("Alice@Example.COM"),
///     "kbatch-alice-example-com--a404476",
/// );
/// ```
pub fn namespace_for_username(username: &str) -> String {
    let sanitized = sanitize(username);
    if sanitized == username {
        format!("{NAMESPACE_PREFIX}{sanitized}")
    } else {
        let digest = short_digest(username);
        format!("{NAMESPACE_PREFIX}{sanitized}--{digest}")
    }
}

/// Tests whether `value` is a legal namespace name (an RFC 1123 DNS label of
/// at most 63 characters).
///
/// [`namespace_for_username`] only produces names that pass this check; the
/// submitter re-checks before creating anything so a corrupt derivation can
/// never reach the cluster.
pub fn is_valid_namespace_name(value: &str) -> bool {
    value.len() <= RFC_1123_LABEL_MAX_LENGTH && RFC_1123_LABEL_REGEX.is_match(value)
}

fn sanitize(username: &str) -> String {
    let mut sanitized = String::with_capacity(username.len());
    let mut previous_was_dash = false;
    for character in username.to_lowercase().chars() {
        if character.is_ascii_lowercase() || character.is_ascii_digit() {
            sanitized.push(character);
            previous_was_dash = false;
        } else if !previous_was_dash {
            // a maximal run of illegal characters becomes a single dash
            sanitized.push('-');
            previous_was_dash = true;
        }
    }
    sanitized.truncate(SANITIZED_MAX_LENGTH);
    sanitized.trim_matches('-').to_owned()
}

fn short_digest(username: &str) -> String {
    let digest = Sha256::digest(username.as_bytes());
    let mut hex = String::with_capacity(DIGEST_SUFFIX_LENGTH + 1);
    for byte in digest.iter().take(DIGEST_SUFFIX_LENGTH.div_ceil(2)) {
        let _ = write!(hex, "{byte:02x}");
    }
    hex.truncate(DIGEST_SUFFIX_LENGTH);
    hex
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("test", "kbatch-test")]
    #[case("test123test", "kbatch-test123test")]
    #[case("test-test", "kbatch-test-test")]
    #[case("TEST", "kbatch-test--94ee059")]
    #[case("taugspurger@microsoft.com", "kbatch-taugspurger-microsoft-com--69c4de7")]
    #[case("Alice@Example.COM", "kbatch-alice-example-com--a404476")]
    fn maps_usernames(#[case] username: &str, #[case] expected: &str) {
        assert_eq!(namespace_for_username(username), expected);
    }

    #[test]
    fn is_deterministic() {
        let first = namespace_for_username("Alice@Example.COM");
        let second = namespace_for_username("Alice@Example.COM");
        assert_eq!(first, second);
    }

    #[test]
    fn distinguishes_identities_with_equal_sanitizations() {
        let lower = namespace_for_username("alice");
        let upper = namespace_for_username("ALICE");
        let mixed = namespace_for_username("Alice");
        assert_ne!(lower, upper);
        assert_ne!(lower, mixed);
        assert_ne!(upper, mixed);
    }

    #[test]
    fn fully_illegal_identity_keeps_only_the_digest() {
        let namespace = namespace_for_username("@@@");
        assert!(namespace.starts_with("kbatch--"));
        assert!(namespace.ends_with("2ec847d"));
    }

    #[rstest]
    #[case("alice")]
    #[case("Alice@Example.COM")]
    #[case("TEST")]
    #[case("user with spaces and Ünïcode")]
    #[case(
        "a-very-long-identity-that-overflows-the-sanitized-budget-by-quite-a-margin@example.com"
    )]
    fn produces_legal_namespace_names(#[case] username: &str) {
        let namespace = namespace_for_username(username);
        assert!(
            is_valid_namespace_name(&namespace),
            "{namespace:?} is not a legal namespace name"
        );
    }

    #[test]
    fn sanitization_is_idempotent() {
        for username in ["alice", "Alice@Example.COM", "a--b", "-edge-"] {
            let once = sanitize(username);
            assert_eq!(sanitize(&once), once);
        }
    }

    #[rstest]
    #[case("a", true)]
    #[case("a-1", true)]
    #[case("1-starts-with-digit", true)]
    #[case("kbatch-alice-example-com--a404476", true)]
    #[case("", false)]
    #[case("Agent", false)]
    #[case("-leading", false)]
    #[case("trailing-", false)]
    #[case("under_score", false)]
    fn validates_namespace_names(#[case] value: &str, #[case] expected: bool) {
        assert_eq!(is_valid_namespace_name(value), expected);
    }
}
