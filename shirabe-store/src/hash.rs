//! Hash identities and string normalization shared by index writers and
//! predicate builders.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Longest normalized/exact string value kept in the string index
pub const MAX_STRING_LENGTH: usize = 200;

/// Number of normalized characters folded into `hash_norm_prefix`
pub const HASH_PREFIX_LENGTH: usize = 1;

/// Deterministic 64-bit hash of (partition, resource type, parameter, values...)
pub fn hash_search_param(
    partition: Option<i32>,
    resource_type: &str,
    param_name: &str,
    values: &[&str],
) -> i64 {
    let mut bytes = Vec::with_capacity(64);
    if let Some(partition) = partition {
        bytes.extend_from_slice(&partition.to_le_bytes());
        bytes.push(0x1e);
    }
    for part in [resource_type, param_name].iter().chain(values) {
        bytes.extend_from_slice(part.as_bytes());
        bytes.push(0);
    }
    seahash::hash(&bytes) as i64
}

pub fn hash_identity(partition: Option<i32>, resource_type: &str, param_name: &str) -> i64 {
    hash_search_param(partition, resource_type, param_name, &[])
}

/// Hash recorded in the param-present table for `:missing` on references
pub fn hash_presence(
    partition: Option<i32>,
    resource_type: &str,
    param_name: &str,
    present: bool,
) -> i64 {
    let flag = if present { "true" } else { "false" };
    hash_search_param(partition, resource_type, param_name, &[flag])
}

/// Accent-stripped, upper-cased form used for default string matching
pub fn normalize_string(value: &str) -> String {
    value
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_uppercase)
        .take(MAX_STRING_LENGTH)
        .collect()
}

pub fn truncate(value: &str) -> String {
    value.chars().take(MAX_STRING_LENGTH).collect()
}

/// The prefix of a normalized value folded into `hash_norm_prefix`
pub fn norm_prefix(normalized: &str) -> String {
    normalized.chars().take(HASH_PREFIX_LENGTH).collect()
}

/// Escape LIKE wildcards; pair with `ESCAPE '\'`
pub fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable_and_discriminating() {
        let a = hash_identity(None, "Patient", "family");
        assert_eq!(a, hash_identity(None, "Patient", "family"));
        assert_ne!(a, hash_identity(None, "Patient", "given"));
        assert_ne!(a, hash_identity(Some(1), "Patient", "family"));
        // separators keep ("ab","c") apart from ("a","bc")
        assert_ne!(
            hash_search_param(None, "ab", "c", &[]),
            hash_search_param(None, "a", "bc", &[])
        );
    }

    #[test]
    fn test_presence_hashes_differ() {
        assert_ne!(
            hash_presence(None, "Observation", "subject", true),
            hash_presence(None, "Observation", "subject", false)
        );
    }

    #[test]
    fn test_normalize_string() {
        assert_eq!(normalize_string("Müller"), "MULLER");
        assert_eq!(normalize_string("josé"), "JOSE");
        assert_eq!(normalize_string(&"a".repeat(300)).len(), MAX_STRING_LENGTH);
        assert_eq!(norm_prefix("MULLER"), "M");
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
    }
}
