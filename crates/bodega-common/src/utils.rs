//! Utility functions for Bodega
//!
//! Common helper functions used across the codebase.

use std::sync::LazyLock;

/// Regex pattern for validating identifiers (branch ids, product ids, resource names)
static VALID_PATTERN: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new("^[a-zA-Z0-9_.:-]+$").expect("Invalid regex pattern"));

/// Validate an identifier contains only allowed characters
///
/// Allowed characters: alphanumeric, underscore, dot, colon, hyphen.
/// Empty strings are rejected.
///
/// # Examples
///
/// ```
/// use bodega_common::is_valid_id;
///
/// assert!(is_valid_id("branch-1"));
/// assert!(is_valid_id("P001"));
/// assert!(!is_valid_id(""));
/// assert!(!is_valid_id("with spaces"));
/// ```
pub fn is_valid_id(str: &str) -> bool {
    VALID_PATTERN.is_match(str)
}

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
