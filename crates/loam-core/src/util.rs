//! Shared utility functions used across multiple modules.

/// Generate a fresh random row identifier (hyphenated 128-bit hex).
#[must_use]
pub fn new_row_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Current Unix timestamp in milliseconds.
#[must_use]
pub fn unix_timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Check if a string starts with `http://` or `https://`.
#[must_use]
pub fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

/// Truncate text to at most 180 characters for error messages.
#[must_use]
pub fn compact_text(value: &str) -> String {
    value.trim().chars().take(180).collect()
}

/// Whether `value` is usable as a bare SQL identifier.
///
/// Table and column names are interpolated into statements, so anything that
/// arrives from configuration or the wire must pass this check first.
#[must_use]
pub fn is_safe_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
