//! Helpers for bounding text before it is persisted and for vetting
//! identifiers before they become path components.
//!
//! Job records are read by external callers, so nothing unbounded (process
//! output, error chains) may land in them verbatim.

/// Prefix marking text whose head was dropped.
pub const TRUNCATION_MARKER: &str = "... (truncated)\n";

/// Keeps at most `max_bytes` of the end of `text`, prefixed with
/// [`TRUNCATION_MARKER`] when anything was dropped.
///
/// The tail is kept because pipeline failures report their cause last
/// (tracebacks, final status lines).
pub fn truncate_tail(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }

    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }

    format!("{}{}", TRUNCATION_MARKER, &text[start..])
}

/// Returns true if `value` can be used verbatim as one directory name.
pub fn is_safe_component(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 255
        && value != "."
        && value != ".."
        && !value.starts_with('.')
        && !value
            .chars()
            .any(|c| c == '/' || c == '\\' || c == '\0' || c.is_control())
}
