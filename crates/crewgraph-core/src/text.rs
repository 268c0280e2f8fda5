//! Character-level truncation shared by the router and the context compiler.

use std::borrow::Cow;

/// Appended to every truncated payload. Never dropped by truncation itself.
pub const TRUNCATION_MARKER: &str = "…[truncated]";

/// Keep the first `max_chars` characters of `text` and append [`TRUNCATION_MARKER`].
///
/// Returns the input unchanged (and `false`) when it already fits.
pub fn truncate_chars(text: &str, max_chars: usize) -> (Cow<'_, str>, bool) {
    match text.char_indices().nth(max_chars) {
        None => (Cow::Borrowed(text), false),
        Some((cut, _)) => {
            let mut out = String::with_capacity(cut + TRUNCATION_MARKER.len());
            out.push_str(&text[..cut]);
            out.push_str(TRUNCATION_MARKER);
            (Cow::Owned(out), true)
        }
    }
}

/// Strip a trailing [`TRUNCATION_MARKER`], returning the kept prefix.
pub fn strip_marker(text: &str) -> Option<&str> {
    text.strip_suffix(TRUNCATION_MARKER)
}
