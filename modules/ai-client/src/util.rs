/// Truncate a string to at most `max_bytes` bytes at a character boundary.
pub fn truncate_to_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Short single-line preview for log fields.
pub fn preview(s: &str, max_bytes: usize) -> String {
    let cut = truncate_to_char_boundary(s, max_bytes);
    let flat = cut.replace('\n', " ");
    if cut.len() < s.len() {
        format!("{flat}…")
    } else {
        flat
    }
}
