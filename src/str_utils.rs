use std::borrow::Cow;

/// Prefix of at most `max_chars` characters, cut on a char boundary.
pub fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Single-line preview of user or model text for log lines.
pub fn log_preview(s: &str, max_chars: usize) -> Cow<'_, str> {
    let prefix = prefix_chars(s, max_chars);
    let truncated = prefix.len() < s.len();
    if !truncated && !prefix.contains(['\n', '\r']) {
        return Cow::Borrowed(prefix);
    }
    let mut preview = prefix.replace(['\n', '\r'], " ");
    if truncated {
        preview.push_str("...");
    }
    Cow::Owned(preview)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_respects_char_boundaries() {
        assert_eq!(prefix_chars("héllo", 2), "hé");
        assert_eq!(prefix_chars("hi", 10), "hi");
    }

    #[test]
    fn test_log_preview() {
        assert!(matches!(log_preview("short", 10), Cow::Borrowed("short")));
        assert_eq!(log_preview("line one\nline two", 8), "line one...");
        assert_eq!(log_preview("a\nb", 10), "a b");
    }
}
