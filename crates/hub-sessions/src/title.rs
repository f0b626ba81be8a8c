//! Title derivation for freshly-started sessions.

/// Collapse whitespace and truncate to `max_chars`, on a char boundary, for
/// use as an auto-generated session title. Never panics on short input or
/// on multi-byte text.
pub fn derive_title(content: &str, max_chars: usize) -> String {
    let collapsed: String = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let truncated: String = collapsed.chars().take(max_chars).collect();
    format!("{}…", truncated.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_message_is_used_as_is() {
        assert_eq!(derive_title("turn off the lights", 60), "turn off the lights");
    }

    #[test]
    fn collapses_internal_whitespace() {
        assert_eq!(derive_title("turn off\n\nthe   lights", 60), "turn off the lights");
    }

    #[test]
    fn truncates_long_message_with_ellipsis() {
        let long = "a".repeat(100);
        let title = derive_title(&long, 10);
        assert_eq!(title.chars().count(), 11);
        assert!(title.ends_with('…'));
    }

    #[test]
    fn truncation_respects_multibyte_chars() {
        let content = "héllo wörld this keeps going for a while".to_string();
        let title = derive_title(&content, 8);
        assert_eq!(title.chars().count(), 9);
    }
}
