//! Snippet normalization for outbound-echo matching.
//!
//! When we send a message, the provider later echoes it back to us as an
//! inbound `fromMe` event. The echo's text is not byte-identical to what we
//! sent (markdown is rendered away, whitespace collapses), so both sides are
//! reduced to a normalized snippet before comparison.

/// Marker used as the snippet for media-only sends, where the echo carries no
/// comparable text.
pub const MEDIA_SNIPPET: &str = "[media]";

/// Reduce `text` to a comparison snippet: markdown markers stripped,
/// whitespace runs collapsed to single spaces, lower-cased, trimmed.
///
/// The law this upholds: for any text `T`, `normalize(T)` equals
/// `normalize(T')` whenever `T'` is `T` up to whitespace and markdown.
pub fn normalize_snippet(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = true;
    for ch in text.chars() {
        match ch {
            // Markdown emphasis / code markers disappear in provider echoes.
            '*' | '_' | '~' | '`' | '#' | '>' => {}
            c if c.is_whitespace() => {
                if !last_was_space {
                    out.push(' ');
                    last_was_space = true;
                }
            }
            c => {
                for lc in c.to_lowercase() {
                    out.push(lc);
                }
                last_was_space = false;
            }
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Snippet for an outbound payload: text when present, [`MEDIA_SNIPPET`] for
/// media-only sends.
pub fn outbound_snippet(text: &str, has_media: bool) -> (String, bool) {
    let norm = normalize_snippet(text);
    if norm.is_empty() && has_media {
        (MEDIA_SNIPPET.to_string(), true)
    } else {
        (norm, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_whitespace_and_case() {
        assert_eq!(normalize_snippet("Hello   World\n"), "hello world");
    }

    #[test]
    fn strips_markdown_markers() {
        assert_eq!(normalize_snippet("**bold** and `code`"), "bold and code");
    }

    #[test]
    fn echo_law_holds_for_rendered_markdown() {
        let sent = "**Hi there** `friend`";
        let echoed = "Hi there friend";
        assert_eq!(normalize_snippet(sent), normalize_snippet(echoed));
    }

    #[test]
    fn media_only_payload_uses_marker() {
        let (snippet, is_media) = outbound_snippet("", true);
        assert_eq!(snippet, MEDIA_SNIPPET);
        assert!(is_media);
    }
}
