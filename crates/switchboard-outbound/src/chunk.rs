//! Chunkers for channels with per-message size limits.
//!
//! Three flavours: plain length-based splitting on word boundaries, a
//! markdown-aware newline splitter that never cuts a fenced code block or a
//! table in half, and the Signal styled-text chunker that converts markdown
//! spans into `(plain text, style ranges)` pairs.

use serde::{Deserialize, Serialize};

/// Split `text` into chunks of at most `limit` characters, preferring splits
/// on newline, then whitespace, to avoid cutting words mid-way.
pub fn split_text_chunks(text: &str, limit: usize) -> Vec<String> {
    if limit == 0 || text.chars().count() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    loop {
        if remaining.chars().count() <= limit {
            if !remaining.is_empty() {
                chunks.push(remaining.to_string());
            }
            break;
        }

        let window_end = byte_index_of_char(remaining, limit);
        let window = &remaining[..window_end];
        let split_at = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(window_end);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

/// Newline-mode splitter for markdown channels.
///
/// Lines are packed into chunks up to `limit`, treating fenced code blocks
/// and contiguous table rows as indivisible segments. A fenced block larger
/// than the limit is itself length-split, with the fence re-opened at every
/// boundary so each chunk still renders as code.
pub fn split_markdown_chunks(text: &str, limit: usize) -> Vec<String> {
    if limit == 0 || text.chars().count() <= limit {
        return vec![text.to_string()];
    }

    let segments = segment_markdown(text);
    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();

    for segment in segments {
        let seg_len = segment.chars().count();
        let cur_len = current.chars().count();
        let joined = if current.is_empty() { seg_len } else { cur_len + 1 + seg_len };

        if joined <= limit {
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(&segment);
            continue;
        }

        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }

        if seg_len <= limit {
            current = segment;
        } else if segment.starts_with("```") {
            chunks.extend(split_fenced_block(&segment, limit));
        } else {
            chunks.extend(split_text_chunks(&segment, limit));
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Inline style kinds Signal understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StyleKind {
    Bold,
    Italic,
    Strikethrough,
    Monospace,
    Spoiler,
}

/// A style applied to `[start, start + length)` of the plain text,
/// in characters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StyleRange {
    pub start: usize,
    pub length: usize,
    pub style: StyleKind,
}

/// One Signal message: plain text plus the style ranges that decorate it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StyledChunk {
    pub text: String,
    pub styles: Vec<StyleRange>,
}

/// Signal's bespoke chunker: markdown-split first, then convert each chunk's
/// inline markers into style ranges over stripped text.
pub fn split_styled_chunks(text: &str, limit: usize) -> Vec<StyledChunk> {
    split_markdown_chunks(text, limit)
        .into_iter()
        .map(|chunk| markdown_to_styled(&chunk))
        .collect()
}

/// Strip inline markdown markers and emit the equivalent style ranges.
///
/// Recognised spans: `**bold**`, `*italic*`, `_italic_`, `~~strike~~`,
/// `` `mono` ``, `||spoiler||`. Unterminated markers are kept as literal
/// text.
pub fn markdown_to_styled(text: &str) -> StyledChunk {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::new();
    let mut out_len = 0usize;
    let mut styles = Vec::new();
    let mut i = 0usize;

    while i < chars.len() {
        let matched = [
            ("**", StyleKind::Bold),
            ("~~", StyleKind::Strikethrough),
            ("||", StyleKind::Spoiler),
            ("*", StyleKind::Italic),
            ("_", StyleKind::Italic),
            ("`", StyleKind::Monospace),
        ]
        .into_iter()
        .find_map(|(marker, style)| {
            let m: Vec<char> = marker.chars().collect();
            if !starts_with_at(&chars, i, &m) {
                return None;
            }
            let close = find_marker(&chars, i + m.len(), &m)?;
            if close == i + m.len() {
                return None; // empty span, treat markers literally
            }
            Some((m.len(), close, style))
        });

        if let Some((marker_len, close, style)) = matched {
            let inner: String = chars[i + marker_len..close].iter().collect();
            let inner_styled = markdown_to_styled(&inner);
            let start = out_len;
            for nested in inner_styled.styles {
                styles.push(StyleRange {
                    start: start + nested.start,
                    length: nested.length,
                    style: nested.style,
                });
            }
            let span_len = inner_styled.text.chars().count();
            out.push_str(&inner_styled.text);
            out_len += span_len;
            styles.push(StyleRange {
                start,
                length: span_len,
                style,
            });
            i = close + marker_len;
        } else {
            out.push(chars[i]);
            out_len += 1;
            i += 1;
        }
    }

    styles.sort_by_key(|s| (s.start, s.length));
    StyledChunk { text: out, styles }
}

// ── helpers ───────────────────────────────────────────────────────────────────

fn byte_index_of_char(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len())
}

/// Group markdown into indivisible segments: fenced blocks, table runs, and
/// single lines.
fn segment_markdown(text: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut lines = text.lines().peekable();

    while let Some(line) = lines.next() {
        if line.trim_start().starts_with("```") {
            let mut block = String::from(line);
            for inner in lines.by_ref() {
                block.push('\n');
                block.push_str(inner);
                if inner.trim_start().starts_with("```") {
                    break;
                }
            }
            segments.push(block);
        } else if is_table_row(line) {
            let mut table = String::from(line);
            while lines.peek().map(|l| is_table_row(l)).unwrap_or(false) {
                table.push('\n');
                table.push_str(lines.next().unwrap());
            }
            segments.push(table);
        } else {
            segments.push(line.to_string());
        }
    }

    segments
}

fn is_table_row(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with('|') && trimmed.len() > 1
}

/// Length-split an oversized fenced block, re-wrapping each piece in fences.
fn split_fenced_block(block: &str, limit: usize) -> Vec<String> {
    let fence = "```";
    let inner: Vec<&str> = block.lines().collect();
    let lang_line = inner.first().copied().unwrap_or(fence);
    let body: Vec<&str> = inner
        .iter()
        .skip(1)
        .take(inner.len().saturating_sub(2))
        .copied()
        .collect();

    // Room for the fences plus newlines around the body.
    let overhead = lang_line.chars().count() + fence.len() + 2;
    let body_limit = limit.saturating_sub(overhead).max(1);

    split_text_chunks(&body.join("\n"), body_limit)
        .into_iter()
        .map(|piece| format!("{lang_line}\n{piece}\n{fence}"))
        .collect()
}

fn starts_with_at(chars: &[char], at: usize, marker: &[char]) -> bool {
    chars.len() >= at + marker.len() && &chars[at..at + marker.len()] == marker
}

fn find_marker(chars: &[char], from: usize, marker: &[char]) -> Option<usize> {
    (from..=chars.len().saturating_sub(marker.len()))
        .find(|&i| &chars[i..i + marker.len()] == marker)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_single_chunk() {
        assert_eq!(split_text_chunks("Hello, world!", 100), vec!["Hello, world!"]);
    }

    #[test]
    fn two_chunk_split_on_exact_limit() {
        let chunks = split_text_chunks("abcd", 2);
        assert_eq!(chunks, vec!["ab", "cd"]);
    }

    #[test]
    fn long_text_splits_on_whitespace() {
        let line = "a".repeat(40);
        let text = format!("{line} {line}");
        let chunks = split_text_chunks(&text, 50);
        assert_eq!(chunks.len(), 2);
        for c in &chunks {
            assert!(c.chars().count() <= 50, "chunk too large: {}", c.len());
        }
    }

    #[test]
    fn markdown_chunker_keeps_fence_whole() {
        let text = format!("intro\n```rust\n{}\n```\noutro", "let x = 1;");
        let chunks = split_markdown_chunks(&text, 30);
        let fenced: Vec<&String> = chunks.iter().filter(|c| c.contains("```")).collect();
        for chunk in fenced {
            // A fence never opens without closing inside the same chunk.
            assert_eq!(chunk.matches("```").count() % 2, 0, "split mid-fence: {chunk:?}");
        }
    }

    #[test]
    fn markdown_chunker_keeps_table_rows_together() {
        let table = "| a | b |\n|---|---|\n| 1 | 2 |";
        let text = format!("before\n{table}\nafter");
        let chunks = split_markdown_chunks(&text, 30);
        let with_table: Vec<&String> = chunks.iter().filter(|c| c.contains("|---|")).collect();
        assert_eq!(with_table.len(), 1);
        assert!(with_table[0].contains("| a | b |"));
        assert!(with_table[0].contains("| 1 | 2 |"));
    }

    #[test]
    fn oversized_fence_reopens_across_chunks() {
        let body = "x".repeat(120);
        let text = format!("```\n{body}\n```");
        let chunks = split_markdown_chunks(&text, 60);
        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            assert!(chunk.starts_with("```"));
            assert!(chunk.ends_with("```"));
        }
    }

    #[test]
    fn styled_bold_and_mono() {
        let styled = markdown_to_styled("say **hello** in `code`");
        assert_eq!(styled.text, "say hello in code");
        assert!(styled.styles.contains(&StyleRange {
            start: 4,
            length: 5,
            style: StyleKind::Bold
        }));
        assert!(styled.styles.contains(&StyleRange {
            start: 13,
            length: 4,
            style: StyleKind::Monospace
        }));
    }

    #[test]
    fn styled_nested_spans() {
        let styled = markdown_to_styled("**bold _and italic_**");
        assert_eq!(styled.text, "bold and italic");
        assert!(styled
            .styles
            .iter()
            .any(|s| s.style == StyleKind::Bold && s.start == 0 && s.length == 15));
        assert!(styled
            .styles
            .iter()
            .any(|s| s.style == StyleKind::Italic && s.start == 5 && s.length == 10));
    }

    #[test]
    fn unterminated_marker_stays_literal() {
        let styled = markdown_to_styled("lonely *star");
        assert_eq!(styled.text, "lonely *star");
        assert!(styled.styles.is_empty());
    }
}
