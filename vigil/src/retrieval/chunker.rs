//! Document chunking.
//!
//! Documents split on paragraph boundaries into chunks near a target
//! size, with a tail of the previous chunk carried forward so sentences
//! that straddle a boundary stay retrievable from both sides.

use regex::Regex;
use std::sync::OnceLock;

fn paragraph_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::unwrap_used)] // pattern is a tested constant
    RE.get_or_init(|| Regex::new(r"\n\s*\n").unwrap())
}

/// Splits `text` into chunks of roughly `target_chars` characters with
/// `overlap_chars` of trailing context repeated at each chunk start.
///
/// Paragraphs are never split unless a single paragraph exceeds the
/// target on its own.
#[must_use]
pub fn chunk_text(text: &str, target_chars: usize, overlap_chars: usize) -> Vec<String> {
    let target = target_chars.max(1);
    let paragraphs: Vec<&str> = paragraph_regex()
        .split(text)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if paragraphs.is_empty() {
        return Vec::new();
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    // Tracks whether `current` holds anything beyond carried overlap.
    let mut has_new = false;

    for paragraph in paragraphs {
        if has_new && current.len() + paragraph.len() + 2 > target {
            chunks.push(current.clone());
            current = overlap_tail(&current, overlap_chars);
            has_new = false;
        }
        if paragraph.len() > target {
            // An oversized paragraph is split on raw character windows.
            for window in split_oversized(paragraph, target) {
                if !current.is_empty() {
                    current.push_str("\n\n");
                }
                current.push_str(&window);
                chunks.push(current.clone());
                current = overlap_tail(&current, overlap_chars);
                has_new = false;
            }
        } else {
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(paragraph);
            has_new = true;
        }
    }

    if has_new {
        chunks.push(current);
    }
    chunks
}

/// Last `overlap` characters of a chunk, snapped to a char boundary.
fn overlap_tail(chunk: &str, overlap: usize) -> String {
    if overlap == 0 || chunk.len() <= overlap {
        return if overlap == 0 { String::new() } else { chunk.to_string() };
    }
    let mut start = chunk.len() - overlap;
    while !chunk.is_char_boundary(start) {
        start += 1;
    }
    chunk[start..].to_string()
}

fn split_oversized(paragraph: &str, target: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = paragraph;
    while rest.len() > target {
        let mut cut = target;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        // Prefer breaking at whitespace when one is near the cut.
        let cut = rest[..cut].rfind(char::is_whitespace).map_or(cut, |w| w.max(1));
        out.push(rest[..cut].to_string());
        rest = rest[cut..].trim_start();
    }
    if !rest.is_empty() {
        out.push(rest.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = chunk_text("A settlement was announced.\n\nThe scheme ran for years.", 1000, 100);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].contains("settlement"));
        assert!(chunks[0].contains("scheme"));
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(chunk_text("", 1000, 100).is_empty());
        assert!(chunk_text("\n\n  \n\n", 1000, 100).is_empty());
    }

    #[test]
    fn chunks_respect_target_and_carry_overlap() {
        let paragraphs: Vec<String> = (0..10)
            .map(|i| format!("Paragraph {i} about billing anomalies and provider enrollment."))
            .collect();
        let text = paragraphs.join("\n\n");

        let chunks = chunk_text(&text, 150, 40);
        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            let tail = overlap_tail(&pair[0], 40);
            assert!(pair[1].starts_with(tail.as_str()));
        }
    }

    #[test]
    fn oversized_paragraph_is_split() {
        let text = "word ".repeat(200);
        let chunks = chunk_text(text.trim(), 100, 0);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.len() <= 110);
        }
    }
}
