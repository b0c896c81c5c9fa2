//! Prompt context formatting.
//!
//! Stages share these helpers so cases, qualities, and retrieved chunks
//! render identically in every prompt.

use crate::store::entities::{Case, Quality};

use super::builder::ScoredChunk;

/// Renders retrieved chunks as a numbered context block.
#[must_use]
pub fn chunks_block(chunks: &[ScoredChunk]) -> String {
    if chunks.is_empty() {
        return "(no reference material retrieved)".to_string();
    }
    chunks
        .iter()
        .enumerate()
        .map(|(i, scored)| format!("[{}] {}", i + 1, scored.chunk.text.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Renders a case for scoring and taxonomy prompts.
#[must_use]
pub fn case_block(case: &Case) -> String {
    let scale = case
        .scale_dollars
        .map_or_else(|| "unknown".to_string(), |d| format!("${d:.0}"));
    format!(
        "Case: {}\nMechanics: {}\nExploited policy: {}\nEnabling condition: {}\nScale: {scale}",
        case.case_name, case.scheme_mechanics, case.exploited_policy, case.enabling_condition
    )
}

/// Renders the approved taxonomy as a definition list.
#[must_use]
pub fn taxonomy_block(qualities: &[Quality]) -> String {
    qualities
        .iter()
        .map(|q| {
            format!(
                "- {} ({}): {}\n  Recognition test: {}",
                q.name, q.quality_id, q.definition, q.recognition_test
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::entities::Chunk;

    #[test]
    fn empty_chunks_render_placeholder() {
        assert!(chunks_block(&[]).contains("no reference material"));
    }

    #[test]
    fn chunks_are_numbered() {
        let scored = vec![
            ScoredChunk {
                chunk: Chunk {
                    chunk_id: "c0".to_string(),
                    doc_id: "d".to_string(),
                    index: 0,
                    text: "first".to_string(),
                },
                score: 1.0,
            },
            ScoredChunk {
                chunk: Chunk {
                    chunk_id: "c1".to_string(),
                    doc_id: "d".to_string(),
                    index: 1,
                    text: "second".to_string(),
                },
                score: 0.5,
            },
        ];
        let block = chunks_block(&scored);
        assert!(block.starts_with("[1] first"));
        assert!(block.contains("[2] second"));
    }

    #[test]
    fn unknown_scale_renders_sentinel() {
        let case = Case {
            case_id: "c".to_string(),
            source_document: "s.txt".to_string(),
            case_name: "Phantom Clinic".to_string(),
            scheme_mechanics: "billed for no-shows".to_string(),
            exploited_policy: "fee-for-service".to_string(),
            enabling_condition: "unverified visit records".to_string(),
            scale_dollars: None,
            scale_defendants: None,
            scale_duration: None,
            detection_method: None,
            extracted_at: chrono::Utc::now(),
        };
        assert!(case_block(&case).contains("Scale: unknown"));
    }
}
