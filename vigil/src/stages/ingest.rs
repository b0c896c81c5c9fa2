//! Stage 0: corpus ingestion.
//!
//! Scans the ingest directory, classifies files by subdirectory name,
//! stores documents with their retrieval chunks, and derives a policy
//! record from each policy document so downstream scanning has targets.
//! Purely local; no model calls.

use async_trait::async_trait;
use chrono::Utc;
use std::path::Path;
use tracing::{info, warn};

use crate::delta::content_hash;
use crate::errors::StageError;
use crate::retrieval::chunk_text;
use crate::store::entities::{Chunk, DocType, Document, MarkerScope, Policy, ProcessedMarker};
use crate::store::{EntityWrite, StageCommit};

use super::{Stage, StageContext, StageReport};

/// Maximum characters of a policy document carried into the policy
/// description shown to the model.
const POLICY_DESCRIPTION_CAP: usize = 4000;

/// Stage 0 implementation.
#[derive(Debug, Default)]
pub struct IngestStage;

impl IngestStage {
    fn doc_type_for(path: &Path) -> DocType {
        let parent = path
            .parent()
            .and_then(Path::file_name)
            .and_then(|n| n.to_str())
            .unwrap_or("");
        match parent {
            "enforcement" => DocType::Enforcement,
            "policies" | "policy" => DocType::Policy,
            "guidance" => DocType::Guidance,
            "reports" | "report" => DocType::Report,
            _ => DocType::Other,
        }
    }

    fn is_text_file(path: &Path) -> bool {
        matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("txt" | "md")
        )
    }

    fn collect_files(dir: &Path, out: &mut Vec<std::path::PathBuf>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                Self::collect_files(&path, out)?;
            } else if Self::is_text_file(&path) {
                out.push(path);
            }
        }
        Ok(())
    }

    /// Builds the writes for one ingested file.
    fn writes_for(
        file_name: &str,
        doc_type: DocType,
        text: &str,
        config: &crate::config::RetrievalConfig,
    ) -> Vec<EntityWrite> {
        let doc_id = format!("doc_{}", content_hash(file_name));
        let mut writes = vec![EntityWrite::Document(Document {
            doc_id: doc_id.clone(),
            file_name: file_name.to_string(),
            doc_type,
            text: text.to_string(),
            ingested_at: Utc::now(),
        })];

        for (index, chunk) in chunk_text(text, config.chunk_chars, config.chunk_overlap)
            .into_iter()
            .enumerate()
        {
            writes.push(EntityWrite::Chunk(Chunk {
                chunk_id: format!("{doc_id}_c{index:04}"),
                doc_id: doc_id.clone(),
                index,
                text: chunk,
            }));
        }

        if doc_type == DocType::Policy {
            let stem = file_name.rsplit_once('.').map_or(file_name, |(s, _)| s);
            let name = stem.replace(['_', '-'], " ");
            let mut description = text.to_string();
            if description.len() > POLICY_DESCRIPTION_CAP {
                let mut cut = POLICY_DESCRIPTION_CAP;
                while !description.is_char_boundary(cut) {
                    cut -= 1;
                }
                description.truncate(cut);
            }
            writes.push(EntityWrite::Policy(Policy {
                policy_id: format!("pol_{}", content_hash(&name)),
                name,
                description,
                source_document: Some(file_name.to_string()),
                structural_characterization: None,
            }));
        }

        writes
    }
}

#[async_trait]
impl Stage for IngestStage {
    fn number(&self) -> u32 {
        0
    }

    fn name(&self) -> &'static str {
        "ingest"
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageReport, StageError> {
        let dir = &ctx.config.pipeline.ingest_dir;
        if !dir.exists() {
            info!(dir = %dir.display(), "ingest directory absent, nothing to ingest");
            return Ok(StageReport::completed(0));
        }

        let mut files = Vec::new();
        Self::collect_files(dir, &mut files).map_err(crate::errors::StoreError::Io)?;
        files.sort();

        // Candidates keyed by file name, hashed on content.
        let mut candidates = Vec::new();
        for path in files {
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            match std::fs::read_to_string(&path) {
                Ok(text) => {
                    let hash = content_hash(&text);
                    candidates.push((file_name.to_string(), hash, (path.clone(), text)));
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "skipping unreadable file");
                }
            }
        }

        let set = ctx.delta.split(0, &MarkerScope::Global, candidates).await?;
        if set.is_empty() {
            info!(skipped = set.skipped, "corpus unchanged");
            return Ok(StageReport {
                items_processed: 0,
                skipped: set.skipped,
                item_errors: Vec::new(),
                outcome: super::StageOutcome::Completed,
            });
        }

        let mut commit = StageCommit::new(&ctx.run_id, 0);
        for pending in &set.pending {
            let (path, text) = &pending.item;
            let doc_type = Self::doc_type_for(path);
            commit.writes.extend(Self::writes_for(
                &pending.item_id,
                doc_type,
                text,
                &ctx.config.retrieval,
            ));
            commit.markers.push(ProcessedMarker::new(
                0,
                MarkerScope::Global,
                &pending.item_id,
                &pending.input_hash,
                &ctx.run_id,
            ));
        }

        let processed = set.pending.len() as u64;
        ctx.store.commit(commit).await?;
        info!(ingested = processed, skipped = set.skipped, "corpus ingested");

        Ok(StageReport {
            items_processed: processed,
            skipped: set.skipped,
            item_errors: Vec::new(),
            outcome: super::StageOutcome::Completed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_type_follows_subdirectory() {
        assert_eq!(
            IngestStage::doc_type_for(Path::new("/corpus/enforcement/case.txt")),
            DocType::Enforcement
        );
        assert_eq!(
            IngestStage::doc_type_for(Path::new("/corpus/policies/ppp.md")),
            DocType::Policy
        );
        assert_eq!(
            IngestStage::doc_type_for(Path::new("/corpus/notes.txt")),
            DocType::Other
        );
    }

    #[test]
    fn policy_document_derives_policy_entity() {
        let config = crate::config::RetrievalConfig::default();
        let writes = IngestStage::writes_for(
            "paycheck_protection.txt",
            DocType::Policy,
            "Forgivable loans based on self-reported payroll.",
            &config,
        );
        let has_policy = writes.iter().any(|w| {
            matches!(w, EntityWrite::Policy(p) if p.name == "paycheck protection")
        });
        assert!(has_policy);
    }

    #[test]
    fn enforcement_document_gets_chunks_only() {
        let config = crate::config::RetrievalConfig::default();
        let writes = IngestStage::writes_for(
            "case.txt",
            DocType::Enforcement,
            "A settlement was announced.",
            &config,
        );
        assert!(writes.iter().any(|w| matches!(w, EntityWrite::Document(_))));
        assert!(writes.iter().any(|w| matches!(w, EntityWrite::Chunk(_))));
        assert!(!writes.iter().any(|w| matches!(w, EntityWrite::Policy(_))));
    }
}
