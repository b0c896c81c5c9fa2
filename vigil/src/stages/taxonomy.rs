//! Stage 2: taxonomy induction.
//!
//! Clusters the pending cases' enabling conditions into candidate
//! vulnerability qualities, then judges each candidate against the
//! existing taxonomy one at a time. Duplicates fold into the surviving
//! quality with an audit record and commit immediately; novel qualities
//! become drafts staged behind the human gate. Dedup is deliberately
//! sequential so two duplicates of each other can never both land as
//! novel.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

use crate::delta::content_hash;
use crate::errors::StageError;
use crate::model::PromptTemplate;
use crate::retrieval::format::taxonomy_block;
use crate::store::entities::{
    MarkerScope, MergeRecord, ProcessedMarker, Quality, ReviewStatus,
};
use crate::store::{EntityWrite, GateProposal, ProposalItem, StageCommit};

use super::{Stage, StageContext, StageOutcome, StageReport};

const CLUSTER_PROMPT: &str = "\
You are building a taxonomy of structural vulnerability qualities: \
abstract design properties of policies that make them exploitable.

Existing taxonomy (do not rediscover these):
{taxonomy}

New enabling conditions from enforcement cases:
{cases}

Cluster the enabling conditions into qualities. Respond with ONLY a \
JSON array. Each element:
{\"name\": str, \"definition\": str, \"recognition_test\": str, \
\"exploitation_logic\": str, \"canonical_examples\": [str], \
\"source_case_ids\": [str]}

recognition_test must be answerable yes/no against a policy description \
alone. source_case_ids lists the case ids whose enabling conditions \
belong to the quality.";

const DEDUP_PROMPT: &str = "\
Decide whether a candidate vulnerability quality duplicates one already \
in the taxonomy. Duplicates describe the same structural property even \
if worded differently.

Taxonomy:
{taxonomy}

Candidate:
Name: {name}
Definition: {definition}
Recognition test: {recognition_test}

Respond with ONLY a JSON object: \
{\"duplicate_of\": str or null, \"rationale\": str}. \
duplicate_of is the quality_id in parentheses above, or null if the \
candidate is genuinely new.";

#[derive(Debug, Deserialize)]
struct CandidateQuality {
    name: String,
    definition: String,
    recognition_test: String,
    exploitation_logic: String,
    #[serde(default)]
    canonical_examples: Vec<String>,
    #[serde(default)]
    source_case_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DedupVerdict {
    duplicate_of: Option<String>,
    rationale: String,
}

/// Stage 2 implementation.
#[derive(Debug, Default)]
pub struct TaxonomyStage;

impl TaxonomyStage {
    fn quality_from(candidate: &CandidateQuality) -> Quality {
        Quality {
            quality_id: format!("q_{}", content_hash(&candidate.name.to_lowercase())),
            name: candidate.name.clone(),
            definition: candidate.definition.clone(),
            recognition_test: candidate.recognition_test.clone(),
            exploitation_logic: candidate.exploitation_logic.clone(),
            canonical_examples: candidate.canonical_examples.clone(),
            review_status: ReviewStatus::Draft,
            created_at: Utc::now(),
        }
    }

    fn markers_for(
        case_ids: &[String],
        hashes: &HashMap<String, String>,
        run_id: &str,
    ) -> Vec<ProcessedMarker> {
        case_ids
            .iter()
            .filter_map(|id| {
                hashes.get(id).map(|hash| {
                    ProcessedMarker::new(2, MarkerScope::Global, id, hash, run_id)
                })
            })
            .collect()
    }
}

#[async_trait]
impl Stage for TaxonomyStage {
    fn number(&self) -> u32 {
        2
    }

    fn name(&self) -> &'static str {
        "taxonomy"
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageReport, StageError> {
        let set = ctx.delta.pending_cases_for_taxonomy().await?;
        if set.is_empty() {
            return Ok(StageReport {
                items_processed: 0,
                skipped: set.skipped,
                item_errors: Vec::new(),
                outcome: StageOutcome::Completed,
            });
        }

        let existing = ctx.store.taxonomy(true).await?;
        let case_hashes: HashMap<String, String> = set
            .pending
            .iter()
            .map(|p| (p.item_id.clone(), p.input_hash.clone()))
            .collect();

        let cases_listing = set
            .pending
            .iter()
            .map(|p| format!("[{}] {}", p.item_id, p.item.enabling_condition))
            .collect::<Vec<_>>()
            .join("\n");

        let cluster_template = PromptTemplate::new("taxonomy-cluster", CLUSTER_PROMPT);
        let mut vars = HashMap::new();
        vars.insert("taxonomy", taxonomy_block(&existing));
        vars.insert("cases", cases_listing);
        let candidates: Vec<CandidateQuality> =
            ctx.client.submit(&cluster_template, &vars).await?;

        // Dedup judges each candidate against the taxonomy as it stands,
        // including candidates accepted earlier in this same batch.
        let dedup_template = PromptTemplate::new("taxonomy-dedup", DEDUP_PROMPT);
        let mut working_taxonomy = existing;
        let mut immediate = StageCommit::new(&ctx.run_id, 2);
        let mut proposal_items = Vec::new();
        let mut attributed: HashSet<String> = HashSet::new();

        for candidate in &candidates {
            attributed.extend(candidate.source_case_ids.iter().cloned());
            let markers = Self::markers_for(&candidate.source_case_ids, &case_hashes, &ctx.run_id);

            let mut vars = HashMap::new();
            vars.insert("taxonomy", taxonomy_block(&working_taxonomy));
            vars.insert("name", candidate.name.clone());
            vars.insert("definition", candidate.definition.clone());
            vars.insert("recognition_test", candidate.recognition_test.clone());
            let verdict: DedupVerdict = ctx.client.submit(&dedup_template, &vars).await?;

            let survivor = verdict.duplicate_of.as_ref().and_then(|id| {
                working_taxonomy.iter().find(|q| &q.quality_id == id)
            });
            if let Some(survivor) = survivor {
                info!(
                    candidate = %candidate.name,
                    merged_into = %survivor.quality_id,
                    "duplicate quality merged"
                );
                immediate.writes.push(EntityWrite::MergeExamples {
                    quality_id: survivor.quality_id.clone(),
                    examples: candidate.canonical_examples.clone(),
                    record: MergeRecord {
                        merge_id: format!("merge_{}", uuid::Uuid::new_v4()),
                        quality_id: survivor.quality_id.clone(),
                        candidate_name: candidate.name.clone(),
                        rationale: verdict.rationale,
                        merged_examples: candidate.canonical_examples.clone(),
                        recorded_at: Utc::now(),
                    },
                });
                immediate.markers.extend(markers);
            } else {
                if verdict.duplicate_of.is_some() {
                    warn!(
                        candidate = %candidate.name,
                        "dedup named an unknown quality id, treating candidate as novel"
                    );
                }
                let quality = Self::quality_from(candidate);
                working_taxonomy.push(quality.clone());
                proposal_items.push(ProposalItem {
                    item_id: quality.quality_id.clone(),
                    label: format!("new quality: {}", quality.name),
                    writes: vec![EntityWrite::Quality(quality)],
                    markers,
                });
            }
        }

        // Cases the model attributed to nothing still count as processed.
        for pending in &set.pending {
            if !attributed.contains(&pending.item_id) {
                immediate.markers.push(ProcessedMarker::new(
                    2,
                    MarkerScope::Global,
                    &pending.item_id,
                    &pending.input_hash,
                    &ctx.run_id,
                ));
            }
        }

        if !immediate.is_empty() {
            ctx.store.commit(immediate).await?;
        }

        let items_processed = set.pending.len() as u64;
        let outcome = if proposal_items.is_empty() {
            StageOutcome::Completed
        } else if ctx.config.is_gated(2) {
            let proposed = proposal_items.len();
            ctx.store
                .put_proposal(GateProposal {
                    run_id: ctx.run_id.clone(),
                    stage: 2,
                    items: proposal_items,
                })
                .await?;
            info!(proposed, "taxonomy drafts staged for review");
            StageOutcome::AwaitingApproval { proposed }
        } else {
            // Ungated configuration: drafts auto-approve.
            let mut commit = StageCommit::new(&ctx.run_id, 2);
            for mut item in proposal_items {
                for write in &mut item.writes {
                    if let EntityWrite::Quality(q) = write {
                        q.review_status = ReviewStatus::Approved;
                    }
                }
                commit.writes.extend(item.writes);
                commit.markers.extend(item.markers);
            }
            ctx.store.commit(commit).await?;
            StageOutcome::Completed
        };

        Ok(StageReport {
            items_processed,
            skipped: set.skipped,
            item_errors: Vec::new(),
            outcome,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_id_is_case_insensitive_on_name() {
        let candidate = |name: &str| CandidateQuality {
            name: name.to_string(),
            definition: "d".to_string(),
            recognition_test: "r".to_string(),
            exploitation_logic: "e".to_string(),
            canonical_examples: vec![],
            source_case_ids: vec![],
        };
        let a = TaxonomyStage::quality_from(&candidate("Self-Reported Eligibility"));
        let b = TaxonomyStage::quality_from(&candidate("self-reported eligibility"));
        assert_eq!(a.quality_id, b.quality_id);
        assert_eq!(a.review_status, ReviewStatus::Draft);
    }

    #[test]
    fn markers_skip_unknown_case_ids() {
        let mut hashes = HashMap::new();
        hashes.insert("case_a".to_string(), "h1".to_string());

        let markers = TaxonomyStage::markers_for(
            &["case_a".to_string(), "case_invented".to_string()],
            &hashes,
            "run_1",
        );
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].item_id, "case_a");
    }
}
