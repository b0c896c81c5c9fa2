//! Stage 4: policy scanning.
//!
//! Characterizes each policy's structure (once, reused thereafter) and
//! scores it against every approved quality using the recognition
//! tests. Policies fan out under the concurrency bound; each policy's
//! characterization, scores, and marker commit atomically.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

use crate::delta::Pending;
use crate::errors::{ModelError, StageError};
use crate::model::PromptTemplate;
use crate::retrieval::format::{chunks_block, taxonomy_block};
use crate::store::entities::{MarkerScope, Policy, PolicyScore, ProcessedMarker};
use crate::store::{EntityWrite, StageCommit};

use super::{ItemError, Stage, StageContext, StageOutcome, StageReport};

const CHARACTERIZE_PROMPT: &str = "\
Characterize the structure of a government policy or program: how money \
or benefits flow, who attests to what, what is verified versus \
self-reported, and where discretion sits.

Policy: {name}
Description:
{description}

Reference material:
{context}

Respond with ONLY a JSON object: {\"characterization\": str}. Write \
the characterization as a dense structural summary, not an evaluation.";

const SCAN_PROMPT: &str = "\
Apply each recognition test below to a policy's structural \
characterization. Answer strictly from structure; ignore whether abuse \
has been reported.

Policy: {name}
Structural characterization:
{characterization}

Taxonomy:
{taxonomy}

Respond with ONLY a JSON array, one element per quality: \
{\"quality_id\": str, \"present\": bool, \"evidence\": str}.";

#[derive(Debug, Deserialize)]
struct Characterization {
    characterization: String,
}

#[derive(Debug, Deserialize)]
struct QualityVerdict {
    quality_id: String,
    present: bool,
    evidence: String,
}

/// Stage 4 implementation.
#[derive(Debug, Default)]
pub struct ScanningStage;

impl ScanningStage {
    /// Scans one policy: characterize if needed, then score every
    /// quality. Returns the updated policy and its verdicts.
    async fn scan_policy(
        ctx: &StageContext,
        taxonomy_text: &str,
        mut policy: Policy,
    ) -> Result<(Policy, Vec<QualityVerdict>), ModelError> {
        if policy.structural_characterization.is_none() {
            let query = format!("{} {}", policy.name, policy.description);
            let chunks = match ctx.retrieval.retrieve(&query, None).await {
                Ok(chunks) => chunks,
                Err(e) => {
                    warn!(policy = %policy.policy_id, error = %e, "retrieval failed, characterizing without context");
                    Vec::new()
                }
            };

            let template = PromptTemplate::new("policy-characterize", CHARACTERIZE_PROMPT);
            let mut vars = HashMap::new();
            vars.insert("name", policy.name.clone());
            vars.insert("description", policy.description.clone());
            vars.insert("context", chunks_block(&chunks));
            let answer: Characterization = ctx.client.submit(&template, &vars).await?;
            policy.structural_characterization = Some(answer.characterization);
        }

        let characterization = policy
            .structural_characterization
            .clone()
            .unwrap_or_default();
        let template = PromptTemplate::new("policy-scan", SCAN_PROMPT);
        let mut vars = HashMap::new();
        vars.insert("name", policy.name.clone());
        vars.insert("characterization", characterization);
        vars.insert("taxonomy", taxonomy_text.to_string());
        let verdicts: Vec<QualityVerdict> = ctx.client.submit(&template, &vars).await?;
        Ok((policy, verdicts))
    }
}

#[async_trait]
impl Stage for ScanningStage {
    fn number(&self) -> u32 {
        4
    }

    fn name(&self) -> &'static str {
        "scanning"
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageReport, StageError> {
        let taxonomy = ctx.store.taxonomy(true).await?;
        if taxonomy.is_empty() {
            return Err(StageError::UpstreamPrerequisiteMissing(
                "no approved taxonomy qualities".to_string(),
            ));
        }

        let fp = ctx.delta.taxonomy_fingerprint().await?;
        let set = ctx.delta.pending_policies_for_scan(&ctx.run_id, &fp).await?;
        let taxonomy_text = taxonomy_block(&taxonomy);
        let known: HashSet<&str> = taxonomy.iter().map(|q| q.quality_id.as_str()).collect();
        let limit = ctx.config.pipeline.max_concurrency;

        let results = crate::parallel::map_bounded(set.pending, limit, |pending| {
            let taxonomy_text = taxonomy_text.clone();
            async move {
                let scanned =
                    Self::scan_policy(ctx, &taxonomy_text, pending.item.clone()).await;
                (pending, scanned)
            }
        })
        .await;

        let mut processed = 0u64;
        let mut item_errors = Vec::new();

        for (pending, scanned) in results {
            let Pending {
                item_id,
                input_hash,
                ..
            } = pending;
            match scanned {
                Ok((policy, verdicts)) => {
                    let mut commit = StageCommit::new(&ctx.run_id, 4);
                    for verdict in verdicts {
                        if !known.contains(verdict.quality_id.as_str()) {
                            warn!(
                                policy = %item_id,
                                quality = %verdict.quality_id,
                                "scan invented a quality id, dropping verdict"
                            );
                            continue;
                        }
                        commit.writes.push(EntityWrite::PolicyScore(PolicyScore {
                            run_id: ctx.run_id.clone(),
                            policy_id: policy.policy_id.clone(),
                            quality_id: verdict.quality_id,
                            present: verdict.present,
                            evidence: verdict.evidence,
                        }));
                    }
                    commit.writes.push(EntityWrite::Policy(policy));
                    commit.markers.push(ProcessedMarker::new(
                        4,
                        MarkerScope::Run(ctx.run_id.clone()),
                        &item_id,
                        &input_hash,
                        &ctx.run_id,
                    ));
                    ctx.store.commit(commit).await?;
                    processed += 1;
                }
                Err(e) => {
                    warn!(policy = %item_id, error = %e, "policy scan failed");
                    item_errors.push(ItemError {
                        item_id,
                        detail: e.to_string(),
                    });
                }
            }
        }

        info!(
            processed,
            skipped = set.skipped,
            failed = item_errors.len(),
            "policy scanning finished"
        );
        Ok(StageReport {
            items_processed: processed,
            skipped: set.skipped,
            item_errors,
            outcome: StageOutcome::Completed,
        })
    }
}
