//! Stage 3: convergence scoring.
//!
//! Scores every case against every approved quality, then derives the
//! run's calibration from the full matrix. Case scoring fans out under
//! the concurrency bound; one commit per case keeps its scores and
//! marker atomic. Calibration runs after scoring and falls back to a
//! fixed threshold when the model's answer is unusable.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

use crate::delta::Pending;
use crate::errors::StageError;
use crate::model::PromptTemplate;
use crate::retrieval::format::{case_block, taxonomy_block};
use crate::store::entities::{
    Calibration, Case, ConvergenceScore, MarkerScope, ProcessedMarker, Quality,
};
use crate::store::{EntityWrite, StageCommit};

use super::{ItemError, Stage, StageContext, StageOutcome, StageReport};

/// Threshold used when the calibration call fails or returns an
/// implausible value.
const FALLBACK_THRESHOLD: u32 = 3;

const SCORE_PROMPT: &str = "\
Score one enforcement case against a taxonomy of structural \
vulnerability qualities. A quality is present only if the case's \
mechanics actually depended on it.

{case}

Taxonomy:
{taxonomy}

Respond with ONLY a JSON array, one element per quality: \
{\"quality_id\": str, \"present\": bool, \"evidence\": str}. \
evidence quotes or paraphrases the part of the case that shows the \
quality, or states why it is absent.";

const CALIBRATION_PROMPT: &str = "\
Below is a convergence matrix: for each enforcement case, the count of \
structural vulnerability qualities present and the case's dollar scale.

{matrix}

Quality frequency across cases:
{frequency}

Pick the convergence threshold: the smallest count of co-present \
qualities that separates the large-scale schemes from the rest. \
Respond with ONLY a JSON object: \
{\"threshold\": int, \"correlation_notes\": str}.";

#[derive(Debug, Deserialize)]
struct QualityVerdict {
    quality_id: String,
    present: bool,
    evidence: String,
}

#[derive(Debug, Deserialize)]
struct CalibrationAnswer {
    threshold: u32,
    correlation_notes: String,
}

/// Stage 3 implementation.
#[derive(Debug, Default)]
pub struct ScoringStage;

impl ScoringStage {
    fn matrix_line(case: &Case, present: usize) -> String {
        let scale = case
            .scale_dollars
            .map_or_else(|| "unknown".to_string(), |d| format!("${d:.0}"));
        format!("{}: {present} qualities, scale {scale}", case.case_name)
    }

    /// Builds the calibration entity from the full score matrix, asking
    /// the model for the threshold.
    async fn calibrate(
        ctx: &StageContext,
        taxonomy: &[Quality],
    ) -> Result<Calibration, StageError> {
        let scores = ctx.store.convergence_scores(&ctx.run_id).await?;
        let cases = ctx.store.cases().await?;

        let mut per_case: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        let mut frequency: BTreeMap<String, u32> = BTreeMap::new();
        let mut combinations: BTreeMap<String, u32> = BTreeMap::new();
        for score in scores.iter().filter(|s| s.present) {
            per_case.entry(&score.case_id).or_default().push(&score.quality_id);
            *frequency.entry(score.quality_id.clone()).or_insert(0) += 1;
        }
        for present in per_case.values_mut() {
            present.sort_unstable();
            for pair in present.windows(2) {
                *combinations
                    .entry(format!("{}+{}", pair[0], pair[1]))
                    .or_insert(0) += 1;
            }
        }

        let matrix = cases
            .iter()
            .map(|c| {
                let count = per_case.get(c.case_id.as_str()).map_or(0, Vec::len);
                Self::matrix_line(c, count)
            })
            .collect::<Vec<_>>()
            .join("\n");
        let frequency_block = frequency
            .iter()
            .map(|(q, n)| format!("{q}: {n}"))
            .collect::<Vec<_>>()
            .join("\n");

        let template = PromptTemplate::new("calibration", CALIBRATION_PROMPT);
        let mut vars = HashMap::new();
        vars.insert("matrix", matrix);
        vars.insert("frequency", frequency_block);

        let max_plausible = taxonomy.len() as u32;
        let (threshold, notes) = match ctx
            .client
            .submit::<CalibrationAnswer>(&template, &vars)
            .await
        {
            Ok(answer) if answer.threshold >= 1 && answer.threshold <= max_plausible => {
                (answer.threshold, answer.correlation_notes)
            }
            Ok(answer) => {
                warn!(threshold = answer.threshold, "implausible threshold, using fallback");
                (FALLBACK_THRESHOLD, answer.correlation_notes)
            }
            Err(e) => {
                warn!(error = %e, "calibration call failed, using fallback threshold");
                (
                    FALLBACK_THRESHOLD,
                    "calibration unavailable; fixed threshold".to_string(),
                )
            }
        };

        Ok(Calibration {
            run_id: ctx.run_id.clone(),
            threshold,
            correlation_notes: notes,
            quality_frequency: frequency,
            quality_combinations: combinations,
        })
    }
}

#[async_trait]
impl Stage for ScoringStage {
    fn number(&self) -> u32 {
        3
    }

    fn name(&self) -> &'static str {
        "scoring"
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageReport, StageError> {
        let taxonomy = ctx.store.taxonomy(true).await?;
        if taxonomy.is_empty() {
            return Err(StageError::UpstreamPrerequisiteMissing(
                "no approved taxonomy qualities".to_string(),
            ));
        }

        let fp = ctx.delta.taxonomy_fingerprint().await?;
        let set = ctx.delta.pending_cases_for_scoring(&ctx.run_id, &fp).await?;

        let template = PromptTemplate::new("convergence-score", SCORE_PROMPT);
        let taxonomy_text = taxonomy_block(&taxonomy);
        let limit = ctx.config.pipeline.max_concurrency;

        let results = crate::parallel::map_bounded(set.pending, limit, |pending| {
            let client = ctx.client.clone();
            let template = template.clone();
            let taxonomy_text = taxonomy_text.clone();
            async move {
                let mut vars = HashMap::new();
                vars.insert("case", case_block(&pending.item));
                vars.insert("taxonomy", taxonomy_text);
                let verdicts: Result<Vec<QualityVerdict>, _> =
                    client.submit(&template, &vars).await;
                (pending, verdicts)
            }
        })
        .await;

        let known: std::collections::HashSet<&str> =
            taxonomy.iter().map(|q| q.quality_id.as_str()).collect();
        let mut processed = 0u64;
        let mut item_errors = Vec::new();

        for (pending, verdicts) in results {
            let Pending {
                item: case,
                item_id,
                input_hash,
            } = pending;
            match verdicts {
                Ok(verdicts) => {
                    let mut commit = StageCommit::new(&ctx.run_id, 3);
                    for verdict in verdicts {
                        if !known.contains(verdict.quality_id.as_str()) {
                            warn!(
                                case = %item_id,
                                quality = %verdict.quality_id,
                                "scorer invented a quality id, dropping verdict"
                            );
                            continue;
                        }
                        commit.writes.push(EntityWrite::ConvergenceScore(ConvergenceScore {
                            run_id: ctx.run_id.clone(),
                            case_id: case.case_id.clone(),
                            quality_id: verdict.quality_id,
                            present: verdict.present,
                            evidence: verdict.evidence,
                        }));
                    }
                    commit.markers.push(ProcessedMarker::new(
                        3,
                        MarkerScope::Run(ctx.run_id.clone()),
                        &item_id,
                        &input_hash,
                        &ctx.run_id,
                    ));
                    ctx.store.commit(commit).await?;
                    processed += 1;
                }
                Err(e) => {
                    warn!(case = %item_id, error = %e, "case scoring failed");
                    item_errors.push(ItemError {
                        item_id,
                        detail: e.to_string(),
                    });
                }
            }
        }

        // Calibration reflects the whole matrix, so recompute whenever
        // anything was scored or no calibration exists yet.
        let needs_calibration =
            processed > 0 || ctx.store.calibration(&ctx.run_id).await?.is_none();
        if needs_calibration && item_errors.is_empty() {
            let calibration = Self::calibrate(ctx, &taxonomy).await?;
            info!(threshold = calibration.threshold, "calibration derived");
            let mut commit = StageCommit::new(&ctx.run_id, 3);
            commit.writes.push(EntityWrite::Calibration(calibration));
            ctx.store.commit(commit).await?;
        }

        Ok(StageReport {
            items_processed: processed,
            skipped: set.skipped,
            item_errors,
            outcome: StageOutcome::Completed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn matrix_line_uses_unknown_sentinel() {
        let case = Case {
            case_id: "c1".to_string(),
            source_document: "s".to_string(),
            case_name: "Phantom Clinic".to_string(),
            scheme_mechanics: String::new(),
            exploited_policy: String::new(),
            enabling_condition: String::new(),
            scale_dollars: None,
            scale_defendants: None,
            scale_duration: None,
            detection_method: None,
            extracted_at: Utc::now(),
        };
        let line = ScoringStage::matrix_line(&case, 4);
        assert!(line.contains("4 qualities"));
        assert!(line.contains("scale unknown"));
    }
}
