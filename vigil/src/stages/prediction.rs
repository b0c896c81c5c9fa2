//! Stage 5: exploitation prediction.
//!
//! Takes every policy whose present-quality count reaches the
//! calibrated threshold and predicts how it will be exploited, grounded
//! in the qualities found and in analogous enforcement cases. Output is
//! staged behind the human gate: predictions name real programs and go
//! nowhere without review.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::delta::{content_hash, Pending};
use crate::errors::StageError;
use crate::model::PromptTemplate;
use crate::retrieval::format::case_block;
use crate::store::entities::{MarkerScope, Policy, Prediction, ProcessedMarker, ReviewStatus};
use crate::store::{EntityWrite, GateProposal, ProposalItem, StageCommit};

use super::{ItemError, Stage, StageContext, StageOutcome, StageReport};

/// Analogous cases shown per prediction prompt.
const MAX_ANALOG_CASES: usize = 5;

const PREDICT_PROMPT: &str = "\
A policy has been found to carry a convergence of structural \
vulnerability qualities. Predict the exploitation scheme it invites.

Policy: {name}
Structural characterization:
{characterization}

Qualities present (with the evidence found):
{qualities}

Analogous enforcement cases sharing these qualities:
{analogs}

Respond with ONLY a JSON object:
{\"mechanics\": str, \"actor_profile\": str, \"lifecycle_stage\": str, \
\"detection_difficulty\": str, \"enabling_qualities\": [str]}

mechanics describes the concrete scheme step by step. \
enabling_qualities lists the quality_ids the scheme depends on. \
lifecycle_stage names where in the policy's life the scheme starts.";

#[derive(Debug, Deserialize)]
struct PredictionAnswer {
    mechanics: String,
    actor_profile: String,
    lifecycle_stage: String,
    detection_difficulty: String,
    #[serde(default)]
    enabling_qualities: Vec<String>,
}

/// Stage 5 implementation.
#[derive(Debug, Default)]
pub struct PredictionStage;

impl PredictionStage {
    fn prediction_id(run_id: &str, policy_id: &str) -> String {
        format!("pred_{}", content_hash(&format!("{run_id}|{policy_id}")))
    }

    async fn predict_policy(
        ctx: &StageContext,
        policy: &Policy,
    ) -> Result<Prediction, StageError> {
        let scores = ctx.store.policy_scores(&ctx.run_id).await?;
        let present: Vec<_> = scores
            .iter()
            .filter(|s| s.policy_id == policy.policy_id && s.present)
            .collect();

        let qualities_block = present
            .iter()
            .map(|s| format!("- {}: {}", s.quality_id, s.evidence))
            .collect::<Vec<_>>()
            .join("\n");

        // Analogous cases: any case where one of the same qualities was
        // found present.
        let convergence = ctx.store.convergence_scores(&ctx.run_id).await?;
        let cases = ctx.store.cases().await?;
        let mut analog_ids: Vec<&str> = convergence
            .iter()
            .filter(|c| c.present && present.iter().any(|s| s.quality_id == c.quality_id))
            .map(|c| c.case_id.as_str())
            .collect();
        analog_ids.sort_unstable();
        analog_ids.dedup();
        let analogs = cases
            .iter()
            .filter(|c| analog_ids.contains(&c.case_id.as_str()))
            .take(MAX_ANALOG_CASES)
            .map(case_block)
            .collect::<Vec<_>>()
            .join("\n\n");

        let template = PromptTemplate::new("exploitation-predict", PREDICT_PROMPT);
        let mut vars = HashMap::new();
        vars.insert("name", policy.name.clone());
        vars.insert(
            "characterization",
            policy
                .structural_characterization
                .clone()
                .unwrap_or_else(|| policy.description.clone()),
        );
        vars.insert("qualities", qualities_block);
        vars.insert(
            "analogs",
            if analogs.is_empty() {
                "(none on record)".to_string()
            } else {
                analogs
            },
        );
        let answer: PredictionAnswer = ctx.client.submit(&template, &vars).await?;

        let known: Vec<&str> = present.iter().map(|s| s.quality_id.as_str()).collect();
        let enabling: Vec<String> = answer
            .enabling_qualities
            .into_iter()
            .filter(|q| known.contains(&q.as_str()))
            .collect();

        Ok(Prediction {
            prediction_id: Self::prediction_id(&ctx.run_id, &policy.policy_id),
            run_id: ctx.run_id.clone(),
            policy_id: policy.policy_id.clone(),
            convergence_score: present.len() as u32,
            mechanics: answer.mechanics,
            enabling_qualities: enabling,
            actor_profile: answer.actor_profile,
            lifecycle_stage: answer.lifecycle_stage,
            detection_difficulty: answer.detection_difficulty,
            review_status: ReviewStatus::Draft,
        })
    }
}

#[async_trait]
impl Stage for PredictionStage {
    fn number(&self) -> u32 {
        5
    }

    fn name(&self) -> &'static str {
        "prediction"
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageReport, StageError> {
        let calibration = ctx
            .store
            .calibration(&ctx.run_id)
            .await?
            .ok_or_else(|| {
                StageError::UpstreamPrerequisiteMissing("no calibration for run".to_string())
            })?;

        let set = ctx
            .delta
            .pending_policies_for_prediction(&ctx.run_id, calibration.threshold)
            .await?;
        if set.is_empty() {
            return Ok(StageReport {
                items_processed: 0,
                skipped: set.skipped,
                item_errors: Vec::new(),
                outcome: StageOutcome::Completed,
            });
        }

        let limit = ctx.config.pipeline.max_concurrency;
        let results = crate::parallel::map_bounded(set.pending, limit, |pending| async move {
            let predicted = Self::predict_policy(ctx, &pending.item).await;
            (pending, predicted)
        })
        .await;

        let mut proposal_items = Vec::new();
        let mut item_errors = Vec::new();
        let mut processed = 0u64;

        for (pending, predicted) in results {
            let Pending {
                item: policy,
                item_id,
                input_hash,
            } = pending;
            match predicted {
                Ok(prediction) => {
                    let marker = ProcessedMarker::new(
                        5,
                        MarkerScope::Run(ctx.run_id.clone()),
                        &item_id,
                        &input_hash,
                        &ctx.run_id,
                    );
                    proposal_items.push(ProposalItem {
                        item_id: prediction.prediction_id.clone(),
                        label: format!(
                            "prediction for {} (convergence {})",
                            policy.name, prediction.convergence_score
                        ),
                        writes: vec![EntityWrite::Prediction(prediction)],
                        markers: vec![marker],
                    });
                    processed += 1;
                }
                Err(e) => {
                    warn!(policy = %item_id, error = %e, "prediction failed");
                    item_errors.push(ItemError {
                        item_id,
                        detail: e.to_string(),
                    });
                }
            }
        }

        let outcome = if proposal_items.is_empty() {
            StageOutcome::Completed
        } else if ctx.config.is_gated(5) {
            let proposed = proposal_items.len();
            ctx.store
                .put_proposal(GateProposal {
                    run_id: ctx.run_id.clone(),
                    stage: 5,
                    items: proposal_items,
                })
                .await?;
            info!(proposed, "predictions staged for review");
            StageOutcome::AwaitingApproval { proposed }
        } else {
            let mut commit = StageCommit::new(&ctx.run_id, 5);
            for mut item in proposal_items {
                for write in &mut item.writes {
                    if let EntityWrite::Prediction(p) = write {
                        p.review_status = ReviewStatus::Approved;
                    }
                }
                commit.writes.extend(item.writes);
                commit.markers.extend(item.markers);
            }
            ctx.store.commit(commit).await?;
            StageOutcome::Completed
        };

        Ok(StageReport {
            items_processed: processed,
            skipped: set.skipped,
            item_errors,
            outcome,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prediction_id_is_stable_within_a_run() {
        let a = PredictionStage::prediction_id("run_1", "pol_x");
        let b = PredictionStage::prediction_id("run_1", "pol_x");
        let c = PredictionStage::prediction_id("run_2", "pol_x");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("pred_"));
    }
}
