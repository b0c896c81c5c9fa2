//! Stage 6: detection pattern generation.
//!
//! Turns each approved prediction into concrete, queryable detection
//! patterns. Regeneration first deletes the prediction's stale patterns
//! in the same commit that writes the fresh ones, so consumers never
//! see a mix of old and new.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::delta::Pending;
use crate::errors::StageError;
use crate::model::PromptTemplate;
use crate::store::entities::{
    DetectionPattern, MarkerScope, Prediction, Priority, ProcessedMarker, ReviewStatus,
};
use crate::store::{EntityWrite, StageCommit};

use super::{ItemError, Stage, StageContext, StageOutcome, StageReport};

const DETECT_PROMPT: &str = "\
Design detection patterns for a predicted exploitation scheme. Each \
pattern must be implementable as a query or rule against a named data \
source available to program-integrity analysts.

Predicted scheme:
{mechanics}

Actor profile: {actor_profile}
Detection difficulty: {detection_difficulty}

Respond with ONLY a JSON array. Each element:
{\"data_source\": str, \"anomaly_signal\": str, \"baseline\": str, \
\"false_positive_risk\": str, \"detection_latency\": str, \
\"priority\": \"critical\"|\"high\"|\"medium\"|\"low\", \
\"implementation_notes\": str}

anomaly_signal must be a measurable condition, not an instruction to \
investigate.";

#[derive(Debug, Deserialize)]
struct PatternAnswer {
    data_source: String,
    anomaly_signal: String,
    baseline: String,
    false_positive_risk: String,
    detection_latency: String,
    priority: Priority,
    implementation_notes: String,
}

/// Stage 6 implementation.
#[derive(Debug, Default)]
pub struct DetectionStage;

impl DetectionStage {
    fn patterns_from(prediction: &Prediction, answers: Vec<PatternAnswer>) -> Vec<DetectionPattern> {
        answers
            .into_iter()
            .map(|a| DetectionPattern {
                pattern_id: format!("pat_{}", uuid::Uuid::new_v4()),
                run_id: prediction.run_id.clone(),
                prediction_id: prediction.prediction_id.clone(),
                data_source: a.data_source,
                anomaly_signal: a.anomaly_signal,
                baseline: a.baseline,
                false_positive_risk: a.false_positive_risk,
                detection_latency: a.detection_latency,
                priority: a.priority,
                implementation_notes: a.implementation_notes,
            })
            .collect()
    }
}

#[async_trait]
impl Stage for DetectionStage {
    fn number(&self) -> u32 {
        6
    }

    fn name(&self) -> &'static str {
        "detection"
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageReport, StageError> {
        let set = ctx
            .delta
            .pending_predictions_for_detection(&ctx.run_id)
            .await?;
        // Only reviewed predictions generate patterns.
        let pending: Vec<_> = set
            .pending
            .into_iter()
            .filter(|p| p.item.review_status == ReviewStatus::Approved)
            .collect();
        if pending.is_empty() {
            return Ok(StageReport {
                items_processed: 0,
                skipped: set.skipped,
                item_errors: Vec::new(),
                outcome: StageOutcome::Completed,
            });
        }

        let template = PromptTemplate::new("detection-patterns", DETECT_PROMPT);
        let limit = ctx.config.pipeline.max_concurrency;

        let results = crate::parallel::map_bounded(pending, limit, |pending| {
            let client = ctx.client.clone();
            let template = template.clone();
            async move {
                let mut vars = HashMap::new();
                vars.insert("mechanics", pending.item.mechanics.clone());
                vars.insert("actor_profile", pending.item.actor_profile.clone());
                vars.insert(
                    "detection_difficulty",
                    pending.item.detection_difficulty.clone(),
                );
                let answers: Result<Vec<PatternAnswer>, _> =
                    client.submit(&template, &vars).await;
                (pending, answers)
            }
        })
        .await;

        let mut processed = 0u64;
        let mut item_errors = Vec::new();

        for (pending, answers) in results {
            let Pending {
                item: prediction,
                item_id,
                input_hash,
            } = pending;
            match answers {
                Ok(answers) => {
                    let mut commit = StageCommit::new(&ctx.run_id, 6);
                    commit.writes.push(EntityWrite::DeletePatternsFor {
                        prediction_id: prediction.prediction_id.clone(),
                    });
                    commit.writes.extend(
                        Self::patterns_from(&prediction, answers)
                            .into_iter()
                            .map(EntityWrite::DetectionPattern),
                    );
                    commit.markers.push(ProcessedMarker::new(
                        6,
                        MarkerScope::Run(ctx.run_id.clone()),
                        &item_id,
                        &input_hash,
                        &ctx.run_id,
                    ));
                    ctx.store.commit(commit).await?;
                    processed += 1;
                }
                Err(e) => {
                    warn!(prediction = %item_id, error = %e, "pattern generation failed");
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
            "detection patterns generated"
        );
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

    #[test]
    fn patterns_inherit_run_and_prediction() {
        let prediction = Prediction {
            prediction_id: "pred_x".to_string(),
            run_id: "run_1".to_string(),
            policy_id: "pol_a".to_string(),
            convergence_score: 4,
            mechanics: "shell providers bill for services never rendered".to_string(),
            enabling_qualities: vec![],
            actor_profile: "organized ring".to_string(),
            lifecycle_stage: "steady state".to_string(),
            detection_difficulty: "moderate".to_string(),
            review_status: ReviewStatus::Approved,
        };
        let answers = vec![PatternAnswer {
            data_source: "claims feed".to_string(),
            anomaly_signal: "billing above the 99th percentile".to_string(),
            baseline: "peer providers".to_string(),
            false_positive_risk: "legitimate high-volume clinics".to_string(),
            detection_latency: "monthly".to_string(),
            priority: Priority::High,
            implementation_notes: "group by provider".to_string(),
        }];

        let patterns = DetectionStage::patterns_from(&prediction, answers);
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].prediction_id, "pred_x");
        assert_eq!(patterns[0].run_id, "run_1");
        assert_eq!(patterns[0].priority, Priority::High);
    }

    #[test]
    fn priority_parses_from_model_output() {
        let raw = r#"{"data_source": "d", "anomaly_signal": "a", "baseline": "b",
            "false_positive_risk": "f", "detection_latency": "l",
            "priority": "critical", "implementation_notes": "n"}"#;
        let answer: PatternAnswer = serde_json::from_str(raw).unwrap();
        assert_eq!(answer.priority, Priority::Critical);
    }
}
