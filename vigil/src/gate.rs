//! Human approval gates.
//!
//! A gated stage stages its output as a [`GateProposal`] and the run
//! halts. The controller resolves the proposal: approval commits the
//! selected items' writes and markers atomically and records an
//! `Approved` execution row; rejection discards the proposal and records
//! a `Failed` row, leaving every input unmarked so a rerun reprocesses
//! it. Unselected items on approval are likewise discarded, not marked.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

use crate::errors::{OrchestratorError, StoreError};
use crate::store::entities::{ExecutionStatus, ReviewStatus, RunState, StageExecution};
use crate::store::{EntityStore, EntityWrite, GateProposal, StageCommit};

/// Observer for gate transitions. The default implementation logs;
/// embedders can swap in notifications.
#[async_trait]
pub trait GateSignal: Send + Sync {
    /// A run halted at a gate with `items` awaiting review.
    async fn halted(&self, run_id: &str, stage: u32, items: usize);

    /// A gate was resolved and the run may continue.
    async fn resumed(&self, run_id: &str, stage: u32, approved: usize, discarded: usize);
}

/// Gate signal that writes structured log events.
#[derive(Debug, Default)]
pub struct LoggingGateSignal;

#[async_trait]
impl GateSignal for LoggingGateSignal {
    async fn halted(&self, run_id: &str, stage: u32, items: usize) {
        info!(run = %run_id, stage, items, "run halted at human gate");
    }

    async fn resumed(&self, run_id: &str, stage: u32, approved: usize, discarded: usize) {
        info!(run = %run_id, stage, approved, discarded, "gate resolved, run resumed");
    }
}

/// Observable gate state for one run and stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateStatus {
    /// The stage has not produced a proposal.
    NotReached,
    /// A proposal is pending review.
    AwaitingApproval {
        /// Number of reviewable items.
        items: usize,
    },
    /// The proposal was approved.
    Approved,
    /// The proposal was rejected.
    Rejected,
}

/// Outcome of resolving a gate.
#[derive(Debug, Clone)]
pub struct GateResolution {
    /// Items whose writes were committed.
    pub approved: usize,
    /// Items discarded without commit.
    pub discarded: usize,
}

/// Resolves gate proposals against the store.
pub struct GateController {
    store: Arc<dyn EntityStore>,
    signal: Arc<dyn GateSignal>,
}

impl GateController {
    /// Creates a controller with the logging signal.
    #[must_use]
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self {
            store,
            signal: Arc::new(LoggingGateSignal),
        }
    }

    /// Replaces the gate signal.
    #[must_use]
    pub fn with_signal(mut self, signal: Arc<dyn GateSignal>) -> Self {
        self.signal = signal;
        self
    }

    /// Returns the pending proposal, if any.
    pub async fn pending(
        &self,
        run_id: &str,
        stage: u32,
    ) -> Result<Option<GateProposal>, StoreError> {
        self.store.get_proposal(run_id, stage).await
    }

    /// Derives the gate state from the proposal table and the execution
    /// log.
    pub async fn status(&self, run_id: &str, stage: u32) -> Result<GateStatus, StoreError> {
        if let Some(proposal) = self.store.get_proposal(run_id, stage).await? {
            return Ok(GateStatus::AwaitingApproval {
                items: proposal.items.len(),
            });
        }
        let executions = self.store.executions(run_id).await?;
        let latest = executions.iter().rev().find(|e| e.stage == stage);
        Ok(match latest.map(|e| e.status) {
            Some(ExecutionStatus::Approved) => GateStatus::Approved,
            Some(ExecutionStatus::Failed)
                if latest.and_then(|e| e.error.as_deref()) == Some(REJECTED_ERROR) =>
            {
                GateStatus::Rejected
            }
            _ => GateStatus::NotReached,
        })
    }

    /// Approves the proposal, or the named subset of it. Selected items
    /// commit atomically with draft entities promoted to approved;
    /// everything else is discarded and its inputs stay pending.
    pub async fn approve(
        &self,
        run_id: &str,
        stage: u32,
        selection: Option<&[String]>,
    ) -> Result<GateResolution, OrchestratorError> {
        let proposal = self
            .store
            .get_proposal(run_id, stage)
            .await?
            .ok_or(OrchestratorError::NothingToApprove { stage })?;

        if let Some(ids) = selection {
            let known: HashSet<&str> = proposal.items.iter().map(|i| i.item_id.as_str()).collect();
            for id in ids {
                if !known.contains(id.as_str()) {
                    return Err(OrchestratorError::Store(StoreError::NotFound(format!(
                        "proposal item '{id}' at stage {stage}"
                    ))));
                }
            }
        }

        let total = proposal.items.len();
        let mut commit = StageCommit::new(run_id, stage);
        let mut approved = 0usize;
        for item in proposal.items {
            let selected = selection.map_or(true, |ids| ids.contains(&item.item_id));
            if !selected {
                continue;
            }
            approved += 1;
            for mut write in item.writes {
                promote(&mut write);
                commit.writes.push(write);
            }
            commit.markers.extend(item.markers);
        }

        self.store.commit(commit).await?;
        self.store.remove_proposal(run_id, stage).await?;

        let mut execution = StageExecution::started(run_id, stage);
        execution = execution.finished(ExecutionStatus::Approved, approved as u64, None);
        self.store.record_execution(execution).await?;

        let mut run = self.store.get_run(run_id).await?;
        run.state = RunState::Active;
        run.current_stage = Some(stage);
        self.store.update_run(run).await?;

        let discarded = total - approved;
        self.signal.resumed(run_id, stage, approved, discarded).await;
        Ok(GateResolution {
            approved,
            discarded,
        })
    }

    /// Rejects the whole proposal. Nothing commits and no inputs are
    /// marked; rerunning the stage regenerates the proposal.
    pub async fn reject(&self, run_id: &str, stage: u32) -> Result<(), OrchestratorError> {
        let proposal = self
            .store
            .get_proposal(run_id, stage)
            .await?
            .ok_or(OrchestratorError::NothingToApprove { stage })?;
        let items = proposal.items.len();

        self.store.remove_proposal(run_id, stage).await?;

        let mut execution = StageExecution::started(run_id, stage);
        execution =
            execution.finished(ExecutionStatus::Failed, 0, Some(REJECTED_ERROR.to_string()));
        self.store.record_execution(execution).await?;

        let mut run = self.store.get_run(run_id).await?;
        run.state = RunState::Active;
        self.store.update_run(run).await?;

        self.signal.resumed(run_id, stage, 0, items).await;
        Ok(())
    }
}

const REJECTED_ERROR: &str = "gate rejected by reviewer";

/// Promotes draft review entities in an approved write.
fn promote(write: &mut EntityWrite) {
    match write {
        EntityWrite::Quality(q) => q.review_status = ReviewStatus::Approved,
        EntityWrite::Prediction(p) => p.review_status = ReviewStatus::Approved,
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::entities::{MarkerScope, ProcessedMarker, Quality, Run};
    use crate::store::{MemoryStore, ProposalItem};
    use chrono::Utc;

    fn draft_quality(id: &str) -> Quality {
        Quality {
            quality_id: id.to_string(),
            name: id.to_string(),
            definition: "d".to_string(),
            recognition_test: "r".to_string(),
            exploitation_logic: "e".to_string(),
            canonical_examples: vec![],
            review_status: ReviewStatus::Draft,
            created_at: Utc::now(),
        }
    }

    fn item(id: &str, case: &str) -> ProposalItem {
        ProposalItem {
            item_id: id.to_string(),
            label: format!("new quality: {id}"),
            writes: vec![EntityWrite::Quality(draft_quality(id))],
            markers: vec![ProcessedMarker::new(
                2,
                MarkerScope::Global,
                case,
                "hash",
                "run_1",
            )],
        }
    }

    async fn store_with_proposal() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .create_run(Run::new("run_1", serde_json::json!({}), "test"))
            .await
            .unwrap();
        store
            .put_proposal(GateProposal {
                run_id: "run_1".to_string(),
                stage: 2,
                items: vec![item("q_a", "case_1"), item("q_b", "case_2")],
            })
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn approve_all_commits_everything_and_promotes() {
        let store = store_with_proposal().await;
        let gate = GateController::new(Arc::clone(&store) as Arc<dyn EntityStore>);

        let resolution = gate.approve("run_1", 2, None).await.unwrap();
        assert_eq!(resolution.approved, 2);
        assert_eq!(resolution.discarded, 0);

        let approved = store.taxonomy(true).await.unwrap();
        assert_eq!(approved.len(), 2);
        let markers = store.markers(2, &MarkerScope::Global).await.unwrap();
        assert_eq!(markers.len(), 2);
        assert!(store.get_proposal("run_1", 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn approve_subset_commits_only_selected() {
        let store = store_with_proposal().await;
        let gate = GateController::new(Arc::clone(&store) as Arc<dyn EntityStore>);

        let resolution = gate
            .approve("run_1", 2, Some(&["q_a".to_string()]))
            .await
            .unwrap();
        assert_eq!(resolution.approved, 1);
        assert_eq!(resolution.discarded, 1);

        let approved = store.taxonomy(true).await.unwrap();
        assert_eq!(approved.len(), 1);
        assert_eq!(approved[0].quality_id, "q_a");
        // The discarded item's case stays unmarked and will reprocess.
        let markers = store.markers(2, &MarkerScope::Global).await.unwrap();
        assert!(markers.contains_key("case_1"));
        assert!(!markers.contains_key("case_2"));
    }

    #[tokio::test]
    async fn approve_unknown_selection_fails_and_keeps_proposal() {
        let store = store_with_proposal().await;
        let gate = GateController::new(Arc::clone(&store) as Arc<dyn EntityStore>);

        let err = gate
            .approve("run_1", 2, Some(&["q_zz".to_string()]))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Store(_)));
        assert!(store.get_proposal("run_1", 2).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn reject_discards_everything() {
        let store = store_with_proposal().await;
        let gate = GateController::new(Arc::clone(&store) as Arc<dyn EntityStore>);

        gate.reject("run_1", 2).await.unwrap();

        assert!(store.taxonomy(false).await.unwrap().is_empty());
        assert!(store
            .markers(2, &MarkerScope::Global)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            gate.status("run_1", 2).await.unwrap(),
            GateStatus::Rejected
        );
    }

    #[tokio::test]
    async fn approve_without_proposal_is_an_error() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_run(Run::new("run_1", serde_json::json!({}), "test"))
            .await
            .unwrap();
        let gate = GateController::new(store as Arc<dyn EntityStore>);

        let err = gate.approve("run_1", 2, None).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::NothingToApprove { stage: 2 }
        ));
    }

    #[tokio::test]
    async fn status_tracks_gate_lifecycle() {
        let store = store_with_proposal().await;
        let gate = GateController::new(Arc::clone(&store) as Arc<dyn EntityStore>);

        assert_eq!(
            gate.status("run_1", 2).await.unwrap(),
            GateStatus::AwaitingApproval { items: 2 }
        );
        gate.approve("run_1", 2, None).await.unwrap();
        assert_eq!(gate.status("run_1", 2).await.unwrap(), GateStatus::Approved);
    }
}
