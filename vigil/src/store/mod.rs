//! Durable entity storage.
//!
//! The pipeline talks to a single [`EntityStore`] trait. Stage output is
//! committed through [`StageCommit`]: the entity writes and the
//! processed-markers covering them land atomically, so a crash can never
//! leave entities visible without their markers or vice versa.

pub mod entities;
mod json;
mod memory;

pub use json::JsonFileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::errors::StoreError;
use entities::{
    Calibration, Case, Chunk, ConvergenceScore, DetectionPattern, DocType, Document, MarkerScope,
    MergeRecord, Policy, PolicyScore, Prediction, ProcessedMarker, Quality, Run, StageExecution,
};

/// A single entity write inside a stage commit. Writes upsert by the
/// entity's own identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EntityWrite {
    /// Upsert a document.
    Document(Document),
    /// Upsert a retrieval chunk.
    Chunk(Chunk),
    /// Upsert an extracted case.
    Case(Case),
    /// Upsert a taxonomy quality.
    Quality(Quality),
    /// Fold a duplicate candidate's examples into an existing quality and
    /// record the merge rationale.
    MergeExamples {
        /// The surviving quality.
        quality_id: String,
        /// Examples to append (deduplicated against existing ones).
        examples: Vec<String>,
        /// The audit record for this merge.
        record: MergeRecord,
    },
    /// Upsert a case convergence score.
    ConvergenceScore(ConvergenceScore),
    /// Upsert the run's calibration.
    Calibration(Calibration),
    /// Upsert a policy.
    Policy(Policy),
    /// Upsert a policy score.
    PolicyScore(PolicyScore),
    /// Upsert a prediction.
    Prediction(Prediction),
    /// Upsert a detection pattern.
    DetectionPattern(DetectionPattern),
    /// Delete all detection patterns derived from a prediction. Used
    /// before regenerating patterns for a changed prediction so stale
    /// patterns never coexist with fresh ones.
    DeletePatternsFor {
        /// The prediction whose patterns are replaced.
        prediction_id: String,
    },
}

/// An atomic unit of stage output: entity writes plus the markers that
/// record which inputs produced them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageCommit {
    /// The committing run.
    pub run_id: String,
    /// The committing stage.
    pub stage: u32,
    /// Entity writes to apply.
    pub writes: Vec<EntityWrite>,
    /// Processed-markers to record alongside the writes.
    pub markers: Vec<ProcessedMarker>,
}

impl StageCommit {
    /// Creates an empty commit for the given run and stage.
    #[must_use]
    pub fn new(run_id: impl Into<String>, stage: u32) -> Self {
        Self {
            run_id: run_id.into(),
            stage,
            writes: Vec::new(),
            markers: Vec::new(),
        }
    }

    /// Returns true if the commit carries no writes and no markers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.markers.is_empty()
    }
}

/// One reviewable item inside a gate proposal. Approval commits exactly
/// this item's writes and markers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalItem {
    /// Identifier the reviewer uses to select the item.
    pub item_id: String,
    /// Human-readable label shown in `status`.
    pub label: String,
    /// Writes committed if this item is approved.
    pub writes: Vec<EntityWrite>,
    /// Markers committed if this item is approved.
    pub markers: Vec<ProcessedMarker>,
}

/// Staged output of a gated stage, held outside the entity tables until
/// a reviewer approves or rejects it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateProposal {
    /// The run that staged the proposal.
    pub run_id: String,
    /// The gated stage.
    pub stage: u32,
    /// Reviewable items.
    pub items: Vec<ProposalItem>,
}

/// Storage abstraction for all pipeline entities.
///
/// Implementations must make [`EntityStore::commit`] atomic: either
/// every write and marker in the commit becomes visible, or none do.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Creates a run.
    async fn create_run(&self, run: Run) -> Result<(), StoreError>;

    /// Returns the most recently created run, if any.
    async fn latest_run(&self) -> Result<Option<Run>, StoreError>;

    /// Returns the run with the given id.
    async fn get_run(&self, run_id: &str) -> Result<Run, StoreError>;

    /// Replaces the stored run record.
    async fn update_run(&self, run: Run) -> Result<(), StoreError>;

    /// Appends a stage execution record. The execution log is
    /// append-only; callers never rewrite prior rows.
    async fn record_execution(&self, execution: StageExecution) -> Result<(), StoreError>;

    /// Returns all execution records for a run, in insertion order.
    async fn executions(&self, run_id: &str) -> Result<Vec<StageExecution>, StoreError>;

    /// Returns documents, optionally filtered by type.
    async fn documents(&self, doc_type: Option<DocType>) -> Result<Vec<Document>, StoreError>;

    /// Returns all retrieval chunks.
    async fn chunks(&self) -> Result<Vec<Chunk>, StoreError>;

    /// Returns all extracted cases.
    async fn cases(&self) -> Result<Vec<Case>, StoreError>;

    /// Returns the taxonomy, optionally filtered to approved qualities.
    async fn taxonomy(&self, approved_only: bool) -> Result<Vec<Quality>, StoreError>;

    /// Returns all merge audit records.
    async fn merge_records(&self) -> Result<Vec<MergeRecord>, StoreError>;

    /// Returns all policies.
    async fn policies(&self) -> Result<Vec<Policy>, StoreError>;

    /// Returns the run's case convergence scores.
    async fn convergence_scores(&self, run_id: &str) -> Result<Vec<ConvergenceScore>, StoreError>;

    /// Returns the run's calibration, if stage 3 completed.
    async fn calibration(&self, run_id: &str) -> Result<Option<Calibration>, StoreError>;

    /// Returns the run's policy scores.
    async fn policy_scores(&self, run_id: &str) -> Result<Vec<PolicyScore>, StoreError>;

    /// Returns the run's predictions.
    async fn predictions(&self, run_id: &str) -> Result<Vec<Prediction>, StoreError>;

    /// Returns the run's detection patterns.
    async fn detection_patterns(&self, run_id: &str) -> Result<Vec<DetectionPattern>, StoreError>;

    /// Returns `item_id -> input_hash` for every marker of the given
    /// stage and scope.
    async fn markers(
        &self,
        stage: u32,
        scope: &MarkerScope,
    ) -> Result<HashMap<String, String>, StoreError>;

    /// Applies a stage commit atomically.
    ///
    /// Returns [`StoreError::Conflict`] if a marker in the commit
    /// already exists with the same hash but was written by a different
    /// run; re-committing one's own markers is idempotent.
    async fn commit(&self, commit: StageCommit) -> Result<(), StoreError>;

    /// Stages a gate proposal, replacing any prior proposal for the same
    /// run and stage.
    async fn put_proposal(&self, proposal: GateProposal) -> Result<(), StoreError>;

    /// Returns the pending proposal for a run and stage, if any.
    async fn get_proposal(
        &self,
        run_id: &str,
        stage: u32,
    ) -> Result<Option<GateProposal>, StoreError>;

    /// Removes the pending proposal for a run and stage.
    async fn remove_proposal(&self, run_id: &str, stage: u32) -> Result<(), StoreError>;
}
