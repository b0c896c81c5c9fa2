//! Pipeline entity types.
//!
//! Global entities (documents, cases, taxonomy, policies) accumulate
//! across runs; per-run entities (scores, calibration, predictions,
//! patterns) are recomputed per run because scoring depends on
//! calibration chosen within that run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle state of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Stages may execute.
    Active,
    /// Halted at a human gate.
    Halted,
    /// All stages succeeded.
    Completed,
    /// A stage failed unrecoverably.
    Failed,
    /// Cancelled between stages.
    Cancelled,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Halted => write!(f, "halted"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One execution of the pipeline over a corpus snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Run identifier.
    pub run_id: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// The most recently completed or attempted stage.
    pub current_stage: Option<u32>,
    /// Run lifecycle state.
    pub state: RunState,
    /// Configuration snapshot taken at creation.
    pub config_snapshot: serde_json::Value,
    /// Free-form notes (e.g. "CLI run", "seed").
    pub notes: String,
}

impl Run {
    /// Creates a new active run with the given id and config snapshot.
    #[must_use]
    pub fn new(run_id: impl Into<String>, config_snapshot: serde_json::Value, notes: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            created_at: Utc::now(),
            current_stage: None,
            state: RunState::Active,
            config_snapshot,
            notes: notes.into(),
        }
    }
}

/// Status of one stage execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Attempt registered but not started.
    Pending,
    /// Attempt in progress.
    Running,
    /// Attempt finished and all writes committed.
    Succeeded,
    /// Attempt aborted; no partial writes are visible.
    Failed,
    /// Output staged as a proposal, halted for human review.
    AwaitingApproval,
    /// Proposal approved; approved subset committed.
    Approved,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::AwaitingApproval => write!(f, "awaiting_approval"),
            Self::Approved => write!(f, "approved"),
        }
    }
}

impl ExecutionStatus {
    /// Returns true if downstream stages may consume this stage's output.
    #[must_use]
    pub fn satisfies_prerequisite(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Approved)
    }
}

/// One attempt to execute a stage within a run. Append-only: the
/// orchestrator records a new row per state change and never rewrites a
/// prior row, so run history is fully reconstructable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageExecution {
    /// Owning run.
    pub run_id: String,
    /// Stage number.
    pub stage: u32,
    /// Attempt status.
    pub status: ExecutionStatus,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// When the attempt reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
    /// Input units successfully processed in this attempt.
    pub items_processed: u64,
    /// Error detail for failed attempts.
    pub error: Option<String>,
}

impl StageExecution {
    /// Creates a `Running` record for a fresh attempt.
    #[must_use]
    pub fn started(run_id: impl Into<String>, stage: u32) -> Self {
        Self {
            run_id: run_id.into(),
            stage,
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            items_processed: 0,
            error: None,
        }
    }

    /// Derives a terminal record from this attempt.
    #[must_use]
    pub fn finished(&self, status: ExecutionStatus, items_processed: u64, error: Option<String>) -> Self {
        Self {
            status,
            finished_at: Some(Utc::now()),
            items_processed,
            error,
            ..self.clone()
        }
    }
}

/// Kind of source document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocType {
    /// Enforcement press release, settlement, or audit report.
    Enforcement,
    /// Policy or program description.
    Policy,
    /// Guidance material.
    Guidance,
    /// Analytical report.
    Report,
    /// Anything else (e.g. data source catalogs).
    Other,
}

impl std::str::FromStr for DocType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enforcement" => Ok(Self::Enforcement),
            "policy" => Ok(Self::Policy),
            "guidance" => Ok(Self::Guidance),
            "report" => Ok(Self::Report),
            "other" => Ok(Self::Other),
            other => Err(format!("unknown doc type '{other}'")),
        }
    }
}

/// A source document in the corpus (global).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Content-derived identifier.
    pub doc_id: String,
    /// Original file name.
    pub file_name: String,
    /// Document kind.
    pub doc_type: DocType,
    /// Full text.
    pub text: String,
    /// Ingestion time; used as the recency tie-break in retrieval.
    pub ingested_at: DateTime<Utc>,
}

/// A retrieval chunk of a document (global).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Chunk identifier (`{doc_id}_c{index:04}`).
    pub chunk_id: String,
    /// Owning document.
    pub doc_id: String,
    /// Position within the document.
    pub index: usize,
    /// Chunk text.
    pub text: String,
}

/// An enforcement case extracted from a document (global).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Case {
    /// Identifier derived from source document and case name.
    pub case_id: String,
    /// File name of the source document.
    pub source_document: String,
    /// Case name.
    pub case_name: String,
    /// How the scheme operated mechanically.
    pub scheme_mechanics: String,
    /// The policy structure that was exploited.
    pub exploited_policy: String,
    /// The design feature that enabled the scheme.
    pub enabling_condition: String,
    /// Monetary scale; `None` is the explicit "unknown" sentinel for
    /// malformed or absent source values.
    pub scale_dollars: Option<f64>,
    /// Number of defendants, when stated.
    pub scale_defendants: Option<u32>,
    /// Scheme duration, when stated.
    pub scale_duration: Option<String>,
    /// How the scheme was detected, when stated.
    pub detection_method: Option<String>,
    /// Extraction time.
    pub extracted_at: DateTime<Utc>,
}

/// Review state of a taxonomy quality or prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    /// Proposed, not yet reviewed.
    Draft,
    /// Approved by a reviewer.
    Approved,
}

/// A structural vulnerability quality in the taxonomy (global).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quality {
    /// Identifier derived from the quality name.
    pub quality_id: String,
    /// Short name.
    pub name: String,
    /// Precise definition.
    pub definition: String,
    /// Concrete yes/no recognition test.
    pub recognition_test: String,
    /// Causal mechanism making the property exploitable.
    pub exploitation_logic: String,
    /// Enabling conditions that exemplify the quality.
    pub canonical_examples: Vec<String>,
    /// Review state; only approved qualities feed scoring.
    pub review_status: ReviewStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Audit record for a taxonomy dedup merge (global). Qualities are never
/// silently dropped: every merge stores the judge's rationale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRecord {
    /// Record identifier.
    pub merge_id: String,
    /// The surviving quality.
    pub quality_id: String,
    /// Name of the candidate that was merged away.
    pub candidate_name: String,
    /// The judge's stated rationale for equivalence.
    pub rationale: String,
    /// Examples carried over from the candidate.
    pub merged_examples: Vec<String>,
    /// When the merge was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// One cell of the case convergence matrix (per-run).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergenceScore {
    /// Owning run.
    pub run_id: String,
    /// Scored case.
    pub case_id: String,
    /// Quality tested.
    pub quality_id: String,
    /// Whether the quality is present.
    pub present: bool,
    /// Evidence cited by the scorer.
    pub evidence: String,
}

/// Calibration derived from the convergence matrix (per-run).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Calibration {
    /// Owning run.
    pub run_id: String,
    /// Convergence score at or above which policies are high-priority.
    pub threshold: u32,
    /// Narrative on the score/scale relationship.
    pub correlation_notes: String,
    /// How often each quality appeared across cases.
    pub quality_frequency: BTreeMap<String, u32>,
    /// Pairwise co-occurrence counts (`"q1+q2"` keys).
    pub quality_combinations: BTreeMap<String, u32>,
}

/// A policy under scan (global).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Identifier derived from the policy name.
    pub policy_id: String,
    /// Policy name.
    pub name: String,
    /// Short description.
    pub description: String,
    /// File name of the source document, if any.
    pub source_document: Option<String>,
    /// Structural characterization produced by the scanning stage.
    pub structural_characterization: Option<String>,
}

/// One cell of the policy score matrix (per-run).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyScore {
    /// Owning run.
    pub run_id: String,
    /// Scored policy.
    pub policy_id: String,
    /// Quality tested.
    pub quality_id: String,
    /// Whether the quality is present.
    pub present: bool,
    /// Evidence cited by the scorer.
    pub evidence: String,
}

/// An exploitation prediction for a high-scoring policy (per-run).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    /// Prediction identifier.
    pub prediction_id: String,
    /// Owning run.
    pub run_id: String,
    /// Target policy.
    pub policy_id: String,
    /// The policy's convergence score when predicted.
    pub convergence_score: u32,
    /// Predicted scheme mechanics.
    pub mechanics: String,
    /// Qualities that structurally entail the prediction.
    pub enabling_qualities: Vec<String>,
    /// Likely actor profile.
    pub actor_profile: String,
    /// Policy lifecycle stage where exploitation starts.
    pub lifecycle_stage: String,
    /// How hard detection would be.
    pub detection_difficulty: String,
    /// Review state.
    pub review_status: ReviewStatus,
}

/// Priority of a detection pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Act immediately.
    Critical,
    /// High priority.
    High,
    /// Default priority.
    Medium,
    /// Low priority.
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

/// An actionable detection pattern for a prediction (per-run).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionPattern {
    /// Pattern identifier.
    pub pattern_id: String,
    /// Owning run.
    pub run_id: String,
    /// Source prediction.
    pub prediction_id: String,
    /// Data source to query.
    pub data_source: String,
    /// Measurable anomaly condition.
    pub anomaly_signal: String,
    /// What normal looks like.
    pub baseline: String,
    /// Expected false positives.
    pub false_positive_risk: String,
    /// How quickly the signal becomes visible.
    pub detection_latency: String,
    /// Priority.
    pub priority: Priority,
    /// Implementation notes for data engineers.
    pub implementation_notes: String,
}

/// Scope of a processed-marker: global entities share markers across
/// runs; per-run entities scope them to one run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerScope {
    /// Marker applies across all runs.
    Global,
    /// Marker applies to one run only.
    Run(String),
}

/// Durable record that a stage successfully processed one input unit.
/// Written atomically with the entity writes it covers; the input hash
/// lets modified inputs re-enter the pending set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedMarker {
    /// The stage that processed the item.
    pub stage: u32,
    /// Marker scope.
    pub scope: MarkerScope,
    /// The processed input's identifier.
    pub item_id: String,
    /// Hash of the input as processed.
    pub input_hash: String,
    /// The run that wrote the marker.
    pub marked_by_run: String,
    /// When the marker was written.
    pub marked_at: DateTime<Utc>,
}

impl ProcessedMarker {
    /// Creates a marker for the given stage, scope, and item.
    #[must_use]
    pub fn new(
        stage: u32,
        scope: MarkerScope,
        item_id: impl Into<String>,
        input_hash: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            stage,
            scope,
            item_id: item_id.into(),
            input_hash: input_hash.into(),
            marked_by_run: run_id.into(),
            marked_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_status_prerequisite_rules() {
        assert!(ExecutionStatus::Succeeded.satisfies_prerequisite());
        assert!(ExecutionStatus::Approved.satisfies_prerequisite());
        assert!(!ExecutionStatus::Running.satisfies_prerequisite());
        assert!(!ExecutionStatus::AwaitingApproval.satisfies_prerequisite());
        assert!(!ExecutionStatus::Failed.satisfies_prerequisite());
    }

    #[test]
    fn execution_finished_keeps_start_time() {
        let started = StageExecution::started("run_1", 3);
        let done = started.finished(ExecutionStatus::Succeeded, 7, None);

        assert_eq!(done.started_at, started.started_at);
        assert_eq!(done.items_processed, 7);
        assert!(done.finished_at.is_some());
        // The original record is untouched; the log stays append-only.
        assert_eq!(started.status, ExecutionStatus::Running);
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&ExecutionStatus::AwaitingApproval).unwrap();
        assert_eq!(json, r#""awaiting_approval""#);
    }

    #[test]
    fn doc_type_parses_from_cli_strings() {
        assert_eq!("enforcement".parse::<DocType>().unwrap(), DocType::Enforcement);
        assert!("unknown".parse::<DocType>().is_err());
    }
}
