//! Error taxonomy for the vigil pipeline.
//!
//! Failure classes are split along retry boundaries: transient model
//! failures are retried inside the client, malformed responses get one
//! repair attempt, per-item failures are collected into the stage report,
//! and prerequisite or store failures abort the stage invocation.

use thiserror::Error;

/// Error raised while rendering a prompt template.
#[derive(Debug, Clone, Error)]
pub enum TemplateError {
    /// A placeholder in the template had no matching variable.
    #[error("template '{template}' is missing variable '{variable}'")]
    MissingVariable {
        /// The template name.
        template: String,
        /// The unresolved placeholder name.
        variable: String,
    },
}

/// Error raised by the raw model transport.
///
/// The structured client retries `Transient` failures with backoff and
/// surfaces `Fatal` failures immediately.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Timeout, rate limit, or 5xx-equivalent failure. Retriable.
    #[error("transient transport failure: {0}")]
    Transient(String),
    /// Auth or malformed-request failure. Never retried.
    #[error("fatal transport failure: {0}")]
    Fatal(String),
}

/// Error surfaced by the structured-response client after its retry
/// policy is exhausted.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Prompt rendering failed before any call was made.
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// All retry attempts hit transient failures.
    #[error("model call failed after {attempts} attempts: {last}")]
    Transient {
        /// Number of attempts made.
        attempts: u32,
        /// The last transient failure observed.
        last: String,
    },

    /// The response could not be parsed even after the repair retry.
    #[error("model returned a malformed response: {detail}")]
    MalformedResponse {
        /// Parse failure detail.
        detail: String,
    },

    /// Non-transient transport failure (auth, malformed request).
    #[error("fatal model failure: {detail}")]
    Fatal {
        /// Failure detail.
        detail: String,
    },
}

impl ModelError {
    /// Returns true if a later invocation could plausibly succeed.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::MalformedResponse { .. })
    }
}

/// Error raised by an entity store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A concurrent writer already marked an item processed. Surfaced to
    /// the orchestrator rather than auto-retried, so true
    /// double-processing bugs stay visible.
    #[error("conflict: item '{item_id}' already marked processed for stage {stage}")]
    Conflict {
        /// The stage whose marker collided.
        stage: u32,
        /// The contested item id.
        item_id: String,
    },

    /// A referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Underlying I/O failure.
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot (de)serialization failure.
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Typed failure returned by a stage invocation.
///
/// These abort the whole stage; per-item failures are instead collected
/// into [`crate::stages::StageReport::item_errors`].
#[derive(Debug, Error)]
pub enum StageError {
    /// A required upstream entity set is empty or unapproved. Converts a
    /// silent ordering bug into a reported, retriable error.
    #[error("upstream prerequisite missing: {0}")]
    UpstreamPrerequisiteMissing(String),

    /// The model client failed at stage level (e.g. the clustering call
    /// that the whole stage depends on).
    #[error("model failure: {0}")]
    Model(#[from] ModelError),

    /// Stage output failed validation before commit.
    #[error("validation failure: {0}")]
    Validation(String),

    /// Entity store failure, including commit conflicts.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Error surfaced by orchestrator operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The previous stage has not succeeded for this run.
    #[error("prerequisite not met: stage {prereq} is '{status}', must succeed before stage {stage}")]
    PrerequisiteNotMet {
        /// The stage the caller asked to run.
        stage: u32,
        /// Its prerequisite stage.
        prereq: u32,
        /// The prerequisite's latest status, or "not started".
        status: String,
    },

    /// A human gate for this run is still awaiting approval.
    #[error("stage {stage} is awaiting approval; approve or reject it first")]
    GatePending {
        /// The gated stage.
        stage: u32,
    },

    /// The requested stage number has no registered implementation.
    #[error("unknown stage: {0}")]
    UnknownStage(u32),

    /// No run exists yet; `seed` or `run` creates one.
    #[error("no pipeline run found")]
    NoRun,

    /// The run was cancelled; no further stages execute.
    #[error("run '{0}' is cancelled")]
    RunCancelled(String),

    /// A stage invocation failed.
    #[error("stage {stage} failed: {source}")]
    Stage {
        /// The failing stage.
        stage: u32,
        /// The underlying stage error.
        #[source]
        source: StageError,
    },

    /// There is nothing to approve at the named stage.
    #[error("stage {stage} has no pending approval")]
    NothingToApprove {
        /// The stage named in the approval request.
        stage: u32,
    },

    /// Entity store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Export I/O failure.
    #[error("export failed: {0}")]
    Export(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_error_retriability() {
        let transient = ModelError::Transient {
            attempts: 3,
            last: "429".to_string(),
        };
        let malformed = ModelError::MalformedResponse {
            detail: "not json".to_string(),
        };
        let fatal = ModelError::Fatal {
            detail: "bad auth".to_string(),
        };

        assert!(transient.is_retriable());
        assert!(malformed.is_retriable());
        assert!(!fatal.is_retriable());
    }

    #[test]
    fn conflict_display_names_item_and_stage() {
        let err = StoreError::Conflict {
            stage: 2,
            item_id: "case_ab12".to_string(),
        };
        assert!(err.to_string().contains("case_ab12"));
        assert!(err.to_string().contains("stage 2"));
    }

    #[test]
    fn prerequisite_error_display() {
        let err = OrchestratorError::PrerequisiteNotMet {
            stage: 3,
            prereq: 2,
            status: "awaiting_approval".to_string(),
        };
        assert!(err.to_string().contains("stage 2"));
        assert!(err.to_string().contains("awaiting_approval"));
    }
}
