//! Stage contract and the seven pipeline stages.
//!
//! Stages share one calling convention: read pending inputs through the
//! delta tracker, call the model per item, and commit entity writes
//! together with processed-markers. Gated stages stage their output as a
//! proposal instead of committing it.

mod case_assembly;
mod detection;
mod ingest;
mod prediction;
mod scanning;
mod scoring;
mod taxonomy;

pub use case_assembly::CaseAssemblyStage;
pub use detection::DetectionStage;
pub use ingest::IngestStage;
pub use prediction::PredictionStage;
pub use scanning::ScanningStage;
pub use scoring::ScoringStage;
pub use taxonomy::TaxonomyStage;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::delta::DeltaTracker;
use crate::errors::StageError;
use crate::model::StructuredClient;
use crate::retrieval::ContextBuilder;
use crate::store::EntityStore;

/// Everything a stage needs to execute within one run.
#[derive(Clone)]
pub struct StageContext {
    /// Entity store.
    pub store: Arc<dyn EntityStore>,
    /// Structured model client.
    pub client: Arc<StructuredClient>,
    /// Retrieval over the chunk corpus.
    pub retrieval: Arc<ContextBuilder>,
    /// Pending-input computation.
    pub delta: DeltaTracker,
    /// The executing run.
    pub run_id: String,
    /// Resolved pipeline configuration.
    pub config: PipelineConfig,
}

/// A per-item failure recorded in the stage report. The item stays
/// unmarked and re-enters the pending set on the next invocation.
#[derive(Debug, Clone)]
pub struct ItemError {
    /// The failing input item.
    pub item_id: String,
    /// Failure detail.
    pub detail: String,
}

/// How a stage invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// All output committed.
    Completed,
    /// Output staged as a gate proposal; the run halts for review.
    AwaitingApproval {
        /// Number of items in the proposal.
        proposed: usize,
    },
}

/// Result of one stage invocation.
#[derive(Debug, Clone)]
pub struct StageReport {
    /// Input units processed in this invocation.
    pub items_processed: u64,
    /// Input units skipped because their markers matched.
    pub skipped: u64,
    /// Per-item failures; these inputs remain pending.
    pub item_errors: Vec<ItemError>,
    /// Terminal outcome.
    pub outcome: StageOutcome,
}

impl StageReport {
    /// A completed report with no skips or errors.
    #[must_use]
    pub fn completed(items_processed: u64) -> Self {
        Self {
            items_processed,
            skipped: 0,
            item_errors: Vec::new(),
            outcome: StageOutcome::Completed,
        }
    }
}

/// One pipeline stage.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stage number in pipeline order.
    fn number(&self) -> u32;

    /// Short stage name for logs and status output.
    fn name(&self) -> &'static str;

    /// The stage that must have succeeded first. Defaults to the
    /// previous stage number; stage 0 has no prerequisite.
    fn prerequisite(&self) -> Option<u32> {
        self.number().checked_sub(1)
    }

    /// Executes the stage over its pending inputs.
    async fn run(&self, ctx: &StageContext) -> Result<StageReport, StageError>;
}
