//! # vigil
//!
//! A multi-stage analytical pipeline that turns a corpus of enforcement
//! documents into structured predictions of policy exploitation.
//!
//! The pipeline runs seven stages: corpus ingestion, case assembly,
//! taxonomy induction, convergence scoring, policy scanning,
//! exploitation prediction, and detection pattern generation. Stages 2
//! and 5 halt behind human approval gates by default. Every stage is
//! resumable: processed inputs carry durable markers written atomically
//! with the stage's output, so reruns skip finished work and crashes
//! never leave half-processed items.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use vigil::config::PipelineConfig;
//! use vigil::model::HttpTransport;
//! use vigil::orchestrator::Orchestrator;
//! use vigil::store::MemoryStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PipelineConfig::resolve(None)?;
//! let transport = Arc::new(HttpTransport::new(&config.model)?);
//! let orchestrator = Orchestrator::new(Arc::new(MemoryStore::new()), transport, config);
//!
//! let run = orchestrator.start_run("example").await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod delta;
pub mod errors;
pub mod gate;
pub mod model;
pub mod orchestrator;
pub mod parallel;
pub mod retrieval;
pub mod stages;
pub mod store;
pub mod testing;

/// Commonly used types, re-exported for embedders.
pub mod prelude {
    pub use crate::config::PipelineConfig;
    pub use crate::delta::DeltaTracker;
    pub use crate::errors::{ModelError, OrchestratorError, StageError, StoreError};
    pub use crate::gate::{GateController, GateStatus};
    pub use crate::model::{HttpTransport, ModelTransport, PromptTemplate, StructuredClient};
    pub use crate::orchestrator::{Orchestrator, RunSummary};
    pub use crate::retrieval::ContextBuilder;
    pub use crate::stages::{Stage, StageContext, StageOutcome, StageReport};
    pub use crate::store::{EntityStore, JsonFileStore, MemoryStore};
}
