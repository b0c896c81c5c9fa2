//! Pipeline orchestration.
//!
//! The orchestrator owns the stage roster and drives runs: prerequisite
//! checks, the append-only execution log, halting at human gates,
//! cancellation between stages, seeding, and export. All run state is
//! derived from the store, so a restarted process resumes exactly where
//! the last one stopped.

use chrono::Utc;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::delta::{content_hash, DeltaTracker};
use crate::errors::{OrchestratorError, StoreError};
use crate::gate::{GateController, GateSignal, GateStatus, LoggingGateSignal};
use crate::model::{ModelTransport, StructuredClient};
use crate::retrieval::{chunk_text, ContextBuilder};
use crate::stages::{
    CaseAssemblyStage, DetectionStage, IngestStage, PredictionStage, ScanningStage, ScoringStage,
    Stage, StageContext, StageOutcome, StageReport, TaxonomyStage,
};
use crate::store::entities::{
    Chunk, DocType, Document, ExecutionStatus, MarkerScope, ProcessedMarker, Quality,
    ReviewStatus, Run, RunState, StageExecution,
};
use crate::store::{EntityStore, EntityWrite, StageCommit};

/// Outcome of driving a run through the stage roster.
#[derive(Debug)]
pub struct RunSummary {
    /// The driven run.
    pub run_id: String,
    /// Stage the run halted at, when a gate intervened.
    pub halted_at_gate: Option<u32>,
    /// True if every stage completed.
    pub completed: bool,
    /// Per-stage reports from this invocation, in execution order.
    pub reports: Vec<(u32, StageReport)>,
}

/// One line of the status report.
#[derive(Debug)]
pub struct StageStatusLine {
    /// Stage number.
    pub stage: u32,
    /// Stage name.
    pub name: &'static str,
    /// Latest execution status, if the stage ever ran.
    pub status: Option<ExecutionStatus>,
    /// Items processed by the latest terminal execution.
    pub items_processed: u64,
    /// Failure reason from the latest execution, when it failed.
    pub error: Option<String>,
    /// Gate state, for gated stages.
    pub gate: Option<GateStatus>,
}

/// Full run status derived from the store.
#[derive(Debug)]
pub struct RunStatusReport {
    /// The run record.
    pub run: Run,
    /// Per-stage lines in pipeline order.
    pub stages: Vec<StageStatusLine>,
}

/// Drives the seven-stage pipeline.
pub struct Orchestrator {
    store: Arc<dyn EntityStore>,
    gate: GateController,
    signal: Arc<dyn GateSignal>,
    stages: BTreeMap<u32, Arc<dyn Stage>>,
    context_proto: StageContext,
}

impl Orchestrator {
    /// Builds an orchestrator with the standard stage roster.
    #[must_use]
    pub fn new(
        store: Arc<dyn EntityStore>,
        transport: Arc<dyn ModelTransport>,
        config: PipelineConfig,
    ) -> Self {
        let signal: Arc<dyn GateSignal> = Arc::new(LoggingGateSignal);
        Self::with_signal(store, transport, config, signal)
    }

    /// Builds an orchestrator with a custom gate signal.
    #[must_use]
    pub fn with_signal(
        store: Arc<dyn EntityStore>,
        transport: Arc<dyn ModelTransport>,
        config: PipelineConfig,
        signal: Arc<dyn GateSignal>,
    ) -> Self {
        let client = Arc::new(StructuredClient::new(transport, &config.model));
        let retrieval = Arc::new(ContextBuilder::new(
            Arc::clone(&store),
            config.retrieval.clone(),
        ));
        let delta = DeltaTracker::new(Arc::clone(&store));
        let gate = GateController::new(Arc::clone(&store)).with_signal(Arc::clone(&signal));

        let mut stages: BTreeMap<u32, Arc<dyn Stage>> = BTreeMap::new();
        for stage in [
            Arc::new(IngestStage) as Arc<dyn Stage>,
            Arc::new(CaseAssemblyStage),
            Arc::new(TaxonomyStage),
            Arc::new(ScoringStage),
            Arc::new(ScanningStage),
            Arc::new(PredictionStage),
            Arc::new(DetectionStage),
        ] {
            stages.insert(stage.number(), stage);
        }

        let context_proto = StageContext {
            store: Arc::clone(&store),
            client,
            retrieval,
            delta,
            run_id: String::new(),
            config,
        };

        Self {
            store,
            gate,
            signal,
            stages,
            context_proto,
        }
    }

    /// The gate controller, for approval workflows.
    #[must_use]
    pub fn gate(&self) -> &GateController {
        &self.gate
    }

    /// Starts a new run with a snapshot of the active configuration.
    pub async fn start_run(&self, notes: &str) -> Result<Run, OrchestratorError> {
        let snapshot =
            serde_json::to_value(&self.context_proto.config).map_err(StoreError::from)?;
        let run = Run::new(format!("run_{}", uuid::Uuid::new_v4()), snapshot, notes);
        self.store.create_run(run.clone()).await?;
        info!(run = %run.run_id, "run started");
        Ok(run)
    }

    /// Returns the latest run, or starts one if none exists or the
    /// latest reached a terminal state.
    pub async fn ensure_run(&self, notes: &str) -> Result<Run, OrchestratorError> {
        match self.store.latest_run().await? {
            Some(run) if matches!(run.state, RunState::Active | RunState::Halted) => Ok(run),
            _ => self.start_run(notes).await,
        }
    }

    /// Returns the latest run or [`OrchestratorError::NoRun`].
    pub async fn latest_run(&self) -> Result<Run, OrchestratorError> {
        self.store.latest_run().await?.ok_or(OrchestratorError::NoRun)
    }

    /// Marks a run cancelled. In-flight stage work is not interrupted;
    /// the check happens between stages.
    pub async fn cancel(&self, run_id: &str) -> Result<(), OrchestratorError> {
        let mut run = self.store.get_run(run_id).await?;
        run.state = RunState::Cancelled;
        self.store.update_run(run).await?;
        info!(run = %run_id, "run cancelled");
        Ok(())
    }

    async fn latest_execution(
        &self,
        run_id: &str,
        stage: u32,
    ) -> Result<Option<StageExecution>, StoreError> {
        let executions = self.store.executions(run_id).await?;
        Ok(executions.into_iter().rev().find(|e| e.stage == stage))
    }

    async fn check_prerequisite(
        &self,
        run_id: &str,
        stage: &Arc<dyn Stage>,
    ) -> Result<(), OrchestratorError> {
        let Some(prereq) = stage.prerequisite() else {
            return Ok(());
        };
        let latest = self.latest_execution(run_id, prereq).await?;
        let ok = latest
            .as_ref()
            .map_or(false, |e| e.status.satisfies_prerequisite());
        if ok {
            Ok(())
        } else {
            Err(OrchestratorError::PrerequisiteNotMet {
                stage: stage.number(),
                prereq,
                status: latest.map_or_else(|| "not started".to_string(), |e| e.status.to_string()),
            })
        }
    }

    /// Runs a single stage for the run, enforcing prerequisites and gate
    /// state, and records the attempt in the execution log.
    pub async fn run_stage(
        &self,
        run_id: &str,
        stage_number: u32,
    ) -> Result<StageReport, OrchestratorError> {
        let run = self.store.get_run(run_id).await?;
        if run.state == RunState::Cancelled {
            return Err(OrchestratorError::RunCancelled(run_id.to_string()));
        }

        let stage = self
            .stages
            .get(&stage_number)
            .ok_or(OrchestratorError::UnknownStage(stage_number))?;

        if self.store.get_proposal(run_id, stage_number).await?.is_some() {
            return Err(OrchestratorError::GatePending {
                stage: stage_number,
            });
        }
        self.check_prerequisite(run_id, stage).await?;

        let started = StageExecution::started(run_id, stage_number);
        self.store.record_execution(started.clone()).await?;

        let mut run = run;
        run.current_stage = Some(stage_number);
        run.state = RunState::Active;
        self.store.update_run(run).await?;

        let mut ctx = self.context_proto.clone();
        ctx.run_id = run_id.to_string();

        info!(run = %run_id, stage = stage_number, name = stage.name(), "stage starting");
        match stage.run(&ctx).await {
            Ok(report) => {
                let (status, run_state) = match report.outcome {
                    StageOutcome::Completed => (ExecutionStatus::Succeeded, RunState::Active),
                    StageOutcome::AwaitingApproval { .. } => {
                        (ExecutionStatus::AwaitingApproval, RunState::Halted)
                    }
                };
                let error = if report.item_errors.is_empty() {
                    None
                } else {
                    Some(format!("{} item(s) failed", report.item_errors.len()))
                };
                self.store
                    .record_execution(started.finished(status, report.items_processed, error))
                    .await?;

                let mut run = self.store.get_run(run_id).await?;
                run.state = run_state;
                self.store.update_run(run).await?;

                if let StageOutcome::AwaitingApproval { proposed } = report.outcome {
                    self.signal.halted(run_id, stage_number, proposed).await;
                }
                info!(
                    run = %run_id,
                    stage = stage_number,
                    processed = report.items_processed,
                    skipped = report.skipped,
                    "stage finished"
                );
                Ok(report)
            }
            Err(e) => {
                error!(run = %run_id, stage = stage_number, error = %e, "stage failed");
                self.store
                    .record_execution(started.finished(
                        ExecutionStatus::Failed,
                        0,
                        Some(e.to_string()),
                    ))
                    .await?;
                let mut run = self.store.get_run(run_id).await?;
                run.state = RunState::Failed;
                self.store.update_run(run).await?;
                Err(OrchestratorError::Stage {
                    stage: stage_number,
                    source: e,
                })
            }
        }
    }

    /// Drives the run through every stage in order, stopping at the
    /// first gate. Stages whose inputs are fully processed run and
    /// no-op, which is what makes rerunning after a crash safe.
    pub async fn run_all(&self, run_id: &str) -> Result<RunSummary, OrchestratorError> {
        let mut reports = Vec::new();

        for (&number, _) in &self.stages {
            let run = self.store.get_run(run_id).await?;
            if run.state == RunState::Cancelled {
                return Err(OrchestratorError::RunCancelled(run_id.to_string()));
            }
            if self.store.get_proposal(run_id, number).await?.is_some() {
                info!(run = %run_id, stage = number, "gate already pending, halting");
                return Ok(RunSummary {
                    run_id: run_id.to_string(),
                    halted_at_gate: Some(number),
                    completed: false,
                    reports,
                });
            }

            let report = self.run_stage(run_id, number).await?;
            let halted = matches!(report.outcome, StageOutcome::AwaitingApproval { .. });
            reports.push((number, report));
            if halted {
                return Ok(RunSummary {
                    run_id: run_id.to_string(),
                    halted_at_gate: Some(number),
                    completed: false,
                    reports,
                });
            }
        }

        let mut run = self.store.get_run(run_id).await?;
        run.state = RunState::Completed;
        self.store.update_run(run).await?;
        info!(run = %run_id, "run completed");

        Ok(RunSummary {
            run_id: run_id.to_string(),
            halted_at_gate: None,
            completed: true,
            reports,
        })
    }

    /// Builds the full status report for a run.
    pub async fn status(&self, run_id: &str) -> Result<RunStatusReport, OrchestratorError> {
        let run = self.store.get_run(run_id).await?;
        let mut lines = Vec::new();
        for (&number, stage) in &self.stages {
            let latest = self.latest_execution(run_id, number).await?;
            let gate = if self.context_proto.config.is_gated(number) {
                Some(self.gate.status(run_id, number).await?)
            } else {
                None
            };
            lines.push(StageStatusLine {
                stage: number,
                name: stage.name(),
                status: latest.as_ref().map(|e| e.status),
                items_processed: latest.as_ref().map_or(0, |e| e.items_processed),
                error: latest.and_then(|e| e.error),
                gate,
            });
        }
        Ok(RunStatusReport { run, stages: lines })
    }

    /// Loads the bundled starter dataset: enforcement documents, an
    /// initial approved taxonomy, and policies to scan. Idempotent;
    /// documents carry ingest markers so stage 0 skips them.
    pub async fn seed(&self, run_id: &str) -> Result<u64, OrchestratorError> {
        let seed: SeedData =
            serde_json::from_str(SEED_JSON).map_err(StoreError::Serialization)?;
        let retrieval = &self.context_proto.config.retrieval;

        let mut commit = StageCommit::new(run_id, 0);
        let mut count = 0u64;
        for doc in seed.documents {
            let doc_id = format!("doc_{}", content_hash(&doc.file_name));
            let hash = content_hash(&doc.text);
            for (index, text) in
                chunk_text(&doc.text, retrieval.chunk_chars, retrieval.chunk_overlap)
                    .into_iter()
                    .enumerate()
            {
                commit.writes.push(EntityWrite::Chunk(Chunk {
                    chunk_id: format!("{doc_id}_c{index:04}"),
                    doc_id: doc_id.clone(),
                    index,
                    text,
                }));
            }
            commit.markers.push(ProcessedMarker::new(
                0,
                MarkerScope::Global,
                &doc.file_name,
                &hash,
                run_id,
            ));
            commit.writes.push(EntityWrite::Document(Document {
                doc_id,
                file_name: doc.file_name,
                doc_type: doc.doc_type,
                text: doc.text,
                ingested_at: Utc::now(),
            }));
            count += 1;
        }
        for quality in seed.qualities {
            commit.writes.push(EntityWrite::Quality(Quality {
                quality_id: format!("q_{}", content_hash(&quality.name.to_lowercase())),
                name: quality.name,
                definition: quality.definition,
                recognition_test: quality.recognition_test,
                exploitation_logic: quality.exploitation_logic,
                canonical_examples: quality.canonical_examples,
                review_status: ReviewStatus::Approved,
                created_at: Utc::now(),
            }));
        }
        for policy in seed.policies {
            commit.writes.push(EntityWrite::Policy(
                crate::store::entities::Policy {
                    policy_id: format!("pol_{}", content_hash(&policy.name)),
                    name: policy.name,
                    description: policy.description,
                    source_document: None,
                    structural_characterization: None,
                },
            ));
        }

        match self.store.commit(commit).await {
            Ok(()) => {
                info!(documents = count, "seed dataset loaded");
                Ok(count)
            }
            Err(StoreError::Conflict { .. }) => {
                warn!("seed dataset already loaded");
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Exports the run's results as a JSON report.
    pub async fn export_json(&self, run_id: &str, dir: &Path) -> Result<std::path::PathBuf, OrchestratorError> {
        let report = self.collect_results(run_id).await?;
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{run_id}.json"));
        std::fs::write(&path, serde_json::to_string_pretty(&report).map_err(StoreError::from)?)?;
        info!(path = %path.display(), "results exported");
        Ok(path)
    }

    /// Exports the run's results as a markdown briefing.
    pub async fn export_markdown(&self, run_id: &str, dir: &Path) -> Result<std::path::PathBuf, OrchestratorError> {
        let results = self.collect_results(run_id).await?;
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{run_id}.md"));

        let mut out = String::new();
        out.push_str(&format!("# Vulnerability predictions: {run_id}\n\n"));
        out.push_str(&format!(
            "Cases analyzed: {}. Taxonomy qualities: {}. Policies scanned: {}.\n\n",
            results.cases.len(),
            results.taxonomy.len(),
            results.policies.len()
        ));
        if let Some(cal) = &results.calibration {
            out.push_str(&format!(
                "Convergence threshold: {} ({})\n\n",
                cal.threshold, cal.correlation_notes
            ));
        }
        for prediction in &results.predictions {
            let policy_name = results
                .policies
                .iter()
                .find(|p| p.policy_id == prediction.policy_id)
                .map_or(prediction.policy_id.as_str(), |p| p.name.as_str());
            out.push_str(&format!(
                "## {policy_name} (convergence {})\n\n{}\n\nActor profile: {}\nLifecycle stage: {}\nDetection difficulty: {}\n\n",
                prediction.convergence_score,
                prediction.mechanics,
                prediction.actor_profile,
                prediction.lifecycle_stage,
                prediction.detection_difficulty
            ));
            let patterns: Vec<_> = results
                .patterns
                .iter()
                .filter(|p| p.prediction_id == prediction.prediction_id)
                .collect();
            if !patterns.is_empty() {
                out.push_str("### Detection patterns\n\n");
                for pattern in patterns {
                    out.push_str(&format!(
                        "- [{}] {}: {} (baseline: {})\n",
                        pattern.priority,
                        pattern.data_source,
                        pattern.anomaly_signal,
                        pattern.baseline
                    ));
                }
                out.push('\n');
            }
        }

        std::fs::write(&path, out)?;
        info!(path = %path.display(), "briefing exported");
        Ok(path)
    }

    async fn collect_results(&self, run_id: &str) -> Result<RunResults, OrchestratorError> {
        Ok(RunResults {
            run: self.store.get_run(run_id).await?,
            cases: self.store.cases().await?,
            taxonomy: self.store.taxonomy(true).await?,
            merge_records: self.store.merge_records().await?,
            policies: self.store.policies().await?,
            calibration: self.store.calibration(run_id).await?,
            predictions: self.store.predictions(run_id).await?,
            patterns: self.store.detection_patterns(run_id).await?,
        })
    }
}

#[derive(Debug, serde::Serialize)]
struct RunResults {
    run: Run,
    cases: Vec<crate::store::entities::Case>,
    taxonomy: Vec<Quality>,
    merge_records: Vec<crate::store::entities::MergeRecord>,
    policies: Vec<crate::store::entities::Policy>,
    calibration: Option<crate::store::entities::Calibration>,
    predictions: Vec<crate::store::entities::Prediction>,
    patterns: Vec<crate::store::entities::DetectionPattern>,
}

const SEED_JSON: &str = include_str!("seed/corpus.json");

#[derive(Debug, Deserialize)]
struct SeedData {
    documents: Vec<SeedDocument>,
    qualities: Vec<SeedQuality>,
    policies: Vec<SeedPolicy>,
}

#[derive(Debug, Deserialize)]
struct SeedDocument {
    file_name: String,
    doc_type: DocType,
    text: String,
}

#[derive(Debug, Deserialize)]
struct SeedQuality {
    name: String,
    definition: String,
    recognition_test: String,
    exploitation_logic: String,
    #[serde(default)]
    canonical_examples: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SeedPolicy {
    name: String,
    description: String,
}
