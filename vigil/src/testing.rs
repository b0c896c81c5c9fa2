//! Test doubles shared by unit and integration tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::errors::{StoreError, TransportError};
use crate::model::ModelTransport;
use crate::store::entities::{
    Calibration, Case, Chunk, ConvergenceScore, DetectionPattern, DocType, Document, MarkerScope,
    MergeRecord, Policy, PolicyScore, Prediction, Quality, Run, StageExecution,
};
use crate::store::{EntityStore, GateProposal, StageCommit};

/// Transport that replays a scripted queue of completions. When the
/// queue runs dry it returns a transient failure, which makes missing
/// scripts visible as retry exhaustion rather than hangs.
pub struct ScriptedTransport {
    responses: Mutex<Vec<Result<String, TransportError>>>,
    fallback: Mutex<Option<String>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    /// Creates a transport that replays `responses` in order.
    #[must_use]
    pub fn new(responses: Vec<Result<String, TransportError>>) -> Self {
        Self {
            responses: Mutex::new(responses),
            fallback: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Creates a transport where every call succeeds with `completion`.
    #[must_use]
    pub fn always(completion: &str) -> Self {
        let transport = Self::new(Vec::new());
        *transport.fallback.lock() = Some(completion.to_string());
        transport
    }

    /// Number of calls made so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Prompts received, in call order.
    #[must_use]
    pub fn prompts(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ModelTransport for ScriptedTransport {
    async fn generate(&self, prompt: &str, _max_tokens: u32) -> Result<String, TransportError> {
        self.calls.lock().push(prompt.to_string());
        let mut responses = self.responses.lock();
        if responses.is_empty() {
            if let Some(fallback) = self.fallback.lock().clone() {
                return Ok(fallback);
            }
            return Err(TransportError::Transient("script exhausted".to_string()));
        }
        responses.remove(0)
    }

    fn model_id(&self) -> &str {
        "scripted"
    }
}

/// Store wrapper that can be told to fail every commit, simulating a
/// crash before anything becomes durable. Reads and all other writes
/// pass through.
pub struct CrashInjectingStore {
    inner: Arc<dyn EntityStore>,
    fail_commits: AtomicBool,
}

impl CrashInjectingStore {
    /// Wraps `inner` with commits passing through.
    #[must_use]
    pub fn new(inner: Arc<dyn EntityStore>) -> Self {
        Self {
            inner,
            fail_commits: AtomicBool::new(false),
        }
    }

    /// Makes every subsequent commit fail without applying.
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl EntityStore for CrashInjectingStore {
    async fn create_run(&self, run: Run) -> Result<(), StoreError> {
        self.inner.create_run(run).await
    }

    async fn latest_run(&self) -> Result<Option<Run>, StoreError> {
        self.inner.latest_run().await
    }

    async fn get_run(&self, run_id: &str) -> Result<Run, StoreError> {
        self.inner.get_run(run_id).await
    }

    async fn update_run(&self, run: Run) -> Result<(), StoreError> {
        self.inner.update_run(run).await
    }

    async fn record_execution(&self, execution: StageExecution) -> Result<(), StoreError> {
        self.inner.record_execution(execution).await
    }

    async fn executions(&self, run_id: &str) -> Result<Vec<StageExecution>, StoreError> {
        self.inner.executions(run_id).await
    }

    async fn documents(&self, doc_type: Option<DocType>) -> Result<Vec<Document>, StoreError> {
        self.inner.documents(doc_type).await
    }

    async fn chunks(&self) -> Result<Vec<Chunk>, StoreError> {
        self.inner.chunks().await
    }

    async fn cases(&self) -> Result<Vec<Case>, StoreError> {
        self.inner.cases().await
    }

    async fn taxonomy(&self, approved_only: bool) -> Result<Vec<Quality>, StoreError> {
        self.inner.taxonomy(approved_only).await
    }

    async fn merge_records(&self) -> Result<Vec<MergeRecord>, StoreError> {
        self.inner.merge_records().await
    }

    async fn policies(&self) -> Result<Vec<Policy>, StoreError> {
        self.inner.policies().await
    }

    async fn convergence_scores(&self, run_id: &str) -> Result<Vec<ConvergenceScore>, StoreError> {
        self.inner.convergence_scores(run_id).await
    }

    async fn calibration(&self, run_id: &str) -> Result<Option<Calibration>, StoreError> {
        self.inner.calibration(run_id).await
    }

    async fn policy_scores(&self, run_id: &str) -> Result<Vec<PolicyScore>, StoreError> {
        self.inner.policy_scores(run_id).await
    }

    async fn predictions(&self, run_id: &str) -> Result<Vec<Prediction>, StoreError> {
        self.inner.predictions(run_id).await
    }

    async fn detection_patterns(&self, run_id: &str) -> Result<Vec<DetectionPattern>, StoreError> {
        self.inner.detection_patterns(run_id).await
    }

    async fn markers(
        &self,
        stage: u32,
        scope: &MarkerScope,
    ) -> Result<HashMap<String, String>, StoreError> {
        self.inner.markers(stage, scope).await
    }

    async fn commit(&self, commit: StageCommit) -> Result<(), StoreError> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected crash before commit",
            )));
        }
        self.inner.commit(commit).await
    }

    async fn put_proposal(&self, proposal: GateProposal) -> Result<(), StoreError> {
        self.inner.put_proposal(proposal).await
    }

    async fn get_proposal(
        &self,
        run_id: &str,
        stage: u32,
    ) -> Result<Option<GateProposal>, StoreError> {
        self.inner.get_proposal(run_id, stage).await
    }

    async fn remove_proposal(&self, run_id: &str, stage: u32) -> Result<(), StoreError> {
        self.inner.remove_proposal(run_id, stage).await
    }
}
