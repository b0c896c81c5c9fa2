//! In-memory entity store.
//!
//! All state lives behind a single lock, so a [`StageCommit`] applies
//! atomically by construction. The same [`StoreState`] type backs the
//! JSON snapshot store.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::errors::StoreError;

use super::entities::{
    Calibration, Case, Chunk, ConvergenceScore, DetectionPattern, DocType, Document, MarkerScope,
    MergeRecord, Policy, PolicyScore, Prediction, ProcessedMarker, Quality, Run, StageExecution,
};
use super::{EntityStore, EntityWrite, GateProposal, StageCommit};

fn marker_key(stage: u32, scope: &MarkerScope, item_id: &str) -> String {
    match scope {
        MarkerScope::Global => format!("{stage}:global:{item_id}"),
        MarkerScope::Run(run_id) => format!("{stage}:run={run_id}:{item_id}"),
    }
}

fn proposal_key(run_id: &str, stage: u32) -> String {
    format!("{run_id}:{stage}")
}

/// Complete store contents. Serializable so file-backed stores can
/// snapshot it wholesale.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(crate) struct StoreState {
    pub runs: Vec<Run>,
    pub executions: Vec<StageExecution>,
    pub documents: BTreeMap<String, Document>,
    pub chunks: BTreeMap<String, Chunk>,
    pub cases: BTreeMap<String, Case>,
    pub qualities: BTreeMap<String, Quality>,
    pub merge_records: Vec<MergeRecord>,
    pub policies: BTreeMap<String, Policy>,
    pub convergence_scores: Vec<ConvergenceScore>,
    pub calibrations: BTreeMap<String, Calibration>,
    pub policy_scores: Vec<PolicyScore>,
    pub predictions: BTreeMap<String, Prediction>,
    pub detection_patterns: BTreeMap<String, DetectionPattern>,
    pub markers: BTreeMap<String, ProcessedMarker>,
    pub proposals: BTreeMap<String, GateProposal>,
}

impl StoreState {
    /// Validates and applies a commit against this state. The caller
    /// holds the state exclusively, so validation and application are
    /// one atomic step.
    pub(crate) fn apply_commit(&mut self, commit: StageCommit) -> Result<(), StoreError> {
        for marker in &commit.markers {
            let key = marker_key(marker.stage, &marker.scope, &marker.item_id);
            if let Some(existing) = self.markers.get(&key) {
                let same_input = existing.input_hash == marker.input_hash;
                let other_run = existing.marked_by_run != marker.marked_by_run;
                if same_input && other_run {
                    return Err(StoreError::Conflict {
                        stage: marker.stage,
                        item_id: marker.item_id.clone(),
                    });
                }
            }
        }

        // Apply against a scratch copy so a failing write cannot leave
        // the state half-committed.
        let mut next = self.clone();
        for write in commit.writes {
            next.apply_write(write)?;
        }
        for marker in commit.markers {
            let key = marker_key(marker.stage, &marker.scope, &marker.item_id);
            next.markers.insert(key, marker);
        }
        *self = next;
        Ok(())
    }

    fn apply_write(&mut self, write: EntityWrite) -> Result<(), StoreError> {
        match write {
            EntityWrite::Document(doc) => {
                self.documents.insert(doc.doc_id.clone(), doc);
            }
            EntityWrite::Chunk(chunk) => {
                self.chunks.insert(chunk.chunk_id.clone(), chunk);
            }
            EntityWrite::Case(case) => {
                self.cases.insert(case.case_id.clone(), case);
            }
            EntityWrite::Quality(quality) => {
                self.qualities.insert(quality.quality_id.clone(), quality);
            }
            EntityWrite::MergeExamples {
                quality_id,
                examples,
                record,
            } => {
                let quality = self
                    .qualities
                    .get_mut(&quality_id)
                    .ok_or_else(|| StoreError::NotFound(format!("quality '{quality_id}'")))?;
                for example in examples {
                    if !quality.canonical_examples.contains(&example) {
                        quality.canonical_examples.push(example);
                    }
                }
                self.merge_records.push(record);
            }
            EntityWrite::ConvergenceScore(score) => {
                self.convergence_scores.retain(|s| {
                    !(s.run_id == score.run_id
                        && s.case_id == score.case_id
                        && s.quality_id == score.quality_id)
                });
                self.convergence_scores.push(score);
            }
            EntityWrite::Calibration(cal) => {
                self.calibrations.insert(cal.run_id.clone(), cal);
            }
            EntityWrite::Policy(policy) => {
                self.policies.insert(policy.policy_id.clone(), policy);
            }
            EntityWrite::PolicyScore(score) => {
                self.policy_scores.retain(|s| {
                    !(s.run_id == score.run_id
                        && s.policy_id == score.policy_id
                        && s.quality_id == score.quality_id)
                });
                self.policy_scores.push(score);
            }
            EntityWrite::Prediction(prediction) => {
                self.predictions
                    .insert(prediction.prediction_id.clone(), prediction);
            }
            EntityWrite::DetectionPattern(pattern) => {
                self.detection_patterns
                    .insert(pattern.pattern_id.clone(), pattern);
            }
            EntityWrite::DeletePatternsFor { prediction_id } => {
                self.detection_patterns
                    .retain(|_, p| p.prediction_id != prediction_id);
            }
        }
        Ok(())
    }
}

/// Entity store backed by process memory. The default store for tests
/// and embedded use.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn create_run(&self, run: Run) -> Result<(), StoreError> {
        self.state.write().runs.push(run);
        Ok(())
    }

    async fn latest_run(&self) -> Result<Option<Run>, StoreError> {
        Ok(self.state.read().runs.last().cloned())
    }

    async fn get_run(&self, run_id: &str) -> Result<Run, StoreError> {
        self.state
            .read()
            .runs
            .iter()
            .find(|r| r.run_id == run_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("run '{run_id}'")))
    }

    async fn update_run(&self, run: Run) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let slot = state
            .runs
            .iter_mut()
            .find(|r| r.run_id == run.run_id)
            .ok_or_else(|| StoreError::NotFound(format!("run '{}'", run.run_id)))?;
        *slot = run;
        Ok(())
    }

    async fn record_execution(&self, execution: StageExecution) -> Result<(), StoreError> {
        self.state.write().executions.push(execution);
        Ok(())
    }

    async fn executions(&self, run_id: &str) -> Result<Vec<StageExecution>, StoreError> {
        Ok(self
            .state
            .read()
            .executions
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn documents(&self, doc_type: Option<DocType>) -> Result<Vec<Document>, StoreError> {
        Ok(self
            .state
            .read()
            .documents
            .values()
            .filter(|d| doc_type.map_or(true, |t| d.doc_type == t))
            .cloned()
            .collect())
    }

    async fn chunks(&self) -> Result<Vec<Chunk>, StoreError> {
        Ok(self.state.read().chunks.values().cloned().collect())
    }

    async fn cases(&self) -> Result<Vec<Case>, StoreError> {
        Ok(self.state.read().cases.values().cloned().collect())
    }

    async fn taxonomy(&self, approved_only: bool) -> Result<Vec<Quality>, StoreError> {
        use super::entities::ReviewStatus;
        Ok(self
            .state
            .read()
            .qualities
            .values()
            .filter(|q| !approved_only || q.review_status == ReviewStatus::Approved)
            .cloned()
            .collect())
    }

    async fn merge_records(&self) -> Result<Vec<MergeRecord>, StoreError> {
        Ok(self.state.read().merge_records.clone())
    }

    async fn policies(&self) -> Result<Vec<Policy>, StoreError> {
        Ok(self.state.read().policies.values().cloned().collect())
    }

    async fn convergence_scores(&self, run_id: &str) -> Result<Vec<ConvergenceScore>, StoreError> {
        Ok(self
            .state
            .read()
            .convergence_scores
            .iter()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn calibration(&self, run_id: &str) -> Result<Option<Calibration>, StoreError> {
        Ok(self.state.read().calibrations.get(run_id).cloned())
    }

    async fn policy_scores(&self, run_id: &str) -> Result<Vec<PolicyScore>, StoreError> {
        Ok(self
            .state
            .read()
            .policy_scores
            .iter()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn predictions(&self, run_id: &str) -> Result<Vec<Prediction>, StoreError> {
        Ok(self
            .state
            .read()
            .predictions
            .values()
            .filter(|p| p.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn detection_patterns(&self, run_id: &str) -> Result<Vec<DetectionPattern>, StoreError> {
        Ok(self
            .state
            .read()
            .detection_patterns
            .values()
            .filter(|p| p.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn markers(
        &self,
        stage: u32,
        scope: &MarkerScope,
    ) -> Result<HashMap<String, String>, StoreError> {
        Ok(self
            .state
            .read()
            .markers
            .values()
            .filter(|m| m.stage == stage && &m.scope == scope)
            .map(|m| (m.item_id.clone(), m.input_hash.clone()))
            .collect())
    }

    async fn commit(&self, commit: StageCommit) -> Result<(), StoreError> {
        self.state.write().apply_commit(commit)
    }

    async fn put_proposal(&self, proposal: GateProposal) -> Result<(), StoreError> {
        let key = proposal_key(&proposal.run_id, proposal.stage);
        self.state.write().proposals.insert(key, proposal);
        Ok(())
    }

    async fn get_proposal(
        &self,
        run_id: &str,
        stage: u32,
    ) -> Result<Option<GateProposal>, StoreError> {
        Ok(self
            .state
            .read()
            .proposals
            .get(&proposal_key(run_id, stage))
            .cloned())
    }

    async fn remove_proposal(&self, run_id: &str, stage: u32) -> Result<(), StoreError> {
        self.state
            .write()
            .proposals
            .remove(&proposal_key(run_id, stage));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::entities::ReviewStatus;
    use chrono::Utc;

    fn quality(id: &str, examples: &[&str]) -> Quality {
        Quality {
            quality_id: id.to_string(),
            name: id.to_string(),
            definition: String::new(),
            recognition_test: String::new(),
            exploitation_logic: String::new(),
            canonical_examples: examples.iter().map(ToString::to_string).collect(),
            review_status: ReviewStatus::Approved,
            created_at: Utc::now(),
        }
    }

    fn marker(stage: u32, item: &str, hash: &str, run: &str) -> ProcessedMarker {
        ProcessedMarker::new(stage, MarkerScope::Global, item, hash, run)
    }

    #[tokio::test]
    async fn commit_applies_writes_and_markers_together() {
        let store = MemoryStore::new();
        let mut commit = StageCommit::new("run_1", 2);
        commit.writes.push(EntityWrite::Quality(quality("q_a", &["e1"])));
        commit.markers.push(marker(2, "case_1", "aaaa", "run_1"));

        store.commit(commit).await.unwrap();

        assert_eq!(store.taxonomy(true).await.unwrap().len(), 1);
        let markers = store.markers(2, &MarkerScope::Global).await.unwrap();
        assert_eq!(markers.get("case_1").map(String::as_str), Some("aaaa"));
    }

    #[tokio::test]
    async fn same_run_recommit_is_idempotent() {
        let store = MemoryStore::new();
        let mut commit = StageCommit::new("run_1", 2);
        commit.markers.push(marker(2, "case_1", "aaaa", "run_1"));
        store.commit(commit.clone()).await.unwrap();
        store.commit(commit).await.unwrap();
    }

    #[tokio::test]
    async fn other_run_same_hash_conflicts() {
        let store = MemoryStore::new();
        let mut first = StageCommit::new("run_1", 2);
        first.markers.push(marker(2, "case_1", "aaaa", "run_1"));
        store.commit(first).await.unwrap();

        let mut second = StageCommit::new("run_2", 2);
        second.markers.push(marker(2, "case_1", "aaaa", "run_2"));
        let err = store.commit(second).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { stage: 2, .. }));
    }

    #[tokio::test]
    async fn changed_hash_overwrites_marker() {
        let store = MemoryStore::new();
        let mut first = StageCommit::new("run_1", 1);
        first.markers.push(marker(1, "doc_1", "aaaa", "run_1"));
        store.commit(first).await.unwrap();

        // The input changed, so a later run may reprocess it.
        let mut second = StageCommit::new("run_2", 1);
        second.markers.push(marker(1, "doc_1", "bbbb", "run_2"));
        store.commit(second).await.unwrap();

        let markers = store.markers(1, &MarkerScope::Global).await.unwrap();
        assert_eq!(markers.get("doc_1").map(String::as_str), Some("bbbb"));
    }

    #[tokio::test]
    async fn merge_examples_appends_without_duplicates() {
        let store = MemoryStore::new();
        let mut setup = StageCommit::new("run_1", 2);
        setup
            .writes
            .push(EntityWrite::Quality(quality("q_a", &["shared"])));
        store.commit(setup).await.unwrap();

        let mut merge = StageCommit::new("run_1", 2);
        merge.writes.push(EntityWrite::MergeExamples {
            quality_id: "q_a".to_string(),
            examples: vec!["shared".to_string(), "novel".to_string()],
            record: MergeRecord {
                merge_id: "m_1".to_string(),
                quality_id: "q_a".to_string(),
                candidate_name: "q_a_variant".to_string(),
                rationale: "same recognition test".to_string(),
                merged_examples: vec!["novel".to_string()],
                recorded_at: Utc::now(),
            },
        });
        store.commit(merge).await.unwrap();

        let taxonomy = store.taxonomy(true).await.unwrap();
        assert_eq!(taxonomy[0].canonical_examples, vec!["shared", "novel"]);
        assert_eq!(store.merge_records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_patterns_for_prediction_removes_only_its_patterns() {
        let store = MemoryStore::new();
        let pattern = |id: &str, pred: &str| DetectionPattern {
            pattern_id: id.to_string(),
            run_id: "run_1".to_string(),
            prediction_id: pred.to_string(),
            data_source: String::new(),
            anomaly_signal: String::new(),
            baseline: String::new(),
            false_positive_risk: String::new(),
            detection_latency: String::new(),
            priority: super::super::entities::Priority::Medium,
            implementation_notes: String::new(),
        };

        let mut setup = StageCommit::new("run_1", 6);
        setup
            .writes
            .push(EntityWrite::DetectionPattern(pattern("p_1", "pred_a")));
        setup
            .writes
            .push(EntityWrite::DetectionPattern(pattern("p_2", "pred_b")));
        store.commit(setup).await.unwrap();

        let mut regen = StageCommit::new("run_1", 6);
        regen.writes.push(EntityWrite::DeletePatternsFor {
            prediction_id: "pred_a".to_string(),
        });
        store.commit(regen).await.unwrap();

        let remaining = store.detection_patterns("run_1").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].prediction_id, "pred_b");
    }

    #[tokio::test]
    async fn proposals_round_trip() {
        let store = MemoryStore::new();
        let proposal = GateProposal {
            run_id: "run_1".to_string(),
            stage: 2,
            items: vec![],
        };
        store.put_proposal(proposal).await.unwrap();
        assert!(store.get_proposal("run_1", 2).await.unwrap().is_some());
        store.remove_proposal("run_1", 2).await.unwrap();
        assert!(store.get_proposal("run_1", 2).await.unwrap().is_none());
    }
}
