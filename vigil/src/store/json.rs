//! JSON snapshot entity store.
//!
//! The whole [`StoreState`] is kept in memory and flushed to disk after
//! every mutation. Flushes write to a sibling temp file and rename it
//! over the snapshot, so a crash mid-write leaves the previous snapshot
//! intact and commit atomicity extends to the file on disk.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::errors::StoreError;

use super::entities::{
    Calibration, Case, Chunk, ConvergenceScore, DetectionPattern, DocType, Document, MarkerScope,
    MergeRecord, Policy, PolicyScore, Prediction, Quality, ReviewStatus, Run, StageExecution,
};
use super::memory::StoreState;
use super::{EntityStore, GateProposal, StageCommit};

/// File-backed entity store used by the CLI.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl JsonFileStore {
    /// Opens the store at `path`, loading the existing snapshot if one
    /// is present.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            StoreState::default()
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    fn persist(path: &Path, state: &StoreState) -> Result<(), StoreError> {
        let raw = serde_json::to_string_pretty(state)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Runs a mutation under the lock and flushes the snapshot if it
    /// succeeded.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut StoreState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut state = self.state.lock();
        let out = f(&mut state)?;
        Self::persist(&self.path, &state)?;
        Ok(out)
    }
}

#[async_trait]
impl EntityStore for JsonFileStore {
    async fn create_run(&self, run: Run) -> Result<(), StoreError> {
        self.mutate(|s| {
            s.runs.push(run);
            Ok(())
        })
    }

    async fn latest_run(&self) -> Result<Option<Run>, StoreError> {
        Ok(self.state.lock().runs.last().cloned())
    }

    async fn get_run(&self, run_id: &str) -> Result<Run, StoreError> {
        self.state
            .lock()
            .runs
            .iter()
            .find(|r| r.run_id == run_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("run '{run_id}'")))
    }

    async fn update_run(&self, run: Run) -> Result<(), StoreError> {
        self.mutate(|s| {
            let slot = s
                .runs
                .iter_mut()
                .find(|r| r.run_id == run.run_id)
                .ok_or_else(|| StoreError::NotFound(format!("run '{}'", run.run_id)))?;
            *slot = run;
            Ok(())
        })
    }

    async fn record_execution(&self, execution: StageExecution) -> Result<(), StoreError> {
        self.mutate(|s| {
            s.executions.push(execution);
            Ok(())
        })
    }

    async fn executions(&self, run_id: &str) -> Result<Vec<StageExecution>, StoreError> {
        Ok(self
            .state
            .lock()
            .executions
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn documents(&self, doc_type: Option<DocType>) -> Result<Vec<Document>, StoreError> {
        Ok(self
            .state
            .lock()
            .documents
            .values()
            .filter(|d| doc_type.map_or(true, |t| d.doc_type == t))
            .cloned()
            .collect())
    }

    async fn chunks(&self) -> Result<Vec<Chunk>, StoreError> {
        Ok(self.state.lock().chunks.values().cloned().collect())
    }

    async fn cases(&self) -> Result<Vec<Case>, StoreError> {
        Ok(self.state.lock().cases.values().cloned().collect())
    }

    async fn taxonomy(&self, approved_only: bool) -> Result<Vec<Quality>, StoreError> {
        Ok(self
            .state
            .lock()
            .qualities
            .values()
            .filter(|q| !approved_only || q.review_status == ReviewStatus::Approved)
            .cloned()
            .collect())
    }

    async fn merge_records(&self) -> Result<Vec<MergeRecord>, StoreError> {
        Ok(self.state.lock().merge_records.clone())
    }

    async fn policies(&self) -> Result<Vec<Policy>, StoreError> {
        Ok(self.state.lock().policies.values().cloned().collect())
    }

    async fn convergence_scores(&self, run_id: &str) -> Result<Vec<ConvergenceScore>, StoreError> {
        Ok(self
            .state
            .lock()
            .convergence_scores
            .iter()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn calibration(&self, run_id: &str) -> Result<Option<Calibration>, StoreError> {
        Ok(self.state.lock().calibrations.get(run_id).cloned())
    }

    async fn policy_scores(&self, run_id: &str) -> Result<Vec<PolicyScore>, StoreError> {
        Ok(self
            .state
            .lock()
            .policy_scores
            .iter()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn predictions(&self, run_id: &str) -> Result<Vec<Prediction>, StoreError> {
        Ok(self
            .state
            .lock()
            .predictions
            .values()
            .filter(|p| p.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn detection_patterns(&self, run_id: &str) -> Result<Vec<DetectionPattern>, StoreError> {
        Ok(self
            .state
            .lock()
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
            .lock()
            .markers
            .values()
            .filter(|m| m.stage == stage && &m.scope == scope)
            .map(|m| (m.item_id.clone(), m.input_hash.clone()))
            .collect())
    }

    async fn commit(&self, commit: StageCommit) -> Result<(), StoreError> {
        self.mutate(|s| s.apply_commit(commit))
    }

    async fn put_proposal(&self, proposal: GateProposal) -> Result<(), StoreError> {
        self.mutate(|s| {
            let key = format!("{}:{}", proposal.run_id, proposal.stage);
            s.proposals.insert(key, proposal);
            Ok(())
        })
    }

    async fn get_proposal(
        &self,
        run_id: &str,
        stage: u32,
    ) -> Result<Option<GateProposal>, StoreError> {
        Ok(self
            .state
            .lock()
            .proposals
            .get(&format!("{run_id}:{stage}"))
            .cloned())
    }

    async fn remove_proposal(&self, run_id: &str, stage: u32) -> Result<(), StoreError> {
        self.mutate(|s| {
            s.proposals.remove(&format!("{run_id}:{stage}"));
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EntityWrite;
    use chrono::Utc;

    #[tokio::test]
    async fn snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        {
            let store = JsonFileStore::open(&path).unwrap();
            let mut commit = StageCommit::new("run_1", 0);
            commit.writes.push(EntityWrite::Document(Document {
                doc_id: "doc_1".to_string(),
                file_name: "case.txt".to_string(),
                doc_type: DocType::Enforcement,
                text: "settlement announced".to_string(),
                ingested_at: Utc::now(),
            }));
            store.commit(commit).await.unwrap();
        }

        let reopened = JsonFileStore::open(&path).unwrap();
        let docs = reopened.documents(None).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].doc_id, "doc_1");
    }

    #[tokio::test]
    async fn failed_commit_leaves_snapshot_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = JsonFileStore::open(&path).unwrap();

        let mut bad = StageCommit::new("run_1", 2);
        bad.writes.push(EntityWrite::MergeExamples {
            quality_id: "missing".to_string(),
            examples: vec![],
            record: MergeRecord {
                merge_id: "m_1".to_string(),
                quality_id: "missing".to_string(),
                candidate_name: "x".to_string(),
                rationale: String::new(),
                merged_examples: vec![],
                recorded_at: Utc::now(),
            },
        });
        assert!(store.commit(bad).await.is_err());
        // Nothing was flushed for the failed commit.
        assert!(!path.exists());
    }
}
