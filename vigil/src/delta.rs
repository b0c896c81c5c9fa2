//! Delta tracking.
//!
//! Every stage processes only inputs that are new or whose content hash
//! changed since the stage last processed them. The tracker reads the
//! durable processed-markers and compares them to freshly computed input
//! hashes; anything equal is skipped, anything new or different is
//! pending. Markers themselves are written by stage commits, never here.

use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::errors::StoreError;
use crate::store::entities::{Case, Document, MarkerScope, Policy, Prediction};
use crate::store::EntityStore;

/// Length of the hex digest prefix kept for input hashes and derived
/// identifiers.
const HASH_PREFIX_LEN: usize = 12;

/// Hashes arbitrary input text into a short stable hex digest.
#[must_use]
pub fn content_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)[..HASH_PREFIX_LEN].to_string()
}

/// An input unit a stage still has to process.
#[derive(Debug, Clone)]
pub struct Pending<T> {
    /// The input entity.
    pub item: T,
    /// Marker identifier for the item.
    pub item_id: String,
    /// Hash of the input as it will be processed.
    pub input_hash: String,
}

/// The split of a stage's candidate inputs into pending and skipped.
#[derive(Debug, Clone)]
pub struct DeltaSet<T> {
    /// Inputs that must be processed.
    pub pending: Vec<Pending<T>>,
    /// Count of inputs skipped because their markers matched.
    pub skipped: u64,
}

impl<T> DeltaSet<T> {
    /// Returns true if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Computes pending input sets per stage from durable markers.
#[derive(Clone)]
pub struct DeltaTracker {
    store: Arc<dyn EntityStore>,
}

impl DeltaTracker {
    /// Creates a tracker over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    /// Fingerprint of the approved taxonomy. Baked into downstream
    /// input hashes so taxonomy changes invalidate prior scoring work.
    pub async fn taxonomy_fingerprint(&self) -> Result<String, StoreError> {
        let mut parts: Vec<String> = self
            .store
            .taxonomy(true)
            .await?
            .iter()
            .map(|q| format!("{}|{}", q.quality_id, q.definition))
            .collect();
        parts.sort();
        Ok(content_hash(&parts.join("\n")))
    }

    /// Enforcement documents pending case extraction (stage 1, global).
    pub async fn pending_documents_for_extraction(
        &self,
    ) -> Result<DeltaSet<Document>, StoreError> {
        use crate::store::entities::DocType;
        let docs = self.store.documents(Some(DocType::Enforcement)).await?;
        let candidates = docs
            .into_iter()
            .map(|d| {
                let hash = content_hash(&d.text);
                (d.doc_id.clone(), hash, d)
            })
            .collect();
        self.split(1, &MarkerScope::Global, candidates).await
    }

    /// Cases pending taxonomy analysis (stage 2, global).
    pub async fn pending_cases_for_taxonomy(&self) -> Result<DeltaSet<Case>, StoreError> {
        let cases = self.store.cases().await?;
        let candidates = cases
            .into_iter()
            .map(|c| {
                let hash = content_hash(&c.enabling_condition);
                (c.case_id.clone(), hash, c)
            })
            .collect();
        self.split(2, &MarkerScope::Global, candidates).await
    }

    /// Cases pending convergence scoring (stage 3, per-run). The
    /// taxonomy fingerprint is part of the hash, so an expanded taxonomy
    /// re-queues every case.
    pub async fn pending_cases_for_scoring(
        &self,
        run_id: &str,
        taxonomy_fp: &str,
    ) -> Result<DeltaSet<Case>, StoreError> {
        let cases = self.store.cases().await?;
        let candidates = cases
            .into_iter()
            .map(|c| {
                let hash = content_hash(&format!(
                    "{}|{}|{taxonomy_fp}",
                    c.scheme_mechanics, c.enabling_condition
                ));
                (c.case_id.clone(), hash, c)
            })
            .collect();
        self.split(3, &MarkerScope::Run(run_id.to_string()), candidates)
            .await
    }

    /// Policies pending structural scanning (stage 4, per-run).
    pub async fn pending_policies_for_scan(
        &self,
        run_id: &str,
        taxonomy_fp: &str,
    ) -> Result<DeltaSet<Policy>, StoreError> {
        let policies = self.store.policies().await?;
        let candidates = policies
            .into_iter()
            .map(|p| {
                let hash = content_hash(&format!("{}|{taxonomy_fp}", p.description));
                (p.policy_id.clone(), hash, p)
            })
            .collect();
        self.split(4, &MarkerScope::Run(run_id.to_string()), candidates)
            .await
    }

    /// High-risk policies pending prediction (stage 5, per-run). A
    /// policy qualifies when its present-quality count reaches the
    /// calibrated threshold; the hash covers the quality profile and the
    /// threshold, so re-scoring or re-calibration re-queues it.
    pub async fn pending_policies_for_prediction(
        &self,
        run_id: &str,
        threshold: u32,
    ) -> Result<DeltaSet<Policy>, StoreError> {
        let scores = self.store.policy_scores(run_id).await?;
        let policies = self.store.policies().await?;

        let mut candidates = Vec::new();
        for policy in policies {
            let mut present: Vec<&str> = scores
                .iter()
                .filter(|s| s.policy_id == policy.policy_id && s.present)
                .map(|s| s.quality_id.as_str())
                .collect();
            present.sort_unstable();
            if (present.len() as u32) < threshold {
                continue;
            }
            let hash = content_hash(&format!("{}|{threshold}", present.join(",")));
            candidates.push((policy.policy_id.clone(), hash, policy));
        }
        self.split(5, &MarkerScope::Run(run_id.to_string()), candidates)
            .await
    }

    /// Predictions pending detection-pattern generation (stage 6,
    /// per-run).
    pub async fn pending_predictions_for_detection(
        &self,
        run_id: &str,
    ) -> Result<DeltaSet<Prediction>, StoreError> {
        let predictions = self.store.predictions(run_id).await?;
        let candidates = predictions
            .into_iter()
            .map(|p| {
                let mut qualities = p.enabling_qualities.clone();
                qualities.sort();
                let hash = content_hash(&format!("{}|{}", p.mechanics, qualities.join(",")));
                (p.prediction_id.clone(), hash, p)
            })
            .collect();
        self.split(6, &MarkerScope::Run(run_id.to_string()), candidates)
            .await
    }

    /// Splits candidates against the durable markers for a stage.
    pub async fn split<T>(
        &self,
        stage: u32,
        scope: &MarkerScope,
        candidates: Vec<(String, String, T)>,
    ) -> Result<DeltaSet<T>, StoreError> {
        let processed = self.store.markers(stage, scope).await?;
        let mut pending = Vec::new();
        let mut skipped = 0u64;
        for (item_id, input_hash, item) in candidates {
            if processed.get(&item_id) == Some(&input_hash) {
                skipped += 1;
            } else {
                pending.push(Pending {
                    item,
                    item_id,
                    input_hash,
                });
            }
        }
        Ok(DeltaSet { pending, skipped })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::entities::ProcessedMarker;
    use crate::store::{MemoryStore, StageCommit};

    #[test]
    fn content_hash_is_short_and_stable() {
        let a = content_hash("medicare overbilling");
        let b = content_hash("medicare overbilling");
        let c = content_hash("medicare overbilling!");
        assert_eq!(a.len(), 12);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn split_separates_new_changed_and_unchanged() {
        let store = Arc::new(MemoryStore::new());
        let mut commit = StageCommit::new("run_1", 1);
        commit.markers.push(ProcessedMarker::new(
            1,
            MarkerScope::Global,
            "doc_same",
            "hash_same",
            "run_1",
        ));
        commit.markers.push(ProcessedMarker::new(
            1,
            MarkerScope::Global,
            "doc_changed",
            "hash_old",
            "run_1",
        ));
        store.commit(commit).await.unwrap();

        let tracker = DeltaTracker::new(store);
        let set = tracker
            .split(
                1,
                &MarkerScope::Global,
                vec![
                    ("doc_same".to_string(), "hash_same".to_string(), ()),
                    ("doc_changed".to_string(), "hash_new".to_string(), ()),
                    ("doc_new".to_string(), "hash_x".to_string(), ()),
                ],
            )
            .await
            .unwrap();

        assert_eq!(set.skipped, 1);
        let ids: Vec<&str> = set.pending.iter().map(|p| p.item_id.as_str()).collect();
        assert_eq!(ids, vec!["doc_changed", "doc_new"]);
    }

    #[tokio::test]
    async fn taxonomy_fingerprint_ignores_order_and_tracks_changes() {
        use crate::store::entities::{Quality, ReviewStatus};
        use crate::store::EntityWrite;
        use chrono::Utc;

        let quality = |id: &str, def: &str| Quality {
            quality_id: id.to_string(),
            name: id.to_string(),
            definition: def.to_string(),
            recognition_test: String::new(),
            exploitation_logic: String::new(),
            canonical_examples: vec![],
            review_status: ReviewStatus::Approved,
            created_at: Utc::now(),
        };

        let store = Arc::new(MemoryStore::new());
        let mut commit = StageCommit::new("run_1", 2);
        commit.writes.push(EntityWrite::Quality(quality("q_a", "a")));
        commit.writes.push(EntityWrite::Quality(quality("q_b", "b")));
        store.commit(commit).await.unwrap();

        let tracker = DeltaTracker::new(Arc::clone(&store) as Arc<dyn EntityStore>);
        let fp1 = tracker.taxonomy_fingerprint().await.unwrap();

        let mut commit = StageCommit::new("run_1", 2);
        commit.writes.push(EntityWrite::Quality(quality("q_c", "c")));
        store.commit(commit).await.unwrap();

        let fp2 = tracker.taxonomy_fingerprint().await.unwrap();
        assert_ne!(fp1, fp2);
    }
}
