//! Lexical retrieval over the chunk corpus.
//!
//! Retrieval is a scoring strategy behind [`ChunkScorer`]; the default
//! is TF-IDF over whitespace-and-punctuation tokens. Embedding-based
//! scorers can slot in behind the same trait without touching stages.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::RetrievalConfig;
use crate::errors::StoreError;
use crate::store::entities::{Chunk, DocType};
use crate::store::EntityStore;

/// A chunk with its relevance score for one query.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    /// The retrieved chunk, text truncated to the configured cap.
    pub chunk: Chunk,
    /// Relevance score; higher is better.
    pub score: f64,
}

/// Scoring strategy over the chunk corpus.
pub trait ChunkScorer: Send + Sync {
    /// Scores every chunk against the query. Order and length of the
    /// returned vector match `chunks`.
    fn score(&self, query: &str, chunks: &[Chunk]) -> Vec<f64>;
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(ToString::to_string)
        .collect()
}

/// TF-IDF scorer. Stateless; document frequencies are computed per call
/// over the chunk set being scored.
#[derive(Debug, Default, Clone, Copy)]
pub struct TfIdfScorer;

impl ChunkScorer for TfIdfScorer {
    fn score(&self, query: &str, chunks: &[Chunk]) -> Vec<f64> {
        let query_terms = tokenize(query);
        if query_terms.is_empty() || chunks.is_empty() {
            return vec![0.0; chunks.len()];
        }

        let chunk_tokens: Vec<Vec<String>> = chunks.iter().map(|c| tokenize(&c.text)).collect();

        let mut doc_freq: HashMap<&str, usize> = HashMap::new();
        for tokens in &chunk_tokens {
            let mut seen: Vec<&str> = Vec::new();
            for token in tokens {
                if !seen.contains(&token.as_str()) {
                    seen.push(token);
                    *doc_freq.entry(token).or_insert(0) += 1;
                }
            }
        }

        let n = chunks.len() as f64;
        chunk_tokens
            .iter()
            .map(|tokens| {
                if tokens.is_empty() {
                    return 0.0;
                }
                let len = tokens.len() as f64;
                query_terms
                    .iter()
                    .map(|term| {
                        let tf = tokens.iter().filter(|t| *t == term).count() as f64 / len;
                        let df = doc_freq.get(term.as_str()).copied().unwrap_or(0) as f64;
                        let idf = ((n + 1.0) / (df + 1.0)).ln() + 1.0;
                        tf * idf
                    })
                    .sum()
            })
            .collect()
    }
}

/// Retrieves query-relevant context from the chunk corpus.
pub struct ContextBuilder {
    store: Arc<dyn EntityStore>,
    scorer: Arc<dyn ChunkScorer>,
    config: RetrievalConfig,
}

impl ContextBuilder {
    /// Creates a builder with the default TF-IDF scorer.
    #[must_use]
    pub fn new(store: Arc<dyn EntityStore>, config: RetrievalConfig) -> Self {
        Self {
            store,
            scorer: Arc::new(TfIdfScorer),
            config,
        }
    }

    /// Replaces the scoring strategy.
    #[must_use]
    pub fn with_scorer(mut self, scorer: Arc<dyn ChunkScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    /// Returns the top chunks for the query, best first, drawn from
    /// documents of the given type or the whole corpus. An empty corpus
    /// yields an empty result rather than an error; callers degrade to
    /// prompts without retrieved context.
    pub async fn retrieve(
        &self,
        query: &str,
        scope: Option<DocType>,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        let recency: HashMap<String, DateTime<Utc>> = self
            .store
            .documents(scope)
            .await?
            .into_iter()
            .map(|d| (d.doc_id, d.ingested_at))
            .collect();

        let mut chunks = self.store.chunks().await?;
        if scope.is_some() {
            chunks.retain(|c| recency.contains_key(&c.doc_id));
        }
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let scores = self.scorer.score(query, &chunks);
        let mut ranked: Vec<(f64, Chunk)> = scores.into_iter().zip(chunks).collect();
        ranked.sort_by(|(sa, ca), (sb, cb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    // Ties prefer newer documents, then earlier chunks.
                    let ra = recency.get(&ca.doc_id);
                    let rb = recency.get(&cb.doc_id);
                    rb.cmp(&ra).then_with(|| ca.index.cmp(&cb.index))
                })
        });

        Ok(ranked
            .into_iter()
            .take(self.config.max_chunks)
            .map(|(score, mut chunk)| {
                if chunk.text.len() > self.config.max_chars_per_chunk {
                    let mut cut = self.config.max_chars_per_chunk;
                    while !chunk.text.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    chunk.text.truncate(cut);
                }
                ScoredChunk { chunk, score }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::entities::{DocType, Document};
    use crate::store::{EntityWrite, MemoryStore, StageCommit};

    fn chunk(id: &str, doc: &str, index: usize, text: &str) -> Chunk {
        Chunk {
            chunk_id: id.to_string(),
            doc_id: doc.to_string(),
            index,
            text: text.to_string(),
        }
    }

    async fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let mut commit = StageCommit::new("run_1", 0);
        commit.writes.push(EntityWrite::Document(Document {
            doc_id: "doc_1".to_string(),
            file_name: "a.txt".to_string(),
            doc_type: DocType::Enforcement,
            text: String::new(),
            ingested_at: Utc::now(),
        }));
        commit.writes.push(EntityWrite::Chunk(chunk(
            "doc_1_c0000",
            "doc_1",
            0,
            "Provider billed Medicare for phantom visits and upcoded claims.",
        )));
        commit.writes.push(EntityWrite::Chunk(chunk(
            "doc_1_c0001",
            "doc_1",
            1,
            "The weather on the day of the announcement was mild.",
        )));
        store.commit(commit).await.unwrap();
        store
    }

    #[tokio::test]
    async fn relevant_chunk_ranks_first() {
        let store = seeded_store().await;
        let builder = ContextBuilder::new(store, RetrievalConfig::default());

        let results = builder
            .retrieve("phantom billing claims", None)
            .await
            .unwrap();
        assert_eq!(results[0].chunk.chunk_id, "doc_1_c0000");
        assert!(results[0].score > results[1].score);
    }

    #[tokio::test]
    async fn empty_corpus_returns_empty() {
        let store = Arc::new(MemoryStore::new());
        let builder = ContextBuilder::new(store, RetrievalConfig::default());
        assert!(builder.retrieve("anything", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scope_excludes_other_document_types() {
        let store = seeded_store().await;
        let mut commit = StageCommit::new("run_1", 0);
        commit.writes.push(EntityWrite::Document(Document {
            doc_id: "doc_2".to_string(),
            file_name: "grant.txt".to_string(),
            doc_type: DocType::Policy,
            text: String::new(),
            ingested_at: Utc::now(),
        }));
        commit.writes.push(EntityWrite::Chunk(chunk(
            "doc_2_c0000",
            "doc_2",
            0,
            "Phantom billing is addressed by the grant's claims review.",
        )));
        store.commit(commit).await.unwrap();
        let builder = ContextBuilder::new(store, RetrievalConfig::default());

        let results = builder
            .retrieve("phantom billing claims", Some(DocType::Enforcement))
            .await
            .unwrap();
        assert!(!results.is_empty());
        assert!(results.iter().all(|r| r.chunk.doc_id == "doc_1"));
    }

    #[tokio::test]
    async fn respects_max_chunks_and_char_cap() {
        let store = seeded_store().await;
        let config = RetrievalConfig {
            max_chunks: 1,
            max_chars_per_chunk: 20,
            ..RetrievalConfig::default()
        };
        let builder = ContextBuilder::new(store, config);

        let results = builder.retrieve("phantom billing", None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].chunk.text.len() <= 20);
    }

    #[test]
    fn tfidf_downweights_ubiquitous_terms() {
        let chunks = vec![
            chunk("c0", "d", 0, "claims claims claims"),
            chunk("c1", "d", 1, "claims phantom visits"),
            chunk("c2", "d", 2, "claims enrollment audit"),
        ];
        let scores = TfIdfScorer.score("phantom", &chunks);
        assert!(scores[1] > scores[0]);
        assert!(scores[1] > scores[2]);
    }
}
