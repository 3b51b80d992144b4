//! Historical-case retrieval with graceful degradation.
//!
//! Retrieval never fails a run. Every call returns a tagged
//! [`HistoricalContext`]: `Available` with ranked cases, or `Absent` with
//! the reason retrieval could not contribute. Callers branch on the tag;
//! they never assume presence.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use precheck_core::{
    ContentTag, EmbeddingRecord, HistoricalContext, SimilarCase, VehicleMetadata, VisionEnvelope,
};

use crate::config::RetrievalConfig;
use crate::providers::{EmbeddingModel, ProviderError};
use crate::store::Datastore;

/// Errors from the vector index.
#[derive(Error, Debug, Clone)]
pub enum IndexError {
    #[error("index unavailable: {0}")]
    Unavailable(String),

    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// One raw index match.
#[derive(Debug, Clone)]
pub struct IndexMatch {
    pub record: EmbeddingRecord,
    pub similarity: f64,
}

/// Nearest-neighbor search over stored embeddings.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert a record. The vector dimension must match the index.
    async fn insert(&self, record: EmbeddingRecord) -> Result<(), IndexError>;

    /// Ranked matches at or above `threshold`, optionally filtered by
    /// content tag, best first.
    async fn search(
        &self,
        vector: &[f32],
        threshold: f64,
        limit: usize,
        tag: Option<ContentTag>,
    ) -> Result<Vec<IndexMatch>, IndexError>;
}

/// In-memory cosine-similarity index.
pub struct MemoryVectorIndex {
    dim: usize,
    records: parking_lot::RwLock<Vec<EmbeddingRecord>>,
}

impl MemoryVectorIndex {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            records: parking_lot::RwLock::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let norm_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn insert(&self, record: EmbeddingRecord) -> Result<(), IndexError> {
        if record.vector.len() != self.dim {
            return Err(IndexError::DimensionMismatch {
                expected: self.dim,
                got: record.vector.len(),
            });
        }
        self.records.write().push(record);
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        threshold: f64,
        limit: usize,
        tag: Option<ContentTag>,
    ) -> Result<Vec<IndexMatch>, IndexError> {
        if vector.len() != self.dim {
            return Err(IndexError::DimensionMismatch {
                expected: self.dim,
                got: vector.len(),
            });
        }

        let mut matches: Vec<IndexMatch> = self
            .records
            .read()
            .iter()
            .filter(|r| tag.map_or(true, |t| r.content_tag == t))
            .map(|r| IndexMatch {
                similarity: cosine_similarity(vector, &r.vector),
                record: r.clone(),
            })
            .filter(|m| m.similarity >= threshold)
            .collect();

        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(limit);
        Ok(matches)
    }
}

/// An index that is permanently unavailable. Used to exercise the degraded
/// path without a backing service.
pub struct UnavailableIndex;

#[async_trait]
impl VectorIndex for UnavailableIndex {
    async fn insert(&self, _record: EmbeddingRecord) -> Result<(), IndexError> {
        Err(IndexError::Unavailable("index offline".to_string()))
    }

    async fn search(
        &self,
        _vector: &[f32],
        _threshold: f64,
        _limit: usize,
        _tag: Option<ContentTag>,
    ) -> Result<Vec<IndexMatch>, IndexError> {
        Err(IndexError::Unavailable("index offline".to_string()))
    }
}

/// Retrieval front door: embeds queries (cached), searches the index, and
/// enriches matches with each case's metadata and latest outcome.
pub struct Retriever {
    embedder: Arc<dyn EmbeddingModel>,
    index: Arc<dyn VectorIndex>,
    store: Arc<dyn Datastore>,
    cache: Cache<String, Arc<Vec<f32>>>,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn EmbeddingModel>,
        index: Arc<dyn VectorIndex>,
        store: Arc<dyn Datastore>,
        config: RetrievalConfig,
    ) -> Self {
        let cache = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(Duration::from_secs(3600))
            .build();
        Self {
            embedder,
            index,
            store,
            cache,
            config,
        }
    }

    /// Embed text, consulting the cache first so repeated queries do not
    /// re-call the embedding model.
    async fn embed_cached(&self, text: &str) -> Result<Arc<Vec<f32>>, ProviderError> {
        let key = text.to_string();
        self.cache
            .try_get_with(key, async {
                self.embedder.embed(text).await.map(Arc::new)
            })
            .await
            .map_err(|e: Arc<ProviderError>| match e.as_ref() {
                ProviderError::RateLimited { retry_after } => ProviderError::RateLimited {
                    retry_after: *retry_after,
                },
                other => ProviderError::HttpError(other.to_string()),
            })
    }

    /// Find similar historical cases for a query text.
    ///
    /// Every failure mode (empty query, embedding unavailable, index
    /// offline) degrades to [`HistoricalContext::Absent`] with the reason.
    pub async fn similar_cases(&self, query_text: &str) -> HistoricalContext {
        if query_text.trim().is_empty() {
            return HistoricalContext::Absent {
                reason: "empty query text".to_string(),
            };
        }

        let vector = match self.embed_cached(query_text).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "embedding unavailable, retrieval degraded");
                return HistoricalContext::Absent {
                    reason: format!("embedding unavailable: {e}"),
                };
            }
        };

        let matches = match self
            .index
            .search(
                &vector,
                self.config.match_threshold,
                self.config.limit,
                Some(ContentTag::Metadata),
            )
            .await
        {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "vector index unavailable, retrieval degraded");
                return HistoricalContext::Absent {
                    reason: format!("index unavailable: {e}"),
                };
            }
        };

        if matches.is_empty() {
            return HistoricalContext::Absent {
                reason: "no cases above the similarity threshold".to_string(),
            };
        }

        let mut cases = Vec::new();
        for (rank, m) in matches.iter().take(self.config.surfaced).enumerate() {
            let (metadata, outcome) = self.enrich(m.record.appraisal_id).await;
            cases.push(SimilarCase {
                rank: rank + 1,
                similarity: m.similarity,
                metadata,
                matched_text: m.record.source_text.clone(),
                historical_outcome: outcome,
            });
        }

        debug!(count = cases.len(), "retrieval found similar cases");
        HistoricalContext::Available { cases }
    }

    /// Pull the matched case's metadata and latest-run outputs, tolerating
    /// missing rows (the case may predate the current store).
    async fn enrich(
        &self,
        appraisal_id: Uuid,
    ) -> (VehicleMetadata, Option<serde_json::Value>) {
        let Ok(appraisal) = self.store.get_appraisal(appraisal_id).await else {
            return (VehicleMetadata::default(), None);
        };

        let outcome = match appraisal.latest_run_id {
            Some(run_id) => self
                .store
                .get_run(run_id)
                .await
                .ok()
                .and_then(|r| r.outputs)
                .and_then(|o| serde_json::to_value(o).ok()),
            None => None,
        };

        (appraisal.metadata, outcome)
    }

    /// Embed and index text for future retrieval.
    pub async fn index_text(
        &self,
        appraisal_id: Uuid,
        run_id: Option<Uuid>,
        tag: ContentTag,
        text: &str,
    ) -> Result<(), IndexError> {
        let vector = self
            .embed_cached(text)
            .await
            .map_err(|e| IndexError::Unavailable(e.to_string()))?;

        self.index
            .insert(EmbeddingRecord {
                id: Uuid::new_v4(),
                appraisal_id,
                run_id,
                content_tag: tag,
                source_text: text.to_string(),
                vector: vector.as_ref().clone(),
                created_at: chrono::Utc::now(),
            })
            .await
    }
}

/// Build the retrieval query text from the current evidence context:
/// vehicle identity, notes, and observed damage.
pub fn build_query_text(
    metadata: &VehicleMetadata,
    notes: Option<&str>,
    envelopes: &[VisionEnvelope],
) -> String {
    let mut parts = Vec::new();

    if let Some(year) = metadata.year {
        parts.push(format!("Year: {year}"));
    }
    if let Some(make) = &metadata.make {
        parts.push(format!("Make: {make}"));
    }
    if let Some(model) = &metadata.model {
        parts.push(format!("Model: {model}"));
    }
    if let Some(mileage) = metadata.mileage {
        parts.push(format!("Mileage: {mileage}"));
    }

    if let Some(notes) = notes {
        if !notes.trim().is_empty() {
            parts.push(format!("Notes: {}", notes.trim()));
        }
    }

    let damage: Vec<&str> = envelopes
        .iter()
        .flat_map(|e| e.extraction.damage.iter())
        .filter_map(|d| d.description.as_deref())
        .collect();
    if !damage.is_empty() {
        parts.push(format!("Damage: {}", damage.join(", ")));
    }

    parts.join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Utc;

    struct StaticEmbedder(Vec<f32>);

    #[async_trait]
    impl EmbeddingModel for StaticEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
            Ok(self.0.clone())
        }

        fn name(&self) -> &str {
            "static"
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl EmbeddingModel for FailingEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
            Err(ProviderError::HttpError("connection refused".to_string()))
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    fn record(appraisal_id: Uuid, vector: Vec<f32>, text: &str) -> EmbeddingRecord {
        EmbeddingRecord {
            id: Uuid::new_v4(),
            appraisal_id,
            run_id: None,
            content_tag: ContentTag::Metadata,
            source_text: text.to_string(),
            vector,
            created_at: Utc::now(),
        }
    }

    fn small_config() -> RetrievalConfig {
        RetrievalConfig {
            embedding_dim: 3,
            ..RetrievalConfig::default()
        }
    }

    #[tokio::test]
    async fn test_cosine_search_ranks_by_similarity() {
        let index = MemoryVectorIndex::new(3);
        index
            .insert(record(Uuid::new_v4(), vec![1.0, 0.0, 0.0], "exact"))
            .await
            .unwrap();
        index
            .insert(record(Uuid::new_v4(), vec![0.8, 0.6, 0.0], "close"))
            .await
            .unwrap();
        index
            .insert(record(Uuid::new_v4(), vec![0.0, 0.0, 1.0], "orthogonal"))
            .await
            .unwrap();

        let matches = index
            .search(&[1.0, 0.0, 0.0], 0.7, 5, Some(ContentTag::Metadata))
            .await
            .unwrap();

        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].record.source_text, "exact");
        assert!(matches[0].similarity > matches[1].similarity);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let index = MemoryVectorIndex::new(3);
        let result = index
            .insert(record(Uuid::new_v4(), vec![1.0, 0.0], "short"))
            .await;
        assert!(matches!(result, Err(IndexError::DimensionMismatch { .. })));
    }

    #[tokio::test]
    async fn test_embedding_failure_degrades() {
        let retriever = Retriever::new(
            Arc::new(FailingEmbedder),
            Arc::new(MemoryVectorIndex::new(3)),
            Arc::new(MemoryStore::new()),
            small_config(),
        );

        let outcome = retriever.similar_cases("2020 Toyota Camry").await;
        match outcome {
            HistoricalContext::Absent { reason } => {
                assert!(reason.contains("embedding unavailable"));
            }
            other => panic!("expected degraded outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_index_unavailable_degrades() {
        let retriever = Retriever::new(
            Arc::new(StaticEmbedder(vec![1.0, 0.0, 0.0])),
            Arc::new(UnavailableIndex),
            Arc::new(MemoryStore::new()),
            small_config(),
        );

        let outcome = retriever.similar_cases("2020 Toyota Camry").await;
        assert!(!outcome.is_available());
    }

    #[tokio::test]
    async fn test_empty_query_degrades_without_calls() {
        let retriever = Retriever::new(
            Arc::new(FailingEmbedder),
            Arc::new(UnavailableIndex),
            Arc::new(MemoryStore::new()),
            small_config(),
        );
        let outcome = retriever.similar_cases("   ").await;
        match outcome {
            HistoricalContext::Absent { reason } => assert!(reason.contains("empty")),
            other => panic!("expected degraded outcome, got {other:?}"),
        }
    }

    #[test]
    fn test_build_query_text() {
        let metadata = VehicleMetadata {
            year: Some(2020),
            make: Some("Toyota".to_string()),
            model: Some("Camry".to_string()),
            mileage: Some(42_000.0),
            ..Default::default()
        };
        let text = build_query_text(&metadata, Some("clean title"), &[]);
        assert_eq!(
            text,
            "Year: 2020 | Make: Toyota | Model: Camry | Mileage: 42000 | Notes: clean title"
        );

        assert_eq!(build_query_text(&VehicleMetadata::default(), None, &[]), "");
    }
}
