//! Content-addressed vector chunk store.
//!
//! Embeddings are memoized by sha256 content hash: identical text is billed
//! and computed once, enforced per-process by a single-flight moka cache and
//! across restarts by the chunk repository. A failed embedding never
//! populates the cache.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use moka::future::Cache;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::RetrievalError;
use crate::provider::ModelProvider;

/// Chunkable type recorded for ad-hoc query embeddings; excluded from search
/// results so queries never surface as knowledge.
const QUERY_CHUNKABLE: &str = "query";

/// A retrievable unit of knowledge text with its cached embedding.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Chunk {
    pub id: String,
    pub chunkable_type: String,
    pub chunkable_id: String,
    pub scope: String,
    pub content: String,
    pub content_hash: String,
    pub embedding: Vec<f32>,
    pub tokens_used: u32,
}

/// Persistence seam for chunk rows. Orphan cleanup is owned by the
/// surrounding deletion workflow, not this store.
#[async_trait]
pub trait ChunkRepository: Send + Sync + Debug {
    async fn find_by_hash(&self, content_hash: &str) -> Option<Chunk>;
    async fn insert(&self, chunk: Chunk);
    async fn all_in_scope(&self, scope: &str) -> Vec<Chunk>;
}

#[derive(Debug, Default)]
pub struct InMemoryChunkRepository {
    chunks: DashMap<String, Chunk>,
}

impl InMemoryChunkRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

#[async_trait]
impl ChunkRepository for InMemoryChunkRepository {
    async fn find_by_hash(&self, content_hash: &str) -> Option<Chunk> {
        self.chunks
            .iter()
            .find(|c| c.content_hash == content_hash)
            .map(|c| c.clone())
    }

    async fn insert(&self, chunk: Chunk) {
        self.chunks.insert(chunk.id.clone(), chunk);
    }

    async fn all_in_scope(&self, scope: &str) -> Vec<Chunk> {
        self.chunks
            .iter()
            .filter(|c| c.scope == scope)
            .map(|c| c.clone())
            .collect()
    }
}

pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Clone)]
struct CachedEmbedding {
    vector: Arc<Vec<f32>>,
    tokens_used: u32,
}

/// Embedding cache + nearest-neighbor search over a [`ChunkRepository`].
pub struct ChunkStore {
    provider: Arc<dyn ModelProvider>,
    repo: Arc<dyn ChunkRepository>,
    cache: Cache<String, CachedEmbedding>,
}

impl ChunkStore {
    pub fn new(provider: Arc<dyn ModelProvider>, repo: Arc<dyn ChunkRepository>) -> Self {
        Self {
            provider,
            repo,
            cache: Cache::builder().max_capacity(10_000).build(),
        }
    }

    /// Embeds `text`, memoized by content hash. Concurrent callers with the
    /// same hash share one in-flight provider call (`try_get_with`); errors
    /// propagate to every waiter and leave the cache unpopulated.
    pub async fn embed(&self, text: &str) -> Result<Arc<Vec<f32>>, RetrievalError> {
        Ok(self.embedding_for(text).await?.vector)
    }

    async fn embedding_for(&self, text: &str) -> Result<CachedEmbedding, RetrievalError> {
        let hash = content_hash(text);
        let provider = self.provider.clone();
        let repo = self.repo.clone();
        let lookup_hash = hash.clone();
        let text = text.to_string();

        self.cache
            .try_get_with(hash, async move {
                if let Some(chunk) = repo.find_by_hash(&lookup_hash).await {
                    debug!(hash = %lookup_hash, "embedding served from chunk repository");
                    return Ok(CachedEmbedding {
                        vector: Arc::new(chunk.embedding),
                        tokens_used: chunk.tokens_used,
                    });
                }
                let out = provider
                    .generate_embeddings(&text)
                    .await
                    .map_err(|e| RetrievalError::Embedding(e.to_string()))?;
                if out.vector.is_empty() {
                    return Err(RetrievalError::EmptyEmbedding);
                }
                Ok(CachedEmbedding { vector: Arc::new(out.vector), tokens_used: out.tokens_used })
            })
            .await
            .map_err(|e: Arc<RetrievalError>| (*e).clone())
    }

    /// Upserts a knowledge chunk. Re-indexing byte-identical text reuses the
    /// cached embedding and is a no-op on the provider.
    pub async fn index(
        &self,
        scope: &str,
        chunkable_type: &str,
        chunkable_id: &str,
        text: &str,
    ) -> Result<Chunk, RetrievalError> {
        let hash = content_hash(text);
        if let Some(existing) = self.repo.find_by_hash(&hash).await {
            if existing.chunkable_type == chunkable_type
                && existing.chunkable_id == chunkable_id
                && existing.scope == scope
            {
                return Ok(existing);
            }
        }

        let embedding = self.embedding_for(text).await?;
        let chunk = Chunk {
            id: uuid::Uuid::new_v4().to_string(),
            chunkable_type: chunkable_type.to_string(),
            chunkable_id: chunkable_id.to_string(),
            scope: scope.to_string(),
            content: text.to_string(),
            content_hash: hash,
            embedding: embedding.vector.as_ref().clone(),
            tokens_used: embedding.tokens_used,
        };
        self.repo.insert(chunk.clone()).await;
        Ok(chunk)
    }

    /// Nearest chunks for `query` within `scope`, ranked by cosine
    /// similarity, best first. The query embedding is persisted as its own
    /// content-addressed row so a repeated query costs nothing.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        scope: &str,
    ) -> Result<Vec<Chunk>, RetrievalError> {
        let hash = content_hash(query);
        let embedding = self.embedding_for(query).await?;

        if self.repo.find_by_hash(&hash).await.is_none() {
            self.repo
                .insert(Chunk {
                    id: uuid::Uuid::new_v4().to_string(),
                    chunkable_type: QUERY_CHUNKABLE.to_string(),
                    chunkable_id: hash.clone(),
                    scope: scope.to_string(),
                    content: query.to_string(),
                    content_hash: hash,
                    embedding: embedding.vector.as_ref().clone(),
                    tokens_used: embedding.tokens_used,
                })
                .await;
        }

        let mut scored: Vec<(f32, Chunk)> = self
            .repo
            .all_in_scope(scope)
            .await
            .into_iter()
            .filter(|c| c.chunkable_type != QUERY_CHUNKABLE)
            .map(|c| (cosine_similarity(&embedding.vector, &c.embedding), c))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored.into_iter().take(limit).map(|(_, c)| c).collect())
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a < f32::EPSILON || mag_b < f32::EPSILON {
        return 0.0;
    }
    dot / (mag_a * mag_b)
}
