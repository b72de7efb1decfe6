use crate::models::{ChunkFilter, ChunkRecord, DocumentElement, SearchStrategy, StoredChunk};
use crate::{IngestError, SearchError};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

/// Turns one source file into ordered document elements.
pub trait DocumentConverter: Send + Sync {
    fn convert(&self, path: &Path) -> Result<Vec<DocumentElement>, IngestError>;
}

/// Embedding-backed chunk storage. Implementations embed on upsert and on
/// search; callers only deal in text and metadata.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Collection name, also the confirmation token for destructive rebuilds.
    fn name(&self) -> &str;

    /// Idempotent per `ChunkRecord::id`.
    async fn upsert(&self, records: &[ChunkRecord]) -> Result<(), SearchError>;

    async fn search(
        &self,
        query: &str,
        k: usize,
        strategy: SearchStrategy,
    ) -> Result<Vec<StoredChunk>, SearchError>;

    /// Exact metadata match, unranked.
    async fn get(&self, filter: &ChunkFilter) -> Result<Vec<StoredChunk>, SearchError>;

    /// Destroys all persisted data and leaves an empty, usable store.
    async fn drop_all(&self) -> Result<(), SearchError>;
}

#[async_trait]
impl<T: VectorStore + ?Sized> VectorStore for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn upsert(&self, records: &[ChunkRecord]) -> Result<(), SearchError> {
        (**self).upsert(records).await
    }

    async fn search(
        &self,
        query: &str,
        k: usize,
        strategy: SearchStrategy,
    ) -> Result<Vec<StoredChunk>, SearchError> {
        (**self).search(query, k, strategy).await
    }

    async fn get(&self, filter: &ChunkFilter) -> Result<Vec<StoredChunk>, SearchError> {
        (**self).get(filter).await
    }

    async fn drop_all(&self) -> Result<(), SearchError> {
        (**self).drop_all().await
    }
}

#[async_trait]
impl<T: VectorStore + ?Sized> VectorStore for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn upsert(&self, records: &[ChunkRecord]) -> Result<(), SearchError> {
        (**self).upsert(records).await
    }

    async fn search(
        &self,
        query: &str,
        k: usize,
        strategy: SearchStrategy,
    ) -> Result<Vec<StoredChunk>, SearchError> {
        (**self).search(query, k, strategy).await
    }

    async fn get(&self, filter: &ChunkFilter) -> Result<Vec<StoredChunk>, SearchError> {
        (**self).get(filter).await
    }

    async fn drop_all(&self) -> Result<(), SearchError> {
        (**self).drop_all().await
    }
}
