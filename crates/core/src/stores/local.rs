use crate::embeddings::{cosine_similarity, Embedder};
use crate::models::{ChunkFilter, ChunkRecord, SearchStrategy, StoredChunk};
use crate::traits::VectorStore;
use crate::SearchError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LocalPoint {
    id: String,
    text: String,
    metadata: Map<String, Value>,
    vector: Vec<f32>,
}

impl LocalPoint {
    fn to_chunk(&self, score: Option<f64>) -> StoredChunk {
        StoredChunk {
            text: self.text.clone(),
            metadata: self.metadata.clone(),
            score,
        }
    }
}

/// In-process vector store. With a path, every write is mirrored to a JSON
/// file that is loaded again by [`LocalStore::open`].
pub struct LocalStore<E> {
    name: String,
    embedder: E,
    path: Option<PathBuf>,
    points: RwLock<BTreeMap<String, LocalPoint>>,
}

impl<E: Embedder> LocalStore<E> {
    pub fn in_memory(name: impl Into<String>, embedder: E) -> Self {
        Self {
            name: name.into(),
            embedder,
            path: None,
            points: RwLock::new(BTreeMap::new()),
        }
    }

    pub async fn open(
        name: impl Into<String>,
        embedder: E,
        path: impl Into<PathBuf>,
    ) -> Result<Self, SearchError> {
        let path = path.into();
        let points = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Vec<LocalPoint>>(&bytes)?
                .into_iter()
                .map(|point| (point.id.clone(), point))
                .collect(),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(error) => return Err(error.into()),
        };
        debug!(path = %path.display(), points = points.len(), "opened local store");

        Ok(Self {
            name: name.into(),
            embedder,
            path: Some(path),
            points: RwLock::new(points),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> Result<usize, SearchError> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, SearchError> {
        Ok(self.read()?.is_empty())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, LocalPoint>>, SearchError> {
        self.points
            .read()
            .map_err(|_| SearchError::NotReady(format!("local store `{}` lock poisoned", self.name)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, LocalPoint>>, SearchError> {
        self.points
            .write()
            .map_err(|_| SearchError::NotReady(format!("local store `{}` lock poisoned", self.name)))
    }

    async fn persist(&self) -> Result<(), SearchError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let snapshot = {
            let points = self.read()?;
            serde_json::to_vec(&points.values().collect::<Vec<_>>())?
        };

        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, snapshot).await?;
        Ok(())
    }

    /// Candidates ranked by similarity to `query_vector`, best first.
    fn ranked(&self, query_vector: &[f32], limit: usize) -> Result<Vec<(f32, LocalPoint)>, SearchError> {
        let points = self.read()?;
        let mut scored = points
            .values()
            .map(|point| (cosine_similarity(query_vector, &point.vector), point))
            .collect::<Vec<_>>();
        scored.sort_by(|left, right| {
            right
                .0
                .total_cmp(&left.0)
                .then_with(|| left.1.id.cmp(&right.1.id))
        });

        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(score, point)| (score, point.clone()))
            .collect())
    }
}

/// Greedy maximal marginal relevance selection over pre-ranked candidates.
fn select_mmr(candidates: Vec<(f32, LocalPoint)>, k: usize, lambda: f32) -> Vec<(f32, LocalPoint)> {
    let mut remaining = candidates;
    let mut selected: Vec<(f32, LocalPoint)> = Vec::new();

    while selected.len() < k && !remaining.is_empty() {
        let mut best_position = 0;
        let mut best_score = f32::NEG_INFINITY;

        for (position, (relevance, point)) in remaining.iter().enumerate() {
            let redundancy = selected
                .iter()
                .map(|(_, chosen)| cosine_similarity(&point.vector, &chosen.vector))
                .fold(0.0f32, f32::max);
            let score = lambda * relevance - (1.0 - lambda) * redundancy;
            if score > best_score {
                best_score = score;
                best_position = position;
            }
        }

        selected.push(remaining.remove(best_position));
    }

    selected
}

#[async_trait]
impl<E: Embedder> VectorStore for LocalStore<E> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upsert(&self, records: &[ChunkRecord]) -> Result<(), SearchError> {
        if records.is_empty() {
            return Ok(());
        }

        let texts = records.iter().map(|record| record.text.as_str()).collect::<Vec<_>>();
        let vectors = self.embedder.embed_batch(&texts);

        {
            let mut points = self.write()?;
            for (record, vector) in records.iter().zip(vectors) {
                points.insert(
                    record.id.clone(),
                    LocalPoint {
                        id: record.id.clone(),
                        text: record.text.clone(),
                        metadata: record.metadata.clone(),
                        vector,
                    },
                );
            }
        }

        self.persist().await
    }

    async fn search(
        &self,
        query: &str,
        k: usize,
        strategy: SearchStrategy,
    ) -> Result<Vec<StoredChunk>, SearchError> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let query_vector = self.embedder.embed(query);
        let hits = match strategy {
            SearchStrategy::Similarity => self.ranked(&query_vector, k)?,
            SearchStrategy::Mmr { fetch_k, lambda } => {
                let candidates = self.ranked(&query_vector, fetch_k.max(k))?;
                select_mmr(candidates, k, lambda.clamp(0.0, 1.0))
            }
        };

        Ok(hits
            .into_iter()
            .map(|(score, point)| point.to_chunk(Some(score as f64)))
            .collect())
    }

    async fn get(&self, filter: &ChunkFilter) -> Result<Vec<StoredChunk>, SearchError> {
        let points = self.read()?;
        let mut matched = points
            .values()
            .filter(|point| filter.matches(&point.metadata))
            .map(|point| point.to_chunk(None))
            .collect::<Vec<_>>();
        matched.sort_by_key(|chunk| chunk.chunk_index());
        Ok(matched)
    }

    async fn drop_all(&self) -> Result<(), SearchError> {
        self.write()?.clear();

        if let Some(path) = &self.path {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                Err(error) => return Err(error.into()),
            }
        }
        Ok(())
    }
}
