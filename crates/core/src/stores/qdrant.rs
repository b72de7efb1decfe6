use crate::embeddings::Embedder;
use crate::models::{ChunkFilter, ChunkRecord, SearchStrategy, StoredChunk, META_CHUNK_INDEX, META_SOURCE};
use crate::traits::VectorStore;
use crate::SearchError;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Map, Value};
use tracing::debug;
use url::Url;
use uuid::Uuid;

const BACKEND: &str = "qdrant";
const TEXT_KEY: &str = "text";
const EXTERNAL_ID_KEY: &str = "external_id";
const UPSERT_BATCH: usize = 256;
const SCROLL_PAGE: usize = 256;

pub struct QdrantStore<E> {
    endpoint: String,
    collection: String,
    client: Client,
    embedder: E,
}

impl<E: Embedder> QdrantStore<E> {
    pub fn new(
        endpoint: &str,
        collection: impl Into<String>,
        embedder: E,
    ) -> Result<Self, SearchError> {
        Url::parse(endpoint)?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            collection: collection.into(),
            client: Client::new(),
            embedder,
        })
    }

    fn collection_url(&self, suffix: &str) -> String {
        format!("{}/collections/{}{}", self.endpoint, self.collection, suffix)
    }

    /// Creates the collection and its payload indexes when missing.
    pub async fn ensure_collection(&self) -> Result<(), SearchError> {
        let existing = self.client.get(self.collection_url("")).send().await?;
        if existing.status().is_success() {
            return Ok(());
        }
        if existing.status() != StatusCode::NOT_FOUND {
            return Err(backend_error(existing.status()));
        }

        let created = self
            .client
            .put(self.collection_url(""))
            .json(&json!({
                "vectors": {
                    "size": self.embedder.dimensions(),
                    "distance": "Cosine",
                }
            }))
            .send()
            .await?;
        check_status(created)?;

        for (field, schema) in [(META_SOURCE, "keyword"), (META_CHUNK_INDEX, "integer")] {
            let indexed = self
                .client
                .put(self.collection_url("/index?wait=true"))
                .json(&json!({ "field_name": field, "field_schema": schema }))
                .send()
                .await?;
            check_status(indexed)?;
        }

        debug!(collection = %self.collection, "created qdrant collection");
        Ok(())
    }

    async fn post_points(&self, suffix: &str, body: &Value) -> Result<Value, SearchError> {
        let response = self
            .client
            .post(self.collection_url(suffix))
            .json(body)
            .send()
            .await?;
        Ok(check_status(response)?.json().await?)
    }
}

/// Stable point id derived from the external `{filename}_{index}` id.
pub fn point_id(external_id: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, external_id.as_bytes())
}

fn backend_error(status: StatusCode) -> SearchError {
    SearchError::BackendResponse {
        backend: BACKEND.to_string(),
        details: status.to_string(),
    }
}

fn check_status(response: Response) -> Result<Response, SearchError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(backend_error(response.status()))
    }
}

fn point_body(record: &ChunkRecord, vector: Vec<f32>) -> Value {
    let mut payload = record.metadata.clone();
    payload.insert(TEXT_KEY.to_string(), Value::from(record.text.clone()));
    payload.insert(EXTERNAL_ID_KEY.to_string(), Value::from(record.id.clone()));

    json!({
        "id": point_id(&record.id).to_string(),
        "vector": vector,
        "payload": payload,
    })
}

/// `source` must match and `chunk_index` must fall in at least one range.
fn scroll_body(filter: &ChunkFilter, offset: Option<&Value>) -> Value {
    let ranges = filter
        .chunk_ranges
        .iter()
        .map(|range| {
            json!({
                "key": META_CHUNK_INDEX,
                "range": { "gte": range.start(), "lte": range.end() },
            })
        })
        .collect::<Vec<_>>();

    let mut body = json!({
        "filter": {
            "must": [{ "key": META_SOURCE, "match": { "value": filter.source } }],
            "should": ranges,
        },
        "limit": SCROLL_PAGE,
        "with_payload": true,
        "with_vector": false,
    });
    if let Some(offset) = offset {
        body["offset"] = offset.clone();
    }
    body
}

fn next_page_offset(parsed: &Value) -> Option<Value> {
    parsed
        .pointer("/result/next_page_offset")
        .filter(|offset| !offset.is_null())
        .cloned()
}

fn search_body(vector: &[f32], k: usize, strategy: SearchStrategy) -> (&'static str, Value) {
    match strategy {
        SearchStrategy::Similarity => (
            "/points/search",
            json!({
                "vector": vector,
                "limit": k,
                "with_payload": true,
            }),
        ),
        SearchStrategy::Mmr { fetch_k, lambda } => (
            "/points/query",
            json!({
                "query": {
                    "nearest": vector,
                    "mmr": {
                        "diversity": 1.0 - lambda.clamp(0.0, 1.0),
                        "candidates_limit": fetch_k.max(k),
                    }
                },
                "limit": k,
                "with_payload": true,
            }),
        ),
    }
}

/// Reads `/result` (search) or `/result/points` (query, scroll).
fn points_from_response(parsed: &Value) -> Result<Vec<StoredChunk>, SearchError> {
    let points = parsed
        .pointer("/result/points")
        .or_else(|| parsed.pointer("/result"))
        .and_then(Value::as_array)
        .ok_or_else(|| SearchError::BackendResponse {
            backend: BACKEND.to_string(),
            details: "response has no result points".to_string(),
        })?;

    Ok(points.iter().map(point_to_chunk).collect())
}

fn point_to_chunk(point: &Value) -> StoredChunk {
    let mut metadata = point
        .pointer("/payload")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_else(Map::new);
    let text = metadata
        .remove(TEXT_KEY)
        .and_then(|value| value.as_str().map(str::to_string))
        .unwrap_or_default();
    metadata.remove(EXTERNAL_ID_KEY);

    StoredChunk {
        text,
        metadata,
        score: point.pointer("/score").and_then(Value::as_f64),
    }
}

#[async_trait]
impl<E: Embedder> VectorStore for QdrantStore<E> {
    fn name(&self) -> &str {
        &self.collection
    }

    async fn upsert(&self, records: &[ChunkRecord]) -> Result<(), SearchError> {
        for batch in records.chunks(UPSERT_BATCH) {
            let texts = batch.iter().map(|record| record.text.as_str()).collect::<Vec<_>>();
            let points = batch
                .iter()
                .zip(self.embedder.embed_batch(&texts))
                .map(|(record, vector)| point_body(record, vector))
                .collect::<Vec<_>>();

            let response = self
                .client
                .put(self.collection_url("/points?wait=true"))
                .json(&json!({ "points": points }))
                .send()
                .await?;
            check_status(response)?;
        }

        Ok(())
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

        let vector = self.embedder.embed(query);
        let (suffix, body) = search_body(&vector, k, strategy);
        let parsed = self.post_points(suffix, &body).await?;
        points_from_response(&parsed)
    }

    async fn get(&self, filter: &ChunkFilter) -> Result<Vec<StoredChunk>, SearchError> {
        if filter.is_empty() {
            return Ok(Vec::new());
        }

        let mut chunks = Vec::new();
        let mut offset = None;
        loop {
            let body = scroll_body(filter, offset.as_ref());
            let parsed = self.post_points("/points/scroll", &body).await?;
            chunks.extend(points_from_response(&parsed)?);

            match next_page_offset(&parsed) {
                Some(next) => offset = Some(next),
                None => break,
            }
        }

        Ok(chunks)
    }

    async fn drop_all(&self) -> Result<(), SearchError> {
        let response = self.client.delete(self.collection_url("")).send().await?;
        if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
            return Err(backend_error(response.status()));
        }

        self.ensure_collection().await
    }
}
