use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::ops::RangeInclusive;
use std::path::PathBuf;

pub const META_SOURCE: &str = "source";
pub const META_FILENAME: &str = "filename";
pub const META_PAGE_NUMBER: &str = "page_number";
pub const META_HEADINGS: &str = "headings";
pub const META_CHUNK_INDEX: &str = "chunk_index";

/// Page recorded when the converter could not attribute content to a page.
pub const DEFAULT_PAGE_NUMBER: u32 = 1;

/// Separator used when the heading breadcrumb is flattened for storage.
pub const HEADING_SEPARATOR: &str = " > ";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ElementCategory {
    Title,
    NarrativeText,
    ListItem,
    Table,
    Header,
    Footer,
    Uncategorized,
}

/// A heading as reported by a converter: either a bare string or an object
/// carrying a `text` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Heading {
    PlainText(String),
    Structured { text: String },
}

impl Heading {
    pub fn as_text(&self) -> &str {
        match self {
            Heading::PlainText(text) => text,
            Heading::Structured { text } => text,
        }
    }
}

impl From<&str> for Heading {
    fn from(value: &str) -> Self {
        Heading::PlainText(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentElement {
    pub text: String,
    pub category: ElementCategory,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub headings: Vec<Heading>,
}

impl DocumentElement {
    pub fn new(category: ElementCategory, page: u32, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            category,
            page: Some(page),
            headings: Vec::new(),
        }
    }

    pub fn with_headings(mut self, headings: Vec<Heading>) -> Self {
        self.headings = headings;
        self
    }

    pub fn is_title(&self) -> bool {
        self.category == ElementCategory::Title
    }
}

/// `(source, chunk_index)`: the identity of a stored chunk.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkKey {
    pub source: String,
    pub chunk_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub source: String,
    pub filename: String,
    pub page_number: u32,
    pub headings: Vec<String>,
    pub chunk_index: u64,
}

impl Chunk {
    pub fn key(&self) -> ChunkKey {
        ChunkKey {
            source: self.source.clone(),
            chunk_index: self.chunk_index,
        }
    }

    /// External id handed to the vector store: `{filename}_{chunk_index}`.
    pub fn external_id(&self) -> String {
        format!("{}_{}", self.filename, self.chunk_index)
    }

    pub fn flattened_headings(&self) -> String {
        self.headings.join(HEADING_SEPARATOR)
    }

    /// Flat metadata in the persisted layout.
    pub fn metadata(&self) -> Map<String, Value> {
        let mut metadata = Map::new();
        metadata.insert(META_SOURCE.to_string(), Value::from(self.source.clone()));
        metadata.insert(META_FILENAME.to_string(), Value::from(self.filename.clone()));
        metadata.insert(META_PAGE_NUMBER.to_string(), Value::from(self.page_number));
        metadata.insert(META_HEADINGS.to_string(), Value::from(self.flattened_headings()));
        metadata.insert(META_CHUNK_INDEX.to_string(), Value::from(self.chunk_index));
        metadata
    }
}

/// Drops metadata values a flat key/value store cannot persist.
pub fn filter_complex_metadata(metadata: Map<String, Value>) -> Map<String, Value> {
    metadata
        .into_iter()
        .filter(|(_, value)| matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_)))
        .collect()
}

/// A chunk ready for upsert: external id, text and storable metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkRecord {
    pub id: String,
    pub text: String,
    pub metadata: Map<String, Value>,
}

impl From<&Chunk> for ChunkRecord {
    fn from(chunk: &Chunk) -> Self {
        Self {
            id: chunk.external_id(),
            text: chunk.text.clone(),
            metadata: filter_complex_metadata(chunk.metadata()),
        }
    }
}

/// A chunk as read back from a vector store. Metadata is untyped here because
/// stored data may predate or violate the current layout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredChunk {
    pub text: String,
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl StoredChunk {
    pub fn new(text: impl Into<String>, metadata: Map<String, Value>) -> Self {
        Self {
            text: text.into(),
            metadata,
            score: None,
        }
    }

    pub fn source(&self) -> Option<&str> {
        self.metadata.get(META_SOURCE).and_then(Value::as_str)
    }

    pub fn filename(&self) -> Option<&str> {
        self.metadata.get(META_FILENAME).and_then(Value::as_str)
    }

    pub fn headings(&self) -> Option<&str> {
        self.metadata
            .get(META_HEADINGS)
            .and_then(Value::as_str)
            .filter(|headings| !headings.is_empty())
    }

    pub fn chunk_index(&self) -> Option<u64> {
        self.metadata.get(META_CHUNK_INDEX).and_then(Value::as_u64)
    }

    pub fn page_number(&self) -> Option<u64> {
        self.metadata.get(META_PAGE_NUMBER).and_then(Value::as_u64)
    }

    /// `None` when either half of the identity is missing or malformed.
    pub fn key(&self) -> Option<ChunkKey> {
        Some(ChunkKey {
            source: self.source()?.to_string(),
            chunk_index: self.chunk_index()?,
        })
    }

    /// Ordering key for result presentation; missing parts sort as empty / 0.
    pub fn sort_key(&self) -> (String, u64, u64) {
        (
            self.source().unwrap_or_default().to_string(),
            self.page_number().unwrap_or(0),
            self.chunk_index().unwrap_or(0),
        )
    }
}

impl From<ChunkRecord> for StoredChunk {
    fn from(record: ChunkRecord) -> Self {
        StoredChunk::new(record.text, record.metadata)
    }
}

/// Exact-match fetch: `source == source` and `chunk_index` inside one of
/// `chunk_ranges`. Ranges are inclusive, sorted and disjoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFilter {
    pub source: String,
    pub chunk_ranges: Vec<RangeInclusive<u64>>,
}

impl ChunkFilter {
    /// Sorts `ranges` and coalesces overlapping or adjacent ones.
    pub fn new(
        source: impl Into<String>,
        ranges: impl IntoIterator<Item = RangeInclusive<u64>>,
    ) -> Self {
        let mut ranges = ranges
            .into_iter()
            .filter(|range| !range.is_empty())
            .collect::<Vec<_>>();
        ranges.sort_by_key(|range| (*range.start(), *range.end()));

        let mut chunk_ranges: Vec<RangeInclusive<u64>> = Vec::with_capacity(ranges.len());
        for range in ranges {
            if let Some(last) = chunk_ranges.last_mut() {
                if *range.start() <= last.end().saturating_add(1) {
                    if range.end() > last.end() {
                        *last = *last.start()..=*range.end();
                    }
                    continue;
                }
            }
            chunk_ranges.push(range);
        }

        Self {
            source: source.into(),
            chunk_ranges,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunk_ranges.is_empty()
    }

    pub fn contains_index(&self, index: u64) -> bool {
        self.chunk_ranges.iter().any(|range| range.contains(&index))
    }

    pub fn matches(&self, metadata: &Map<String, Value>) -> bool {
        let source_matches = metadata
            .get(META_SOURCE)
            .and_then(Value::as_str)
            .is_some_and(|source| source == self.source);
        let index_matches = metadata
            .get(META_CHUNK_INDEX)
            .and_then(Value::as_u64)
            .is_some_and(|index| self.contains_index(index));
        source_matches && index_matches
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum SearchStrategy {
    Similarity,
    /// Maximal marginal relevance over the `fetch_k` nearest candidates.
    /// `lambda` = 1.0 is pure relevance, 0.0 is pure diversity.
    Mmr { fetch_k: usize, lambda: f32 },
}

impl Default for SearchStrategy {
    fn default() -> Self {
        SearchStrategy::Mmr {
            fetch_k: 20,
            lambda: 0.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestionOptions {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// Chunks must be strictly longer than this (in chars) to be kept.
    pub min_chunk_chars: usize,
    pub merge_titles: bool,
    pub allowed_categories: Vec<ElementCategory>,
    pub recursive: bool,
}

impl Default for IngestionOptions {
    fn default() -> Self {
        Self {
            chunk_size: 1_500,
            chunk_overlap: 300,
            min_chunk_chars: 50,
            merge_titles: true,
            allowed_categories: vec![ElementCategory::Title, ElementCategory::NarrativeText],
            recursive: false,
        }
    }
}

impl IngestionOptions {
    pub fn validate(&self) -> Result<(), crate::IngestError> {
        if self.chunk_size == 0 {
            return Err(crate::IngestError::InvalidChunkConfig(
                "chunk_size must be positive".to_string(),
            ));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(crate::IngestError::InvalidChunkConfig(format!(
                "chunk_overlap {} must be smaller than chunk_size {}",
                self.chunk_overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalOptions {
    pub k: usize,
    pub window: u64,
    pub strategy: SearchStrategy,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            k: 5,
            window: 1,
            strategy: SearchStrategy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SkippedPdf {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct SourceSummary {
    pub path: PathBuf,
    pub checksum: String,
    pub chunk_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn heading_deserializes_from_either_shape() {
        let headings: Vec<Heading> =
            serde_json::from_value(json!(["Intro", {"text": "Results"}])).unwrap();
        assert_eq!(headings[0], Heading::PlainText("Intro".to_string()));
        assert_eq!(headings[1].as_text(), "Results");
    }

    #[test]
    fn chunk_metadata_has_persisted_layout() {
        let chunk = Chunk {
            text: "body".to_string(),
            source: "/data/a.pdf".to_string(),
            filename: "a.pdf".to_string(),
            page_number: 3,
            headings: vec!["1 Scope".to_string(), "1.2 Terms".to_string()],
            chunk_index: 7,
        };

        let metadata = chunk.metadata();
        let mut keys = metadata.keys().cloned().collect::<Vec<_>>();
        keys.sort();
        assert_eq!(
            keys,
            vec!["chunk_index", "filename", "headings", "page_number", "source"]
        );
        assert_eq!(metadata["headings"], json!("1 Scope > 1.2 Terms"));
        assert_eq!(metadata["chunk_index"], json!(7));
        assert_eq!(chunk.external_id(), "a.pdf_7");
    }

    #[test]
    fn complex_metadata_is_dropped() {
        let metadata = json!({
            "source": "a.pdf",
            "chunk_index": 1,
            "nested": {"x": 1},
            "list": [1, 2],
            "missing": null,
            "flag": true,
        });
        let Value::Object(map) = metadata else {
            unreachable!()
        };

        let filtered = filter_complex_metadata(map);
        assert_eq!(filtered.len(), 3);
        assert!(filtered.contains_key("flag"));
        assert!(!filtered.contains_key("nested"));
    }

    #[test]
    fn stored_chunk_without_index_has_no_key() {
        let mut metadata = Map::new();
        metadata.insert("source".to_string(), json!("a.pdf"));
        metadata.insert("chunk_index".to_string(), json!("two"));
        let stored = StoredChunk::new("text", metadata);

        assert_eq!(stored.key(), None);
        assert_eq!(stored.sort_key(), ("a.pdf".to_string(), 0, 0));
    }

    #[test]
    fn chunk_filter_coalesces_overlapping_and_adjacent_ranges() {
        let filter = ChunkFilter::new("a.pdf", [6..=9, 0..=3, 4..=5, 12..=12, 2..=4]);
        assert_eq!(filter.chunk_ranges, vec![0..=9, 12..=12]);

        assert!(filter.contains_index(0));
        assert!(filter.contains_index(9));
        assert!(!filter.contains_index(10));
        assert!(filter.contains_index(12));
    }

    #[test]
    fn chunk_filter_handles_the_full_index_range() {
        let filter = ChunkFilter::new("a.pdf", [0..=u64::MAX, 5..=7]);
        assert_eq!(filter.chunk_ranges, vec![0..=u64::MAX]);

        let mut metadata = Map::new();
        metadata.insert("source".to_string(), json!("a.pdf"));
        metadata.insert("chunk_index".to_string(), json!(u64::MAX));
        assert!(filter.matches(&metadata));

        metadata.insert("source".to_string(), json!("b.pdf"));
        assert!(!filter.matches(&metadata));
    }

    #[test]
    fn overlap_must_be_smaller_than_size() {
        let options = IngestionOptions {
            chunk_size: 100,
            chunk_overlap: 100,
            ..IngestionOptions::default()
        };
        assert!(options.validate().is_err());
        assert!(IngestionOptions::default().validate().is_ok());
    }
}
