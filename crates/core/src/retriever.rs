use crate::models::{ChunkFilter, ChunkKey, RetrievalOptions, StoredChunk};
use crate::traits::VectorStore;
use crate::SearchError;
use futures_util::future::try_join_all;
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use tracing::debug;

/// Read path: semantic base hits widened with their textual neighbors.
pub struct NeighborRetriever<S> {
    store: S,
    options: RetrievalOptions,
}

impl<S: VectorStore> NeighborRetriever<S> {
    pub fn new(store: S, options: RetrievalOptions) -> Self {
        Self { store, options }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn options(&self) -> &RetrievalOptions {
        &self.options
    }

    /// `retrieve` with the configured `k` and `window`.
    pub async fn retrieve_default(&self, query: &str) -> Result<Vec<StoredChunk>, SearchError> {
        self.retrieve(query, self.options.k, self.options.window).await
    }

    /// Up to `k` base hits plus every chunk within `window` indices of a base
    /// hit in the same source, deduplicated by `(source, chunk_index)` and
    /// sorted by `(source, page_number, chunk_index)`.
    ///
    /// When no base hit carries a `chunk_index` the base hits are returned as
    /// the store ranked them.
    pub async fn retrieve(
        &self,
        query: &str,
        k: usize,
        window: u64,
    ) -> Result<Vec<StoredChunk>, SearchError> {
        let base = self.store.search(query, k, self.options.strategy).await?;
        if base.iter().all(|chunk| chunk.chunk_index().is_none()) {
            debug!(base_count = base.len(), "no positional metadata, skipping expansion");
            return Ok(base);
        }

        let neighbors = if window == 0 {
            Vec::new()
        } else {
            self.fetch_neighbors(neighbor_windows(&base, window)).await?
        };
        debug!(
            base_count = base.len(),
            neighbor_count = neighbors.len(),
            "expanded base hits"
        );

        Ok(merge_and_sort(base, neighbors))
    }

    /// One exact-match fetch per source, issued concurrently.
    async fn fetch_neighbors(
        &self,
        filters: Vec<ChunkFilter>,
    ) -> Result<Vec<StoredChunk>, SearchError> {
        let fetched = try_join_all(filters.iter().map(|filter| self.store.get(filter))).await?;
        Ok(fetched.into_iter().flatten().collect())
    }
}

/// One filter per source covering `[index - window, index + window]` for
/// every base hit with a complete identity. Bounds saturate at the ends of
/// the `u64` range; overlapping windows are coalesced.
pub fn neighbor_windows(base: &[StoredChunk], window: u64) -> Vec<ChunkFilter> {
    let mut windows: BTreeMap<String, Vec<RangeInclusive<u64>>> = BTreeMap::new();

    for key in base.iter().filter_map(StoredChunk::key) {
        let low = key.chunk_index.saturating_sub(window);
        let high = key.chunk_index.saturating_add(window);
        windows.entry(key.source).or_default().push(low..=high);
    }

    windows
        .into_iter()
        .map(|(source, ranges)| ChunkFilter::new(source, ranges))
        .collect()
}

/// Base hits win over neighbor copies of the same key. Hits without a
/// complete identity are kept as they are.
pub fn merge_and_sort(base: Vec<StoredChunk>, neighbors: Vec<StoredChunk>) -> Vec<StoredChunk> {
    let mut keyed: BTreeMap<ChunkKey, StoredChunk> = BTreeMap::new();
    let mut unkeyed = Vec::new();

    for chunk in base {
        match chunk.key() {
            Some(key) => {
                keyed.entry(key).or_insert(chunk);
            }
            None => unkeyed.push(chunk),
        }
    }

    for chunk in neighbors {
        if let Some(key) = chunk.key() {
            keyed.entry(key).or_insert(chunk);
        }
    }

    let mut merged = keyed.into_values().chain(unkeyed).collect::<Vec<_>>();
    merged.sort_by_cached_key(StoredChunk::sort_key);
    merged
}

/// Formats retrieved chunks as citation-headed passages for an LLM prompt.
pub fn render_context(chunks: &[StoredChunk]) -> String {
    let mut rendered = String::new();

    for chunk in chunks {
        let label = chunk.filename().or(chunk.source()).unwrap_or("unknown");
        rendered.push('[');
        rendered.push_str(label);
        if let Some(page) = chunk.page_number() {
            rendered.push_str(&format!(" p.{page}"));
        }
        if let Some(index) = chunk.chunk_index() {
            rendered.push_str(&format!(" #{index}"));
        }
        rendered.push(']');
        if let Some(headings) = chunk.headings() {
            rendered.push(' ');
            rendered.push_str(headings);
        }
        rendered.push('\n');
        rendered.push_str(chunk.text.trim());
        rendered.push_str("\n\n");
    }

    rendered.truncate(rendered.trim_end().len());
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SearchStrategy;
    use async_trait::async_trait;
    use serde_json::{json, Map, Value};
    use std::sync::Mutex;

    fn chunk(source: &str, page: u64, index: u64, text: &str) -> StoredChunk {
        let mut metadata = Map::new();
        metadata.insert("source".to_string(), json!(source));
        metadata.insert("filename".to_string(), json!(source));
        metadata.insert("page_number".to_string(), json!(page));
        metadata.insert("headings".to_string(), json!(""));
        metadata.insert("chunk_index".to_string(), json!(index));
        StoredChunk::new(text, metadata)
    }

    fn indices(chunks: &[StoredChunk], source: &str) -> Vec<u64> {
        chunks
            .iter()
            .filter(|chunk| chunk.source() == Some(source))
            .filter_map(StoredChunk::chunk_index)
            .collect()
    }

    /// Returns fixed base hits and serves `get` from `corpus`, recording every
    /// filter it was asked for.
    struct FakeStore {
        base: Vec<StoredChunk>,
        corpus: Vec<StoredChunk>,
        queries: Mutex<Vec<(String, usize)>>,
        fetches: Mutex<Vec<ChunkFilter>>,
    }

    impl FakeStore {
        fn new(base: Vec<StoredChunk>, corpus: Vec<StoredChunk>) -> Self {
            Self {
                base,
                corpus,
                queries: Mutex::new(Vec::new()),
                fetches: Mutex::new(Vec::new()),
            }
        }

        fn queries(&self) -> Vec<(String, usize)> {
            self.queries.lock().map(|queries| queries.clone()).unwrap_or_default()
        }

        fn fetches(&self) -> Vec<ChunkFilter> {
            self.fetches.lock().map(|fetches| fetches.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl VectorStore for FakeStore {
        fn name(&self) -> &str {
            "fake"
        }

        async fn upsert(&self, _records: &[crate::models::ChunkRecord]) -> Result<(), SearchError> {
            Ok(())
        }

        async fn search(
            &self,
            query: &str,
            k: usize,
            _strategy: SearchStrategy,
        ) -> Result<Vec<StoredChunk>, SearchError> {
            if let Ok(mut queries) = self.queries.lock() {
                queries.push((query.to_string(), k));
            }
            Ok(self.base.iter().take(k).cloned().collect())
        }

        async fn get(&self, filter: &ChunkFilter) -> Result<Vec<StoredChunk>, SearchError> {
            if let Ok(mut fetches) = self.fetches.lock() {
                fetches.push(filter.clone());
            }
            Ok(self
                .corpus
                .iter()
                .filter(|chunk| filter.matches(&chunk.metadata))
                .cloned()
                .collect())
        }

        async fn drop_all(&self) -> Result<(), SearchError> {
            Ok(())
        }
    }

    fn corpus(source: &str, count: u64) -> Vec<StoredChunk> {
        (0..count)
            .map(|index| chunk(source, 1 + index / 3, index, &format!("{source} #{index}")))
            .collect()
    }

    fn retriever(store: FakeStore) -> NeighborRetriever<FakeStore> {
        let options = RetrievalOptions {
            strategy: SearchStrategy::Similarity,
            ..RetrievalOptions::default()
        };
        NeighborRetriever::new(store, options)
    }

    #[tokio::test]
    async fn single_hit_expands_to_its_window() -> Result<(), SearchError> {
        let corpus = corpus("A", 5);
        let store = FakeStore::new(vec![corpus[2].clone()], corpus);
        let retriever = retriever(store);

        let result = retriever.retrieve("query", 5, 1).await?;

        assert_eq!(indices(&result, "A"), vec![1, 2, 3]);
        assert_eq!(retriever.store().fetches().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn overlapping_windows_merge_without_duplicates() -> Result<(), SearchError> {
        let corpus = corpus("A", 12);
        let store = FakeStore::new(vec![corpus[6].clone(), corpus[2].clone()], corpus);
        let retriever = retriever(store);

        let result = retriever.retrieve("query", 5, 2).await?;

        assert_eq!(indices(&result, "A"), (0..=8).collect::<Vec<_>>());
        let fetches = retriever.store().fetches();
        assert_eq!(fetches.len(), 1);
        assert_eq!(fetches[0].chunk_ranges, vec![0..=8]);
        Ok(())
    }

    #[tokio::test]
    async fn window_zero_returns_sorted_deduplicated_base() -> Result<(), SearchError> {
        let corpus = corpus("A", 5);
        let base = vec![corpus[3].clone(), corpus[0].clone(), corpus[3].clone()];
        let store = FakeStore::new(base, corpus);
        let retriever = retriever(store);

        let result = retriever.retrieve("query", 5, 0).await?;

        assert_eq!(indices(&result, "A"), vec![0, 3]);
        assert!(retriever.store().fetches().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn one_fetch_per_distinct_source() -> Result<(), SearchError> {
        let mut all = corpus("A", 6);
        all.extend(corpus("B", 6));
        let base = vec![all[1].clone(), all[4].clone(), all[8].clone()];
        let store = FakeStore::new(base, all);
        let retriever = retriever(store);

        let result = retriever.retrieve("query", 5, 1).await?;

        assert_eq!(retriever.store().fetches().len(), 2);
        assert_eq!(indices(&result, "A"), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(indices(&result, "B"), vec![1, 2, 3]);
        Ok(())
    }

    #[tokio::test]
    async fn hit_without_index_is_kept_and_not_expanded() -> Result<(), SearchError> {
        let corpus = corpus("A", 5);
        let mut orphan = chunk("B", 1, 0, "orphan");
        orphan.metadata.remove("chunk_index");
        let store = FakeStore::new(vec![orphan.clone(), corpus[2].clone()], corpus);
        let retriever = retriever(store);

        let result = retriever.retrieve("query", 5, 1).await?;

        assert!(result.contains(&orphan));
        assert_eq!(indices(&result, "A"), vec![1, 2, 3]);
        let fetches = retriever.store().fetches();
        assert_eq!(fetches.len(), 1);
        assert_eq!(fetches[0].source, "A");
        Ok(())
    }

    #[tokio::test]
    async fn base_without_any_index_is_returned_unchanged() -> Result<(), SearchError> {
        let mut first = StoredChunk::new("first", Map::new());
        first.score = Some(0.9);
        let mut second = chunk("Z", 4, 0, "second");
        second.metadata.remove("chunk_index");
        let base = vec![second.clone(), first.clone()];
        let store = FakeStore::new(base.clone(), Vec::new());
        let retriever = retriever(store);

        let result = retriever.retrieve("query", 5, 3).await?;

        assert_eq!(result, base);
        assert!(retriever.store().fetches().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn empty_base_is_returned_unchanged() -> Result<(), SearchError> {
        let retriever = retriever(FakeStore::new(Vec::new(), corpus("A", 3)));
        assert!(retriever.retrieve("query", 5, 1).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn blank_query_is_passed_to_the_store() -> Result<(), SearchError> {
        let corpus = corpus("A", 5);
        let retriever = retriever(FakeStore::new(vec![corpus[0].clone()], corpus));

        let result = retriever.retrieve("   ", 5, 1).await?;

        assert_eq!(indices(&result, "A"), vec![0, 1]);
        assert_eq!(retriever.store().queries(), vec![("   ".to_string(), 5)]);
        Ok(())
    }

    #[tokio::test]
    async fn configured_defaults_drive_k_and_window() -> Result<(), SearchError> {
        let corpus = corpus("A", 8);
        let base = vec![corpus[4].clone(), corpus[7].clone()];
        let store = FakeStore::new(base, corpus);
        let retriever = NeighborRetriever::new(
            store,
            RetrievalOptions {
                k: 1,
                window: 2,
                strategy: SearchStrategy::Similarity,
            },
        );

        let result = retriever.retrieve_default("query").await?;

        assert_eq!(indices(&result, "A"), vec![2, 3, 4, 5, 6]);
        assert_eq!(retriever.store().queries(), vec![("query".to_string(), 1)]);
        Ok(())
    }

    #[tokio::test]
    async fn huge_window_is_fetched_as_a_single_range() -> Result<(), SearchError> {
        let corpus = corpus("A", 5);
        let store = FakeStore::new(vec![corpus[3].clone()], corpus);
        let retriever = retriever(store);

        let result = retriever.retrieve("query", 5, u64::MAX).await?;

        assert_eq!(indices(&result, "A"), vec![0, 1, 2, 3, 4]);
        let fetches = retriever.store().fetches();
        assert_eq!(fetches.len(), 1);
        assert_eq!(fetches[0].chunk_ranges, vec![0..=u64::MAX]);
        Ok(())
    }

    #[test]
    fn base_copy_wins_over_neighbor_copy() {
        let base = chunk("A", 1, 2, "base text");
        let mut neighbor = chunk("A", 1, 2, "neighbor text");
        neighbor.metadata.insert("headings".to_string(), Value::from("changed"));

        let merged = merge_and_sort(vec![base.clone()], vec![neighbor, chunk("A", 1, 3, "next")]);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0], base);
    }

    #[test]
    fn context_is_rendered_with_citations() {
        let mut cited = chunk("/data/a.pdf", 2, 3, "  Slag basicity rose.  ");
        cited.metadata.insert("filename".to_string(), json!("a.pdf"));
        cited.metadata.insert("headings".to_string(), json!("2 Slag"));
        let bare = StoredChunk::new("Loose text", Map::new());

        assert_eq!(
            render_context(&[cited, bare]),
            "[a.pdf p.2 #3] 2 Slag\nSlag basicity rose.\n\n[unknown]\nLoose text"
        );
    }

    #[test]
    fn window_lower_bound_saturates() {
        let windows = neighbor_windows(&[chunk("A", 1, 1, "x")], 3);
        assert_eq!(windows, vec![ChunkFilter::new("A", [0..=4])]);
    }

    #[test]
    fn large_window_stays_one_range_per_source() {
        let base = [chunk("A", 1, 3, "a"), chunk("A", 9, 40, "b"), chunk("B", 1, 0, "c")];
        let windows = neighbor_windows(&base, 5_000_000);

        assert_eq!(
            windows,
            vec![
                ChunkFilter::new("A", [0..=5_000_040]),
                ChunkFilter::new("B", [0..=5_000_000]),
            ]
        );
    }

    #[test]
    fn distant_hits_keep_separate_ranges() {
        let base = [chunk("A", 1, 2, "a"), chunk("A", 5, 20, "b")];
        let windows = neighbor_windows(&base, 1);
        assert_eq!(windows[0].chunk_ranges, vec![1..=3, 19..=21]);
    }

    #[test]
    fn results_are_ordered_by_source_page_then_index() {
        let mut unpaged = chunk("A", 0, 5, "no page");
        unpaged.metadata.remove("page_number");
        let merged = merge_and_sort(
            vec![
                chunk("B", 1, 0, "b0"),
                chunk("A", 2, 4, "a4"),
                chunk("A", 1, 7, "a7"),
                unpaged,
            ],
            Vec::new(),
        );

        let order = merged.iter().map(|chunk| chunk.text.as_str()).collect::<Vec<_>>();
        assert_eq!(order, vec!["no page", "a7", "a4", "b0"]);
        for pair in merged.windows(2) {
            assert!(pair[0].sort_key() <= pair[1].sort_key());
        }
    }
}
