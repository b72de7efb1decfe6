pub mod chunking;
pub mod converter;
pub mod embeddings;
pub mod error;
pub mod ingest;
pub mod models;
pub mod normalize;
pub mod retriever;
pub mod stores;
pub mod traits;

pub use chunking::{merge_titles, normalize_whitespace, split_text, ChunkBuilder, MergedUnit};
pub use converter::{LopdfConverter, OcrEndpointConfig, PageText};
pub use embeddings::{cosine_similarity, CharacterNgramEmbedder, Embedder, DEFAULT_EMBEDDING_DIMENSIONS};
pub use error::{IngestError, SearchError};
pub use ingest::{
    build_source_chunks, collect_chunks, digest_file, discover_pdf_files, IngestionPipeline,
    IngestionReport,
};
pub use models::{
    filter_complex_metadata, Chunk, ChunkFilter, ChunkKey, ChunkRecord, DocumentElement,
    ElementCategory, Heading, IngestionOptions, RetrievalOptions, SearchStrategy, SkippedPdf,
    SourceSummary, StoredChunk,
};
pub use normalize::TextNormalizer;
pub use retriever::{merge_and_sort, neighbor_windows, render_context, NeighborRetriever};
pub use stores::{LocalStore, QdrantStore};
pub use traits::{DocumentConverter, VectorStore};
