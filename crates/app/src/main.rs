use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use pdf_context_core::{
    render_context, CharacterNgramEmbedder, ChunkBuilder, IngestionOptions, IngestionPipeline,
    IngestionReport, LocalStore, LopdfConverter, NeighborRetriever, OcrEndpointConfig,
    QdrantStore, RetrievalOptions, SearchStrategy, TextNormalizer, VectorStore,
};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "pdf-context", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Vector store backend
    #[arg(long, value_enum, default_value_t = Backend::Local, env = "PDF_CONTEXT_BACKEND")]
    backend: Backend,

    /// Collection name; also the confirmation token for `rebuild`
    #[arg(long, default_value = "pdf_chunks", env = "PDF_CONTEXT_COLLECTION")]
    collection: String,

    /// File backing the local store
    #[arg(long, default_value = "vector_store/chunks.json", env = "PDF_CONTEXT_STORE_PATH")]
    store_path: PathBuf,

    /// Qdrant base URL
    #[arg(long, default_value = "http://localhost:6333", env = "QDRANT_URL")]
    qdrant_url: String,

    /// Embedding dimensions
    #[arg(long, default_value_t = pdf_context_core::DEFAULT_EMBEDDING_DIMENSIONS)]
    dimensions: usize,

    /// Multimodal OCR endpoint used when a PDF cannot be parsed
    #[arg(long, env = "LLM_OCR_ENDPOINT")]
    ocr_endpoint: Option<String>,

    /// Bearer token for the OCR endpoint
    #[arg(long, env = "LLM_OCR_API_KEY", hide_env_values = true)]
    ocr_api_key: Option<String>,

    #[command(flatten)]
    chunking: ChunkingArgs,
}

#[derive(clap::Args)]
struct ChunkingArgs {
    /// Maximum characters per chunk
    #[arg(long, default_value_t = 1_500)]
    chunk_size: usize,

    /// Characters shared by consecutive chunks of one element
    #[arg(long, default_value_t = 300)]
    chunk_overlap: usize,

    /// Chunks must be longer than this many characters
    #[arg(long, default_value_t = 50)]
    min_chunk_chars: usize,

    /// Keep titles as separate elements instead of fusing them with the next one
    #[arg(long, default_value_t = false)]
    no_title_merge: bool,

    /// Descend into subdirectories when discovering PDFs
    #[arg(long, default_value_t = false)]
    recursive: bool,
}

impl ChunkingArgs {
    fn options(&self) -> IngestionOptions {
        IngestionOptions {
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
            min_chunk_chars: self.min_chunk_chars,
            merge_titles: !self.no_title_merge,
            recursive: self.recursive,
            ..IngestionOptions::default()
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    Local,
    Qdrant,
}

#[derive(Clone, Copy, ValueEnum)]
enum Strategy {
    Similarity,
    Mmr,
}

#[derive(Subcommand)]
enum Command {
    /// Chunk every PDF in a folder and upsert the chunks.
    Ingest {
        #[arg(long)]
        folder: PathBuf,
    },
    /// Chunk a single PDF and upsert its chunks.
    Add {
        #[arg(long)]
        file: PathBuf,
    },
    /// Drop the whole store and ingest a folder from scratch.
    Rebuild {
        #[arg(long)]
        folder: PathBuf,
        /// Must equal the collection name.
        #[arg(long)]
        confirm: String,
    },
    /// Retrieve chunks for a query, widened with their neighbors.
    Search {
        #[arg(long)]
        query: String,
        /// Number of base hits.
        #[arg(long, default_value_t = RetrievalOptions::default().k)]
        k: usize,
        /// Neighbor radius in chunk indices.
        #[arg(long, default_value_t = RetrievalOptions::default().window)]
        window: u64,
        #[arg(long, value_enum, default_value_t = Strategy::Mmr)]
        strategy: Strategy,
        /// Candidates considered by MMR.
        #[arg(long, default_value_t = 20)]
        fetch_k: usize,
        /// MMR relevance weight (1.0 = no diversity).
        #[arg(long, default_value_t = 0.5)]
        lambda: f32,
        /// Print the result as an LLM-ready context block.
        #[arg(long, default_value_t = false)]
        context: bool,
    },
}

async fn open_store(cli: &Cli) -> anyhow::Result<Box<dyn VectorStore>> {
    let embedder = CharacterNgramEmbedder {
        dimensions: cli.dimensions,
    };

    match cli.backend {
        Backend::Local => {
            let store = LocalStore::open(&cli.collection, embedder, &cli.store_path)
                .await
                .with_context(|| format!("opening local store {}", cli.store_path.display()))?;
            Ok(Box::new(store))
        }
        Backend::Qdrant => {
            let store = QdrantStore::new(&cli.qdrant_url, &cli.collection, embedder)?;
            store
                .ensure_collection()
                .await
                .with_context(|| format!("preparing qdrant collection {}", cli.collection))?;
            Ok(Box::new(store))
        }
    }
}

fn pipeline(
    cli: &Cli,
    store: Box<dyn VectorStore>,
) -> anyhow::Result<IngestionPipeline<LopdfConverter, Box<dyn VectorStore>>> {
    let ocr = cli
        .ocr_endpoint
        .as_deref()
        .and_then(|endpoint| OcrEndpointConfig::new(endpoint, cli.ocr_api_key.as_deref()));
    let converter = LopdfConverter::new(ocr)?;
    let builder = ChunkBuilder::new(cli.chunking.options(), TextNormalizer::with_default_rules()?)?;
    Ok(IngestionPipeline::new(converter, store, builder))
}

fn print_report(folder: &Path, report: &IngestionReport) {
    for skipped in &report.skipped_files {
        warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped pdf");
    }
    for source in &report.sources {
        info!(
            path = %source.path.display(),
            checksum = %source.checksum,
            chunk_count = source.chunk_count,
            "source indexed"
        );
    }

    println!(
        "{} chunks from {} file(s) ingested from {} at {} ({} skipped)",
        report.chunks.len(),
        report.sources.len(),
        folder.display(),
        report.ingested_at.to_rfc3339(),
        report.skipped_files.len()
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "pdf-context boot"
    );

    let store = open_store(&cli).await?;

    match &cli.command {
        Command::Ingest { folder } => {
            let report = pipeline(&cli, store)?
                .ingest_with_report(folder)
                .await
                .with_context(|| format!("ingesting {}", folder.display()))?;
            print_report(folder, &report);
        }
        Command::Add { file } => {
            let count = pipeline(&cli, store)?
                .add_document(file)
                .await
                .with_context(|| format!("adding {}", file.display()))?;
            println!("{count} chunks added from {}", file.display());
        }
        Command::Rebuild { folder, confirm } => {
            let report = pipeline(&cli, store)?
                .rebuild(folder, confirm)
                .await
                .with_context(|| format!("rebuilding from {}", folder.display()))?;
            print_report(folder, &report);
        }
        Command::Search {
            query,
            k,
            window,
            strategy,
            fetch_k,
            lambda,
            context,
        } => {
            let options = RetrievalOptions {
                k: *k,
                window: *window,
                strategy: match strategy {
                    Strategy::Similarity => SearchStrategy::Similarity,
                    Strategy::Mmr => SearchStrategy::Mmr {
                        fetch_k: *fetch_k,
                        lambda: *lambda,
                    },
                },
            };
            let retriever = NeighborRetriever::new(store, options);
            let chunks = retriever
                .retrieve_default(query)
                .await
                .context("retrieving context")?;

            if *context {
                println!("{}", render_context(&chunks));
                return Ok(());
            }

            println!("query: {query}");
            for chunk in &chunks {
                let score = chunk
                    .score
                    .map(|score| format!(" score={score:.4}"))
                    .unwrap_or_default();
                println!(
                    "[{} page={} chunk={}]{}",
                    chunk.source().unwrap_or("unknown"),
                    chunk.page_number().unwrap_or(0),
                    chunk
                        .chunk_index()
                        .map(|index| index.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    score
                );
                if let Some(headings) = chunk.headings() {
                    println!("  headings={headings}");
                }
                println!("  chunk_text:\n{}", chunk.text);
            }
        }
    }

    Ok(())
}
