use crate::chunking::ChunkBuilder;
use crate::models::{Chunk, ChunkRecord, SkippedPdf, SourceSummary};
use crate::traits::{DocumentConverter, VectorStore};
use crate::IngestError;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub fn discover_pdf_files(folder: &Path, recursive: bool) -> Vec<PathBuf> {
    let mut walker = WalkDir::new(folder).min_depth(1);
    if !recursive {
        walker = walker.max_depth(1);
    }

    let mut files = Vec::new();
    for entry in walker.into_iter().filter_map(|item| item.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_pdf = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));

        if is_pdf {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

pub fn digest_file(path: &Path) -> Result<String, IngestError> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

fn display_filename(path: &Path) -> Result<String, IngestError> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| IngestError::MissingFileName(path.display().to_string()))
}

pub struct IngestionReport {
    pub chunks: Vec<Chunk>,
    pub sources: Vec<SourceSummary>,
    pub skipped_files: Vec<SkippedPdf>,
    pub ingested_at: DateTime<Utc>,
}

impl IngestionReport {
    fn empty() -> Self {
        Self {
            chunks: Vec::new(),
            sources: Vec::new(),
            skipped_files: Vec::new(),
            ingested_at: Utc::now(),
        }
    }

    pub fn records(&self) -> Vec<ChunkRecord> {
        self.chunks.iter().map(ChunkRecord::from).collect()
    }
}

/// Converts and chunks one source file. Chunk indices are local to it.
pub fn build_source_chunks<C: DocumentConverter + ?Sized>(
    path: &Path,
    converter: &C,
    builder: &ChunkBuilder,
) -> Result<(Vec<Chunk>, SourceSummary), IngestError> {
    let filename = display_filename(path)?;
    let checksum = digest_file(path)?;
    let elements = converter.convert(path)?;
    let source = path.to_string_lossy().to_string();

    let chunks = builder.build(&source, &filename, elements);
    if chunks.is_empty() {
        info!(path = %path.display(), "source produced no usable chunks");
    }

    let summary = SourceSummary {
        path: path.to_path_buf(),
        checksum,
        chunk_count: chunks.len(),
    };
    Ok((chunks, summary))
}

fn skip(report: &mut IngestionReport, path: &Path, reason: String) {
    warn!(path = %path.display(), reason = %reason, "skipped pdf");
    report.skipped_files.push(SkippedPdf {
        path: path.to_path_buf(),
        reason,
    });
}

/// Chunks every PDF in `paths`; a file that fails is logged and skipped.
///
/// Chunk ids are `{filename}_{chunk_index}`, so only the first file with a
/// given filename is ingested. Later files with that name are skipped.
pub fn collect_chunks<C: DocumentConverter + ?Sized>(
    paths: &[PathBuf],
    converter: &C,
    builder: &ChunkBuilder,
) -> IngestionReport {
    let mut report = IngestionReport::empty();
    let mut claimed: HashMap<String, PathBuf> = HashMap::new();

    for path in paths {
        if let Some(owner) = display_filename(path)
            .ok()
            .and_then(|filename| claimed.get(&filename))
        {
            let reason = format!("filename already ingested from {}", owner.display());
            skip(&mut report, path, reason);
            continue;
        }

        match build_source_chunks(path, converter, builder) {
            Ok((chunks, summary)) => {
                debug!(path = %path.display(), chunk_count = chunks.len(), "chunked source");
                if let Ok(filename) = display_filename(path) {
                    claimed.insert(filename, path.clone());
                }
                report.chunks.extend(chunks);
                report.sources.push(summary);
            }
            Err(error) => skip(&mut report, path, error.to_string()),
        }
    }

    report
}

/// Write path: source files to chunks to the vector store.
pub struct IngestionPipeline<C, S> {
    converter: C,
    store: S,
    builder: ChunkBuilder,
}

impl<C, S> IngestionPipeline<C, S>
where
    C: DocumentConverter,
    S: VectorStore,
{
    pub fn new(converter: C, store: S, builder: ChunkBuilder) -> Self {
        Self {
            converter,
            store,
            builder,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Chunks the folder without writing anything.
    pub fn prepare(&self, folder: &Path) -> Result<IngestionReport, IngestError> {
        if !folder.is_dir() {
            return Err(IngestError::InvalidArgument(format!(
                "not a directory: {}",
                folder.display()
            )));
        }

        let files = discover_pdf_files(folder, self.builder.options().recursive);
        if files.is_empty() {
            info!(folder = %folder.display(), "no pdf files found");
            return Ok(IngestionReport::empty());
        }

        Ok(collect_chunks(&files, &self.converter, &self.builder))
    }

    /// Ingests every PDF in `folder` and returns the report; the number of
    /// chunks written is `report.chunks.len()`.
    pub async fn ingest_with_report(&self, folder: &Path) -> Result<IngestionReport, IngestError> {
        let report = self.prepare(folder)?;
        self.write(&report).await?;
        Ok(report)
    }

    pub async fn ingest(&self, folder: &Path) -> Result<usize, IngestError> {
        Ok(self.ingest_with_report(folder).await?.chunks.len())
    }

    /// Adds one PDF to the existing store. Unlike folder ingestion, a
    /// conversion failure here is returned to the caller.
    pub async fn add_document(&self, path: &Path) -> Result<usize, IngestError> {
        let (chunks, summary) = build_source_chunks(path, &self.converter, &self.builder)?;
        let report = IngestionReport {
            chunks,
            sources: vec![summary],
            ..IngestionReport::empty()
        };
        self.write(&report).await?;
        Ok(report.chunks.len())
    }

    /// Destroys the store and ingests `folder` from scratch. `confirmation`
    /// must equal the store name.
    pub async fn rebuild(
        &self,
        folder: &Path,
        confirmation: &str,
    ) -> Result<IngestionReport, IngestError> {
        if confirmation != self.store.name() {
            return Err(IngestError::RebuildNotConfirmed {
                expected: self.store.name().to_string(),
                provided: confirmation.to_string(),
            });
        }

        let report = self.prepare(folder)?;
        warn!(store = %self.store.name(), "dropping vector store for rebuild");
        self.store.drop_all().await?;
        self.write(&report).await?;
        Ok(report)
    }

    async fn write(&self, report: &IngestionReport) -> Result<(), IngestError> {
        if report.chunks.is_empty() {
            info!(store = %self.store.name(), "nothing to write");
            return Ok(());
        }

        self.store.upsert(&report.records()).await?;
        info!(
            store = %self.store.name(),
            chunk_count = report.chunks.len(),
            source_count = report.sources.len(),
            "upserted chunks"
        );
        Ok(())
    }
}
