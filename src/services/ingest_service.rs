use serde::Serialize;
use std::fmt;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::db::{DbError, FileRegistration, FileRepository, FileSource, FileStatus};
use crate::files::{is_binary_export, BlobStore, BlobStoreError, ConversionError, Converter};
use crate::logger::{parse_export, LoggerLayout, ParsedExport};
use crate::notifier::LiveNotifier;
use crate::services::filename_locks::FilenameLocks;
use crate::utils::{compute_checksum, normalize_tags, sanitize_filename};

pub const DEFAULT_CATEGORY: &str = "general";

/// Steps a single file moves through during ingestion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStage {
    Received,
    Converted,
    Parsed,
    Registered,
    Notified,
    Done,
    Failed,
}

impl fmt::Display for IngestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IngestStage::Received => "received",
            IngestStage::Converted => "converted",
            IngestStage::Parsed => "parsed",
            IngestStage::Registered => "registered",
            IngestStage::Notified => "notified",
            IngestStage::Done => "done",
            IngestStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Error types for ingestion
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Invalid filename: {0:?}")]
    InvalidFilename(String),

    #[error("Storage error: {0}")]
    Storage(#[from] BlobStoreError),

    #[error("Conversion failed: {0}")]
    ConversionFailed(#[from] ConversionError),

    #[error("No data extracted from {filename}: {reason}")]
    NoDataExtracted { filename: String, reason: String },

    #[error("Failed to read export: {0}")]
    ReadFailed(String),

    #[error("Failed to store {filename}: {source}")]
    StoreWriteFailed {
        filename: String,
        #[source]
        source: DbError,
    },
}

impl IngestError {
    /// Step that was being attempted when the ingestion failed
    pub fn stage(&self) -> IngestStage {
        match self {
            IngestError::InvalidFilename(_) | IngestError::Storage(_) => IngestStage::Received,
            IngestError::ConversionFailed(_) => IngestStage::Converted,
            IngestError::NoDataExtracted { .. } | IngestError::ReadFailed(_) => IngestStage::Parsed,
            IngestError::StoreWriteFailed { .. } => IngestStage::Registered,
        }
    }
}

/// One file handed to the coordinator
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub filename: String,
    pub bytes: Vec<u8>,
    /// Defaults to `backend` for RLD files and `txt_upload` otherwise
    pub source: Option<FileSource>,
    pub tags: Vec<String>,
    pub category: Option<String>,
    pub description: Option<String>,
    /// Force a column layout instead of detecting it
    pub layout: Option<LoggerLayout>,
}

impl IngestRequest {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            bytes,
            source: None,
            tags: Vec::new(),
            category: None,
            description: None,
            layout: None,
        }
    }

    /// Read a file from disk into a request named after its final component
    pub async fn read_from(path: &Path) -> std::io::Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self::new(filename, bytes))
    }

    pub fn with_source(mut self, source: FileSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_layout(mut self, layout: LoggerLayout) -> Self {
        self.layout = Some(layout);
        self
    }
}

/// Result of a successful ingestion
#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub file_id: i64,
    pub filename: String,
    pub records_added: usize,
    pub lines_skipped: usize,
    pub status: FileStatus,
    pub version: i64,
    pub layout: LoggerLayout,
    pub subscribers_notified: usize,
}

/// Orchestrates save → convert → parse → register → notify for one file
#[derive(Clone)]
pub struct IngestService {
    blob_store: BlobStore,
    converter: Arc<dyn Converter>,
    file_repo: FileRepository,
    notifier: LiveNotifier,
    locks: FilenameLocks,
}

impl IngestService {
    pub fn new(
        blob_store: BlobStore,
        converter: Arc<dyn Converter>,
        file_repo: FileRepository,
        notifier: LiveNotifier,
        locks: FilenameLocks,
    ) -> Self {
        Self {
            blob_store,
            converter,
            file_repo,
            notifier,
            locks,
        }
    }

    pub fn blob_store(&self) -> &BlobStore {
        &self.blob_store
    }

    /// Ingest one export
    ///
    /// On success the file's metadata and records are committed together and
    /// the new records have been offered to every live subscriber. On failure
    /// nothing in the library has changed; the raw upload stays on disk.
    #[instrument(skip(self, request), fields(filename = %request.filename, size = request.bytes.len()))]
    pub async fn ingest(&self, request: IngestRequest) -> Result<IngestSummary, IngestError> {
        let start_time = Instant::now();

        let result = self.run_pipeline(request).await;

        match &result {
            Ok(summary) => info!(
                "Ingested {}: {} records added, {} lines skipped, status {} (v{}) in {:.2}s",
                summary.filename,
                summary.records_added,
                summary.lines_skipped,
                summary.status,
                summary.version,
                start_time.elapsed().as_secs_f64()
            ),
            Err(e) => error!(
                stage = %e.stage(),
                "Ingestion {}: {}",
                IngestStage::Failed,
                e
            ),
        }

        result
    }

    async fn run_pipeline(&self, request: IngestRequest) -> Result<IngestSummary, IngestError> {
        let filename = sanitize_filename(&request.filename)
            .ok_or_else(|| IngestError::InvalidFilename(request.filename.clone()))?;
        let binary = is_binary_export(&filename);
        debug!(stage = %IngestStage::Received, binary, "Accepted {}", filename);

        // Same-name ingests run one at a time from upload to commit
        let guard = self.locks.lock(&filename).await;

        let upload_path = self.blob_store.save_upload(&filename, &request.bytes).await?;

        let text_path = if binary {
            let converted = self.convert(&filename, &upload_path).await?;
            debug!(stage = %IngestStage::Converted, "Converted {} to {}", filename, converted.display());
            converted
        } else {
            upload_path
        };

        let parsed = self.parse(text_path, &filename, request.layout).await?;
        let report = &parsed.report;
        debug!(
            stage = %IngestStage::Parsed,
            "Parsed {}: {} accepted, {} skipped",
            filename, report.accepted, report.skipped
        );

        if parsed.records.is_empty() {
            let reason = match report.check() {
                Err(e) => e.to_string(),
                Ok(()) => format!("{} data lines, none valid", report.skipped),
            };
            warn!("No data extracted from {}: {}", filename, reason);
            return Err(IngestError::NoDataExtracted { filename, reason });
        }

        let layout = report.layout.unwrap_or(LoggerLayout::Legacy);
        let source = request.source.unwrap_or(if binary {
            FileSource::Backend
        } else {
            FileSource::TxtUpload
        });
        let extension_tag = if binary { "RLD" } else { "TXT" };
        let tags = normalize_tags(
            request
                .tags
                .iter()
                .map(String::as_str)
                .chain([extension_tag, layout.tag()]),
        );
        let category = request
            .category
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| DEFAULT_CATEGORY.to_string());

        let registration = FileRegistration {
            filename: filename.clone(),
            file_size: request.bytes.len() as i64,
            tags,
            category,
            description: request.description.filter(|d| !d.trim().is_empty()),
            source,
            checksum: Some(compute_checksum(&request.bytes)),
        };

        let registered = self
            .file_repo
            .register_with_records(&registration, &parsed.records)
            .await
            .map_err(|source| IngestError::StoreWriteFailed {
                filename: filename.clone(),
                source,
            })?;
        debug!(stage = %IngestStage::Registered, file_id = registered.id, "Registered {}", filename);
        drop(guard);

        let broadcast = self.notifier.broadcast(&parsed.records).await;
        debug!(
            stage = %IngestStage::Notified,
            delivered = broadcast.delivered,
            dropped = broadcast.dropped,
            "Notified subscribers of {}",
            filename
        );
        debug!(stage = %IngestStage::Done, "Finished {}", filename);

        Ok(IngestSummary {
            file_id: registered.id,
            filename,
            records_added: registered.records_inserted,
            lines_skipped: parsed.report.skipped,
            status: registered.status,
            version: registered.version,
            layout,
            subscribers_notified: broadcast.delivered,
        })
    }

    /// Stage the upload alone in a scratch directory, run the converter on
    /// it and copy the produced text export to the converted directory
    async fn convert(&self, filename: &str, upload_path: &Path) -> Result<PathBuf, IngestError> {
        let staging = tempfile::Builder::new()
            .prefix("rld-convert-")
            .tempdir()
            .map_err(|source| BlobStoreError::Io {
                path: std::env::temp_dir(),
                source,
            })?;
        let source_dir = staging.path().join("source");
        let output_dir = staging.path().join("output");

        for dir in [&source_dir, &output_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| BlobStoreError::Io {
                    path: dir.clone(),
                    source,
                })?;
        }

        let staged = source_dir.join(filename);
        tokio::fs::copy(upload_path, &staged)
            .await
            .map_err(|source| BlobStoreError::Io {
                path: staged.clone(),
                source,
            })?;

        self.converter.convert(&source_dir, &output_dir).await?;

        let produced = find_text_export(&output_dir)
            .await?
            .ok_or_else(|| ConversionError::MissingOutput(output_dir.clone()))?;

        let target = self.blob_store.converted_path(filename);
        tokio::fs::copy(&produced, &target)
            .await
            .map_err(|source| BlobStoreError::Io {
                path: target.clone(),
                source,
            })?;

        Ok(target)
    }

    /// Parse a text export from disk on the blocking pool
    async fn parse(
        &self,
        path: PathBuf,
        filename: &str,
        layout: Option<LoggerLayout>,
    ) -> Result<ParsedExport, IngestError> {
        let name = filename.to_string();
        let display = path.display().to_string();

        tokio::task::spawn_blocking(move || -> std::io::Result<ParsedExport> {
            let file = std::fs::File::open(&path)?;
            Ok(parse_export(BufReader::new(file), &name, layout))
        })
        .await
        .map_err(|e| IngestError::ReadFailed(format!("parser task failed: {e}")))?
        .map_err(|e| IngestError::ReadFailed(format!("{display}: {e}")))
    }
}

/// First `.txt` file (by name) in a converter output directory
async fn find_text_export(dir: &Path) -> Result<Option<PathBuf>, BlobStoreError> {
    let io_err = |source| BlobStoreError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut entries = tokio::fs::read_dir(dir).await.map_err(io_err)?;
    let mut found = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
        let path = entry.path();
        let is_txt = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("txt"))
            .unwrap_or(false);
        if is_txt {
            found.push(path);
        }
    }

    found.sort();
    Ok(found.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_stages() {
        assert_eq!(
            IngestError::InvalidFilename("..".into()).stage(),
            IngestStage::Received
        );
        assert_eq!(
            IngestError::ConversionFailed(ConversionError::NotConfigured).stage(),
            IngestStage::Converted
        );
        assert_eq!(
            IngestError::NoDataExtracted {
                filename: "a.txt".into(),
                reason: "empty".into()
            }
            .stage(),
            IngestStage::Parsed
        );
    }

    #[test]
    fn test_request_builder() {
        let request = IngestRequest::new("site.txt", b"data".to_vec())
            .with_source(FileSource::LocalClient)
            .with_tags(vec!["mast-a".into()])
            .with_category("field")
            .with_layout(LoggerLayout::SymphoniePro);

        assert_eq!(request.source, Some(FileSource::LocalClient));
        assert_eq!(request.tags, vec!["mast-a"]);
        assert_eq!(request.category.as_deref(), Some("field"));
        assert_eq!(request.layout, Some(LoggerLayout::SymphoniePro));
    }

    #[tokio::test]
    async fn test_find_text_export_picks_first_txt() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("a.TXT"), "a").unwrap();
        std::fs::write(dir.path().join("log.csv"), "c").unwrap();

        let found = find_text_export(dir.path()).await.unwrap().unwrap();
        assert_eq!(found.file_name().unwrap(), "a.TXT");

        let empty = tempfile::tempdir().unwrap();
        assert!(find_text_export(empty.path()).await.unwrap().is_none());
    }
}
