use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

use crate::db::FileSource;
use crate::services::{IngestRequest, IngestService};

pub const PROCESSED_DIR: &str = "processed";
pub const FAILED_DIR: &str = "failed";

#[derive(Debug, thiserror::Error)]
pub enum InboxError {
    #[error("Inbox IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of one polling cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    /// Candidate exports found in the inbox (before the batch limit)
    pub discovered: usize,
    pub ingested: usize,
    pub failed: usize,
    pub records_added: usize,
}

/// Inbox Worker
///
/// Picks logger exports dropped into an inbox directory and runs them
/// through the ingestion coordinator. Each handled file is moved to
/// `processed/` or `failed/` so it is never picked up twice. All ingestion
/// logic stays in IngestService.
#[derive(Clone)]
pub struct InboxWorker {
    inbox_dir: PathBuf,
    batch_size: usize,
    ingest_service: IngestService,
}

impl InboxWorker {
    pub fn new(inbox_dir: impl Into<PathBuf>, batch_size: usize, ingest_service: IngestService) -> Self {
        Self {
            inbox_dir: inbox_dir.into(),
            batch_size: batch_size.max(1),
            ingest_service,
        }
    }

    pub fn inbox_dir(&self) -> &Path {
        &self.inbox_dir
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Run a single fetch-convert-ingest cycle
    ///
    /// Only a failure to read the inbox itself is an error; a file that
    /// fails to ingest is moved to `failed/` and counted.
    #[instrument(skip(self), fields(inbox = %self.inbox_dir.display()))]
    pub async fn run_cycle(&self) -> Result<CycleReport, InboxError> {
        let processed_dir = self.inbox_dir.join(PROCESSED_DIR);
        let failed_dir = self.inbox_dir.join(FAILED_DIR);
        for dir in [&self.inbox_dir, &processed_dir, &failed_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| InboxError::Io {
                    path: dir.clone(),
                    source,
                })?;
        }

        let candidates = self.list_candidates().await?;
        let mut report = CycleReport {
            discovered: candidates.len(),
            ..Default::default()
        };

        if candidates.is_empty() {
            debug!("Inbox empty");
            return Ok(report);
        }

        for path in candidates.into_iter().take(self.batch_size) {
            let outcome = match IngestRequest::read_from(&path).await {
                Ok(request) => self
                    .ingest_service
                    .ingest(request.with_source(FileSource::LocalClient))
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };

            let destination = match outcome {
                Ok(summary) => {
                    report.ingested += 1;
                    report.records_added += summary.records_added;
                    &processed_dir
                }
                Err(e) => {
                    warn!("Inbox file {} failed: {}", path.display(), e);
                    report.failed += 1;
                    &failed_dir
                }
            };

            move_into(&path, destination).await;
        }

        info!(
            "Inbox cycle: {} discovered, {} ingested, {} failed, {} records",
            report.discovered, report.ingested, report.failed, report.records_added
        );
        Ok(report)
    }

    /// `.rld` and `.txt` files directly in the inbox, by name
    async fn list_candidates(&self) -> Result<Vec<PathBuf>, InboxError> {
        let io_err = |source| InboxError::Io {
            path: self.inbox_dir.clone(),
            source,
        };

        let mut entries = tokio::fs::read_dir(&self.inbox_dir).await.map_err(io_err)?;
        let mut found = Vec::new();

        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if is_file && is_logger_export(&entry.path()) {
                found.push(entry.path());
            }
        }

        found.sort();
        Ok(found)
    }
}

fn is_logger_export(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("rld") || ext.eq_ignore_ascii_case("txt"))
        .unwrap_or(false)
}

/// Move a handled file; on failure it stays put and is retried next cycle
async fn move_into(path: &Path, dir: &Path) {
    let Some(name) = path.file_name() else {
        return;
    };
    let target = dir.join(name);
    if let Err(e) = tokio::fs::rename(path, &target).await {
        warn!(
            "Failed to move {} to {}: {}",
            path.display(),
            target.display(),
            e
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_logger_export() {
        assert!(is_logger_export(Path::new("inbox/000110_2024.rld")));
        assert!(is_logger_export(Path::new("inbox/site.TXT")));
        assert!(!is_logger_export(Path::new("inbox/readme.md")));
        assert!(!is_logger_export(Path::new("inbox/noext")));
    }
}
