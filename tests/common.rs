// Shared fixtures for integration tests
//
// Every test gets its own in-memory database and its own temp directories,
// so tests run in parallel without cleanup.
#![allow(dead_code)]

use async_trait::async_trait;
use nrg_datasense::db::{connect_in_memory, FileRepository, SensorRecordRepository};
use nrg_datasense::files::{BlobStore, ConversionError, Converter, UnconfiguredConverter};
use nrg_datasense::notifier::LiveNotifier;
use nrg_datasense::services::{FilenameLocks, IngestService, LibraryService};
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const LEGACY_EXPORT: &str = "Site Number:\t000110\n\
    Site Description:\tTest mast\n\
    \n\
    Timestamp\tCh1\tCh2\tCh3\tCh4\tCh5\tCh6\tCh7\tCh8\tCh9\tCh10\n\
    2024-01-01 00:00:00\t5.2\t180\t21.5\t65\t1013.2\t0\t30.1\t2.4\t3.1\t12.6\n\
    2024-01-01 00:10:00\t6.1\t190\t21.4\t66\t1013.0\t0.2\t30.0\t2.5\t3.0\t12.5\n\
    2024-01-01 00:20:00\t5.8\t185\t21.3\t66\t1012.9\t0\t29.8\t2.5\t3.0\t12.5\n";

pub const SYMPHONIE_EXPORT: &str = "SymphoniePRO Desktop Application\n\
    Export Version:\t2\n\
    Timestamp\tCh1\tCh2\tCh3\tCh4\tCh5\tCh6\tCh7\tCh8\tCh9\tCh10\tCh11\tCh12\tCh13\n\
    2024-02-01 00:00:00\t4.0\t90\t10.0\t70\t1000\t0\t15\t1.1\t1.2\t12.9\t410\t\t395\n";

/// Export with header and `count` valid lines, timestamps one minute apart
pub fn export_with_lines(count: usize) -> String {
    let mut text =
        String::from("Timestamp\tCh1\tCh2\tCh3\tCh4\tCh5\tCh6\tCh7\tCh8\tCh9\tCh10\n");
    for i in 0..count {
        text.push_str(&format!(
            "2024-03-01 {:02}:{:02}:00\t{}\t1\t1\t1\t1\t1\t1\t1\t1\t1\n",
            i / 60,
            i % 60,
            i
        ));
    }
    text
}

/// Converter stand-in that writes a fixed text export for each run
pub struct FakeConverter {
    pub output: String,
}

#[async_trait]
impl Converter for FakeConverter {
    async fn convert(&self, source_dir: &Path, output_dir: &Path) -> Result<(), ConversionError> {
        let mut entries = std::fs::read_dir(source_dir)?;
        let source = entries
            .next()
            .ok_or_else(|| ConversionError::MissingOutput(source_dir.to_path_buf()))??;
        let stem = source
            .path()
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        std::fs::write(output_dir.join(format!("{stem}.txt")), &self.output)?;
        Ok(())
    }
}

pub struct TestContext {
    pub pool: SqlitePool,
    pub dir: TempDir,
    pub blob_store: BlobStore,
    pub file_repo: FileRepository,
    pub record_repo: SensorRecordRepository,
    pub notifier: LiveNotifier,
    pub locks: FilenameLocks,
    pub ingest_service: IngestService,
    pub library_service: LibraryService,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_converter(Arc::new(UnconfiguredConverter)).await
    }

    pub async fn with_converter(converter: Arc<dyn Converter>) -> Self {
        let pool = connect_in_memory()
            .await
            .expect("Failed to create in-memory database");
        let dir = tempfile::tempdir().expect("Failed to create temp dir");

        let blob_store = BlobStore::new(dir.path().join("uploads"), dir.path().join("converted"));
        let file_repo = FileRepository::new(pool.clone());
        let record_repo = SensorRecordRepository::new(pool.clone());
        let notifier = LiveNotifier::new(
            Arc::new(record_repo.clone()),
            Duration::from_millis(100),
            16,
        );
        let locks = FilenameLocks::new();
        let ingest_service = IngestService::new(
            blob_store.clone(),
            converter,
            file_repo.clone(),
            notifier.clone(),
            locks.clone(),
        );
        let library_service = LibraryService::new(
            file_repo.clone(),
            record_repo.clone(),
            blob_store.clone(),
            locks.clone(),
        );

        Self {
            pool,
            dir,
            blob_store,
            file_repo,
            record_repo,
            notifier,
            locks,
            ingest_service,
            library_service,
        }
    }
}
