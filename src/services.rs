pub mod filename_locks;
pub mod ingest_service;
pub mod library_service;

pub use filename_locks::{FilenameGuard, FilenameLocks};
pub use ingest_service::{IngestError, IngestRequest, IngestService, IngestStage, IngestSummary};
pub use library_service::{
    ExportBody, ExportFormat, FileListResponse, LibraryError, LibraryQuery, LibraryService,
};
