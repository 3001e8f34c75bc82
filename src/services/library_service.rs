use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::db::{
    DbError, FileDetail, FileMetadata, FileMetadataUpdate, FileRepository, LibraryFilter,
    LibraryStats, SensorRecordRepository, SortField, SortOrder,
};
use crate::files::BlobStore;
use crate::services::filename_locks::FilenameLocks;
use crate::logger::{Channel, SensorRecord};
use crate::utils::{normalize_tags, parse_tag_list};

const MAX_PAGE_SIZE: u32 = 100;
const TOP_TAGS: i64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum LibraryError {
    #[error("File {0} not found")]
    NotFound(i64),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Export failed: {0}")]
    Export(String),
}

// Listing parameters (used by API)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LibraryQuery {
    pub search: Option<String>,
    pub category: Option<String>,
    /// Comma-separated; a file must carry all of them
    pub tags: Option<String>,
    #[serde(default)]
    pub sort_by: SortField,
    #[serde(default)]
    pub sort_order: SortOrder,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    50
}

impl LibraryQuery {
    pub fn page(&self) -> u32 {
        self.page.max(1)
    }

    pub fn page_size(&self) -> u32 {
        self.page_size.clamp(1, MAX_PAGE_SIZE)
    }

    pub fn offset(&self) -> i64 {
        (self.page() as i64 - 1) * self.page_size() as i64
    }

    pub fn limit(&self) -> i64 {
        self.page_size() as i64
    }

    pub fn filter(&self) -> LibraryFilter {
        LibraryFilter {
            search: self.search.clone().filter(|s| !s.trim().is_empty()),
            category: self.category.clone().filter(|c| !c.trim().is_empty()),
            tags: self.tags.as_deref().map(parse_tag_list).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileListResponse {
    pub total_files: i64,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u32,
    pub has_next_page: bool,
    pub has_prev_page: bool,
    pub files: Vec<FileMetadata>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkDeleteResult {
    pub deleted: Vec<FileMetadata>,
    pub not_found: Vec<i64>,
    /// Upload or converted blobs that could not be removed
    pub cleanup_failures: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
}

/// Field-complete export of one file
#[derive(Debug, Clone, Serialize)]
pub struct FileExport {
    pub metadata: FileMetadata,
    pub records: Vec<SensorRecord>,
    pub exported_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum ExportBody {
    Json(FileExport),
    Csv { filename: String, body: String },
}

/// Library management on top of the file and record repositories
#[derive(Clone)]
pub struct LibraryService {
    file_repo: FileRepository,
    record_repo: SensorRecordRepository,
    blob_store: BlobStore,
    locks: FilenameLocks,
}

impl LibraryService {
    pub fn new(
        file_repo: FileRepository,
        record_repo: SensorRecordRepository,
        blob_store: BlobStore,
        locks: FilenameLocks,
    ) -> Self {
        Self {
            file_repo,
            record_repo,
            blob_store,
            locks,
        }
    }

    /// Filtered, sorted, paginated listing with the total match count
    #[instrument(skip(self))]
    pub async fn list(&self, query: &LibraryQuery) -> Result<FileListResponse, LibraryError> {
        let filter = query.filter();
        let total_files = self.file_repo.count(&filter).await?;
        let files = self
            .file_repo
            .find_filtered(
                &filter,
                query.sort_by,
                query.sort_order,
                query.offset(),
                query.limit(),
            )
            .await?;

        let page = query.page();
        let page_size = query.page_size();
        let total_pages = (total_files as u64).div_ceil(page_size as u64) as u32;

        Ok(FileListResponse {
            total_files,
            page,
            page_size,
            total_pages,
            has_next_page: page < total_pages,
            has_prev_page: page > 1,
            files,
        })
    }

    /// Metadata plus every record of one file
    #[instrument(skip(self))]
    pub async fn get_detail(&self, id: i64) -> Result<FileDetail, LibraryError> {
        self.file_repo.touch(id).await?;
        let metadata = self
            .file_repo
            .find_by_id(id)
            .await?
            .ok_or(LibraryError::NotFound(id))?;
        let records = self.record_repo.find_by_filename(&metadata.filename).await?;

        debug!("Loaded {} with {} records", metadata.filename, records.len());
        Ok(FileDetail { metadata, records })
    }

    #[instrument(skip(self, update))]
    pub async fn update(
        &self,
        id: i64,
        mut update: FileMetadataUpdate,
    ) -> Result<FileMetadata, LibraryError> {
        if let Some(tags) = update.tags.take() {
            update.tags = Some(normalize_tags(tags));
        }
        self.file_repo
            .update_metadata(id, &update)
            .await?
            .ok_or(LibraryError::NotFound(id))
    }

    /// Delete one file, its records and its blobs
    #[instrument(skip(self))]
    pub async fn delete(&self, id: i64) -> Result<FileMetadata, LibraryError> {
        let mut result = self.bulk_delete(&[id]).await?;
        result.deleted.pop().ok_or(LibraryError::NotFound(id))
    }

    /// Delete several files atomically, then clean up their blobs
    ///
    /// The affected filenames stay locked against ingestion from before the
    /// catalog delete until their blobs are gone, so a concurrent re-ingest
    /// lands either entirely before or entirely after. Blob cleanup never
    /// undoes the catalog commit.
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn bulk_delete(&self, ids: &[i64]) -> Result<BulkDeleteResult, LibraryError> {
        let mut filenames = Vec::new();
        for id in ids {
            if let Some(file) = self.file_repo.find_by_id(*id).await? {
                filenames.push(file.filename);
            }
        }
        let _guards = self
            .locks
            .lock_all(filenames.iter().map(String::as_str))
            .await;

        let deleted = self.file_repo.delete_many(ids).await?;

        let not_found: Vec<i64> = ids
            .iter()
            .copied()
            .filter(|id| !deleted.iter().any(|f| f.id == *id))
            .collect();

        let mut cleanup_failures = 0;
        for file in &deleted {
            cleanup_failures += self.blob_store.remove_artifacts(&file.filename).await;
        }
        if cleanup_failures > 0 {
            warn!(
                "{} artifacts could not be removed after deleting {} files",
                cleanup_failures,
                deleted.len()
            );
        }

        info!(
            "Bulk delete: {} deleted, {} not found",
            deleted.len(),
            not_found.len()
        );
        Ok(BulkDeleteResult {
            deleted,
            not_found,
            cleanup_failures,
        })
    }

    #[instrument(skip(self))]
    pub async fn stats(&self) -> Result<LibraryStats, LibraryError> {
        Ok(self.file_repo.stats(TOP_TAGS).await?)
    }

    /// Stored records, optionally restricted to one file
    #[instrument(skip(self))]
    pub async fn records(&self, filename: Option<&str>) -> Result<Vec<SensorRecord>, LibraryError> {
        let records = match filename {
            Some(name) => self.record_repo.find_by_filename(name).await?,
            None => self.record_repo.find_all().await?,
        };
        Ok(records)
    }

    #[instrument(skip(self))]
    pub async fn export(&self, id: i64, format: ExportFormat) -> Result<ExportBody, LibraryError> {
        let FileDetail { metadata, records } = self.get_detail(id).await?;

        match format {
            ExportFormat::Json => Ok(ExportBody::Json(FileExport {
                metadata,
                records,
                exported_at: Utc::now(),
            })),
            ExportFormat::Csv => {
                let body = records_to_csv(&records)?;
                let stem = std::path::Path::new(&metadata.filename)
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| metadata.filename.clone());
                Ok(ExportBody::Csv {
                    filename: format!("{stem}.csv"),
                    body,
                })
            }
        }
    }
}

/// Flat table: timestamp, filename, then every channel in fixed order
pub fn records_to_csv(records: &[SensorRecord]) -> Result<String, LibraryError> {
    let export_err = |e: csv::Error| LibraryError::Export(e.to_string());
    let mut writer = csv::Writer::from_writer(Vec::new());

    let mut header = vec!["timestamp", "filename"];
    header.extend(Channel::ALL.iter().map(|c| c.wire_name()));
    writer.write_record(&header).map_err(export_err)?;

    for record in records {
        let mut row = vec![record.timestamp.clone(), record.filename.clone()];
        row.extend(record.values().iter().map(|v| v.to_string()));
        writer.write_record(&row).map_err(export_err)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| LibraryError::Export(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| LibraryError::Export(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_is_capped_consistently() {
        let query = LibraryQuery {
            page: 3,
            page_size: 500,
            ..Default::default()
        };
        assert_eq!(query.page_size(), 100);
        assert_eq!(query.limit(), 100);
        assert_eq!(query.offset(), 200);
    }

    #[test]
    fn test_page_zero_is_first_page() {
        let query = LibraryQuery {
            page: 0,
            page_size: 10,
            ..Default::default()
        };
        assert_eq!(query.page(), 1);
        assert_eq!(query.offset(), 0);
    }

    #[test]
    fn test_filter_splits_tags_and_drops_blank_search() {
        let query = LibraryQuery {
            search: Some("  ".into()),
            tags: Some("RLD, mast-a,".into()),
            ..Default::default()
        };
        let filter = query.filter();
        assert!(filter.search.is_none());
        assert_eq!(filter.tags, vec!["RLD", "mast-a"]);
    }

    #[test]
    fn test_csv_has_every_channel_even_when_zero() {
        let mut record = SensorRecord::new("2024-01-01 00:00:00", "site.txt");
        record.wind_speed = 5.2;

        let csv = records_to_csv(&[record]).unwrap();
        let mut lines = csv.lines();

        let header: Vec<&str> = lines.next().unwrap().split(',').collect();
        assert_eq!(header.len(), 2 + Channel::ALL.len());
        assert_eq!(header[2], "NRG_40C_Anem");
        assert_eq!(header[14], "Solar_Irradiance_3");

        let row: Vec<&str> = lines.next().unwrap().split(',').collect();
        assert_eq!(row[0], "2024-01-01 00:00:00");
        assert_eq!(row[2], "5.2");
        assert_eq!(row[14], "0");
    }
}
