use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};
use std::fmt;
use std::str::FromStr;

use crate::logger::{Channel, SensorRecord};

/// Processing status of a library entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Active,
    Updated,
    Processed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Updated => "updated",
            Self::Processed => "processed",
        }
    }
}

impl FromStr for FileStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "updated" => Ok(Self::Updated),
            "processed" => Ok(Self::Processed),
            other => Err(format!("unknown file status: {other}")),
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an ingested file came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileSource {
    Backend,
    TxtUpload,
    LocalClient,
}

impl FileSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backend => "backend",
            Self::TxtUpload => "txt_upload",
            Self::LocalClient => "local_client",
        }
    }
}

impl FromStr for FileSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backend" => Ok(Self::Backend),
            "txt_upload" => Ok(Self::TxtUpload),
            "local_client" => Ok(Self::LocalClient),
            other => Err(format!("unknown file source: {other}")),
        }
    }
}

impl fmt::Display for FileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Database entity models
#[derive(Debug, Clone, Serialize)]
pub struct FileMetadata {
    pub id: i64,
    pub filename: String,
    pub ingested_at: DateTime<Utc>,
    pub processing_date: String,
    pub record_count: i64,
    pub file_size: i64,
    pub status: FileStatus,
    pub tags: Vec<String>,
    pub category: String,
    pub description: Option<String>,
    pub source: FileSource,
    pub checksum: Option<String>,
    pub version: i64,
    pub last_accessed: DateTime<Utc>,
}

fn decode_text<T: FromStr<Err = String>>(row: &SqliteRow, column: &str) -> Result<T, sqlx::Error> {
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|e: String| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: e.into(),
    })
}

impl<'r> FromRow<'r, SqliteRow> for FileMetadata {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let tags_json: String = row.try_get("tags")?;
        let tags: Vec<String> =
            serde_json::from_str(&tags_json).map_err(|e| sqlx::Error::ColumnDecode {
                index: "tags".to_string(),
                source: Box::new(e),
            })?;

        Ok(Self {
            id: row.try_get("id")?,
            filename: row.try_get("filename")?,
            ingested_at: row.try_get("ingested_at")?,
            processing_date: row.try_get("processing_date")?,
            record_count: row.try_get("record_count")?,
            file_size: row.try_get("file_size")?,
            status: decode_text(row, "status")?,
            tags,
            category: row.try_get("category")?,
            description: row.try_get("description")?,
            source: decode_text(row, "source")?,
            checksum: row.try_get("checksum")?,
            version: row.try_get("version")?,
            last_accessed: row.try_get("last_accessed")?,
        })
    }
}

/// Decode a `sensor_records` row into the parser's record type
pub fn sensor_record_from_row(row: &SqliteRow) -> Result<SensorRecord, sqlx::Error> {
    let mut record = SensorRecord::new(
        row.try_get::<String, _>("timestamp")?,
        row.try_get::<String, _>("filename")?,
    );
    for channel in Channel::ALL {
        let value: f64 = row.try_get(channel.column_name())?;
        record.set(channel, value);
    }
    Ok(record)
}

/// Everything needed to register one ingested file
#[derive(Debug, Clone)]
pub struct FileRegistration {
    pub filename: String,
    pub file_size: i64,
    pub tags: Vec<String>,
    pub category: String,
    pub description: Option<String>,
    pub source: FileSource,
    pub checksum: Option<String>,
}

/// Outcome of `FileRepository::register_with_records`
#[derive(Debug, Clone, Serialize)]
pub struct RegisteredFile {
    pub id: i64,
    pub status: FileStatus,
    pub version: i64,
    pub records_inserted: usize,
    pub records_replaced: u64,
}

/// Mutable fields of a library entry; `None` leaves a field unchanged
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileMetadataUpdate {
    pub tags: Option<Vec<String>>,
    pub category: Option<String>,
    /// An empty (or all-whitespace) string clears the description
    pub description: Option<String>,
    pub status: Option<FileStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    Filename,
    Size,
    RecordCount,
    #[default]
    Timestamp,
}

impl SortField {
    pub fn column(&self) -> &'static str {
        match self {
            Self::Filename => "filename",
            Self::Size => "file_size",
            Self::RecordCount => "record_count",
            Self::Timestamp => "ingested_at",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Filters applied to a library listing
#[derive(Debug, Clone, Default)]
pub struct LibraryFilter {
    /// Substring match on filename
    pub search: Option<String>,
    pub category: Option<String>,
    /// A file matches only if it carries every tag listed
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct SourceCount {
    pub source: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct CategoryCount {
    pub category: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct TagCount {
    pub tag: String,
    pub count: i64,
}

// API response DTOs (to avoid circular dependency between services and api modules)
#[derive(Debug, Clone, Serialize)]
pub struct LibraryStats {
    pub total_files: i64,
    pub total_records: i64,
    pub total_bytes: i64,
    pub files_last_7_days: i64,
    pub files_last_30_days: i64,
    pub by_source: Vec<SourceCount>,
    pub by_category: Vec<CategoryCount>,
    pub top_tags: Vec<TagCount>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileDetail {
    pub metadata: FileMetadata,
    pub records: Vec<SensorRecord>,
}
