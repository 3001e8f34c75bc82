use chrono::{Duration, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool, Transaction};
use tracing::{debug, error, info, instrument};

use crate::db::{
    CategoryCount, DbError, FileMetadata, FileMetadataUpdate, FileRegistration, FileStatus,
    LibraryFilter, LibraryStats, RegisteredFile, SortField, SortOrder, SourceCount, TagCount,
};
use crate::logger::{Channel, SensorRecord};

/// SQLite caps bound parameters per statement; 2 + 13 channels per row
const RECORDS_PER_INSERT: usize = 60;

const FILE_COLUMNS: &str = "id, filename, ingested_at, processing_date, record_count, file_size, \
     status, tags, category, description, source, checksum, version, last_accessed";

/// Library catalog: file metadata plus the records each file owns
#[derive(Clone)]
pub struct FileRepository {
    pool: SqlitePool,
}

impl FileRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Upsert a file's metadata and replace its records in one transaction
    ///
    /// A new filename is inserted with status `processed`. An existing
    /// filename keeps its id, gets status `updated`, a bumped version and the
    /// new counts; its previous records are replaced by `records`. Any
    /// failure rolls the whole registration back.
    #[instrument(skip(self, registration, records), fields(filename = %registration.filename, count = records.len()))]
    pub async fn register_with_records(
        &self,
        registration: &FileRegistration,
        records: &[SensorRecord],
    ) -> Result<RegisteredFile, DbError> {
        debug!(
            "Beginning transaction to register {} with {} records",
            registration.filename,
            records.len()
        );
        let mut tx = self.pool.begin().await?;

        let now = Utc::now();
        let processing_date = now.format("%Y-%m-%d %H:%M:%S").to_string();
        let tags_json = serde_json::to_string(&registration.tags)?;

        // Write first so the transaction takes the write lock up front
        let (id, status, version): (i64, String, i64) = sqlx::query_as(
            r#"
            INSERT INTO file_metadata (
                filename, ingested_at, processing_date, record_count, file_size,
                status, tags, category, description, source, checksum, version, last_accessed
            )
            VALUES (?, ?, ?, ?, ?, 'processed', ?, ?, ?, ?, ?, 1, ?)
            ON CONFLICT (filename) DO UPDATE SET
                ingested_at = excluded.ingested_at,
                processing_date = excluded.processing_date,
                record_count = excluded.record_count,
                file_size = excluded.file_size,
                status = 'updated',
                tags = excluded.tags,
                category = excluded.category,
                description = COALESCE(excluded.description, file_metadata.description),
                source = excluded.source,
                checksum = excluded.checksum,
                version = file_metadata.version + 1
            RETURNING id, status, version
            "#,
        )
        .bind(&registration.filename)
        .bind(now)
        .bind(&processing_date)
        .bind(records.len() as i64)
        .bind(registration.file_size)
        .bind(&tags_json)
        .bind(&registration.category)
        .bind(&registration.description)
        .bind(registration.source.as_str())
        .bind(&registration.checksum)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            error!(
                filename = %registration.filename,
                error = %e,
                "Failed to upsert file metadata"
            );
            e
        })?;

        let replaced = sqlx::query("DELETE FROM sensor_records WHERE filename = ?")
            .bind(&registration.filename)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let inserted = Self::insert_records(&mut tx, &registration.filename, records).await?;

        tx.commit().await?;

        let status = status.parse::<FileStatus>().unwrap_or(FileStatus::Processed);
        info!(
            "Registered {} (id {}, status {}, version {}): {} records inserted, {} replaced",
            registration.filename, id, status, version, inserted, replaced
        );

        Ok(RegisteredFile {
            id,
            status,
            version,
            records_inserted: inserted,
            records_replaced: replaced,
        })
    }

    /// Bulk insert records tagged with their owning filename
    async fn insert_records(
        tx: &mut Transaction<'_, Sqlite>,
        filename: &str,
        records: &[SensorRecord],
    ) -> Result<usize, DbError> {
        let mut inserted = 0;

        for chunk in records.chunks(RECORDS_PER_INSERT) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("INSERT INTO sensor_records (filename, timestamp");
            for channel in Channel::ALL {
                builder.push(", ").push(channel.column_name());
            }
            builder.push(") ");

            builder.push_values(chunk, |mut row, record| {
                row.push_bind(filename).push_bind(record.timestamp.as_str());
                for value in record.values() {
                    row.push_bind(value);
                }
            });

            let result = builder.build().execute(&mut **tx).await?;
            inserted += result.rows_affected() as usize;
        }

        debug!("Inserted {} records for {}", inserted, filename);
        Ok(inserted)
    }

    #[instrument(skip(self))]
    pub async fn find_by_id(&self, id: i64) -> Result<Option<FileMetadata>, DbError> {
        let sql = format!("SELECT {FILE_COLUMNS} FROM file_metadata WHERE id = ?");
        let file = sqlx::query_as::<_, FileMetadata>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        if file.is_some() {
            debug!("Found file {}", id);
        } else {
            debug!("File {} not found", id);
        }
        Ok(file)
    }

    #[instrument(skip(self), fields(filename = %filename))]
    pub async fn find_by_filename(&self, filename: &str) -> Result<Option<FileMetadata>, DbError> {
        let sql = format!("SELECT {FILE_COLUMNS} FROM file_metadata WHERE filename = ?");
        let file = sqlx::query_as::<_, FileMetadata>(&sql)
            .bind(filename)
            .fetch_optional(&self.pool)
            .await?;
        Ok(file)
    }

    /// Count files matching a filter
    #[instrument(skip(self))]
    pub async fn count(&self, filter: &LibraryFilter) -> Result<i64, DbError> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) FROM file_metadata");
        push_filter(&mut builder, filter);

        let count: i64 = builder.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count)
    }

    /// One page of files matching a filter; ties on the sort key break by id
    #[instrument(skip(self))]
    pub async fn find_filtered(
        &self,
        filter: &LibraryFilter,
        sort_by: SortField,
        sort_order: SortOrder,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<FileMetadata>, DbError> {
        debug!(
            "Querying files with offset={}, limit={}, sort={:?} {:?}",
            offset, limit, sort_by, sort_order
        );

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {FILE_COLUMNS} FROM file_metadata"));
        push_filter(&mut builder, filter);
        builder
            .push(" ORDER BY ")
            .push(sort_by.column())
            .push(" ")
            .push(sort_order.keyword())
            .push(", id ASC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);

        let files = builder
            .build_query_as::<FileMetadata>()
            .fetch_all(&self.pool)
            .await?;

        debug!("Found {} files", files.len());
        Ok(files)
    }

    /// Apply a partial metadata update, returning the updated row
    #[instrument(skip(self, update))]
    pub async fn update_metadata(
        &self,
        id: i64,
        update: &FileMetadataUpdate,
    ) -> Result<Option<FileMetadata>, DbError> {
        let tags_json = update
            .tags
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let description = update.description.as_deref().map(str::trim);

        let result = sqlx::query(
            r#"
            UPDATE file_metadata SET
                tags = COALESCE(?, tags),
                category = COALESCE(?, category),
                description = CASE WHEN ? IS NULL THEN description ELSE NULLIF(?, '') END,
                status = COALESCE(?, status)
            WHERE id = ?
            "#,
        )
        .bind(tags_json)
        .bind(&update.category)
        .bind(description)
        .bind(description)
        .bind(update.status.map(|s| s.as_str()))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!("No file {} to update", id);
            return Ok(None);
        }

        info!("Updated metadata for file {}", id);
        self.find_by_id(id).await
    }

    /// Record a read of this file
    #[instrument(skip(self))]
    pub async fn touch(&self, id: i64) -> Result<(), DbError> {
        sqlx::query("UPDATE file_metadata SET last_accessed = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete files and every record they own in a single transaction
    ///
    /// Returns the metadata of the rows actually deleted; unknown ids are
    /// ignored.
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn delete_many(&self, ids: &[i64]) -> Result<Vec<FileMetadata>, DbError> {
        let mut tx = self.pool.begin().await?;
        let mut deleted = Vec::new();
        let mut records_deleted = 0;

        for id in ids {
            let sql = format!("SELECT {FILE_COLUMNS} FROM file_metadata WHERE id = ?");
            let Some(file) = sqlx::query_as::<_, FileMetadata>(&sql)
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?
            else {
                debug!("File {} not found, skipping", id);
                continue;
            };

            records_deleted += sqlx::query("DELETE FROM sensor_records WHERE filename = ?")
                .bind(&file.filename)
                .execute(&mut *tx)
                .await?
                .rows_affected();

            sqlx::query("DELETE FROM file_metadata WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;

            deleted.push(file);
        }

        tx.commit().await?;
        info!(
            "Deleted {} files and {} records",
            deleted.len(),
            records_deleted
        );
        Ok(deleted)
    }

    /// Aggregate views over the catalog; nothing here is a stored counter
    #[instrument(skip(self))]
    pub async fn stats(&self, top_tags: i64) -> Result<LibraryStats, DbError> {
        let (total_files, total_bytes): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(file_size), 0) FROM file_metadata",
        )
        .fetch_one(&self.pool)
        .await?;

        let total_records: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sensor_records")
            .fetch_one(&self.pool)
            .await?;

        let now = Utc::now();
        let files_last_7_days = self.count_since(now - Duration::days(7)).await?;
        let files_last_30_days = self.count_since(now - Duration::days(30)).await?;

        let by_source = sqlx::query_as::<_, SourceCount>(
            "SELECT source, COUNT(*) AS count FROM file_metadata GROUP BY source ORDER BY count DESC, source",
        )
        .fetch_all(&self.pool)
        .await?;

        let by_category = sqlx::query_as::<_, CategoryCount>(
            "SELECT category, COUNT(*) AS count FROM file_metadata GROUP BY category ORDER BY count DESC, category",
        )
        .fetch_all(&self.pool)
        .await?;

        let top_tags = sqlx::query_as::<_, TagCount>(
            r#"
            SELECT t.value AS tag, COUNT(*) AS count
            FROM file_metadata, json_each(file_metadata.tags) AS t
            GROUP BY t.value
            ORDER BY count DESC, tag
            LIMIT ?
            "#,
        )
        .bind(top_tags)
        .fetch_all(&self.pool)
        .await?;

        Ok(LibraryStats {
            total_files,
            total_records,
            total_bytes,
            files_last_7_days,
            files_last_30_days,
            by_source,
            by_category,
            top_tags,
        })
    }

    async fn count_since(&self, since: chrono::DateTime<Utc>) -> Result<i64, DbError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM file_metadata WHERE ingested_at >= ?")
                .bind(since)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

/// Append WHERE clauses for a library filter
fn push_filter(builder: &mut QueryBuilder<'_, Sqlite>, filter: &LibraryFilter) {
    let mut clause = " WHERE ";

    if let Some(search) = filter.search.as_deref().filter(|s| !s.is_empty()) {
        builder
            .push(clause)
            .push("instr(lower(filename), lower(")
            .push_bind(search.to_string())
            .push(")) > 0");
        clause = " AND ";
    }

    if let Some(category) = filter.category.as_deref().filter(|c| !c.is_empty()) {
        builder
            .push(clause)
            .push("category = ")
            .push_bind(category.to_string());
        clause = " AND ";
    }

    for tag in &filter.tags {
        builder
            .push(clause)
            .push("EXISTS (SELECT 1 FROM json_each(file_metadata.tags) WHERE json_each.value = ")
            .push_bind(tag.clone())
            .push(")");
        clause = " AND ";
    }
}
