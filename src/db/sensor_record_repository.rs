use sqlx::SqlitePool;
use tracing::{debug, instrument};

use crate::db::{sensor_record_from_row, DbError};
use crate::logger::{Channel, SensorRecord};

/// Read access to the stored time series
#[derive(Clone)]
pub struct SensorRecordRepository {
    pool: SqlitePool,
}

impl SensorRecordRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn select_sql(filter_by_filename: bool) -> String {
        let channels: Vec<&str> = Channel::ALL.iter().map(|c| c.column_name()).collect();
        let filter = if filter_by_filename {
            " WHERE filename = ?"
        } else {
            ""
        };
        format!(
            "SELECT filename, timestamp, {} FROM sensor_records{} ORDER BY timestamp ASC, id ASC",
            channels.join(", "),
            filter
        )
    }

    /// Every stored record ordered by timestamp
    #[instrument(skip(self))]
    pub async fn find_all(&self) -> Result<Vec<SensorRecord>, DbError> {
        let rows = sqlx::query(&Self::select_sql(false))
            .fetch_all(&self.pool)
            .await?;

        let records = rows
            .iter()
            .map(sensor_record_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        debug!("Loaded {} records", records.len());
        Ok(records)
    }

    /// Records owned by one file, ordered by timestamp
    #[instrument(skip(self), fields(filename = %filename))]
    pub async fn find_by_filename(&self, filename: &str) -> Result<Vec<SensorRecord>, DbError> {
        let rows = sqlx::query(&Self::select_sql(true))
            .bind(filename)
            .fetch_all(&self.pool)
            .await?;

        let records = rows
            .iter()
            .map(sensor_record_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        debug!("Found {} records for {}", records.len(), filename);
        Ok(records)
    }

    #[instrument(skip(self))]
    pub async fn count(&self) -> Result<i64, DbError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sensor_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    #[instrument(skip(self), fields(filename = %filename))]
    pub async fn count_by_filename(&self, filename: &str) -> Result<i64, DbError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sensor_records WHERE filename = ?")
                .bind(filename)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}
