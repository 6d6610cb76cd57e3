//! Typed column access for rows that store timestamps and ids as TEXT

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use uuid::Uuid;

use crate::errors::{StorageError, StorageResult};

pub trait SqliteRowExt {
    fn get_datetime(&self, column: &str) -> StorageResult<DateTime<Utc>>;
    fn get_uuid(&self, column: &str) -> StorageResult<Uuid>;
    /// Decode a JSON array column, treating NULL as empty
    fn get_json_list(&self, column: &str) -> StorageResult<Vec<String>>;
}

impl SqliteRowExt for sqlx::sqlite::SqliteRow {
    fn get_datetime(&self, column: &str) -> StorageResult<DateTime<Utc>> {
        let value: String = self.try_get(column)?;
        DateTime::parse_from_rfc3339(&value)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| StorageError::corrupt_row(column, format!("bad timestamp '{value}': {e}")))
    }

    fn get_uuid(&self, column: &str) -> StorageResult<Uuid> {
        let value: String = self.try_get(column)?;
        Uuid::parse_str(&value)
            .map_err(|e| StorageError::corrupt_row(column, format!("bad uuid '{value}': {e}")))
    }

    fn get_json_list(&self, column: &str) -> StorageResult<Vec<String>> {
        let value: Option<String> = self.try_get(column)?;
        match value {
            Some(json) if !json.is_empty() => Ok(serde_json::from_str(&json)?),
            _ => Ok(Vec::new()),
        }
    }
}

/// Fixed-width RFC3339 (millisecond precision, `Z` suffix) so stored
/// timestamps compare correctly as text
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_rfc3339() -> String {
    format_timestamp(Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamps_sort_lexically() {
        let earlier = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let later = earlier + chrono::Duration::milliseconds(500);
        assert_eq!(format_timestamp(earlier), "2024-01-01T12:00:00.000Z");
        assert!(format_timestamp(earlier) < format_timestamp(later));
    }
}
