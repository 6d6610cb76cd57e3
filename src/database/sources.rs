use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use super::Database;
use crate::errors::{StorageError, StorageResult};
use crate::models::{
    Source, SourceKind, SourceStatistics, SourceUpsertOutcome, SourceUpsertRequest,
    StorageStatistics,
};
use crate::services::credentials::password_digest;
use crate::utils::sqlite::{format_timestamp, SqliteRowExt};

const SOURCE_COLUMNS: &str = "id, name, url, username, kind, created_at, last_synced_at";

fn source_from_row(row: &SqliteRow) -> StorageResult<Source> {
    let username: String = row.try_get("username")?;
    let kind: String = row.try_get("kind")?;
    Ok(Source {
        id: row.get_uuid("id")?,
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        username: (!username.is_empty()).then_some(username),
        kind: kind
            .parse::<SourceKind>()
            .map_err(|e| StorageError::corrupt_row("sources", e))?,
        created_at: row.get_datetime("created_at")?,
        last_synced_at: row.get_datetime("last_synced_at")?,
    })
}

impl Database {
    /// Insert a source, or refresh name, kind and sync time of the one that
    /// already has the same (url, username, password). One atomic statement.
    pub async fn upsert_source(
        &self,
        request: &SourceUpsertRequest,
    ) -> StorageResult<SourceUpsertOutcome> {
        let candidate_id = Uuid::new_v4();
        let now = format_timestamp(Utc::now());

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO sources (id, name, url, username, password_digest, kind, created_at, last_synced_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (url, username, password_digest) DO UPDATE SET
                name = excluded.name,
                kind = excluded.kind,
                last_synced_at = excluded.last_synced_at
            RETURNING {SOURCE_COLUMNS}
            "#
        ))
        .bind(candidate_id.to_string())
        .bind(&request.name)
        .bind(&request.url)
        .bind(request.username.as_deref().unwrap_or_default())
        .bind(password_digest(request.password.as_deref()))
        .bind(request.kind.as_str())
        .bind(&now)
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;

        let source = source_from_row(&row)?;
        let created = source.id == candidate_id;
        info!(
            "{} source {} ({})",
            if created { "Created" } else { "Refreshed" },
            source.name,
            source.id
        );
        Ok(SourceUpsertOutcome { source, created })
    }

    pub async fn get_source(&self, id: Uuid) -> StorageResult<Option<Source>> {
        let row = sqlx::query(&format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(source_from_row).transpose()
    }

    pub async fn list_sources(&self) -> StorageResult<Vec<Source>> {
        let rows = sqlx::query(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources ORDER BY name COLLATE NOCASE, created_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(source_from_row).collect()
    }

    /// Delete a source together with its channels, categories and session associations
    pub async fn delete_source(&self, id: Uuid) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM sources WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        let deleted = result.rows_affected() > 0;
        debug!("Delete source {}: {}", id, deleted);
        Ok(deleted)
    }

    pub async fn storage_statistics(&self) -> StorageResult<StorageStatistics> {
        let totals = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM sources) AS sources,
                (SELECT COUNT(*) FROM channels) AS channels,
                (SELECT COUNT(*) FROM categories) AS categories,
                (SELECT COUNT(*) FROM session_sources) AS session_associations
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(
            r#"
            SELECT s.id, s.name, s.url, s.username, s.kind, s.created_at, s.last_synced_at,
                (SELECT COUNT(*) FROM channels c WHERE c.source_id = s.id) AS channel_count,
                (SELECT COUNT(*) FROM categories cat WHERE cat.source_id = s.id) AS category_count,
                (SELECT COUNT(*) FROM channels c
                    WHERE c.source_id = s.id AND c.epg_channel_id IS NOT NULL) AS mapped_channel_count
            FROM sources s
            ORDER BY s.name COLLATE NOCASE
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let source_details = rows
            .iter()
            .map(|row| -> StorageResult<SourceStatistics> {
                Ok(SourceStatistics {
                    source: source_from_row(row)?,
                    channel_count: row.try_get("channel_count")?,
                    category_count: row.try_get("category_count")?,
                    mapped_channel_count: row.try_get("mapped_channel_count")?,
                })
            })
            .collect::<StorageResult<Vec<_>>>()?;

        Ok(StorageStatistics {
            sources: totals.try_get("sources")?,
            channels: totals.try_get("channels")?,
            categories: totals.try_get("categories")?,
            session_associations: totals.try_get("session_associations")?,
            source_details,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::memory_database;

    fn request(password: Option<&str>) -> SourceUpsertRequest {
        SourceUpsertRequest {
            name: "Provider".to_string(),
            url: "http://provider.example/get.php".to_string(),
            username: Some("alice".to_string()),
            password: password.map(str::to_string),
            kind: SourceKind::Playlist,
        }
    }

    #[tokio::test]
    async fn test_upsert_source_is_idempotent_by_url_and_credentials() {
        let db = memory_database(10).await;

        let first = db.upsert_source(&request(Some("secret"))).await.unwrap();
        assert!(first.created);

        let mut renamed = request(Some("secret"));
        renamed.name = "Renamed".to_string();
        let second = db.upsert_source(&renamed).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.source.id, first.source.id);
        assert_eq!(second.source.name, "Renamed");
        assert!(second.source.last_synced_at >= first.source.last_synced_at);
        assert_eq!(second.source.created_at, first.source.created_at);

        assert_eq!(db.list_sources().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_different_password_is_a_different_source() {
        let db = memory_database(10).await;
        let a = db.upsert_source(&request(Some("one"))).await.unwrap();
        let b = db.upsert_source(&request(Some("two"))).await.unwrap();
        let c = db.upsert_source(&request(None)).await.unwrap();
        let d = db.upsert_source(&request(None)).await.unwrap();

        assert_ne!(a.source.id, b.source.id);
        assert_ne!(b.source.id, c.source.id);
        assert_eq!(c.source.id, d.source.id);
        assert!(!d.created);
    }

    #[tokio::test]
    async fn test_password_is_not_stored_in_clear() {
        let db = memory_database(10).await;
        db.upsert_source(&request(Some("hunter2"))).await.unwrap();

        let stored: String = sqlx::query_scalar("SELECT password_digest FROM sources")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_ne!(stored, "hunter2");
        assert_eq!(stored.len(), 64);
    }

    #[tokio::test]
    async fn test_get_and_delete_source() {
        let db = memory_database(10).await;
        let outcome = db.upsert_source(&request(None)).await.unwrap();
        let id = outcome.source.id;

        assert_eq!(db.get_source(id).await.unwrap().unwrap().username.as_deref(), Some("alice"));
        assert!(db.delete_source(id).await.unwrap());
        assert!(db.get_source(id).await.unwrap().is_none());
        assert!(!db.delete_source(id).await.unwrap());
    }
}
