use chrono::{Duration, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use super::Database;
use crate::errors::{StorageError, StorageResult};
use crate::utils::sqlite::format_timestamp;

impl Database {
    /// Make `source_id` visible to `session_id`. Returns `false` when it already was.
    pub async fn associate_source_with_session(
        &self,
        session_id: &str,
        source_id: Uuid,
    ) -> StorageResult<bool> {
        let result = sqlx::query(
            "INSERT INTO session_sources (session_id, source_id, created_at) VALUES (?, ?, ?) \
             ON CONFLICT (session_id, source_id) DO NOTHING",
        )
        .bind(session_id)
        .bind(source_id.to_string())
        .bind(format_timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() > 0;
        debug!(
            "Session {} -> source {}: {}",
            session_id,
            source_id,
            if inserted { "associated" } else { "already associated" }
        );
        Ok(inserted)
    }

    pub async fn session_source_ids(&self, session_id: &str) -> StorageResult<Vec<Uuid>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT source_id FROM session_sources WHERE session_id = ? ORDER BY created_at",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        ids.iter()
            .map(|id| {
                Uuid::parse_str(id)
                    .map_err(|e| StorageError::corrupt_row("session_sources", e.to_string()))
            })
            .collect()
    }

    /// Delete associations older than `max_age`. Sources and channels are left alone.
    pub async fn sweep_expired_session_associations(&self, max_age: Duration) -> StorageResult<u64> {
        let cutoff = format_timestamp(Utc::now() - max_age);
        let result = sqlx::query("DELETE FROM session_sources WHERE created_at < ?")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?;

        let removed = result.rows_affected();
        if removed > 0 {
            info!("Swept {} session associations created before {}", removed, cutoff);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::memory_database;
    use crate::models::{SourceKind, SourceUpsertRequest};

    async fn source(db: &Database) -> Uuid {
        db.upsert_source(&SourceUpsertRequest {
            name: "A".to_string(),
            url: "http://a".to_string(),
            username: None,
            password: None,
            kind: SourceKind::Playlist,
        })
        .await
        .unwrap()
        .source
        .id
    }

    async fn age_association(db: &Database, session_id: &str, hours: i64) {
        sqlx::query("UPDATE session_sources SET created_at = ? WHERE session_id = ?")
            .bind(format_timestamp(Utc::now() - Duration::hours(hours)))
            .bind(session_id)
            .execute(db.pool())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reassociation_is_a_no_op() {
        let db = memory_database(10).await;
        let id = source(&db).await;

        assert!(db.associate_source_with_session("s1", id).await.unwrap());
        assert!(!db.associate_source_with_session("s1", id).await.unwrap());
        assert!(db.associate_source_with_session("s2", id).await.unwrap());
        assert_eq!(db.session_source_ids("s1").await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_sweep_removes_only_old_associations() {
        let db = memory_database(10).await;
        let id = source(&db).await;
        db.associate_source_with_session("old", id).await.unwrap();
        db.associate_source_with_session("new", id).await.unwrap();
        age_association(&db, "old", 48).await;

        let removed = db.sweep_expired_session_associations(Duration::hours(24)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(db.session_source_ids("old").await.unwrap().is_empty());
        assert_eq!(db.session_source_ids("new").await.unwrap(), vec![id]);

        // the source itself survives the sweep
        assert!(db.get_source(id).await.unwrap().is_some());
        assert_eq!(db.sweep_expired_session_associations(Duration::hours(24)).await.unwrap(), 0);
    }
}
