use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::{debug, info};

use crate::assets::MigrationAssets;
use crate::config::{DatabaseConfig, IngestionConfig};
use crate::errors::{StorageError, StorageResult};
use crate::utils::sqlite::now_rfc3339;

pub mod channels;
pub mod sessions;
pub mod sources;

/// Handle to the SQLite store. Cheap to clone.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    channel_batch_size: usize,
}

impl Database {
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn new(config: &DatabaseConfig, ingestion: &IngestionConfig) -> StorageResult<Self> {
        let max_connections = config.max_connections.unwrap_or(10);
        Self::connect(&config.url, max_connections, ingestion.channel_batch_size).await
    }

    /// Open (creating if needed) the database at `url`.
    ///
    /// In-memory databases live only as long as their connection, so they get
    /// a single connection that is never recycled.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        channel_batch_size: usize,
    ) -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections.max(1))
        };

        let pool = pool_options.connect_with(options).await?;
        debug!("Opened SQLite pool for {}", url);

        Ok(Self {
            pool,
            channel_batch_size: channel_batch_size.max(1),
        })
    }

    /// Apply embedded migrations that have not been recorded yet, each in its own transaction
    pub async fn migrate(&self) -> StorageResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                name TEXT PRIMARY KEY,
                checksum TEXT NOT NULL,
                applied_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for (name, content) in MigrationAssets::get_migrations() {
            let applied = sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM _migrations WHERE name = ?",
            )
            .bind(&name)
            .fetch_one(&self.pool)
            .await?;

            if applied > 0 {
                continue;
            }

            let start = std::time::Instant::now();
            let mut tx = self.pool.begin().await?;

            sqlx::query(&content)
                .execute(&mut *tx)
                .await
                .map_err(|e| StorageError::Migration {
                    name: name.clone(),
                    message: e.to_string(),
                })?;

            sqlx::query("INSERT INTO _migrations (name, checksum, applied_at) VALUES (?, ?, ?)")
                .bind(&name)
                .bind(hex::encode(Sha256::digest(content.as_bytes())))
                .bind(now_rfc3339())
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            info!(
                "Applied migration: {} ({}ms)",
                name,
                start.elapsed().as_millis()
            );
        }

        Ok(())
    }

    /// Reclaim free pages
    pub async fn optimize(&self) -> StorageResult<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        info!("Database vacuumed");
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::memory_database;

    #[tokio::test]
    async fn test_migrations_are_recorded_once() {
        let db = memory_database(10).await;
        db.migrate().await.unwrap();

        let recorded: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _migrations")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(recorded, 1);

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE '\\_%' ESCAPE '\\' AND name NOT LIKE 'sqlite%' ORDER BY name",
        )
        .fetch_all(db.pool())
        .await
        .unwrap();
        assert_eq!(tables, vec!["categories", "channels", "session_sources", "sources"]);
    }
}
