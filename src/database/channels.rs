use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::Database;
use crate::errors::{StorageError, StorageResult};
use crate::models::{Category, CategoryRecord, Channel, ChannelFilters, ChannelRecord};
use crate::utils::sqlite::{format_timestamp, SqliteRowExt};

/// Upper bound on bind parameters in one SQLite statement
const SQLITE_MAX_BINDS: usize = 32_766;
const CHANNEL_BINDS_PER_ROW: usize = 11;
const CATEGORY_BINDS_PER_ROW: usize = 4;

/// Search tokens shorter than this are ignored
const MIN_TOKEN_CHARS: usize = 2;

const CHANNEL_COLUMNS: &str = "c.source_id, c.channel_id, c.name, c.logo, c.group_title, \
     c.stream_url, c.epg_hint, c.epg_channel_id, c.categories, c.updated_at";

fn channel_from_row(row: &SqliteRow) -> StorageResult<Channel> {
    Ok(Channel {
        source_id: row.get_uuid("source_id")?,
        channel_id: row.try_get("channel_id")?,
        name: row.try_get("name")?,
        logo: row.try_get("logo")?,
        group: row.try_get("group_title")?,
        stream_url: row.try_get("stream_url")?,
        epg_hint: row.try_get("epg_hint")?,
        epg_channel_id: row.try_get("epg_channel_id")?,
        categories: row.get_json_list("categories")?,
        updated_at: row.get_datetime("updated_at")?,
    })
}

/// How well a channel name matches a search, lower is better
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum SearchRank {
    Exact,
    Prefix,
    Token,
}

fn search_tokens(query: &str) -> Vec<String> {
    query
        .split_whitespace()
        .filter(|token| token.chars().count() >= MIN_TOKEN_CHARS)
        .map(str::to_lowercase)
        .collect()
}

fn search_rank(name: &str, phrase: &str) -> SearchRank {
    let name = name.to_lowercase();
    if name == phrase {
        SearchRank::Exact
    } else if name.starts_with(phrase) {
        SearchRank::Prefix
    } else {
        SearchRank::Token
    }
}

impl Database {
    /// Insert or refresh the categories of a source in one transaction
    pub async fn upsert_categories(
        &self,
        source_id: Uuid,
        categories: &[CategoryRecord],
    ) -> StorageResult<usize> {
        if categories.is_empty() {
            return Ok(0);
        }

        let now = format_timestamp(Utc::now());
        let source = source_id.to_string();
        let mut tx = self.pool.begin().await?;

        for chunk in categories.chunks(SQLITE_MAX_BINDS / CATEGORY_BINDS_PER_ROW) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO categories (source_id, category_id, name, updated_at) ",
            );
            builder.push_values(chunk, |mut b, category| {
                b.push_bind(&source)
                    .push_bind(&category.category_id)
                    .push_bind(&category.name)
                    .push_bind(&now);
            });
            builder.push(
                " ON CONFLICT (source_id, category_id) DO UPDATE SET \
                 name = excluded.name, updated_at = excluded.updated_at",
            );
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        debug!("Upserted {} categories for source {}", categories.len(), source_id);
        Ok(categories.len())
    }

    /// Insert or overwrite the channels of a source in sequential batches.
    ///
    /// Each batch is its own transaction. When a batch fails it is rolled
    /// back, the remaining batches are not attempted, and the error reports
    /// how many rows the earlier batches committed.
    pub async fn upsert_channels(
        &self,
        source_id: Uuid,
        channels: &[ChannelRecord],
    ) -> StorageResult<usize> {
        let total_batches = channels.len().div_ceil(self.channel_batch_size);
        let mut committed = 0;

        for (index, batch) in channels.chunks(self.channel_batch_size).enumerate() {
            let batch_number = index + 1;
            if let Err(e) = self.upsert_channel_batch(source_id, batch).await {
                warn!(
                    "Channel batch {}/{} for source {} failed after {} rows: {}",
                    batch_number, total_batches, source_id, committed, e
                );
                return Err(StorageError::BatchAborted {
                    batch: batch_number,
                    committed,
                    message: e.to_string(),
                });
            }
            committed += batch.len();
            debug!(
                "Committed channel batch {}/{} ({} rows) for source {}",
                batch_number,
                total_batches,
                batch.len(),
                source_id
            );
        }

        info!("Upserted {} channels for source {}", committed, source_id);
        Ok(committed)
    }

    async fn upsert_channel_batch(
        &self,
        source_id: Uuid,
        batch: &[ChannelRecord],
    ) -> StorageResult<()> {
        let now = format_timestamp(Utc::now());
        let source = source_id.to_string();
        let encoded = batch
            .iter()
            .map(|channel| serde_json::to_string(&channel.categories))
            .collect::<Result<Vec<_>, _>>()?;
        let rows: Vec<(&ChannelRecord, &String)> = batch.iter().zip(encoded.iter()).collect();

        let mut tx = self.pool.begin().await?;
        for chunk in rows.chunks(SQLITE_MAX_BINDS / CHANNEL_BINDS_PER_ROW) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO channels (source_id, channel_id, name, logo, group_title, stream_url, \
                 epg_hint, epg_channel_id, categories, created_at, updated_at) ",
            );
            builder.push_values(chunk, |mut b, (channel, categories)| {
                b.push_bind(&source)
                    .push_bind(&channel.channel_id)
                    .push_bind(&channel.name)
                    .push_bind(&channel.logo)
                    .push_bind(&channel.group)
                    .push_bind(&channel.stream_url)
                    .push_bind(&channel.epg_hint)
                    .push_bind(&channel.epg_channel_id)
                    .push_bind(*categories)
                    .push_bind(&now)
                    .push_bind(&now);
            });
            builder.push(
                " ON CONFLICT (source_id, channel_id) DO UPDATE SET \
                 name = excluded.name, logo = excluded.logo, group_title = excluded.group_title, \
                 stream_url = excluded.stream_url, epg_hint = excluded.epg_hint, \
                 epg_channel_id = excluded.epg_channel_id, categories = excluded.categories, \
                 updated_at = excluded.updated_at",
            );
            builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Channels of every source associated with `session_id`, narrowed by `filters`
    pub async fn list_channels(
        &self,
        session_id: &str,
        filters: &ChannelFilters,
    ) -> StorageResult<Vec<Channel>> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels c \
             JOIN session_sources ss ON ss.source_id = c.source_id \
             WHERE ss.session_id = "
        ));
        builder.push_bind(session_id);

        if let Some(source_id) = filters.source_id {
            builder.push(" AND c.source_id = ").push_bind(source_id.to_string());
        }
        if let Some(group) = &filters.group {
            builder.push(" AND c.group_title = ").push_bind(group.clone());
        }
        match filters.epg_mapped {
            Some(true) => {
                builder.push(" AND c.epg_channel_id IS NOT NULL");
            }
            Some(false) => {
                builder.push(" AND c.epg_channel_id IS NULL");
            }
            None => {}
        }

        builder.push(" ORDER BY c.name COLLATE NOCASE, c.channel_id");
        if filters.limit.is_some() || filters.offset.is_some() {
            builder
                .push(" LIMIT ")
                .push_bind(filters.limit.map(i64::from).unwrap_or(-1))
                .push(" OFFSET ")
                .push_bind(i64::from(filters.offset.unwrap_or(0)));
        }

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(channel_from_row).collect()
    }

    pub async fn list_unmapped_channels(&self, session_id: &str) -> StorageResult<Vec<Channel>> {
        let filters = ChannelFilters {
            epg_mapped: Some(false),
            ..Default::default()
        };
        self.list_channels(session_id, &filters).await
    }

    /// Categories of every source associated with `session_id`, with channel counts
    pub async fn list_categories(&self, session_id: &str) -> StorageResult<Vec<Category>> {
        let rows = sqlx::query(
            r#"
            SELECT cat.source_id, cat.category_id, cat.name,
                (SELECT COUNT(*) FROM channels c
                    WHERE c.source_id = cat.source_id AND c.group_title = cat.name) AS channel_count
            FROM categories cat
            JOIN session_sources ss ON ss.source_id = cat.source_id
            WHERE ss.session_id = ?
            ORDER BY cat.name COLLATE NOCASE, cat.category_id
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> StorageResult<Category> {
                Ok(Category {
                    source_id: row.get_uuid("source_id")?,
                    category_id: row.try_get("category_id")?,
                    name: row.try_get("name")?,
                    channel_count: row.try_get("channel_count")?,
                })
            })
            .collect()
    }

    /// Session-scoped name search.
    ///
    /// The query is split on whitespace and tokens shorter than two characters
    /// are dropped. A channel matches when any token occurs in its name,
    /// ignoring case. Exact full-name matches come first, then names starting
    /// with the query, then the rest, each group ordered by name.
    pub async fn search_channels(
        &self,
        session_id: &str,
        query: &str,
        limit: Option<usize>,
    ) -> StorageResult<Vec<Channel>> {
        let tokens = search_tokens(query);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        // SQLite's lower() only folds ASCII, so names are matched here
        let rows = sqlx::query(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels c \
             JOIN session_sources ss ON ss.source_id = c.source_id \
             WHERE ss.session_id = ?"
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        let mut channels = Vec::new();
        for row in &rows {
            let name: String = row.try_get("name")?;
            let folded = name.to_lowercase();
            if tokens.iter().any(|token| folded.contains(token.as_str())) {
                channels.push(channel_from_row(row)?);
            }
        }

        let phrase = query.trim().to_lowercase();
        channels.sort_by(|a, b| {
            search_rank(&a.name, &phrase)
                .cmp(&search_rank(&b.name, &phrase))
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.channel_id.cmp(&b.channel_id))
        });
        if let Some(limit) = limit {
            channels.truncate(limit);
        }

        debug!(
            "Search '{}' in session {} matched {} channels",
            query,
            session_id,
            channels.len()
        );
        Ok(channels)
    }

    /// Set (or clear) the EPG channel of `channel_id` in every source the session can see.
    /// Returns the number of rows changed.
    pub async fn set_channel_epg_mapping(
        &self,
        session_id: &str,
        channel_id: &str,
        epg_channel_id: Option<&str>,
    ) -> StorageResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE channels SET epg_channel_id = ?, updated_at = ?
            WHERE channel_id = ?
              AND source_id IN (SELECT source_id FROM session_sources WHERE session_id = ?)
            "#,
        )
        .bind(epg_channel_id)
        .bind(format_timestamp(Utc::now()))
        .bind(channel_id)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Write many `(channel id, EPG channel id)` pairs for one source in a single transaction
    pub async fn apply_epg_mappings(
        &self,
        source_id: Uuid,
        mappings: &[(String, Option<String>)],
    ) -> StorageResult<u64> {
        let now = format_timestamp(Utc::now());
        let source = source_id.to_string();
        let mut changed = 0;

        let mut tx = self.pool.begin().await?;
        for (channel_id, epg_channel_id) in mappings {
            let result = sqlx::query(
                "UPDATE channels SET epg_channel_id = ?, updated_at = ? \
                 WHERE source_id = ? AND channel_id = ? AND epg_channel_id IS NOT ?",
            )
            .bind(epg_channel_id)
            .bind(&now)
            .bind(&source)
            .bind(channel_id)
            .bind(epg_channel_id)
            .execute(&mut *tx)
            .await?;
            changed += result.rows_affected();
        }
        tx.commit().await?;

        Ok(changed)
    }
}
