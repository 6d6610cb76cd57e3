use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub mod epg;

pub use epg::*;

/// Group label applied when a provider gives a channel none
pub const DEFAULT_GROUP: &str = "Uncategorized";

/// Name applied when a playlist entry carries neither a title nor a tvg-name
pub const DEFAULT_CHANNEL_NAME: &str = "Unknown Channel";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    Playlist,
    ProviderApi,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Playlist => "playlist",
            SourceKind::ProviderApi => "provider-api",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "playlist" | "m3u" => Ok(SourceKind::Playlist),
            "provider-api" | "xtream" => Ok(SourceKind::ProviderApi),
            other => Err(format!("unknown source kind '{other}'")),
        }
    }
}

/// Declared kind of a fetched payload
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ContentKind {
    PlaylistM3u,
    EpgXml,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::PlaylistM3u => "playlist-m3u",
            ContentKind::EpgXml => "epg-xml",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ingested provider or uploaded playlist
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Source {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub username: Option<String>,
    pub kind: SourceKind,
    pub created_at: DateTime<Utc>,
    pub last_synced_at: DateTime<Utc>,
}

/// Everything needed to upsert a [`Source`]. The password only contributes a digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceUpsertRequest {
    pub name: String,
    pub url: String,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub kind: SourceKind,
}

#[derive(Debug, Clone)]
pub struct SourceUpsertOutcome {
    pub source: Source,
    /// `true` when this call created the row, `false` when it refreshed an existing one
    pub created: bool,
}

/// A channel entry as produced by the playlist parser or the provider API
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelRecord {
    pub channel_id: String,
    pub name: String,
    pub logo: Option<String>,
    pub group: String,
    pub stream_url: String,
    /// EPG identifier advertised by the provider (tvg-id / epg_channel_id)
    pub epg_hint: Option<String>,
    pub epg_channel_id: Option<String>,
    pub categories: Vec<String>,
}

/// A persisted channel row
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Channel {
    pub source_id: Uuid,
    pub channel_id: String,
    pub name: String,
    pub logo: Option<String>,
    pub group: String,
    pub stream_url: String,
    pub epg_hint: Option<String>,
    pub epg_channel_id: Option<String>,
    pub categories: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CategoryRecord {
    pub category_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Category {
    pub source_id: Uuid,
    pub category_id: String,
    pub name: String,
    pub channel_count: i64,
}

/// Optional narrowing applied on top of session scoping
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelFilters {
    pub source_id: Option<Uuid>,
    pub group: Option<String>,
    /// `Some(true)` only mapped channels, `Some(false)` only unmapped ones
    pub epg_mapped: Option<bool>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Result handed back to whoever started an ingestion
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestResult {
    pub source_id: Uuid,
    pub channel_count: usize,
    pub category_count: usize,
    /// Whether the source was new; existing sources are refreshed in place
    pub created: bool,
    pub epg_matched: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchReport {
    pub matched: usize,
    pub unmatched: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceStatistics {
    pub source: Source,
    pub channel_count: i64,
    pub category_count: i64,
    pub mapped_channel_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageStatistics {
    pub sources: i64,
    pub channels: i64,
    pub categories: i64,
    pub session_associations: i64,
    pub source_details: Vec<SourceStatistics>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_kind_round_trips_through_str() {
        assert_eq!("playlist".parse::<SourceKind>(), Ok(SourceKind::Playlist));
        assert_eq!("xtream".parse::<SourceKind>(), Ok(SourceKind::ProviderApi));
        assert_eq!(SourceKind::ProviderApi.as_str(), "provider-api");
        assert!("rss".parse::<SourceKind>().is_err());
    }

    #[test]
    fn test_upsert_request_never_serializes_password() {
        let request = SourceUpsertRequest {
            name: "Provider".to_string(),
            url: "http://provider.example".to_string(),
            username: Some("alice".to_string()),
            password: Some("hunter2".to_string()),
            kind: SourceKind::ProviderApi,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(!json.contains("hunter2"));
    }
}
