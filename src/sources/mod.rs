//! Provider-facing retrieval
//!
//! [`SourceFetcher`] moves bytes. The [`SourceHandler`] implementations turn
//! a provider URL plus credentials into a [`ProviderCatalog`] for their
//! source kind.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::errors::SourceResult;
use crate::ingestor::M3uParser;
use crate::models::{CategoryRecord, ChannelRecord, ContentKind, SourceKind};

pub mod cache;
pub mod fetcher;
pub mod xtream;

pub use cache::DownloadCache;
pub use fetcher::{validate_payload, FetchedPayload, SourceFetcher};
pub use xtream::XtreamSourceHandler;

/// Where to fetch from. The password is only ever held in memory.
#[derive(Debug, Clone)]
pub struct SourceRequest {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Channels and categories of one provider, ready for the storage layer
#[derive(Debug, Clone, Default)]
pub struct ProviderCatalog {
    pub channels: Vec<ChannelRecord>,
    pub categories: Vec<CategoryRecord>,
}

impl ProviderCatalog {
    /// Category rows derived from the distinct group labels of `channels`
    pub fn from_channels(channels: Vec<ChannelRecord>) -> Self {
        let groups: BTreeSet<&str> = channels.iter().map(|c| c.group.as_str()).collect();
        let categories = groups
            .into_iter()
            .map(|group| CategoryRecord {
                category_id: group.to_string(),
                name: group.to_string(),
            })
            .collect();
        Self {
            channels,
            categories,
        }
    }
}

#[async_trait]
pub trait SourceHandler: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Short-timeout check that the provider answers
    async fn test_connectivity(&self, request: &SourceRequest) -> SourceResult<()>;

    /// Full pull and parse of the provider's channel list
    async fn ingest_channels(&self, request: &SourceRequest) -> SourceResult<ProviderCatalog>;
}

/// M3U playlists served over HTTP
pub struct PlaylistSourceHandler {
    fetcher: Arc<SourceFetcher>,
    parser: M3uParser,
}

impl PlaylistSourceHandler {
    pub fn new(fetcher: Arc<SourceFetcher>) -> Self {
        Self {
            fetcher,
            parser: M3uParser::new(),
        }
    }

    pub fn parse_payload(&self, payload: &FetchedPayload) -> SourceResult<ProviderCatalog> {
        let channels = self.parser.parse(&payload.text())?;
        Ok(ProviderCatalog::from_channels(channels))
    }
}

#[async_trait]
impl SourceHandler for PlaylistSourceHandler {
    fn kind(&self) -> SourceKind {
        SourceKind::Playlist
    }

    async fn test_connectivity(&self, request: &SourceRequest) -> SourceResult<()> {
        self.fetcher.probe(&request.url).await
    }

    async fn ingest_channels(&self, request: &SourceRequest) -> SourceResult<ProviderCatalog> {
        let payload = self
            .fetcher
            .fetch(&request.url, ContentKind::PlaylistM3u)
            .await?;
        self.parse_payload(&payload)
    }
}
