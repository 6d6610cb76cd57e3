//! Provider-API (Xtream Codes compatible) channel listings

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::{ProviderCatalog, SourceHandler, SourceRequest};
use super::fetcher::SourceFetcher;
use crate::errors::{SourceError, SourceResult};
use crate::models::{CategoryRecord, ChannelRecord, SourceKind, DEFAULT_CHANNEL_NAME, DEFAULT_GROUP};
use crate::utils::UrlUtils;

/// Response of the bare `player_api.php` call; only the presence of `user_info` matters
#[derive(Debug, Deserialize)]
struct XtreamAccount {
    user_info: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct XtreamCategory {
    #[serde(deserialize_with = "string_or_number")]
    category_id: String,
    category_name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct XtreamStream {
    #[serde(deserialize_with = "string_or_number")]
    stream_id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    stream_icon: Option<String>,
    #[serde(default)]
    epg_channel_id: Option<String>,
    #[serde(default, deserialize_with = "optional_string_or_number")]
    category_id: Option<String>,
}

/// Providers send ids as JSON numbers or as numeric strings, sometimes both in one response
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    optional_string_or_number(deserializer)?
        .ok_or_else(|| serde::de::Error::custom("expected a string or number, found null"))
}

fn optional_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected a string or number, found {other}"
        ))),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

pub struct XtreamSourceHandler {
    fetcher: Arc<SourceFetcher>,
}

impl XtreamSourceHandler {
    pub fn new(fetcher: Arc<SourceFetcher>) -> Self {
        Self { fetcher }
    }

    fn credentials<'a>(&self, request: &'a SourceRequest) -> SourceResult<(&'a str, &'a str)> {
        match (request.username.as_deref(), request.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() => Ok((user, pass)),
            _ => Err(SourceError::connection(
                UrlUtils::redact(&request.url),
                "provider API requires a username and password",
            )),
        }
    }

    fn to_catalog(
        &self,
        request: &SourceRequest,
        categories: Vec<XtreamCategory>,
        streams: Vec<XtreamStream>,
    ) -> SourceResult<ProviderCatalog> {
        let (username, password) = self.credentials(request)?;
        let names: HashMap<&str, &str> = categories
            .iter()
            .map(|c| (c.category_id.as_str(), c.category_name.as_str()))
            .collect();

        let mut channels = Vec::with_capacity(streams.len());
        for stream in streams {
            let group = stream
                .category_id
                .as_deref()
                .and_then(|id| names.get(id))
                .map(|name| name.trim())
                .filter(|name| !name.is_empty())
                .unwrap_or(DEFAULT_GROUP)
                .to_string();

            channels.push(ChannelRecord {
                stream_url: UrlUtils::build_live_stream_url(
                    &request.url,
                    username,
                    password,
                    &stream.stream_id,
                )?,
                channel_id: stream.stream_id,
                name: non_empty(stream.name).unwrap_or_else(|| DEFAULT_CHANNEL_NAME.to_string()),
                logo: non_empty(stream.stream_icon),
                categories: vec![group.clone()],
                group,
                epg_hint: non_empty(stream.epg_channel_id),
                epg_channel_id: None,
            });
        }

        let mut category_records: Vec<CategoryRecord> = categories
            .into_iter()
            .map(|c| CategoryRecord {
                category_id: c.category_id,
                name: c.category_name,
            })
            .collect();
        if channels.iter().any(|c| c.group == DEFAULT_GROUP)
            && !category_records.iter().any(|c| c.name == DEFAULT_GROUP)
        {
            category_records.push(CategoryRecord {
                category_id: DEFAULT_GROUP.to_string(),
                name: DEFAULT_GROUP.to_string(),
            });
        }

        Ok(ProviderCatalog {
            channels,
            categories: category_records,
        })
    }
}

#[async_trait]
impl SourceHandler for XtreamSourceHandler {
    fn kind(&self) -> SourceKind {
        SourceKind::ProviderApi
    }

    async fn test_connectivity(&self, request: &SourceRequest) -> SourceResult<()> {
        let (username, password) = self.credentials(request)?;
        let url = UrlUtils::build_player_api_url(&request.url, username, password, None)?;

        let account: XtreamAccount = self.fetcher.probe_json(&url).await?;
        match account.user_info {
            Some(serde_json::Value::Object(_)) => Ok(()),
            _ => Err(SourceError::invalid_payload(
                "provider-api",
                "player_api.php response has no user_info",
            )),
        }
    }

    async fn ingest_channels(&self, request: &SourceRequest) -> SourceResult<ProviderCatalog> {
        let (username, password) = self.credentials(request)?;

        let categories_url = UrlUtils::build_player_api_url(
            &request.url,
            username,
            password,
            Some("get_live_categories"),
        )?;
        let categories: Vec<XtreamCategory> = self.fetcher.get_json(&categories_url).await?;
        debug!("Provider returned {} live categories", categories.len());

        let streams_url = UrlUtils::build_player_api_url(
            &request.url,
            username,
            password,
            Some("get_live_streams"),
        )?;
        let streams: Vec<XtreamStream> = self.fetcher.get_json(&streams_url).await?;
        if streams.is_empty() {
            return Err(SourceError::parse_error(
                "provider-api",
                "provider returned zero live streams",
            ));
        }

        info!(
            "Provider returned {} live streams in {} categories",
            streams.len(),
            categories.len()
        );
        self.to_catalog(request, categories, streams)
    }
}
