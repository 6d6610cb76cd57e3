use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::borrow::Cow;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::cache::DownloadCache;
use crate::config::FetchConfig;
use crate::errors::{AppError, AppResult, SourceError, SourceResult};
use crate::models::ContentKind;
use crate::utils::{DecompressionService, UrlUtils};

const PLAYLIST_MARKER: &[u8] = b"#EXTM3U";
const EPG_MARKER: &[u8] = b"<tv";

/// Validated, decompressed payload bytes plus their declared kind
#[derive(Debug, Clone)]
pub struct FetchedPayload {
    pub content: Bytes,
    pub kind: ContentKind,
    pub from_cache: bool,
}

impl FetchedPayload {
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.content)
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

/// Check that `content` carries the marker expected for `kind`
pub fn validate_payload(content: &[u8], kind: ContentKind) -> SourceResult<()> {
    let marker = match kind {
        ContentKind::PlaylistM3u => PLAYLIST_MARKER,
        ContentKind::EpgXml => EPG_MARKER,
    };
    if content.windows(marker.len()).any(|w| w == marker) {
        Ok(())
    } else {
        Err(SourceError::invalid_payload(
            kind.as_str(),
            format!(
                "missing {} marker in {} bytes of content",
                String::from_utf8_lossy(marker),
                content.len()
            ),
        ))
    }
}

/// Retrieves provider payloads over HTTP or accepts uploaded bytes
#[derive(Clone)]
pub struct SourceFetcher {
    client: Client,
    probe_timeout: Duration,
    pull_timeout: Duration,
    cache: DownloadCache,
}

impl SourceFetcher {
    pub fn new(config: &FetchConfig) -> AppResult<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.probe_timeout())
            .build()
            .map_err(|e| AppError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            probe_timeout: config.probe_timeout(),
            pull_timeout: config.pull_timeout(),
            cache: DownloadCache::new(config.cache_dir.clone(), config.cache_ttl()),
        })
    }

    /// Short connectivity check: the URL answers with a success status within
    /// the probe timeout. The body is not downloaded and the cache is not used.
    pub async fn probe(&self, url: &str) -> SourceResult<()> {
        let url = UrlUtils::normalize_scheme(url);
        let redacted = UrlUtils::redact(&url);
        debug!("Probing {}", redacted);

        let response = self
            .client
            .get(&url)
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| SourceError::from_reqwest(&redacted, e, self.probe_timeout.as_secs()))?;

        if !response.status().is_success() {
            return Err(SourceError::connection(
                redacted,
                format!("HTTP {}", response.status()),
            ));
        }
        Ok(())
    }

    /// Full pull of a playlist or EPG document.
    ///
    /// EPG documents go through the download cache: a fresh cached copy
    /// short-circuits the request and a stale copy stands in when the
    /// download fails or does not validate. Only validated downloads are cached.
    pub async fn fetch(&self, url: &str, kind: ContentKind) -> SourceResult<FetchedPayload> {
        let url = UrlUtils::normalize_scheme(url);
        let cacheable = kind == ContentKind::EpgXml;

        if cacheable {
            if let Some(cached) = self.cache.fresh(&url).await {
                info!("Using cached copy of {} ({} bytes)", UrlUtils::redact(&url), cached.len());
                return self.finish(cached, kind, true);
            }
        }

        let downloaded = self.download(&url).await.and_then(|raw| {
            self.finish(raw.clone(), kind, false)
                .map(|payload| (raw, payload))
        });

        match downloaded {
            Ok((raw, payload)) => {
                if cacheable {
                    self.cache.store(&url, &raw).await;
                }
                Ok(payload)
            }
            Err(e) if cacheable => match self.cache.stale(&url).await {
                Some(stale) => {
                    warn!(
                        "Download of {} failed ({}), falling back to stale cached copy",
                        UrlUtils::redact(&url),
                        e
                    );
                    self.finish(stale, kind, true)
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    /// Accept uploaded bytes as if they had been fetched
    pub fn from_upload(&self, content: Bytes, kind: ContentKind) -> SourceResult<FetchedPayload> {
        self.finish(content, kind, false)
    }

    /// GET a JSON document with the pull timeout
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> SourceResult<T> {
        self.get_json_with_timeout(url, self.pull_timeout).await
    }

    /// GET a JSON document with the probe timeout
    pub async fn probe_json<T: DeserializeOwned>(&self, url: &str) -> SourceResult<T> {
        self.get_json_with_timeout(url, self.probe_timeout).await
    }

    async fn get_json_with_timeout<T: DeserializeOwned>(
        &self,
        url: &str,
        timeout: Duration,
    ) -> SourceResult<T> {
        let redacted = UrlUtils::redact(url);
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| SourceError::from_reqwest(&redacted, e, timeout.as_secs()))?;

        if !response.status().is_success() {
            return Err(SourceError::connection(
                redacted,
                format!("HTTP {}", response.status()),
            ));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| SourceError::from_reqwest(&redacted, e, timeout.as_secs()))?;
        serde_json::from_slice(&body).map_err(|e| {
            SourceError::invalid_payload("json", format!("{redacted} returned unexpected JSON: {e}"))
        })
    }

    async fn download(&self, url: &str) -> SourceResult<Bytes> {
        let redacted = UrlUtils::redact(url);
        let timeout_secs = self.pull_timeout.as_secs();
        info!("Downloading {}", redacted);

        let response = self
            .client
            .get(url)
            .timeout(self.pull_timeout)
            .send()
            .await
            .map_err(|e| SourceError::from_reqwest(&redacted, e, timeout_secs))?;

        if !response.status().is_success() {
            return Err(SourceError::connection(
                redacted,
                format!("HTTP {}", response.status()),
            ));
        }

        let mut body = BytesMut::with_capacity(response.content_length().unwrap_or(0) as usize);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| SourceError::from_reqwest(&redacted, e, timeout_secs))?;
            body.extend_from_slice(&chunk);
        }

        info!("Downloaded {} bytes from {}", body.len(), redacted);
        Ok(body.freeze())
    }

    fn finish(&self, raw: Bytes, kind: ContentKind, from_cache: bool) -> SourceResult<FetchedPayload> {
        let content = DecompressionService::decompress(raw)?;
        validate_payload(&content, kind)?;
        Ok(FetchedPayload {
            content,
            kind,
            from_cache,
        })
    }
}
