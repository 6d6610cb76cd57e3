//! Ingestion pipeline
//!
//! One run is strictly sequential: fetch, parse, match against the current
//! EPG index, then persist in batches. Staged progress goes to the caller's
//! session scope on the [`ProgressReporter`]. Runs for different sources may
//! interleave freely; conflicts are resolved by the storage upserts.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::epg_parser::{EpgParseOutput, EpgParser};
use crate::config::Config;
use crate::database::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{
    ChannelFilters, ContentKind, EpgParseSummary, EpgProgramme, IngestResult, MatchReport,
    SourceKind, SourceUpsertRequest,
};
use crate::services::{CredentialStore, InMemoryCredentialStore, ProgressReporter};
use crate::sources::{
    PlaylistSourceHandler, ProviderCatalog, SourceFetcher, SourceHandler, SourceRequest,
    XtreamSourceHandler,
};

const UPLOAD_SCHEME: &str = "upload://";

/// A playlist or provider-API source to ingest
#[derive(Debug, Clone)]
pub struct PlaylistIngestRequest {
    /// Display name; the URL is used when absent
    pub name: Option<String>,
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub kind: SourceKind,
    /// Session to associate the source with and to report progress to
    pub session_id: Option<String>,
}

impl PlaylistIngestRequest {
    pub fn playlist(url: impl Into<String>) -> Self {
        Self {
            name: None,
            url: url.into(),
            username: None,
            password: None,
            kind: SourceKind::Playlist,
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    fn source_request(&self) -> SourceRequest {
        SourceRequest {
            url: self.url.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }

    fn upsert_request(&self) -> SourceUpsertRequest {
        SourceUpsertRequest {
            name: self.name.clone().unwrap_or_else(|| self.url.clone()),
            url: self.url.clone(),
            username: self.username.clone().filter(|u| !u.is_empty()),
            password: self.password.clone().filter(|p| !p.is_empty()),
            kind: self.kind,
        }
    }
}

/// Where an EPG document comes from
#[derive(Debug, Clone)]
pub enum EpgSourceRequest {
    Url(String),
    Upload(Bytes),
}

#[derive(Clone)]
pub struct IngestionPipeline {
    database: Database,
    fetcher: Arc<SourceFetcher>,
    playlist: Arc<PlaylistSourceHandler>,
    provider_api: Arc<XtreamSourceHandler>,
    progress: ProgressReporter,
    credentials: Arc<dyn CredentialStore>,
    epg_parser: EpgParser,
    current_epg: Arc<RwLock<Option<Arc<EpgParseOutput>>>>,
}

impl IngestionPipeline {
    pub fn new(database: Database, config: &Config, progress: ProgressReporter) -> AppResult<Self> {
        let fetcher = Arc::new(SourceFetcher::new(&config.fetch)?);
        Ok(Self {
            database,
            playlist: Arc::new(PlaylistSourceHandler::new(fetcher.clone())),
            provider_api: Arc::new(XtreamSourceHandler::new(fetcher.clone())),
            fetcher,
            progress,
            credentials: Arc::new(InMemoryCredentialStore::new()),
            epg_parser: EpgParser::new(config.ingestion.epg_batch_size),
            current_epg: Arc::new(RwLock::new(None)),
        })
    }

    pub fn with_credential_store(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn progress(&self) -> &ProgressReporter {
        &self.progress
    }

    fn handler(&self, kind: SourceKind) -> Arc<dyn SourceHandler> {
        match kind {
            SourceKind::Playlist => self.playlist.clone(),
            SourceKind::ProviderApi => self.provider_api.clone(),
        }
    }

    fn report(&self, scope: Option<&str>, percentage: f64, stage: &str, message: impl Into<String>) {
        if let Some(scope) = scope {
            self.progress.emit_progress(scope, percentage, stage, message);
        }
    }

    /// Short-timeout connectivity check for a source, nothing is stored
    pub async fn test_connectivity(&self, request: &PlaylistIngestRequest) -> AppResult<()> {
        self.handler(request.kind)
            .test_connectivity(&request.source_request())
            .await?;
        Ok(())
    }

    /// Fetch, parse and persist a remote playlist or provider-API source
    pub async fn ingest_playlist(&self, request: &PlaylistIngestRequest) -> AppResult<IngestResult> {
        let scope = request.session_id.as_deref();
        info!("Ingesting {} source {}", request.kind, request.name.as_deref().unwrap_or("(unnamed)"));

        self.report(scope, 5.0, "fetch", "Fetching channel list");
        let catalog = self
            .handler(request.kind)
            .ingest_channels(&request.source_request())
            .await?;
        self.report(
            scope,
            40.0,
            "parse",
            format!("Parsed {} channels", catalog.channels.len()),
        );

        let outcome = self
            .persist_catalog(scope, &request.upsert_request(), catalog)
            .await?;

        if let Some(password) = request.password.as_ref().filter(|p| !p.is_empty()) {
            self.credentials.put(outcome.source_id, password.clone()).await;
        }
        Ok(outcome)
    }

    /// Parse and persist an uploaded playlist file
    pub async fn ingest_upload(
        &self,
        name: &str,
        content: Bytes,
        session_id: Option<&str>,
    ) -> AppResult<IngestResult> {
        self.report(session_id, 5.0, "validate", "Validating uploaded playlist");
        let payload = self.fetcher.from_upload(content, ContentKind::PlaylistM3u)?;
        let catalog = self.playlist.parse_payload(&payload)?;
        self.report(
            session_id,
            40.0,
            "parse",
            format!("Parsed {} channels", catalog.channels.len()),
        );

        let request = SourceUpsertRequest {
            name: name.to_string(),
            url: format!("{UPLOAD_SCHEME}{}", urlencoding::encode(name)),
            username: None,
            password: None,
            kind: SourceKind::Playlist,
        };
        self.persist_catalog(session_id, &request, catalog).await
    }

    async fn persist_catalog(
        &self,
        scope: Option<&str>,
        request: &SourceUpsertRequest,
        mut catalog: ProviderCatalog,
    ) -> AppResult<IngestResult> {
        let epg_matched = self.apply_current_index(&mut catalog).await;

        let outcome = self.database.upsert_source(request).await?;
        let source_id = outcome.source.id;
        self.report(
            scope,
            50.0,
            "source",
            if outcome.created {
                format!("Created source {}", outcome.source.name)
            } else {
                format!("Refreshing source {}", outcome.source.name)
            },
        );

        let category_count = self
            .database
            .upsert_categories(source_id, &catalog.categories)
            .await?;
        self.report(
            scope,
            60.0,
            "categories",
            format!("Saved {} categories", category_count),
        );

        let channel_count = self
            .database
            .upsert_channels(source_id, &catalog.channels)
            .await?;
        self.report(
            scope,
            95.0,
            "channels",
            format!("Saved {} channels", channel_count),
        );

        if let Some(session_id) = scope {
            self.database
                .associate_source_with_session(session_id, source_id)
                .await?;
        }

        info!(
            "Ingested source {}: {} channels, {} categories, {} matched to EPG",
            source_id, channel_count, category_count, epg_matched
        );
        self.report(scope, 100.0, "complete", "Ingestion complete");

        Ok(IngestResult {
            source_id,
            channel_count,
            category_count,
            created: outcome.created,
            epg_matched,
        })
    }

    /// Fill in EPG channel ids from the loaded index. Returns how many matched.
    async fn apply_current_index(&self, catalog: &mut ProviderCatalog) -> usize {
        let Some(epg) = self.current_epg().await else {
            return 0;
        };

        let mut matched = 0;
        for channel in &mut catalog.channels {
            if let Some(definition) = epg.index.lookup(&*channel) {
                channel.epg_channel_id = Some(definition.id.clone());
                matched += 1;
            }
        }
        debug!(
            "Matched {}/{} channels against loaded EPG",
            matched,
            catalog.channels.len()
        );
        matched
    }

    /// Run [`Self::ingest_playlist`] in the background. Failures become a
    /// terminal error event on the session scope instead of propagating.
    pub fn spawn_ingest_playlist(&self, request: PlaylistIngestRequest) -> JoinHandle<Option<IngestResult>> {
        let pipeline = self.clone();
        tokio::spawn(async move {
            match pipeline.ingest_playlist(&request).await {
                Ok(result) => Some(result),
                Err(e) => {
                    error!("Background ingestion of {} failed: {}", request.url, e);
                    pipeline.report_failure(request.session_id.as_deref(), &e);
                    None
                }
            }
        })
    }

    fn report_failure(&self, scope: Option<&str>, err: &AppError) {
        if let Some(scope) = scope {
            let details = err
                .committed_rows()
                .map(|rows| format!("{rows} channels were saved before the failure"));
            self.progress
                .emit_error(scope, err.to_failure().message, details);
        }
    }

    /// Parse an EPG document on the worker and install its index as the current one
    pub async fn ingest_epg(
        &self,
        source: EpgSourceRequest,
        scope: Option<&str>,
    ) -> AppResult<EpgParseSummary> {
        self.report(scope, 0.0, "fetch", "Fetching EPG document");
        let payload = match source {
            EpgSourceRequest::Url(url) => self.fetcher.fetch(&url, ContentKind::EpgXml).await?,
            EpgSourceRequest::Upload(content) => {
                self.fetcher.from_upload(content, ContentKind::EpgXml)?
            }
        };
        info!(
            "Parsing EPG document ({} bytes{})",
            payload.len(),
            if payload.from_cache { ", cached" } else { "" }
        );

        let handle = self.epg_parser.spawn(payload.content)?;
        let output = handle
            .finish(|progress| {
                self.report(scope, progress.fraction * 100.0, "epg", progress.stage);
            })
            .await?;

        let summary = output.summary.clone();
        *self.current_epg.write().await = Some(Arc::new(output));
        info!(
            "Loaded EPG index: {} channels, {} programmes, {} keys",
            summary.channel_count, summary.programme_count, summary.key_count
        );
        Ok(summary)
    }

    /// Background variant of [`Self::ingest_epg`]
    pub fn spawn_ingest_epg(
        &self,
        source: EpgSourceRequest,
        scope: String,
    ) -> JoinHandle<Option<EpgParseSummary>> {
        let pipeline = self.clone();
        tokio::spawn(async move {
            match pipeline.ingest_epg(source, Some(&scope)).await {
                Ok(summary) => Some(summary),
                Err(e) => {
                    error!("Background EPG ingestion failed: {}", e);
                    pipeline.report_failure(Some(&scope), &e);
                    None
                }
            }
        })
    }

    pub async fn current_epg(&self) -> Option<Arc<EpgParseOutput>> {
        self.current_epg.read().await.clone()
    }

    /// Resolve every channel the session can see against the loaded EPG index.
    /// Channels without a match are recorded with no EPG channel id.
    pub async fn match_channels(&self, session_id: &str) -> AppResult<MatchReport> {
        let epg = self
            .current_epg()
            .await
            .ok_or_else(|| AppError::validation("no EPG document has been loaded"))?;

        let channels = self
            .database
            .list_channels(session_id, &ChannelFilters::default())
            .await?;

        let mut report = MatchReport {
            matched: 0,
            unmatched: 0,
        };
        let mut by_source: HashMap<Uuid, Vec<(String, Option<String>)>> = HashMap::new();
        for channel in &channels {
            let epg_channel_id = epg.index.lookup(channel).map(|d| d.id.clone());
            if epg_channel_id.is_some() {
                report.matched += 1;
            } else {
                report.unmatched += 1;
            }
            by_source
                .entry(channel.source_id)
                .or_default()
                .push((channel.channel_id.clone(), epg_channel_id));
        }

        for (source_id, mappings) in by_source {
            let changed = self.database.apply_epg_mappings(source_id, &mappings).await?;
            debug!("Updated EPG mapping of {} channels in source {}", changed, source_id);
        }

        info!(
            "Session {}: {} channels matched, {} unmatched",
            session_id, report.matched, report.unmatched
        );
        Ok(report)
    }

    /// Programmes of one EPG channel in document order
    pub async fn programmes_for(&self, epg_channel_id: &str) -> Vec<EpgProgramme> {
        match self.current_epg().await {
            Some(epg) => epg.programmes_for(epg_channel_id).cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Re-ingest a stored source using credentials from the credential store
    pub async fn refresh_source(
        &self,
        source_id: Uuid,
        session_id: Option<&str>,
    ) -> AppResult<IngestResult> {
        let source = self
            .database
            .get_source(source_id)
            .await?
            .ok_or_else(|| AppError::not_found("source", source_id.to_string()))?;

        if source.url.starts_with(UPLOAD_SCHEME) {
            return Err(AppError::validation(format!(
                "source {} was uploaded and has no URL to refresh from",
                source.name
            )));
        }

        let password = self.credentials.get(source_id).await;
        if password.is_none() && source.username.is_some() {
            warn!("No stored password for source {}, refreshing without one", source_id);
        }

        let request = PlaylistIngestRequest {
            name: Some(source.name),
            url: source.url,
            username: source.username,
            password,
            kind: source.kind,
            session_id: session_id.map(str::to_string),
        };
        self.ingest_playlist(&request).await
    }

    /// Delete a source and forget its stored password
    pub async fn delete_source(&self, source_id: Uuid) -> AppResult<bool> {
        let deleted = self.database.delete_source(source_id).await?;
        self.credentials.remove(source_id).await;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::memory_database;
    use crate::services::ProgressEvent;

    const PLAYLIST: &str = "#EXTM3U\n\
        #EXTINF:-1 tvg-id=\"espn.us\" tvg-logo=\"http://logo/espn.png\" group-title=\"Sports\",ESPN HD\n\
        http://provider.example/live/espn.ts\n\
        #EXTINF:-1 tvg-id=\"cnn.us\" group-title=\"News\",CNN\n\
        http://provider.example/live/cnn.ts\n\
        #EXTINF:-1,Channel X\n\
        http://provider.example/streams/42\n";

    const EPG: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<tv>
  <channel id="ESPN.us"><display-name>ESPN</display-name></channel>
  <channel id="bbc.uk"><display-name>BBC One</display-name></channel>
  <programme channel="ESPN.us" start="20240101000000 +0000" stop="20240101010000 +0000"><title>SportsCenter</title></programme>
  <programme channel="ESPN.us" start="20240101010000 +0000" stop="20240101020000 +0000"><title>NFL Live</title></programme>
</tv>"#;

    async fn pipeline() -> IngestionPipeline {
        let mut config = Config::default();
        config.ingestion.epg_batch_size = 1;
        IngestionPipeline::new(memory_database(2).await, &config, ProgressReporter::new(64)).unwrap()
    }

    fn drain(rx: &mut crate::services::ProgressReceiver) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_upload_ingestion_reports_progress_and_associates_session() {
        let pipeline = pipeline().await;
        let mut rx = pipeline.progress().subscribe("s1");

        let result = pipeline
            .ingest_upload("Local", Bytes::from_static(PLAYLIST.as_bytes()), Some("s1"))
            .await
            .unwrap();
        assert_eq!(result.channel_count, 3);
        assert_eq!(result.category_count, 3);
        assert!(result.created);

        let events = drain(&mut rx);
        let percentages: Vec<f64> = events.iter().filter_map(|e| e.percentage()).collect();
        assert!(percentages.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(percentages.last(), Some(&100.0));

        let channels = pipeline
            .database()
            .list_channels("s1", &ChannelFilters::default())
            .await
            .unwrap();
        let x = channels.iter().find(|c| c.name == "Channel X").unwrap();
        assert_eq!(x.channel_id, "42");
        assert_eq!(x.group, "Uncategorized");

        let again = pipeline
            .ingest_upload("Local", Bytes::from_static(PLAYLIST.as_bytes()), Some("s1"))
            .await
            .unwrap();
        assert!(!again.created);
        assert_eq!(again.source_id, result.source_id);
    }

    #[tokio::test]
    async fn test_match_channels_uses_loaded_epg() {
        let pipeline = pipeline().await;
        pipeline
            .ingest_upload("Local", Bytes::from_static(PLAYLIST.as_bytes()), Some("s1"))
            .await
            .unwrap();

        assert!(pipeline.match_channels("s1").await.is_err());

        let summary = pipeline
            .ingest_epg(EpgSourceRequest::Upload(Bytes::from_static(EPG.as_bytes())), Some("s1"))
            .await
            .unwrap();
        assert_eq!(summary.channel_count, 2);
        assert_eq!(summary.programme_count, 2);

        let report = pipeline.match_channels("s1").await.unwrap();
        assert_eq!(report, MatchReport { matched: 1, unmatched: 2 });

        let mapped = pipeline
            .database()
            .list_channels("s1", &ChannelFilters { epg_mapped: Some(true), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(mapped.len(), 1);
        assert_eq!(mapped[0].epg_channel_id.as_deref(), Some("ESPN.us"));

        let titles: Vec<_> = pipeline
            .programmes_for("ESPN.us")
            .await
            .into_iter()
            .filter_map(|p| p.title)
            .collect();
        assert_eq!(titles, vec!["SportsCenter", "NFL Live"]);
    }

    #[tokio::test]
    async fn test_ingestion_applies_loaded_index() {
        let pipeline = pipeline().await;
        pipeline
            .ingest_epg(EpgSourceRequest::Upload(Bytes::from_static(EPG.as_bytes())), None)
            .await
            .unwrap();

        let result = pipeline
            .ingest_upload("Local", Bytes::from_static(PLAYLIST.as_bytes()), None)
            .await
            .unwrap();
        assert_eq!(result.epg_matched, 1);
    }

    #[tokio::test]
    async fn test_background_failure_becomes_error_event() {
        let pipeline = pipeline().await;
        let mut rx = pipeline.progress().subscribe("s1");

        let request = PlaylistIngestRequest::playlist("http://127.0.0.1:1/playlist.m3u").with_session("s1");
        let outcome = pipeline.spawn_ingest_playlist(request).await.unwrap();
        assert!(outcome.is_none());

        let events = drain(&mut rx);
        assert!(events.last().unwrap().is_error());
        assert_eq!(events.iter().filter(|e| e.is_error()).count(), 1);
    }

    #[tokio::test]
    async fn test_uploaded_sources_cannot_be_refreshed() {
        let pipeline = pipeline().await;
        let result = pipeline
            .ingest_upload("Local", Bytes::from_static(PLAYLIST.as_bytes()), None)
            .await
            .unwrap();

        let err = pipeline.refresh_source(result.source_id, None).await.unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));

        let missing = pipeline.refresh_source(Uuid::new_v4(), None).await.unwrap_err();
        assert!(matches!(missing, AppError::NotFound { .. }));
    }
}
