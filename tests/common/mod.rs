//! Shared fixtures: an in-process fake provider and pipeline construction

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use flate2::{write::GzEncoder, Compression};
use serde_json::json;
use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use epg_linker::{
    config::Config,
    database::Database,
    ingestor::IngestionPipeline,
    services::ProgressReporter,
};

pub const PLAYLIST: &str = "#EXTM3U\n\
#EXTINF:-1 tvg-id=\"espn.us\" tvg-name=\"ESPN\" tvg-logo=\"http://logos.example/espn.png\" group-title=\"Sports\",ESPN HD\n\
http://streams.example/live/espn.ts\n\
#EXTINF:-1 tvg-id=\"cnn\" group-title=\"News;US\",CNN International\n\
http://streams.example/live/cnn.ts\n\
#EXTINF:-1,Channel X\n\
http://streams.example/streams/42\n";

pub const EPG: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE tv SYSTEM "xmltv.dtd">
<tv generator-info-name="fake">
  <channel id="ESPN.us">
    <display-name>ESPN</display-name>
    <icon src="http://logos.example/espn.png"/>
  </channel>
  <channel id="CNNInternational">
    <display-name>CNN International</display-name>
  </channel>
  <channel id="bbc1.uk">
    <display-name>BBC One</display-name>
  </channel>
  <programme start="20240101060000 +0000" stop="20240101070000 +0000" channel="ESPN.us">
    <title lang="en">SportsCenter</title>
    <desc lang="en">Highlights &amp; news</desc>
    <category>Sports</category>
  </programme>
  <programme start="20240101070000 +0000" stop="20240101080000 +0000" channel="ESPN.us">
    <title>First Take</title>
  </programme>
  <programme start="20240101060000 +0000" stop="20240101063000 +0000" channel="CNNInternational">
    <title>World News</title>
  </programme>
</tv>"#;

#[derive(Clone, Default)]
pub struct ProviderState {
    pub epg_requests: Arc<AtomicUsize>,
    /// When set, every route answers 503
    pub offline: Arc<AtomicBool>,
    /// When set, the guide answers 200 with an HTML error page
    pub guide_error_page: Arc<AtomicBool>,
}

impl ProviderState {
    pub fn epg_requests(&self) -> usize {
        self.epg_requests.load(Ordering::SeqCst)
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_guide_error_page(&self, enabled: bool) {
        self.guide_error_page.store(enabled, Ordering::SeqCst);
    }
}

pub struct FakeProvider {
    pub addr: SocketAddr,
    pub state: ProviderState,
}

impl FakeProvider {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

pub fn gzip(content: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(content).unwrap();
    encoder.finish().unwrap()
}

fn unavailable(state: &ProviderState) -> Option<Response> {
    state
        .offline
        .load(Ordering::SeqCst)
        .then(|| StatusCode::SERVICE_UNAVAILABLE.into_response())
}

async fn playlist(State(state): State<ProviderState>) -> Response {
    if let Some(response) = unavailable(&state) {
        return response;
    }
    ([(header::CONTENT_TYPE, "audio/x-mpegurl")], PLAYLIST).into_response()
}

async fn not_a_playlist() -> Response {
    ([(header::CONTENT_TYPE, "text/html")], "<html><body>Suspended</body></html>").into_response()
}

async fn empty_playlist() -> Response {
    ([(header::CONTENT_TYPE, "audio/x-mpegurl")], "#EXTM3U\n").into_response()
}

async fn guide(State(state): State<ProviderState>) -> Response {
    if let Some(response) = unavailable(&state) {
        return response;
    }
    state.epg_requests.fetch_add(1, Ordering::SeqCst);
    if state.guide_error_page.load(Ordering::SeqCst) {
        return ([(header::CONTENT_TYPE, "text/html")], "<html><body>Quota exceeded</body></html>")
            .into_response();
    }
    ([(header::CONTENT_TYPE, "application/gzip")], gzip(EPG.as_bytes())).into_response()
}

async fn player_api(
    State(state): State<ProviderState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if let Some(response) = unavailable(&state) {
        return response;
    }
    let authorized = params.get("username").map(String::as_str) == Some("alice")
        && params.get("password").map(String::as_str) == Some("secret");
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    match params.get("action").map(String::as_str) {
        None => Json(json!({
            "user_info": {"username": "alice", "auth": 1, "status": "Active"},
            "server_info": {"url": "provider.example", "port": "80"}
        }))
        .into_response(),
        Some("get_live_categories") => Json(json!([
            {"category_id": "1", "category_name": "Sports", "parent_id": 0},
            {"category_id": 2, "category_name": "News", "parent_id": 0}
        ]))
        .into_response(),
        Some("get_live_streams") => Json(json!([
            {"num": 1, "name": "ESPN", "stream_type": "live", "stream_id": 101,
             "stream_icon": "http://logos.example/espn.png", "epg_channel_id": "ESPN.us",
             "category_id": "1"},
            {"num": 2, "name": "CNN International", "stream_type": "live", "stream_id": "102",
             "stream_icon": "", "epg_channel_id": null, "category_id": 2},
            {"num": 3, "name": "Mystery", "stream_type": "live", "stream_id": 103,
             "category_id": null}
        ]))
        .into_response(),
        Some(_) => StatusCode::BAD_REQUEST.into_response(),
    }
}

pub async fn spawn_provider() -> FakeProvider {
    let state = ProviderState::default();
    let app = Router::new()
        .route("/playlist.m3u", get(playlist))
        .route("/suspended.m3u", get(not_a_playlist))
        .route("/empty.m3u", get(empty_playlist))
        .route("/guide.xml.gz", get(guide))
        .route("/player_api.php", get(player_api))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    FakeProvider { addr, state }
}

pub async fn memory_database(channel_batch_size: usize) -> Database {
    let db = Database::connect("sqlite::memory:", 1, channel_batch_size)
        .await
        .unwrap();
    db.migrate().await.unwrap();
    db
}

pub fn test_config(cache_dir: &Path) -> Config {
    let mut config = Config::default();
    config.fetch.cache_dir = cache_dir.to_path_buf();
    config.fetch.probe_timeout_secs = 2;
    config.fetch.pull_timeout_secs = 5;
    config.ingestion.epg_batch_size = 2;
    config
}

pub async fn pipeline(cache_dir: &Path) -> IngestionPipeline {
    let config = test_config(cache_dir);
    IngestionPipeline::new(memory_database(2).await, &config, ProgressReporter::new(256)).unwrap()
}
