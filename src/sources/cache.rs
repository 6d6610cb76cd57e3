//! On-disk cache of full EPG downloads, keyed by an MD5 digest of the URL

use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct DownloadCache {
    dir: PathBuf,
    ttl: Duration,
}

impl DownloadCache {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
        }
    }

    /// `<md5(url)>.xml`, or `.xml.gz` when the URL names a gzip file
    pub fn path_for(&self, url: &str) -> PathBuf {
        let digest = format!("{:x}", md5::compute(url.as_bytes()));
        let path_part = url.split(['?', '#']).next().unwrap_or(url);
        let extension = if path_part.ends_with(".gz") {
            "xml.gz"
        } else {
            "xml"
        };
        self.dir.join(format!("{digest}.{extension}"))
    }

    /// Cached copy younger than the TTL
    pub async fn fresh(&self, url: &str) -> Option<Bytes> {
        let path = self.path_for(url);
        let modified = tokio::fs::metadata(&path).await.ok()?.modified().ok()?;
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        if age >= self.ttl {
            debug!("Cached copy of {} is {}s old, refreshing", path.display(), age.as_secs());
            return None;
        }
        self.read(&path).await
    }

    /// Cached copy regardless of age, used when a download fails
    pub async fn stale(&self, url: &str) -> Option<Bytes> {
        self.read(&self.path_for(url)).await
    }

    pub async fn store(&self, url: &str, content: &Bytes) {
        let path = self.path_for(url);
        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            warn!("Failed to create cache directory {}: {}", self.dir.display(), e);
            return;
        }
        match tokio::fs::write(&path, content).await {
            Ok(()) => debug!("Cached {} bytes at {}", content.len(), path.display()),
            Err(e) => warn!("Failed to write cache file {}: {}", path.display(), e),
        }
    }

    async fn read(&self, path: &Path) -> Option<Bytes> {
        tokio::fs::read(path).await.ok().map(Bytes::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_is_digest_with_gz_suffix_preserved() {
        let cache = DownloadCache::new("/tmp/cache", Duration::from_secs(60));
        let plain = cache.path_for("http://epg.example/guide.xml");
        let gz = cache.path_for("http://epg.example/guide.xml.gz?token=1");

        let plain_name = plain.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(plain_name.len(), 32 + ".xml".len());
        assert!(gz.to_string_lossy().ends_with(".xml.gz"));
    }

    #[tokio::test]
    async fn test_fresh_respects_ttl_and_stale_ignores_it() {
        let dir = tempfile::tempdir().unwrap();
        let url = "http://epg.example/guide.xml";

        let cache = DownloadCache::new(dir.path(), Duration::from_secs(3600));
        assert!(cache.fresh(url).await.is_none());

        cache.store(url, &Bytes::from_static(b"<tv></tv>")).await;
        assert_eq!(cache.fresh(url).await.unwrap().as_ref(), b"<tv></tv>");

        let expired = DownloadCache::new(dir.path(), Duration::ZERO);
        assert!(expired.fresh(url).await.is_none());
        assert!(expired.stale(url).await.is_some());
    }
}
