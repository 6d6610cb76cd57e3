use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{AppError, AppResult};

/// Environment variables use this prefix, e.g. `EPG_LINKER__DATABASE__URL`
pub const ENV_PREFIX: &str = "EPG_LINKER";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub fetch: FetchConfig,
    pub ingestion: IngestionConfig,
    pub sessions: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Timeout for connectivity probes
    pub probe_timeout_secs: u64,
    /// Timeout for full playlist and EPG pulls
    pub pull_timeout_secs: u64,
    pub user_agent: String,
    pub cache_dir: PathBuf,
    pub cache_ttl_hours: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    pub channel_batch_size: usize,
    pub epg_batch_size: usize,
    pub progress_channel_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub association_max_age_hours: i64,
    pub sweep_interval_minutes: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://./epg-linker.db".to_string(),
            max_connections: Some(10),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            probe_timeout_secs: 10,
            pull_timeout_secs: 30,
            user_agent: format!("epg-linker/{}", env!("CARGO_PKG_VERSION")),
            cache_dir: PathBuf::from("./data/cache"),
            cache_ttl_hours: 24,
        }
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            channel_batch_size: 1000,
            epg_batch_size: 1000,
            progress_channel_capacity: 256,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            association_max_age_hours: 48,
            sweep_interval_minutes: 60,
        }
    }
}

impl FetchConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_hours * 60 * 60)
    }
}

impl SessionConfig {
    pub fn association_max_age(&self) -> chrono::Duration {
        chrono::Duration::hours(self.association_max_age_hours)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_minutes.max(1) * 60)
    }
}

impl Config {
    /// Layer defaults, the TOML file at `path` (when present) and environment overrides.
    ///
    /// A missing file is written out with the default values so there is
    /// something to edit next time.
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();

        if !path.exists() {
            let contents = toml::to_string_pretty(&Self::default())
                .map_err(|e| AppError::configuration(format!("failed to render defaults: {e}")))?;
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| {
                    AppError::configuration(format!("failed to create {}: {e}", parent.display()))
                })?;
            }
            std::fs::write(path, contents).map_err(|e| {
                AppError::configuration(format!("failed to write {}: {e}", path.display()))
            })?;
        }

        Self::builder(Some(path))?
            .build()
            .and_then(|settings| settings.try_deserialize::<Config>())
            .map_err(|e| AppError::configuration(e.to_string()))
    }

    /// Defaults plus environment overrides, no file involved
    pub fn from_env() -> AppResult<Self> {
        Self::builder(None)?
            .build()
            .and_then(|settings| settings.try_deserialize::<Config>())
            .map_err(|e| AppError::configuration(e.to_string()))
    }

    fn builder(
        path: Option<&Path>,
    ) -> AppResult<config::ConfigBuilder<config::builder::DefaultState>> {
        let defaults = config::Config::try_from(&Self::default())
            .map_err(|e| AppError::configuration(e.to_string()))?;

        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            );
        }

        Ok(builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        ))
    }
}
