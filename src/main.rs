use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{broadcast::error::RecvError, oneshot};
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use epg_linker::{
    config::Config,
    database::Database,
    ingestor::{EpgSourceRequest, IngestionPipeline, PlaylistIngestRequest},
    models::{ChannelFilters, SourceKind},
    services::{ProgressEvent, ProgressReporter, SessionSweeper},
};

/// Session scope used by the command line when none is given
const CLI_SESSION: &str = "cli";

#[derive(Parser)]
#[command(name = "epg-linker")]
#[command(version)]
#[command(about = "Ingests IPTV playlists and XMLTV guides and links channels to EPG entries")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Database URL (overrides config file)
    #[arg(short = 'd', long, value_name = "URL")]
    database_url: Option<String>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct SessionArgs {
    /// Session whose sources are read or written
    #[arg(short, long, default_value = CLI_SESSION)]
    session: String,
}

#[derive(Args)]
struct EpgArgs {
    /// XMLTV document URL (plain or gzip)
    #[arg(long, conflicts_with = "file", required_unless_present = "file")]
    url: Option<String>,
    /// Local XMLTV file
    #[arg(long)]
    file: Option<PathBuf>,
}

impl EpgArgs {
    async fn into_request(self) -> Result<EpgSourceRequest> {
        match (self.url, self.file) {
            (_, Some(file)) => Ok(EpgSourceRequest::Upload(Bytes::from(
                tokio::fs::read(&file)
                    .await
                    .with_context(|| format!("failed to read {}", file.display()))?,
            ))),
            (Some(url), None) => Ok(EpgSourceRequest::Url(url)),
            (None, None) => anyhow::bail!("either --url or --file is required"),
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Fetch (or read) a playlist or provider-API source and store its channels
    IngestPlaylist {
        /// Playlist or provider URL
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        url: Option<String>,
        /// Local playlist file to upload instead of fetching
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long)]
        name: Option<String>,
        #[arg(short, long)]
        username: Option<String>,
        #[arg(short, long)]
        password: Option<String>,
        /// playlist or provider-api
        #[arg(long, default_value = "playlist")]
        kind: SourceKind,
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Parse an XMLTV document and print its summary
    IngestEpg {
        #[command(flatten)]
        epg: EpgArgs,
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Load an XMLTV document and map the session's channels to its channels
    Match {
        #[command(flatten)]
        epg: EpgArgs,
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Refresh a stored source from its URL
    Refresh {
        source_id: Uuid,
        #[command(flatten)]
        session: SessionArgs,
    },
    /// List channels visible to a session
    Channels {
        #[command(flatten)]
        session: SessionArgs,
        #[arg(long)]
        group: Option<String>,
        /// Only channels without an EPG mapping
        #[arg(long)]
        unmapped: bool,
        #[arg(long)]
        limit: Option<u32>,
        #[arg(long)]
        offset: Option<u32>,
    },
    /// Search channel names visible to a session
    Search {
        query: String,
        #[command(flatten)]
        session: SessionArgs,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// List categories visible to a session
    Categories {
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Map a channel to an EPG channel id by hand
    Map {
        channel_id: String,
        /// Leave out to clear the mapping
        epg_channel_id: Option<String>,
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Remove expired session associations
    Sweep,
    /// Keep sweeping expired session associations until interrupted
    Watch {
        /// Sweep period in seconds (overrides config)
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    /// Print storage statistics
    Stats,
    /// Delete a source with its channels and categories
    DeleteSource { source_id: Uuid },
    /// Vacuum the database
    Optimize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_filter = format!("epg_linker={}", cli.log_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::load(&cli.config)?;
    info!("Configuration loaded from: {}", cli.config.display());
    if let Some(database_url) = cli.database_url {
        config.database.url = database_url;
    }

    info!("Using database: {}", config.database.url);
    let database = Database::new(&config.database, &config.ingestion).await?;
    database.migrate().await?;

    let progress = ProgressReporter::new(config.ingestion.progress_channel_capacity);
    let pipeline = IngestionPipeline::new(database.clone(), &config, progress.clone())?;

    match cli.command {
        Command::IngestPlaylist {
            url,
            file,
            name,
            username,
            password,
            kind,
            session,
        } => {
            let printer = print_progress(&progress, &session.session);
            let result = match (url, file) {
                (_, Some(file)) => {
                    let content = tokio::fs::read(&file)
                        .await
                        .with_context(|| format!("failed to read {}", file.display()))?;
                    let name = name.unwrap_or_else(|| file.display().to_string());
                    pipeline
                        .ingest_upload(&name, Bytes::from(content), Some(&session.session))
                        .await
                }
                (Some(url), None) => {
                    let request = PlaylistIngestRequest {
                        name,
                        url,
                        username,
                        password,
                        kind,
                        session_id: Some(session.session.clone()),
                    };
                    pipeline.test_connectivity(&request).await?;
                    pipeline.ingest_playlist(&request).await
                }
                (None, None) => anyhow::bail!("either --url or --file is required"),
            };
            printer.finish().await;
            let result = result?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::IngestEpg { epg, session } => {
            let source = epg.into_request().await?;
            let printer = print_progress(&progress, &session.session);
            let summary = pipeline.ingest_epg(source, Some(&session.session)).await;
            printer.finish().await;
            println!("{}", serde_json::to_string_pretty(&summary?)?);
        }
        Command::Match { epg, session } => {
            let source = epg.into_request().await?;
            let printer = print_progress(&progress, &session.session);
            let summary = pipeline.ingest_epg(source, Some(&session.session)).await;
            printer.finish().await;
            summary?;

            let report = pipeline.match_channels(&session.session).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Refresh { source_id, session } => {
            let printer = print_progress(&progress, &session.session);
            let result = pipeline.refresh_source(source_id, Some(&session.session)).await;
            printer.finish().await;
            println!("{}", serde_json::to_string_pretty(&result?)?);
        }
        Command::Channels {
            session,
            group,
            unmapped,
            limit,
            offset,
        } => {
            let filters = ChannelFilters {
                group,
                epg_mapped: unmapped.then_some(false),
                limit,
                offset,
                ..Default::default()
            };
            let channels = database.list_channels(&session.session, &filters).await?;
            println!("{}", serde_json::to_string_pretty(&channels)?);
        }
        Command::Search {
            query,
            session,
            limit,
        } => {
            let channels = database
                .search_channels(&session.session, &query, limit)
                .await?;
            println!("{}", serde_json::to_string_pretty(&channels)?);
        }
        Command::Categories { session } => {
            let categories = database.list_categories(&session.session).await?;
            println!("{}", serde_json::to_string_pretty(&categories)?);
        }
        Command::Map {
            channel_id,
            epg_channel_id,
            session,
        } => {
            let updated = database
                .set_channel_epg_mapping(&session.session, &channel_id, epg_channel_id.as_deref())
                .await?;
            println!("Updated {} channels", updated);
        }
        Command::Sweep => {
            let removed = SessionSweeper::new(database.clone(), &config.sessions)
                .with_progress(progress.clone())
                .run_once()
                .await?;
            println!("Removed {} session associations", removed);
        }
        Command::Watch { interval_secs } => {
            let mut sweeper =
                SessionSweeper::new(database.clone(), &config.sessions).with_progress(progress.clone());
            if let Some(secs) = interval_secs {
                sweeper = sweeper.with_period(Duration::from_secs(secs.max(1)));
            }
            let handle = sweeper.spawn();
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for ctrl-c")?;
            info!("Stopping session sweeper");
            handle.abort();
        }
        Command::Stats => {
            let stats = database.storage_statistics().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::DeleteSource { source_id } => {
            if pipeline.delete_source(source_id).await? {
                println!("Deleted source {}", source_id);
            } else {
                anyhow::bail!("source {} not found", source_id);
            }
        }
        Command::Optimize => {
            database.optimize().await?;
        }
    }

    Ok(())
}

/// Prints progress events for one scope to stderr
struct ProgressPrinter {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl ProgressPrinter {
    /// Print whatever is still buffered, then stop
    async fn finish(self) {
        let _ = self.stop.send(());
        let _ = self.handle.await;
    }
}

fn print_progress(progress: &ProgressReporter, scope: &str) -> ProgressPrinter {
    let mut rx = progress.subscribe(scope);
    let (stop, mut stopped) = oneshot::channel();
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                event = rx.recv() => match event {
                    Ok(event) => print_event(event),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                },
                _ = &mut stopped => {
                    while let Ok(event) = rx.try_recv() {
                        print_event(event);
                    }
                    break;
                }
            }
        }
    });
    ProgressPrinter { stop, handle }
}

fn print_event(event: ProgressEvent) {
    match event {
        ProgressEvent::Progress {
            percentage,
            stage,
            message,
            ..
        } => eprintln!("[{:>5.1}%] {}: {}", percentage, stage, message),
        ProgressEvent::Error {
            message, details, ..
        } => match details {
            Some(details) => eprintln!("[error] {} ({})", message, details),
            None => eprintln!("[error] {}", message),
        },
    }
}
