//! Fediverse archiver daemon.
//!
//! Opens streaming sessions against the seed servers, archives every message
//! they deliver, and follows the servers those streams mention.
//!
//! # Usage
//!
//! ```bash
//! # Archive one Misskey server's local timeline
//! fedarchive-crawl --platform misskey --url misskey.io
//!
//! # Seed from a server list, explore every platform, download media
//! fedarchive-crawl \
//!     --server-list servers.txt \
//!     --timeline local,global \
//!     --scope unbounded \
//!     --media --parallel-download 8
//! ```
//!
//! Every flag can also be set through a `FEDARCHIVE_*` environment variable,
//! and a `.env` file in the working directory is loaded first.
//!
//! # Graceful Shutdown
//!
//! On SIGINT (Ctrl+C) or SIGTERM:
//! 1. The intake loop stops accepting servers
//! 2. Sessions stop receiving and close their connections
//! 3. Queued downloads are written to `pending_downloads.jsonl`
//! 4. The next run with `--media` downloads them first

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use fedarchive_core::metrics::{init_metrics, start_metrics_server};
use fedarchive_core::{
    ARCHIVE_INFO_FILE, ArchiveInfo, PENDING_DOWNLOADS_FILE, Server, Timeline, read_server_list,
    save_archive_info,
};
use fedarchive_crawl::media::recover_pending;
use fedarchive_crawl::queue::take_pending;
use fedarchive_crawl::{
    CrawlConfig, CrawlManager, DefaultProviderFactory, NodeInfoClient, NodeInfoLookup,
    ProviderFactory, Scope,
};
use tracing_subscriber::EnvFilter;

/// Fediverse archiver daemon.
#[derive(Parser, Debug)]
#[command(name = "fedarchive-crawl")]
#[command(about = "Streaming archiver for Mastodon, Misskey, Bluesky and Nostr")]
#[command(version)]
struct Args {
    /// Seed server URL (repeatable, requires --platform)
    #[arg(long = "url", env = "FEDARCHIVE_URL", value_delimiter = ',', requires = "platform")]
    urls: Vec<String>,

    /// Platform type of the --url seeds (mastodon, misskey, bluesky, nostr)
    #[arg(long, env = "FEDARCHIVE_PLATFORM")]
    platform: Option<String>,

    /// File of `url type` lines to seed from
    #[arg(long, env = "FEDARCHIVE_SERVER_LIST")]
    server_list: Option<PathBuf>,

    /// Timelines to archive (comma-separated: local, global)
    #[arg(long, env = "FEDARCHIVE_TIMELINE", value_delimiter = ',', default_value = "local")]
    timeline: Vec<Timeline>,

    /// Root directory of the archive
    #[arg(long, env = "FEDARCHIVE_DOWNLOAD_DIR", default_value = "downloads")]
    download_dir: PathBuf,

    /// Which discovered servers to follow: unbounded, server, or a platform type
    #[arg(long, env = "FEDARCHIVE_SCOPE", default_value = "server")]
    scope: Scope,

    /// Download media assets referenced by archived messages
    #[arg(long, env = "FEDARCHIVE_MEDIA")]
    media: bool,

    /// Download workers per archived timeline
    #[arg(long, env = "FEDARCHIVE_PARALLEL_DOWNLOAD", default_value = "4")]
    parallel_download: usize,

    /// Capacity of each download queue
    #[arg(long, env = "FEDARCHIVE_QUEUE_CAPACITY", default_value = "100")]
    queue_capacity: usize,

    /// Fixed delay between reconnect attempts, in seconds
    #[arg(long, env = "FEDARCHIVE_RECONNECT_DELAY_SECS", default_value = "5")]
    reconnect_delay_secs: u64,

    /// Spill download items here when a queue is full instead of waiting
    #[arg(long, env = "FEDARCHIVE_OVERFLOW_FILE")]
    overflow_file: Option<PathBuf>,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, env = "FEDARCHIVE_METRICS_PORT", default_value = "0")]
    metrics_port: u16,

    /// Debug logging
    #[arg(long, short, env = "FEDARCHIVE_VERBOSE")]
    verbose: bool,

    /// Extra .env file, loaded before FEDARCHIVE_* variables are read
    #[arg(long, env = "FEDARCHIVE_DOTENV")]
    dotenv: Option<PathBuf>,
}

impl Args {
    fn crawl_config(&self) -> CrawlConfig {
        CrawlConfig {
            download_dir: self.download_dir.clone(),
            timelines: self.timeline.clone(),
            scope: self.scope.clone(),
            media_enabled: self.media,
            parallel_downloads: self.parallel_download,
            queue_capacity: self.queue_capacity,
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
            overflow_file: self.overflow_file.clone(),
            ..Default::default()
        }
    }

    /// Seeds from `--url` followed by the server list.
    fn seed_servers(&self) -> Result<Vec<Server>> {
        let mut servers = Vec::new();
        if let Some(platform) = &self.platform {
            servers.extend(
                self.urls
                    .iter()
                    .filter(|url| !url.trim().is_empty())
                    .map(|url| Server::new(platform.as_str(), url.trim())),
            );
        }

        if let Some(path) = &self.server_list {
            let listed = read_server_list(path)
                .with_context(|| format!("Failed to read server list {}", path.display()))?;
            tracing::info!("Loaded {} servers from {}", listed.len(), path.display());
            servers.extend(listed);
        }

        Ok(servers)
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "debug,fedarchive_crawl=debug"
    } else {
        "info,fedarchive_crawl=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider (required when both ring and aws-lc-rs are present)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    dotenvy::dotenv().ok();
    let mut args = Args::parse();
    if let Some(path) = args.dotenv.clone() {
        dotenvy::from_path(&path)
            .with_context(|| format!("Failed to load {}", path.display()))?;
        args = Args::parse();
    }

    init_tracing(args.verbose);
    tracing::info!("Fediverse archiver starting...");

    let config = args.crawl_config();
    config.validate()?;

    let seeds = args.seed_servers()?;
    if seeds.is_empty() {
        bail!("No seed servers: pass --url with --platform, or --server-list");
    }

    if args.metrics_port > 0 {
        let handle = init_metrics().context("Failed to install metrics recorder")?;
        start_metrics_server(args.metrics_port, handle)
            .await
            .context("Failed to start metrics server")?;
    }

    tracing::info!("Configuration:");
    tracing::info!("  Download dir: {}", config.download_dir.display());
    tracing::info!(
        "  Timelines: {}",
        config
            .timelines
            .iter()
            .map(Timeline::as_str)
            .collect::<Vec<_>>()
            .join(",")
    );
    tracing::info!("  Scope: {}", config.scope);
    tracing::info!("  Media: {}", config.media_enabled);
    tracing::info!("  Parallel downloads: {}", config.parallel_downloads);
    tracing::info!("  Seed servers: {}", seeds.len());

    std::fs::create_dir_all(&config.download_dir).with_context(|| {
        format!(
            "Failed to create download dir {}",
            config.download_dir.display()
        )
    })?;
    let info = ArchiveInfo::new(
        &config
            .timelines
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>(),
        &config.scope.to_string(),
        &seeds.iter().map(|s| s.url.clone()).collect::<Vec<_>>(),
    );
    save_archive_info(&info, &config.download_dir.join(ARCHIVE_INFO_FILE))
        .context("Failed to save archive info")?;

    let http = reqwest::Client::builder()
        .user_agent(concat!("fedarchive/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(60))
        .build()
        .context("Failed to build HTTP client")?;
    let nodeinfo: Arc<dyn NodeInfoLookup> = Arc::new(NodeInfoClient::new(http.clone()));
    let factory: Arc<dyn ProviderFactory> = Arc::new(DefaultProviderFactory::new(
        http.clone(),
        Arc::clone(&nodeinfo),
    ));
    let pending_path = config.download_dir.join(PENDING_DOWNLOADS_FILE);
    let media_enabled = config.media_enabled;
    let manager = CrawlManager::new(config, factory, nodeinfo, http.clone());

    // Set up graceful shutdown
    let shutdown = manager.shutdown_token();
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping gracefully...");
        shutdown.cancel();
    })
    .context("Failed to set Ctrl+C handler")?;

    let recovery = if media_enabled {
        let pending = take_pending(&pending_path).context("Failed to load pending downloads")?;
        (!pending.is_empty())
            .then(|| recover_pending(pending, http.clone(), manager.shutdown_token()))
    } else {
        None
    };

    manager.seed(seeds);
    manager.run().await;

    tracing::info!("Shutting down...");
    let drained = manager.shutdown().await;
    if let Some(recovery) = recovery
        && let Err(e) = recovery.await
    {
        tracing::warn!("Pending download recovery failed: {}", e);
    }

    let registry = manager.registry();
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("SHUTDOWN COMPLETE");
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("Known servers:        {}", registry.known_server_count());
    tracing::info!("Archivers started:    {}", registry.archiver_count());
    tracing::info!("Explorers started:    {}", registry.explorer_count());
    tracing::info!("Pending downloads:    {}", drained);

    Ok(())
}
