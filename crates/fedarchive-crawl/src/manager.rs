//! Crawl manager.
//!
//! A single intake loop consumes the shared new-server channel and decides
//! which sessions to spawn for each server it has not seen before:
//!
//! ```text
//!   seeds ─┐
//!          ▼
//!   ┌─────────────┐ known? ──► skip
//!   │ intake loop │──────────► record known (server list, NodeInfo)
//!   └─────────────┘            │
//!          ▲                   ▼ scope filter
//!          │        ┌──────────────────────┐
//!          │        │ archiver per timeline│──► DLQueue ──► workers
//!          │        └──────────────────────┘
//!          │        ┌──────────────────────┐
//!          └────────│ explorer on global   │
//!                   └──────────────────────┘
//! ```
//!
//! Factory failures abort only the spawn they belong to. Sessions never
//! report back; the manager does not learn when one terminates.
//!
//! On shutdown the shared token is cancelled, every spawned task is awaited,
//! and whatever is still queued for download goes to the recovery file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fedarchive_core::metrics::increment;
use fedarchive_core::{
    NODEINFO_FILE, PENDING_DOWNLOADS_FILE, Server, Target, Timeline, append_line, save_metadata,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::CrawlConfig;
use crate::media::{MediaDownloader, spawn_discard_worker, spawn_download_workers};
use crate::nodeinfo::NodeInfoLookup;
use crate::provider::{ProviderFactory, create_connection};
use crate::queue::{ServerSink, SharedReceiver, download_queue, drain_to_file};
use crate::registry::Registry;
use crate::session::{Session, SessionOutput};
use crate::Result;

/// What the manager did with one server from the intake channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntakeOutcome {
    /// Already processed earlier; nothing done.
    AlreadyKnown,
    /// Recorded as known, but its platform name or URL cannot be used as an
    /// archive path. Nothing is written for it.
    Rejected,
    /// Recorded as known but excluded by the scope filter.
    OutOfScope,
    /// In scope, but every session failed to build (e.g. unsupported platform).
    NotSpawned,
    /// Sessions started for this server.
    Spawned { archivers: usize, explorers: usize },
}

/// An archiver's queue, kept so it can be drained on shutdown.
struct ArchiveQueue {
    server_dir: PathBuf,
    rx: SharedReceiver,
}

/// Spawns and tracks sessions for discovered servers.
pub struct CrawlManager {
    config: CrawlConfig,
    registry: Registry,
    factory: Arc<dyn ProviderFactory>,
    nodeinfo: Arc<dyn NodeInfoLookup>,
    http: reqwest::Client,
    intake_tx: mpsc::Sender<Server>,
    intake_rx: tokio::sync::Mutex<mpsc::Receiver<Server>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    queues: Mutex<Vec<ArchiveQueue>>,
}

impl CrawlManager {
    pub fn new(
        config: CrawlConfig,
        factory: Arc<dyn ProviderFactory>,
        nodeinfo: Arc<dyn NodeInfoLookup>,
        http: reqwest::Client,
    ) -> Self {
        let (intake_tx, intake_rx) = mpsc::channel(config.intake_capacity);
        Self {
            config,
            registry: Registry::new(),
            factory,
            nodeinfo,
            http,
            intake_tx,
            intake_rx: tokio::sync::Mutex::new(intake_rx),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            queues: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &CrawlConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Token cancelled by [`CrawlManager::shutdown`]. Cancelling it directly
    /// stops the intake loop.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// A sender onto the intake channel.
    pub fn server_sink(&self) -> ServerSink {
        ServerSink::new(self.intake_tx.clone())
    }

    /// Feed seed servers into the intake channel from a background task, so a
    /// seed list longer than the channel capacity cannot block the caller.
    pub fn seed(&self, servers: Vec<Server>) {
        let sink = self.server_sink();
        let shutdown = self.shutdown.clone();
        self.track(tokio::spawn(async move {
            let total = servers.len();
            for server in servers {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    sent = sink.push(server) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
            tracing::info!("Seeded {} servers", total);
        }));
    }

    /// Consume the intake channel until shutdown.
    pub async fn run(&self) {
        let mut intake = self.intake_rx.lock().await;
        tracing::info!(scope = %self.config.scope, "Crawl manager started");

        loop {
            let server = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                server = intake.recv() => server,
            };
            let Some(server) = server else {
                break;
            };

            match self.process_server(server.clone()) {
                IntakeOutcome::AlreadyKnown | IntakeOutcome::Rejected => {}
                IntakeOutcome::OutOfScope => {
                    tracing::debug!("Out of scope: {} ({})", server.url, server.platform);
                }
                IntakeOutcome::NotSpawned => {
                    tracing::debug!("No sessions started for {} ({})", server.url, server.platform);
                }
                IntakeOutcome::Spawned {
                    archivers,
                    explorers,
                } => {
                    tracing::info!(
                        server = %server.url,
                        platform = %server.platform,
                        archivers,
                        explorers,
                        "Server added"
                    );
                }
            }
        }

        tracing::info!("Crawl manager stopped");
    }

    /// Apply the intake policy to one server.
    pub fn process_server(&self, server: Server) -> IntakeOutcome {
        if !self.registry.add_known_server(&server) {
            return IntakeOutcome::AlreadyKnown;
        }
        increment("crawl_servers_discovered_total", 1);

        let (list_path, server_dir) = match self.archive_paths(&server) {
            Ok(paths) => paths,
            Err(e) => {
                tracing::warn!("Refusing server {} ({}): {}", server.url, server.platform, e);
                increment("crawl_servers_rejected_total", 1);
                return IntakeOutcome::Rejected;
            }
        };
        self.record_known(&server, &list_path, &server_dir);

        if !self.config.scope.allows(&server.platform) {
            increment("crawl_servers_out_of_scope_total", 1);
            return IntakeOutcome::OutOfScope;
        }

        let mut archivers = 0;
        for timeline in &self.config.timelines {
            let target = Target::new(server.clone(), *timeline);
            match self.spawn_archiver(target, server_dir.clone()) {
                Ok(true) => archivers += 1,
                Ok(false) => {}
                Err(e) => tracing::error!(
                    server = %server.url,
                    timeline = %timeline,
                    "Failed to create archiver: {}",
                    e
                ),
            }
        }

        let mut explorers = 0;
        if self.config.scope.explores() {
            let target = Target::new(server.clone(), Timeline::Global);
            match self.spawn_explorer(target, server_dir.clone()) {
                Ok(true) => explorers += 1,
                Ok(false) => {}
                Err(e) => tracing::error!(server = %server.url, "Failed to create explorer: {}", e),
            }
        }

        if archivers + explorers == 0 {
            return IntakeOutcome::NotSpawned;
        }
        IntakeOutcome::Spawned {
            archivers,
            explorers,
        }
    }

    /// Server list file and archive directory for a server.
    fn archive_paths(&self, server: &Server) -> Result<(PathBuf, PathBuf)> {
        let server_dir = self.config.server_dir(server)?;
        let list_path = self.config.server_list_path(&server.platform)?;
        Ok((list_path, server_dir))
    }

    /// Append the server list line and save NodeInfo in the background.
    fn record_known(&self, server: &Server, list_path: &Path, server_dir: &Path) {
        if let Err(e) = append_line(list_path, &server.to_list_line()) {
            tracing::error!("Failed to append to {}: {}", list_path.display(), e);
        }

        let nodeinfo = Arc::clone(&self.nodeinfo);
        let path = server_dir.join(NODEINFO_FILE);
        let server = server.clone();
        let shutdown = self.shutdown.clone();
        self.track(tokio::spawn(async move {
            let info = tokio::select! {
                _ = shutdown.cancelled() => return,
                info = nodeinfo.get_node_info(&server.url) => info,
            };
            let info = match info {
                Ok(info) => info,
                Err(e) => {
                    tracing::debug!("NodeInfo not available for {}: {}", server.url, e);
                    return;
                }
            };

            let mut meta = BTreeMap::new();
            meta.insert("source_url".to_string(), info.source_url.clone());
            meta.insert("server_url".to_string(), server.url.clone());
            meta.insert("server_type".to_string(), server.platform.to_string());
            meta.insert("schema_version".to_string(), info.schema_version.clone());
            if let Err(e) = save_metadata(Some(info.raw.as_slice()), None, &path, &meta) {
                tracing::error!("Failed to save NodeInfo for {}: {}", server.url, e);
            }
        }));
    }

    /// Start an archiver and its download consumers.
    ///
    /// Returns `Ok(false)` when one is already registered for the target.
    fn spawn_archiver(&self, target: Target, server_dir: PathBuf) -> Result<bool> {
        if self.registry.archiver_exists(&target) {
            return Ok(false);
        }

        let connection = create_connection(self.factory.as_ref(), &target, &server_dir)?;
        let (sink, rx) = download_queue(
            self.config.queue_capacity,
            self.config.overflow_file.clone(),
        );
        let (session, handle) = Session::new(
            connection,
            SessionOutput::Downloads(sink),
            server_dir.clone(),
            self.config.reconnect_delay,
        );
        if !self.registry.register_archiver(handle) {
            return Ok(false);
        }

        if self.config.media_enabled {
            let downloader = MediaDownloader::new(self.http.clone(), server_dir.clone());
            for worker in spawn_download_workers(
                downloader,
                Arc::clone(&rx),
                self.config.parallel_downloads,
                self.shutdown.clone(),
            ) {
                self.track(worker);
            }
        } else {
            self.track(spawn_discard_worker(Arc::clone(&rx), self.shutdown.clone()));
        }
        self.queues.lock().push(ArchiveQueue { server_dir, rx });

        self.track(tokio::spawn(session.run(self.shutdown.clone())));
        Ok(true)
    }

    /// Start an explorer feeding the intake channel.
    ///
    /// Returns `Ok(false)` when one is already registered for the target.
    fn spawn_explorer(&self, target: Target, server_dir: PathBuf) -> Result<bool> {
        if self.registry.explorer_exists(&target) {
            return Ok(false);
        }

        let connection = create_connection(self.factory.as_ref(), &target, &server_dir)?;
        let (session, handle) = Session::new(
            connection,
            SessionOutput::Servers(self.server_sink()),
            server_dir,
            self.config.reconnect_delay,
        );
        if !self.registry.register_explorer(handle) {
            return Ok(false);
        }

        self.track(tokio::spawn(session.run(self.shutdown.clone())));
        Ok(true)
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Stop every session and worker, then move queued downloads to
    /// `{download_dir}/pending_downloads.jsonl`.
    ///
    /// Returns the number of items written to the recovery file.
    pub async fn shutdown(&self) -> usize {
        self.shutdown.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        tracing::info!("Waiting for {} tasks to stop", tasks.len());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Task failed during shutdown: {}", e);
            }
        }

        let queues = std::mem::take(&mut *self.queues.lock());
        let pending_path = self.config.download_dir.join(PENDING_DOWNLOADS_FILE);
        let mut drained = 0;
        for queue in &queues {
            match drain_to_file(&queue.rx, &queue.server_dir, &pending_path).await {
                Ok(n) => drained += n,
                Err(e) => tracing::error!(
                    "Failed to drain queue for {}: {}",
                    queue.server_dir.display(),
                    e
                ),
            }
        }

        if drained > 0 {
            tracing::info!(
                "Saved {} pending downloads to {}",
                drained,
                pending_path.display()
            );
        }
        drained
    }
}
