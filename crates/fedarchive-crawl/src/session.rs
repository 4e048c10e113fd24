//! Streaming sessions.
//!
//! A [`Session`] owns one [`Connection`] and drives it through
//!
//! ```text
//! Created → Connecting → Subscribing → Receiving
//!                ▲                         │ Err
//!                │                         ▼
//!           Reconnecting ◄──────────── Disconnected
//!
//! any state ──(first attempt fails | stream ends | shutdown)──► Terminated
//! ```
//!
//! Transient failures close the provider, wait a fixed delay, assign a fresh
//! crawl session id and reconnect, forever. The delay and the receive loop
//! both stop on the shared [`CancellationToken`].
//!
//! The session holds the only producer of its output, so reaching
//! `Terminated` closes an archiver's DLQueue and its consumers exit.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fedarchive_core::metrics::increment_role;
use fedarchive_core::{CRAWL_SESSIONS_FILE, Target, save_metadata, save_request};
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::Result;
use crate::provider::Connection;
use crate::queue::{DownloadSink, ServerSink};

/// What a session does with its timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Persist messages and queue their assets.
    Archive,
    /// Look for other servers.
    Explore,
}

impl Role {
    /// Name used in crawl session records and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Archive => "archiver",
            Self::Explore => "explorer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Connecting,
    Subscribing,
    Receiving,
    Disconnected,
    Reconnecting,
    Terminated,
}

/// Where a session sends what it finds.
#[derive(Debug)]
pub enum SessionOutput {
    Downloads(DownloadSink),
    Servers(ServerSink),
}

impl SessionOutput {
    pub fn role(&self) -> Role {
        match self {
            Self::Downloads(_) => Role::Archive,
            Self::Servers(_) => Role::Explore,
        }
    }
}

/// Cloneable view of a running session, stored in the registry.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    target: Target,
    role: Role,
    state: watch::Receiver<SessionState>,
    crawl_session_id: Arc<Mutex<Uuid>>,
}

impl SessionHandle {
    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Id of the current connection attempt.
    pub fn crawl_session_id(&self) -> Uuid {
        *self.crawl_session_id.lock()
    }

    /// Wait until the session reports `state`.
    ///
    /// Returns `false` if the session went away first.
    pub async fn wait_for(&mut self, state: SessionState) -> bool {
        self.state.wait_for(|s| *s == state).await.is_ok()
    }

    /// Handle not backed by a running session.
    #[cfg(test)]
    pub(crate) fn detached(target: Target, role: Role) -> Self {
        let (_tx, state) = watch::channel(SessionState::Created);
        Self {
            target,
            role,
            state,
            crawl_session_id: Arc::new(Mutex::new(Uuid::new_v4())),
        }
    }
}

/// One streaming session for a target.
pub struct Session {
    connection: Connection,
    output: SessionOutput,
    server_dir: PathBuf,
    reconnect_delay: Duration,
    crawl_session_id: Arc<Mutex<Uuid>>,
    state: watch::Sender<SessionState>,
}

impl Session {
    /// Build a session in the `Created` state and its handle.
    pub fn new(
        connection: Connection,
        output: SessionOutput,
        server_dir: PathBuf,
        reconnect_delay: Duration,
    ) -> (Self, SessionHandle) {
        let (state, state_rx) = watch::channel(SessionState::Created);
        let crawl_session_id = Arc::new(Mutex::new(Uuid::new_v4()));

        let handle = SessionHandle {
            target: connection.target.clone(),
            role: output.role(),
            state: state_rx,
            crawl_session_id: Arc::clone(&crawl_session_id),
        };

        let session = Self {
            connection,
            output,
            server_dir,
            reconnect_delay,
            crawl_session_id,
            state,
        };
        (session, handle)
    }

    pub fn role(&self) -> Role {
        self.output.role()
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    fn current_id(&self) -> Uuid {
        *self.crawl_session_id.lock()
    }

    /// Drive the session until it terminates.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let role = self.role().as_str();
        let target = self.connection.target.clone();
        increment_role("crawl_sessions_started_total", role);

        if let Err(e) = self.establish(&shutdown).await {
            tracing::error!(
                server = %target.server.url,
                timeline = %target.timeline,
                role,
                "Failed to start session: {}",
                e
            );
            self.terminate().await;
            return;
        }

        loop {
            self.set_state(SessionState::Receiving);
            let result = tokio::select! {
                _ = shutdown.cancelled() => None,
                result = self.receive() => Some(result),
            };

            match result {
                None => break,
                Some(Ok(())) => {
                    tracing::info!(
                        server = %target.server.url,
                        timeline = %target.timeline,
                        role,
                        "Stream ended"
                    );
                    break;
                }
                Some(Err(e)) => {
                    tracing::warn!(
                        server = %target.server.url,
                        timeline = %target.timeline,
                        role,
                        "Receive error: {}. Reconnecting in {:?}",
                        e,
                        self.reconnect_delay
                    );
                    counter!("crawl_session_failures_total", "role" => role, "stage" => "receive")
                        .increment(1);
                    self.set_state(SessionState::Disconnected);
                    if !self.reconnect(&shutdown).await {
                        break;
                    }
                    tracing::info!(
                        server = %target.server.url,
                        timeline = %target.timeline,
                        role,
                        "Reconnected successfully"
                    );
                }
            }
        }

        self.terminate().await;
    }

    /// Close, wait, and retry until a connect+subscribe succeeds.
    ///
    /// Returns `false` if shutdown interrupted the loop.
    async fn reconnect(&mut self, shutdown: &CancellationToken) -> bool {
        let role = self.role().as_str();
        loop {
            self.close_provider().await;
            self.set_state(SessionState::Reconnecting);
            increment_role("crawl_session_reconnects_total", role);

            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }

            *self.crawl_session_id.lock() = Uuid::new_v4();
            match self.establish(shutdown).await {
                Ok(()) => return true,
                Err(_) if shutdown.is_cancelled() => return false,
                Err(e) => {
                    tracing::warn!(
                        server = %self.connection.target.server.url,
                        timeline = %self.connection.target.timeline,
                        role,
                        "Reconnect failed: {}. Retrying",
                        e
                    );
                }
            }
        }
    }

    /// Record the crawl session, then connect and subscribe.
    async fn establish(&mut self, shutdown: &CancellationToken) -> Result<()> {
        let role = self.role().as_str();
        let crawl_session_id = self.current_id();
        self.record_crawl_session(crawl_session_id);
        let log_path = self.server_dir.join(CRAWL_SESSIONS_FILE);

        self.set_state(SessionState::Connecting);
        let connected = tokio::select! {
            _ = shutdown.cancelled() => Err(crate::Error::Connection("shutdown".into())),
            r = self.connection.provider.connect(crawl_session_id) => r,
        };
        let url = connected.inspect_err(|_| {
            counter!("crawl_session_failures_total", "role" => role, "stage" => "connect")
                .increment(1);
        })?;
        if let Err(e) = save_request(None, &url, crawl_session_id, &log_path) {
            tracing::error!("Failed to save connect request: {}", e);
        }

        self.set_state(SessionState::Subscribing);
        let sent = self
            .connection
            .provider
            .subscribe_channel()
            .await
            .inspect_err(|_| {
                counter!("crawl_session_failures_total", "role" => role, "stage" => "subscribe")
                    .increment(1);
            })?;
        if let Some(sent) = sent
            && let Err(e) = save_request(Some(&sent), &url, crawl_session_id, &log_path)
        {
            tracing::error!("Failed to save subscription request: {}", e);
        }

        Ok(())
    }

    async fn receive(&mut self) -> Result<()> {
        let Session {
            connection, output, ..
        } = self;
        match output {
            SessionOutput::Downloads(sink) => connection.provider.receive_messages(sink).await,
            SessionOutput::Servers(sink) => connection.provider.crawl_new_servers(sink).await,
        }
    }

    fn record_crawl_session(&self, crawl_session_id: Uuid) {
        let target = &self.connection.target;
        let mut meta = BTreeMap::new();
        meta.insert("server_url".to_string(), target.server.url.clone());
        meta.insert("server_type".to_string(), target.server.platform.to_string());
        meta.insert("timeline".to_string(), target.timeline.to_string());
        meta.insert("role".to_string(), self.role().as_str().to_string());

        let path = self.server_dir.join(CRAWL_SESSIONS_FILE);
        if let Err(e) = save_metadata(None, Some(crawl_session_id), &path, &meta) {
            tracing::error!("Failed to save crawl session: {}", e);
        }
    }

    async fn close_provider(&mut self) {
        if let Err(e) = self.connection.provider.close().await {
            tracing::debug!(
                server = %self.connection.target.server.url,
                "Close failed: {}",
                e
            );
        }
    }

    /// Close the provider, publish `Terminated`, and drop the output.
    async fn terminate(mut self) {
        self.close_provider().await;
        self.set_state(SessionState::Terminated);
        tracing::debug!(
            server = %self.connection.target.server.url,
            timeline = %self.connection.target.timeline,
            role = self.role().as_str(),
            "Session terminated"
        );
    }
}
