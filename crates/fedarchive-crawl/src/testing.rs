//! Scriptable fakes for session and manager tests, plus a loopback
//! WebSocket server for exercising the real providers.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use fedarchive_core::{Platform, Server, Target, TargetKey, Timeline};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::nodeinfo::{NodeInfo, NodeInfoLookup};
use crate::provider::{PlatformProvider, ProviderFactory, misskey};
use crate::queue::{DownloadSink, ServerSink};
use crate::{Error, Result};

/// What one `receive_messages` / `crawl_new_servers` call does.
#[derive(Debug, Clone)]
pub(crate) enum Script {
    /// Queue these URLs, then report the stream ended.
    Items(Vec<String>),
    /// Emit these servers, then report the stream ended.
    Servers(Vec<Server>),
    /// Feed raw Misskey streaming frames through the note parser.
    MisskeyFrames(Vec<String>),
    /// Fail with a receive error.
    Fail(String),
    /// Block until cancelled.
    Hang,
}

#[derive(Debug, Default)]
pub(crate) struct FakeStats {
    connects: AtomicUsize,
    closes: AtomicUsize,
    receives: AtomicUsize,
}

impl FakeStats {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn receives(&self) -> usize {
        self.receives.load(Ordering::SeqCst)
    }
}

pub(crate) struct FakeProvider {
    url: String,
    scripts: VecDeque<Script>,
    failing_connects: Vec<bool>,
    failing_subscribe: bool,
    subscription: Option<Vec<u8>>,
    stats: Arc<FakeStats>,
}

impl FakeProvider {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            url: "example.test".to_string(),
            scripts: scripts.into(),
            failing_connects: Vec::new(),
            failing_subscribe: false,
            subscription: None,
            stats: Arc::default(),
        }
    }

    pub fn with_url(mut self, url: &str) -> Self {
        self.url = url.to_string();
        self
    }

    /// `true` at index n makes the (n+1)th connect fail.
    pub fn failing_connects(mut self, pattern: Vec<bool>) -> Self {
        self.failing_connects = pattern;
        self
    }

    pub fn failing_subscribe(mut self) -> Self {
        self.failing_subscribe = true;
        self
    }

    pub fn with_subscription(mut self, sent: Vec<u8>) -> Self {
        self.subscription = Some(sent);
        self
    }

    pub fn stats(&self) -> Arc<FakeStats> {
        Arc::clone(&self.stats)
    }

    fn next_script(&mut self) -> Option<Script> {
        self.stats.receives.fetch_add(1, Ordering::SeqCst);
        self.scripts.pop_front()
    }
}

#[async_trait]
impl PlatformProvider for FakeProvider {
    async fn connect(&mut self, _crawl_session_id: Uuid) -> Result<String> {
        let attempt = self.stats.connects.fetch_add(1, Ordering::SeqCst);
        if self.failing_connects.get(attempt).copied().unwrap_or(false) {
            return Err(Error::Connection(format!("{}: refused", self.url)));
        }
        Ok(format!("fake://{}", self.url))
    }

    async fn subscribe_channel(&mut self) -> Result<Option<Vec<u8>>> {
        if self.failing_subscribe {
            return Err(Error::Subscription("rejected".into()));
        }
        Ok(self.subscription.clone())
    }

    async fn receive_messages(&mut self, sink: &DownloadSink) -> Result<()> {
        match self.next_script() {
            None | Some(Script::Servers(_)) => Ok(()),
            Some(Script::Items(urls)) => {
                sink.push_urls(urls, Utc::now()).await?;
                Ok(())
            }
            Some(Script::MisskeyFrames(frames)) => {
                for frame in frames {
                    if let Some(note) = misskey::parse_note(frame.as_bytes()) {
                        let observed_at = note.created_at.unwrap_or_else(Utc::now);
                        sink.push_urls(misskey::note_urls(&note), observed_at).await?;
                    }
                }
                Ok(())
            }
            Some(Script::Fail(reason)) => Err(Error::Receive(reason)),
            Some(Script::Hang) => std::future::pending().await,
        }
    }

    async fn crawl_new_servers(&mut self, sink: &ServerSink) -> Result<()> {
        match self.next_script() {
            None | Some(Script::Items(_)) => Ok(()),
            Some(Script::Servers(servers)) => {
                for server in servers {
                    sink.push(server).await?;
                }
                Ok(())
            }
            Some(Script::MisskeyFrames(frames)) => {
                for frame in frames {
                    if let Some(note) = misskey::parse_note(frame.as_bytes()) {
                        for host in misskey::remote_hosts(&note) {
                            sink.push(Server::new("misskey", host)).await?;
                        }
                    }
                }
                Ok(())
            }
            Some(Script::Fail(reason)) => Err(Error::Receive(reason)),
            Some(Script::Hang) => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory handing out [`FakeProvider`]s with per-target scripts.
///
/// Targets without a script get a provider that hangs until shutdown.
#[derive(Default)]
pub(crate) struct FakeFactory {
    scripts: Mutex<HashMap<TargetKey, Vec<Script>>>,
    created: Mutex<Vec<Target>>,
}

impl FakeFactory {
    pub fn script(self, url: &str, timeline: Timeline, script: Vec<Script>) -> Self {
        let key = TargetKey {
            url: url.to_string(),
            timeline,
        };
        self.scripts.lock().insert(key, script);
        self
    }

    pub fn created(&self) -> Vec<Target> {
        self.created.lock().clone()
    }
}

impl ProviderFactory for FakeFactory {
    fn create(&self, target: &Target, _server_dir: &Path) -> Result<Box<dyn PlatformProvider>> {
        if let Platform::Other(name) = &target.server.platform {
            return Err(Error::UnsupportedPlatform(name.clone()));
        }
        self.created.lock().push(target.clone());

        let script = self
            .scripts
            .lock()
            .remove(&target.key())
            .unwrap_or_else(|| vec![Script::Hang]);
        Ok(Box::new(FakeProvider::new(script).with_url(&target.server.url)))
    }
}

/// NodeInfo lookup answering from a fixed table.
#[derive(Default)]
pub(crate) struct StubNodeInfo {
    software: HashMap<String, String>,
}

impl StubNodeInfo {
    pub fn with(mut self, host: &str, software: &str) -> Self {
        self.software.insert(host.to_string(), software.to_string());
        self
    }
}

#[async_trait]
impl NodeInfoLookup for StubNodeInfo {
    async fn get_node_info(&self, host: &str) -> Result<NodeInfo> {
        let software = self
            .software
            .get(host)
            .ok_or_else(|| Error::NodeInfo(format!("{host}: unknown")))?;
        Ok(NodeInfo {
            source_url: format!("https://{host}/.well-known/nodeinfo"),
            schema_version: "2.1".to_string(),
            software_name: software.clone(),
            software_version: "1.0.0".to_string(),
            raw: Arc::new(
                serde_json::json!({"version": "2.1", "software": {"name": software}})
                    .to_string()
                    .into_bytes(),
            ),
        })
    }
}

// =============================================================================
// Loopback WebSocket server
// =============================================================================

/// Server side of an accepted test connection.
pub(crate) type PeerSocket = WebSocketStream<TcpStream>;

/// Accept WebSocket connections on a loopback port and hand each one to
/// `handler` on its own task. Returns the `ws://` base URL.
pub(crate) async fn ws_server<F, Fut>(handler: F) -> String
where
    F: Fn(PeerSocket) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(handler);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                    handler(ws).await;
                }
            });
        }
    });
    format!("ws://{addr}")
}

/// A loopback `ws://` URL with nothing listening behind it.
pub(crate) async fn refused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{addr}")
}
