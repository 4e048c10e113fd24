//! Platform providers.
//!
//! A provider adapts one streaming protocol to the five-operation contract
//! sessions are written against:
//!
//! ```text
//! connect ──► subscribe_channel ──► receive_messages | crawl_new_servers ──► close
//!    ▲                                        │
//!    └────────────── reconnect ◄──── Err(_) ──┘
//! ```
//!
//! `receive_messages` and `crawl_new_servers` block until the transport fails.
//! Their `Err` return is the reconnect trigger; `Ok(())` means the stream ended
//! and the session terminates. Providers without server discovery (Nostr,
//! Bluesky) return `Ok(())` from `crawl_new_servers` straight away.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Deserializer};
use fedarchive_core::{Platform, Target};
use uuid::Uuid;

use crate::nodeinfo::NodeInfoLookup;
use crate::queue::{DownloadSink, ServerSink};
use crate::{Error, Result};

pub mod bluesky;
pub mod mastodon;
pub mod misskey;
pub mod nostr;
mod transport;

pub use transport::{Frame, WsTransport};

/// Per-platform streaming adapter.
#[async_trait]
pub trait PlatformProvider: Send {
    /// Open the transport. Returns the URL that was dialled.
    ///
    /// `crawl_session_id` tags every record persisted until the next call.
    async fn connect(&mut self, crawl_session_id: Uuid) -> Result<String>;

    /// Issue the subscription request, returning the bytes sent, if any.
    async fn subscribe_channel(&mut self) -> Result<Option<Vec<u8>>>;

    /// Persist every inbound message and queue its asset URLs.
    async fn receive_messages(&mut self, sink: &DownloadSink) -> Result<()>;

    /// Watch inbound messages for references to other servers.
    async fn crawl_new_servers(&mut self, sink: &ServerSink) -> Result<()>;

    /// Release the transport. Safe to call repeatedly and after a failed connect.
    async fn close(&mut self) -> Result<()>;
}

/// A target bound to the provider that streams it.
pub struct Connection {
    pub target: Target,
    pub provider: Box<dyn PlatformProvider>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// Builds providers for targets.
pub trait ProviderFactory: Send + Sync {
    /// `server_dir` is the archive directory for the target's server.
    fn create(&self, target: &Target, server_dir: &Path) -> Result<Box<dyn PlatformProvider>>;
}

/// Build a [`Connection`] through a factory.
pub fn create_connection(
    factory: &dyn ProviderFactory,
    target: &Target,
    server_dir: &Path,
) -> Result<Connection> {
    let provider = factory.create(target, server_dir)?;
    Ok(Connection {
        target: target.clone(),
        provider,
    })
}

/// Factory for the four built-in platforms.
pub struct DefaultProviderFactory {
    http: reqwest::Client,
    nodeinfo: Arc<dyn NodeInfoLookup>,
    tokens: mastodon::TokenCache,
}

impl DefaultProviderFactory {
    pub fn new(http: reqwest::Client, nodeinfo: Arc<dyn NodeInfoLookup>) -> Self {
        Self {
            http,
            nodeinfo,
            tokens: mastodon::TokenCache::new(),
        }
    }
}

impl ProviderFactory for DefaultProviderFactory {
    fn create(&self, target: &Target, server_dir: &Path) -> Result<Box<dyn PlatformProvider>> {
        let base = ProviderBase::new(target, server_dir);
        match &target.server.platform {
            Platform::Mastodon => Ok(Box::new(mastodon::MastodonProvider::new(
                base,
                self.http.clone(),
                self.tokens.clone(),
                Arc::clone(&self.nodeinfo),
            ))),
            Platform::Misskey => Ok(Box::new(misskey::MisskeyProvider::new(
                base,
                Arc::clone(&self.nodeinfo),
            ))),
            Platform::Bluesky => Ok(Box::new(bluesky::BlueskyProvider::new(base))),
            Platform::Nostr => Ok(Box::new(nostr::NostrProvider::new(base))),
            Platform::Other(name) => Err(Error::UnsupportedPlatform(name.clone())),
        }
    }
}

/// State shared by every built-in provider.
#[derive(Debug)]
pub(crate) struct ProviderBase {
    pub target: Target,
    pub server_dir: PathBuf,
    pub crawl_session_id: Uuid,
    pub transport: Option<WsTransport>,
}

impl ProviderBase {
    pub fn new(target: &Target, server_dir: &Path) -> Self {
        Self {
            target: target.clone(),
            server_dir: server_dir.to_path_buf(),
            crawl_session_id: Uuid::nil(),
            transport: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.target.server.url
    }

    pub fn transport(&mut self) -> Result<&mut WsTransport> {
        self.transport
            .as_mut()
            .ok_or_else(|| Error::Receive("not connected".to_string()))
    }

    /// `{server_dir}/{date}/{date}_{timeline}.jsonl`
    pub fn daily_log_path(&self, date: NaiveDate) -> PathBuf {
        let date = date.format("%Y-%m-%d").to_string();
        self.server_dir
            .join(&date)
            .join(format!("{}_{}.jsonl", date, self.target.timeline))
    }

    /// Persist one inbound message as a `response` record.
    ///
    /// Failures are logged; persistence never interrupts the stream.
    pub fn save_raw(&self, raw: &[u8], date: NaiveDate) {
        let path = self.daily_log_path(date);
        if let Err(e) =
            fedarchive_core::save_response(raw, self.url(), self.crawl_session_id, &path)
        {
            tracing::error!("Failed to save message from {}: {}", self.url(), e);
        }
    }

    pub async fn close_transport(&mut self) -> Result<()> {
        if let Some(mut transport) = self.transport.take() {
            transport.close().await?;
        }
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Split a server URL into its WebSocket and HTTP base URLs.
///
/// `https` → `wss`, `http` → `ws`, `wss`/`ws` are kept, and a bare host gets
/// `wss://` / `https://`. Trailing slashes are trimmed.
pub fn url_adjust(url: &str) -> (String, String) {
    let url = url.trim_end_matches('/');
    if let Some(rest) = url.strip_prefix("https://") {
        (format!("wss://{rest}"), url.to_string())
    } else if let Some(rest) = url.strip_prefix("http://") {
        (format!("ws://{rest}"), url.to_string())
    } else if let Some(rest) = url.strip_prefix("wss://") {
        (url.to_string(), format!("https://{rest}"))
    } else if let Some(rest) = url.strip_prefix("ws://") {
        (url.to_string(), format!("http://{rest}"))
    } else {
        (format!("wss://{url}"), format!("https://{url}"))
    }
}

/// Deserialize `null` as the type's default.
pub(crate) fn nullable<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Host part of a server URL (scheme and path removed).
pub fn host_of(url: &str) -> &str {
    let rest = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url);
    rest.split('/').next().unwrap_or(rest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedarchive_core::{Server, Timeline};

    #[test]
    fn test_url_adjust() {
        assert_eq!(
            url_adjust("misskey.io"),
            ("wss://misskey.io".into(), "https://misskey.io".into())
        );
        assert_eq!(
            url_adjust("https://mstdn.jp/"),
            ("wss://mstdn.jp".into(), "https://mstdn.jp".into())
        );
        assert_eq!(
            url_adjust("http://localhost:3000"),
            ("ws://localhost:3000".into(), "http://localhost:3000".into())
        );
        assert_eq!(
            url_adjust("wss://relay.damus.io"),
            ("wss://relay.damus.io".into(), "https://relay.damus.io".into())
        );
        assert_eq!(
            url_adjust("ws://127.0.0.1:7777"),
            ("ws://127.0.0.1:7777".into(), "http://127.0.0.1:7777".into())
        );
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("misskey.io"), "misskey.io");
        assert_eq!(host_of("wss://bsky.network/xrpc/x"), "bsky.network");
        assert_eq!(host_of("https://mstdn.jp"), "mstdn.jp");
    }

    #[test]
    fn test_factory_rejects_unknown_platform() {
        struct NoLookup;
        #[async_trait]
        impl NodeInfoLookup for NoLookup {
            async fn get_node_info(&self, host: &str) -> Result<crate::nodeinfo::NodeInfo> {
                Err(Error::NodeInfo(host.to_string()))
            }
        }

        let factory = DefaultProviderFactory::new(reqwest::Client::new(), Arc::new(NoLookup));
        let dir = Path::new("/tmp/unused");

        let pleroma = Target::new(Server::new("pleroma", "p.test"), Timeline::Local);
        assert!(matches!(
            factory.create(&pleroma, dir),
            Err(Error::UnsupportedPlatform(name)) if name == "pleroma"
        ));

        for platform in ["mastodon", "misskey", "bluesky", "nostr"] {
            let target = Target::new(Server::new(platform, "x.test"), Timeline::Local);
            assert!(factory.create(&target, dir).is_ok(), "{platform}");
        }
    }

    #[test]
    fn test_daily_log_path() {
        let target = Target::new(Server::new("misskey", "example.test"), Timeline::Local);
        let base = ProviderBase::new(&target, Path::new("/data/misskey/example.test"));
        let date = NaiveDate::from_ymd_opt(2025, 3, 9).unwrap();
        assert_eq!(
            base.daily_log_path(date),
            PathBuf::from("/data/misskey/example.test/2025-03-09/2025-03-09_local.jsonl")
        );
    }
}
