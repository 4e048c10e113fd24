//! Mastodon streaming provider.
//!
//! The stream is selected by query string, so there is no subscription step.
//! Servers that refuse anonymous streaming are retried with an app token.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use fedarchive_core::{Server, Timeline};
use uuid::Uuid;

use super::{Frame, PlatformProvider, ProviderBase, WsTransport, host_of, url_adjust};
use crate::nodeinfo::NodeInfoLookup;
use crate::queue::{DownloadSink, ServerSink};
use crate::{Error, Result};

mod auth;
pub mod types;

pub use auth::{TokenCache, get_access_token};
pub use types::status_urls;
use types::{Status, StreamingMessage};

/// Streaming API stream name for a timeline.
pub fn stream_name(timeline: Timeline) -> &'static str {
    match timeline {
        Timeline::Local => "public:local",
        Timeline::Global => "public",
    }
}

pub fn parse_message(raw: &[u8]) -> Option<StreamingMessage> {
    match serde_json::from_slice(raw) {
        Ok(msg) => Some(msg),
        Err(e) => {
            tracing::debug!("Failed to parse Mastodon message: {}", e);
            None
        }
    }
}

/// Host of the page a status links to, reblogs resolved.
fn status_host(status: &Status) -> Option<String> {
    let url = status
        .url
        .as_deref()
        .or_else(|| status.reblog.as_ref().and_then(|r| r.url.as_deref()))?;
    let parsed = url::Url::parse(url).ok()?;
    parsed.host_str().map(str::to_string)
}

pub struct MastodonProvider {
    base: ProviderBase,
    http: reqwest::Client,
    tokens: TokenCache,
    nodeinfo: Arc<dyn NodeInfoLookup>,
}

impl MastodonProvider {
    pub(crate) fn new(
        base: ProviderBase,
        http: reqwest::Client,
        tokens: TokenCache,
        nodeinfo: Arc<dyn NodeInfoLookup>,
    ) -> Self {
        Self {
            base,
            http,
            tokens,
            nodeinfo,
        }
    }

    fn stream_url(&self) -> String {
        let (ws_url, _) = url_adjust(self.base.url());
        format!(
            "{ws_url}/api/v1/streaming/?stream={}",
            stream_name(self.base.target.timeline)
        )
    }
}

#[async_trait]
impl PlatformProvider for MastodonProvider {
    async fn connect(&mut self, crawl_session_id: Uuid) -> Result<String> {
        self.base.crawl_session_id = crawl_session_id;
        let stream_url = self.stream_url();

        let anonymous = match WsTransport::connect(&stream_url, None).await {
            Ok(transport) => {
                self.base.transport = Some(transport);
                tracing::info!("Connected to {} (no auth)", stream_url);
                return Ok(stream_url);
            }
            Err(e) => e,
        };
        tracing::debug!(
            "Connection without auth failed for {}: {}, trying with token",
            self.base.url(),
            anonymous
        );

        let host = host_of(self.base.url()).to_string();
        let token = match get_access_token(&self.http, &host, &self.tokens).await {
            Ok(token) => token,
            Err(e) => {
                tracing::error!("Failed to get access token for {}: {}", host, e);
                return Err(anonymous);
            }
        };

        let authed_url = format!("{stream_url}&access_token={token}");
        let transport = WsTransport::connect(&authed_url, Some(&token))
            .await
            .map_err(|e| {
                Error::Connection(format!("failed both with and without auth: {e}"))
            })?;
        self.base.transport = Some(transport);
        tracing::info!("Connected to {} (with token)", stream_url);
        Ok(stream_url)
    }

    async fn subscribe_channel(&mut self) -> Result<Option<Vec<u8>>> {
        tracing::info!(
            "Already subscribed to {} on {}",
            stream_name(self.base.target.timeline),
            self.base.url()
        );
        Ok(None)
    }

    async fn receive_messages(&mut self, sink: &DownloadSink) -> Result<()> {
        loop {
            let frame = self.base.transport()?.next_frame().await?;
            let raw = frame.as_bytes();

            let status = parse_message(raw).and_then(|msg| msg.status());
            let created_at = status
                .as_ref()
                .and_then(|s| s.created_at)
                .unwrap_or_else(Utc::now);
            self.base.save_raw(raw, created_at.date_naive());

            if let Some(status) = status {
                tracing::debug!("Received status {}", status.id);
                sink.push_urls(status_urls(&status), created_at).await?;
            }
        }
    }

    async fn crawl_new_servers(&mut self, sink: &ServerSink) -> Result<()> {
        let own_host = host_of(self.base.url()).to_string();
        loop {
            let frame = self.base.transport()?.next_frame().await?;
            let Frame::Text(text) = frame else { continue };
            let Some(status) = parse_message(text.as_bytes()).and_then(|m| m.status()) else {
                continue;
            };
            let Some(host) = status_host(&status) else {
                continue;
            };
            if host == own_host {
                continue;
            }

            match self.nodeinfo.software_name(&host).await {
                Ok(software) => sink.push(Server::new(software, host)).await?,
                Err(e) => tracing::debug!("Failed to get software name for {}: {}", host, e),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.base.close_transport().await
    }
}
