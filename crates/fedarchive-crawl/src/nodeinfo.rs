//! NodeInfo lookup.
//!
//! Resolves a host's software name and metadata through
//! `/.well-known/nodeinfo`, picking the highest schema version the server
//! advertises. Results are cached per host for 24 hours and failures for
//! ten minutes, so a dead host costs one timed-out lookup per window.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use serde::Deserialize;

use crate::{Error, Result};

const CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const FAILURE_TTL: Duration = Duration::from_secs(10 * 60);
const CACHE_CAPACITY: u64 = 100_000;

/// Per-request timeout, shorter than the shared client's.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Schema versions in order of preference.
const SCHEMA_PREFERENCE: [&str; 4] = ["2.1", "2.0", "1.1", "1.0"];

/// Parsed NodeInfo document plus the raw response body.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// The well-known URL the document was resolved from.
    pub source_url: String,
    pub schema_version: String,
    pub software_name: String,
    pub software_version: String,
    pub raw: Arc<Vec<u8>>,
}

/// Something that can resolve NodeInfo for a host.
#[async_trait]
pub trait NodeInfoLookup: Send + Sync {
    async fn get_node_info(&self, host: &str) -> Result<NodeInfo>;

    /// Software name (e.g. `mastodon`, `misskey`) of a host.
    async fn software_name(&self, host: &str) -> Result<String> {
        Ok(self.get_node_info(host).await?.software_name)
    }
}

#[derive(Debug, Deserialize)]
struct WellKnown {
    #[serde(default)]
    links: Vec<WellKnownLink>,
}

#[derive(Debug, Clone, Deserialize)]
struct WellKnownLink {
    rel: String,
    href: String,
}

#[derive(Debug, Default, Deserialize)]
struct Document {
    #[serde(default)]
    version: String,
    #[serde(default)]
    software: Software,
}

#[derive(Debug, Default, Deserialize)]
struct Software {
    #[serde(default)]
    name: String,
    #[serde(default)]
    version: String,
}

/// Choose the best NodeInfo document link.
///
/// Prefers 2.1, then 2.0, 1.1, 1.0, and falls back to the first link.
fn best_link(links: &[WellKnownLink]) -> Option<&WellKnownLink> {
    SCHEMA_PREFERENCE
        .iter()
        .find_map(|version| {
            let suffix = format!("/schema/{version}");
            links.iter().find(|l| l.rel.ends_with(&suffix))
        })
        .or_else(|| links.first())
}

/// HTTP NodeInfo client with a per-host cache.
#[derive(Clone)]
pub struct NodeInfoClient {
    http: reqwest::Client,
    cache: Cache<String, NodeInfo>,
    failures: Cache<String, String>,
}

impl NodeInfoClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            cache: Cache::builder()
                .max_capacity(CACHE_CAPACITY)
                .time_to_live(CACHE_TTL)
                .build(),
            failures: Cache::builder()
                .max_capacity(CACHE_CAPACITY)
                .time_to_live(FAILURE_TTL)
                .build(),
        }
    }

    async fn fetch(&self, host: &str) -> Result<NodeInfo> {
        let well_known_url = format!("https://{host}/.well-known/nodeinfo");

        let well_known: WellKnown = self
            .http
            .get(&well_known_url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let link = best_link(&well_known.links)
            .ok_or_else(|| Error::NodeInfo(format!("{host}: no nodeinfo links")))?;
        tracing::debug!("Fetching NodeInfo from: {}", link.href);

        let raw = self
            .http
            .get(&link.href)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        let doc: Document = serde_json::from_slice(&raw)?;
        Ok(NodeInfo {
            source_url: well_known_url,
            schema_version: doc.version,
            software_name: doc.software.name,
            software_version: doc.software.version,
            raw: Arc::new(raw.to_vec()),
        })
    }
}

#[async_trait]
impl NodeInfoLookup for NodeInfoClient {
    async fn get_node_info(&self, host: &str) -> Result<NodeInfo> {
        if let Some(info) = self.cache.get(host).await {
            tracing::debug!("NodeInfo cache hit for {}", host);
            return Ok(info);
        }

        if let Some(reason) = self.failures.get(host).await {
            return Err(Error::NodeInfo(format!("{host}: {reason} (cached)")));
        }

        match self.fetch(host).await {
            Ok(info) => {
                self.cache.insert(host.to_string(), info.clone()).await;
                Ok(info)
            }
            Err(e) => {
                self.failures.insert(host.to_string(), e.to_string()).await;
                Err(e)
            }
        }
    }
}
