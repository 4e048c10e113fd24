//! Crawl orchestration for federated social-network archiving.
//!
//! This crate keeps long-lived streaming sessions open against Mastodon,
//! Misskey, Bluesky and Nostr servers, persists every message they deliver,
//! downloads the assets those messages reference, and grows its set of
//! servers from what the streams mention.
//!
//! # Modules
//!
//! - [`manager`] - Intake loop and spawn policy
//! - [`registry`] - Live sessions and known servers
//! - [`session`] - Connect/subscribe/receive/reconnect state machine
//! - [`provider`] - Platform adapters behind one five-operation contract
//! - [`queue`] - Download queues, intake sink, shutdown drain
//! - [`media`] - Asset downloader pool
//! - [`nodeinfo`] - Cached NodeInfo lookups
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   Seed servers  │  (--url, server_list.txt)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │  CrawlManager   │◄──────────────────┐
//! └────────┬────────┘                   │ discovered servers
//!          │ spawn                      │
//!          ▼                            │
//! ┌─────────────────┐          ┌────────┴────────┐
//! │    Archivers    │          │    Explorers    │
//! └────────┬────────┘          └─────────────────┘
//!          │ DownloadItem
//!          ▼
//! ┌─────────────────┐
//! │ MediaDownloader │  sha256-named assets + URL mapping
//! └─────────────────┘
//! ```
//!
//! The archive is append-only JSONL: every connect, subscription and inbound
//! message is written as a record before anything else happens to it.

pub mod config;
mod error;
pub mod manager;
pub mod media;
pub mod nodeinfo;
pub mod provider;
pub mod queue;
pub mod registry;
pub mod session;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};

pub use config::{CrawlConfig, Scope};
pub use manager::{CrawlManager, IntakeOutcome};
pub use media::MediaDownloader;
pub use nodeinfo::{NodeInfo, NodeInfoClient, NodeInfoLookup};
pub use provider::{Connection, DefaultProviderFactory, PlatformProvider, ProviderFactory};
pub use queue::{DownloadSink, PendingDownload, ServerSink};
pub use registry::Registry;
pub use session::{Role, Session, SessionHandle, SessionState};
