//! Core types and shared utilities for the fediverse archiver.
//!
//! This crate provides:
//! - The shared data model (servers, platforms, crawl targets, download items)
//! - The append-only JSONL record envelope used for every persisted message
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
pub mod metrics;
pub mod model;
pub mod record;

// ═══════════════════════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════════════════════

/// Version string stamped into `archive_info` records.
pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the per-platform server list file.
pub const SERVER_LIST_FILE: &str = "server_list.txt";

/// Name of the per-server crawl session log.
pub const CRAWL_SESSIONS_FILE: &str = "crawl_sessions.jsonl";

/// Name of the per-server NodeInfo log.
pub const NODEINFO_FILE: &str = "nodeinfo.jsonl";

/// Name of the startup record file at the download root.
pub const ARCHIVE_INFO_FILE: &str = "archive_info.jsonl";

/// Name of the shutdown recovery file at the download root.
pub const PENDING_DOWNLOADS_FILE: &str = "pending_downloads.jsonl";

pub use error::{Error, Result};
pub use model::{
    DownloadItem, FilenameUrlMapping, Platform, Server, Target, TargetKey, Timeline,
    read_server_list,
};
pub use record::{
    ArchiveInfo, RecordType, append_line, save_archive_info, save_metadata, save_request,
    save_response, server_session_id,
};
