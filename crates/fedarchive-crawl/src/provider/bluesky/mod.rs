//! Bluesky firehose provider.
//!
//! `com.atproto.sync.subscribeRepos` streams binary frames, each a CBOR header
//! `{op, t}` followed by a CBOR payload. Frames are kept verbatim under
//! `{date}/cbor/` with one JSON metadata line per frame in `{date}/{date}.jsonl`.
//! Commit frames carry a CAR archive whose post and profile records
//! reference blobs.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use ciborium::Value;
use serde::Serialize;
use uuid::Uuid;

use super::{PlatformProvider, ProviderBase, WsTransport, url_adjust};
use crate::Result;
use crate::queue::{DownloadSink, ServerSink};

mod blobs;
mod car;

pub use blobs::{blob_url, blob_urls};
use blobs::{field, link_to_cid, text_field};

const SUBSCRIBE_PATH: &str = "/xrpc/com.atproto.sync.subscribeRepos";

/// Firehose URL for a server, adding the subscribeRepos path to a bare host.
pub fn firehose_url(server_url: &str) -> String {
    let (ws_url, _) = url_adjust(server_url);
    let has_path = ws_url
        .split_once("://")
        .is_some_and(|(_, rest)| rest.contains('/'));
    if has_path {
        ws_url
    } else {
        format!("{ws_url}{SUBSCRIBE_PATH}")
    }
}

/// A decoded firehose frame.
#[derive(Debug)]
pub struct FirehoseFrame {
    pub op: i64,
    /// Message type with its `#` prefix, e.g. `#commit`.
    pub kind: String,
    pub payload: Value,
}

impl FirehoseFrame {
    /// Decode the header and payload values from one binary frame.
    pub fn decode(raw: &[u8]) -> Option<Self> {
        let mut reader = raw;
        let header: Value = match ciborium::from_reader(&mut reader) {
            Ok(header) => header,
            Err(e) => {
                tracing::debug!("Failed to decode firehose header: {}", e);
                return None;
            }
        };
        let op = field(&header, "op")
            .and_then(Value::as_integer)
            .and_then(|i| i64::try_from(i).ok())
            .unwrap_or(0);
        let kind = text_field(&header, "t").unwrap_or_default().to_string();

        if op == -1 {
            return Some(Self {
                op,
                kind,
                payload: Value::Null,
            });
        }

        let payload = match ciborium::from_reader(&mut reader) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::debug!("Failed to decode firehose payload: {}", e);
                return None;
            }
        };
        Some(Self { op, kind, payload })
    }

    pub fn is_error(&self) -> bool {
        self.op == -1
    }

    fn seq(&self) -> Option<u64> {
        field(&self.payload, "seq")
            .and_then(Value::as_integer)
            .and_then(|i| u64::try_from(i).ok())
    }

    fn text(&self, key: &str) -> String {
        text_field(&self.payload, key).unwrap_or_default().to_string()
    }
}

#[derive(Debug, Serialize)]
pub struct OpInfo {
    pub action: String,
    pub path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cid: String,
}

/// One line of `{date}.jsonl`.
#[derive(Debug, Serialize)]
pub struct FirehoseMetadata {
    pub seq: u64,
    pub time: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub repo: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub rev: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ops: Vec<OpInfo>,
    pub cbor_file: String,
    pub received_at: String,
}

fn commit_ops(payload: &Value) -> Vec<OpInfo> {
    let Some(ops) = field(payload, "ops").and_then(Value::as_array) else {
        return Vec::new();
    };
    ops.iter()
        .map(|op| OpInfo {
            action: text_field(op, "action").unwrap_or_default().to_string(),
            path: text_field(op, "path").unwrap_or_default().to_string(),
            cid: field(op, "cid")
                .and_then(link_to_cid)
                .map(|c| c.to_string())
                .unwrap_or_default(),
        })
        .collect()
}

/// Message type as it appears in a file name: `#commit` becomes `commit`.
/// Anything outside `[A-Za-z0-9_-]` is dropped.
fn file_kind(kind: &str) -> String {
    kind.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
        .collect()
}

/// Write the frame and its metadata line, returning any blob URLs it carries.
pub fn archive_frame(
    server_dir: &Path,
    raw: &[u8],
    frame: &FirehoseFrame,
    now: DateTime<Utc>,
) -> Result<Vec<String>> {
    let date = now.format("%Y-%m-%d").to_string();
    let daily_dir = server_dir.join(&date);
    let seq = frame
        .seq()
        .unwrap_or_else(|| now.timestamp_nanos_opt().unwrap_or_default() as u64);

    let cbor_file = format!("{}_{}.cbor", seq, file_kind(&frame.kind));
    let cbor_dir = daily_dir.join("cbor");
    std::fs::create_dir_all(&cbor_dir)?;
    std::fs::write(cbor_dir.join(&cbor_file), raw)?;

    let received_at = now.to_rfc3339_opts(SecondsFormat::Secs, true);
    let mut urls = Vec::new();

    let metadata = if frame.kind == "#commit" {
        let repo = frame.text("repo");
        if let Some(blocks) = field(&frame.payload, "blocks").and_then(Value::as_bytes) {
            match car::read_blocks(blocks) {
                Ok(blocks) => urls = blob_urls(&repo, &blocks),
                Err(e) => tracing::debug!("Failed to read CAR blocks for seq {}: {}", seq, e),
            }
        }
        FirehoseMetadata {
            seq,
            time: frame.text("time"),
            kind: frame.kind.clone(),
            rev: frame.text("rev"),
            ops: commit_ops(&frame.payload),
            repo,
            cbor_file,
            received_at,
        }
    } else {
        let did = frame.text("did");
        FirehoseMetadata {
            seq,
            time: frame.text("time"),
            kind: frame.kind.clone(),
            repo: if did.is_empty() { frame.text("repo") } else { did },
            rev: String::new(),
            ops: Vec::new(),
            cbor_file,
            received_at,
        }
    };

    let line = serde_json::to_string(&metadata)?;
    fedarchive_core::append_line(&daily_dir.join(format!("{date}.jsonl")), &line)?;
    tracing::debug!("Saved {} seq={} repo={}", metadata.kind, seq, metadata.repo);
    Ok(urls)
}

pub struct BlueskyProvider {
    base: ProviderBase,
}

impl BlueskyProvider {
    pub(crate) fn new(base: ProviderBase) -> Self {
        Self { base }
    }

    fn server_dir(&self) -> PathBuf {
        self.base.server_dir.clone()
    }
}

#[async_trait]
impl PlatformProvider for BlueskyProvider {
    async fn connect(&mut self, crawl_session_id: Uuid) -> Result<String> {
        self.base.crawl_session_id = crawl_session_id;
        let url = firehose_url(self.base.url());
        self.base.transport = Some(WsTransport::connect(&url, None).await?);
        tracing::info!("Connected to {}", url);
        Ok(url)
    }

    async fn subscribe_channel(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn receive_messages(&mut self, sink: &DownloadSink) -> Result<()> {
        let server_dir = self.server_dir();
        loop {
            let frame = self.base.transport()?.next_frame().await?;
            let raw = frame.as_bytes();

            let Some(decoded) = FirehoseFrame::decode(raw) else {
                continue;
            };
            if decoded.is_error() {
                tracing::info!("Received error from firehose: {}", decoded.kind);
                continue;
            }

            let now = Utc::now();
            match archive_frame(&server_dir, raw, &decoded, now) {
                Ok(urls) => {
                    for url in &urls {
                        tracing::debug!("Found blob URL: {}", url);
                    }
                    sink.push_urls(urls, now).await?;
                }
                Err(e) => tracing::error!("Failed to save firehose frame: {}", e),
            }
        }
    }

    async fn crawl_new_servers(&mut self, _sink: &ServerSink) -> Result<()> {
        // Discovery is not implemented for the firehose; the explorer ends here.
        tracing::debug!("No server discovery for {}", self.base.url());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.base.close_transport().await
    }
}
