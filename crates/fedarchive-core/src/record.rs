//! Append-only JSONL records.
//!
//! Every line written by [`save_record`] is a self-describing envelope:
//!
//! ```text
//! {"record_id": <uuid>, "server_session": <uuid>, "saved_at": <rfc3339>,
//!  "record_type": "request" | "response" | "metadata" | "archive_info",
//!  "data": {...}}
//! ```
//!
//! `server_session` is generated once per process. Records that carry a raw
//! payload also carry its `raw_sha256` digest. Parent directories are created
//! on demand.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::LazyLock;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{Result, TOOL_VERSION};

static SERVER_SESSION_ID: LazyLock<Uuid> = LazyLock::new(Uuid::new_v4);

/// Identifier of this process run, stamped on every record.
pub fn server_session_id() -> Uuid {
    *SERVER_SESSION_ID
}

/// Kind of record stored in the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    ArchiveInfo,
    Request,
    Response,
    Metadata,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ArchiveInfo => "archive_info",
            Self::Request => "request",
            Self::Response => "response",
            Self::Metadata => "metadata",
        }
    }
}

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    record_id: Uuid,
    server_session: Uuid,
    saved_at: String,
    record_type: RecordType,
    data: &'a T,
}

/// Append a single line to a file, creating parent directories as needed.
pub fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut buf = String::with_capacity(line.len() + 1);
    buf.push_str(line);
    buf.push('\n');
    file.write_all(buf.as_bytes())?;
    Ok(())
}

/// Wrap `data` in an envelope and append it to `path`.
pub fn save_record<T: Serialize>(record_type: RecordType, data: &T, path: &Path) -> Result<()> {
    let envelope = Envelope {
        record_id: Uuid::new_v4(),
        server_session: server_session_id(),
        saved_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        record_type,
        data,
    };

    let line = serde_json::to_string(&envelope)?;
    append_line(path, &line)?;

    tracing::trace!("Saved {} record to {}", record_type.as_str(), path.display());
    Ok(())
}

/// `sha256:<hex>` digest of a raw payload.
pub fn raw_digest(raw: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(raw)))
}

/// Embed a raw payload: JSON stays JSON, anything else becomes a string.
fn raw_value(raw: Option<&[u8]>) -> Value {
    match raw {
        None => Value::Null,
        Some(bytes) => serde_json::from_slice(bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned())),
    }
}

fn with_content(mut data: Map<String, Value>, raw: Option<&[u8]>) -> Value {
    data.insert(
        "raw_sha256".to_string(),
        Value::String(raw_digest(raw.unwrap_or_default())),
    );
    data.insert("raw".to_string(), raw_value(raw));
    Value::Object(data)
}

/// Save an outbound request (WebSocket dial, channel subscription, ...).
pub fn save_request(
    raw: Option<&[u8]>,
    target_url: &str,
    crawl_session_id: Uuid,
    path: &Path,
) -> Result<()> {
    let mut data = Map::new();
    data.insert("target_url".into(), Value::String(target_url.to_string()));
    data.insert(
        "crawl_session_id".into(),
        Value::String(crawl_session_id.to_string()),
    );
    save_record(RecordType::Request, &with_content(data, raw), path)
}

/// Save an inbound message.
pub fn save_response(
    raw: &[u8],
    source_url: &str,
    crawl_session_id: Uuid,
    path: &Path,
) -> Result<()> {
    let mut data = Map::new();
    data.insert("source_url".into(), Value::String(source_url.to_string()));
    data.insert(
        "crawl_session_id".into(),
        Value::String(crawl_session_id.to_string()),
    );
    save_record(RecordType::Response, &with_content(data, Some(raw)), path)
}

/// Save free-form metadata (NodeInfo, crawl sessions, ...).
///
/// An absent `crawl_session_id` is stored as an empty string.
pub fn save_metadata(
    raw: Option<&[u8]>,
    crawl_session_id: Option<Uuid>,
    path: &Path,
    meta: &BTreeMap<String, String>,
) -> Result<()> {
    let mut data: Map<String, Value> = meta
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    data.insert(
        "crawl_session_id".into(),
        Value::String(crawl_session_id.map(|id| id.to_string()).unwrap_or_default()),
    );
    save_record(RecordType::Metadata, &with_content(data, raw), path)
}

/// Startup record describing this archive run.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveInfo {
    pub software: String,
    pub server_session_id: Uuid,
    pub timelines: String,
    pub scope: String,
    pub seed_servers: String,
}

impl ArchiveInfo {
    pub fn new(timelines: &[String], scope: &str, seed_urls: &[String]) -> Self {
        Self {
            software: format!("fedarchive/{}", TOOL_VERSION),
            server_session_id: server_session_id(),
            timelines: timelines.join(","),
            scope: scope.to_string(),
            seed_servers: seed_urls.join(","),
        }
    }
}

/// Save the startup record.
pub fn save_archive_info(info: &ArchiveInfo, path: &Path) -> Result<()> {
    save_record(RecordType::ArchiveInfo, info, path)
}
