//! Shared data model: servers, crawl targets, timelines and download items.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Software platform a server runs.
///
/// Discovery resolves software names through NodeInfo, so names outside the
/// four supported platforms are kept verbatim in [`Platform::Other`]. The
/// provider factory rejects those.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Platform {
    Mastodon,
    Misskey,
    Bluesky,
    Nostr,
    Other(String),
}

impl Platform {
    /// The platform type string used in paths and server lists.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Mastodon => "mastodon",
            Self::Misskey => "misskey",
            Self::Bluesky => "bluesky",
            Self::Nostr => "nostr",
            Self::Other(name) => name,
        }
    }
}

impl From<&str> for Platform {
    fn from(s: &str) -> Self {
        match s {
            "mastodon" => Self::Mastodon,
            "misskey" => Self::Misskey,
            "bluesky" => Self::Bluesky,
            "nostr" => Self::Nostr,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for Platform {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<Platform> for String {
    fn from(p: Platform) -> Self {
        p.as_str().to_string()
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A federated server.
///
/// Identity is the raw `url` string. No scheme, case or trailing-slash
/// normalization is applied, so `Example.test` and `example.test` are two
/// different servers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Server {
    #[serde(rename = "type")]
    pub platform: Platform,
    pub url: String,
}

impl Server {
    pub fn new(platform: impl Into<Platform>, url: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            url: url.into(),
        }
    }

    /// Format as a `server_list.txt` line (`url type`).
    pub fn to_list_line(&self) -> String {
        format!("{} {}", self.url, self.platform)
    }

    /// Parse one `server_list.txt` line.
    ///
    /// Blank lines and `#` comments yield `Ok(None)`.
    pub fn parse_list_line(line: &str, line_no: usize) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let mut parts = line.split_whitespace();
        let url = parts.next().ok_or_else(|| Error::InvalidServerLine {
            line: line_no,
            reason: "missing server url".to_string(),
        })?;
        let platform = parts.next().ok_or_else(|| Error::InvalidServerLine {
            line: line_no,
            reason: "missing platform type".to_string(),
        })?;
        if parts.next().is_some() {
            return Err(Error::InvalidServerLine {
                line: line_no,
                reason: "expected exactly two fields".to_string(),
            });
        }

        Ok(Some(Self::new(platform, url)))
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.url, self.platform)
    }
}

/// Read a whole `server_list.txt` file.
pub fn read_server_list(path: &Path) -> Result<Vec<Server>> {
    let contents = std::fs::read_to_string(path)?;
    let mut servers = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        if let Some(server) = Server::parse_list_line(line, idx + 1)? {
            servers.push(server);
        }
    }
    Ok(servers)
}

/// Logical timeline name, translated to a platform channel by each provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timeline {
    Local,
    Global,
}

impl Timeline {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Global => "global",
        }
    }
}

impl FromStr for Timeline {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        // The camel-case names are accepted for older command lines.
        match s.trim() {
            "local" | "localTimeline" => Ok(Self::Local),
            "global" | "globalTimeline" => Ok(Self::Global),
            other => Err(format!("unknown timeline '{}'", other)),
        }
    }
}

impl fmt::Display for Timeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One streaming subscription: a server and one of its timelines.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub server: Server,
    pub timeline: Timeline,
}

impl Target {
    pub fn new(server: Server, timeline: Timeline) -> Self {
        Self { server, timeline }
    }

    /// Registry / dedup key for this target.
    pub fn key(&self) -> TargetKey {
        TargetKey {
            url: self.server.url.clone(),
            timeline: self.timeline,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.server.url, self.timeline)
    }
}

/// `(server url, timeline)` identity of a [`Target`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetKey {
    pub url: String,
    pub timeline: Timeline,
}

/// An asset URL observed in a message, queued for download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadItem {
    pub url: String,
    pub observed_at: DateTime<Utc>,
}

impl DownloadItem {
    pub fn new(url: impl Into<String>, observed_at: DateTime<Utc>) -> Self {
        Self {
            url: url.into(),
            observed_at,
        }
    }
}

/// Mapping record written next to downloaded assets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilenameUrlMapping {
    pub filepath: String,
    pub url: String,
    pub downloadtime: String,
}
