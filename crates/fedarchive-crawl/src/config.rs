//! Crawl configuration.

use std::ffi::OsStr;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use fedarchive_core::{Platform, SERVER_LIST_FILE, Server, Timeline};

use crate::Error;

/// Which discovered servers may spawn sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Every platform type; explorers enabled.
    Unbounded,
    /// Only the seeded servers' archivers; no explorers.
    ServerOnly,
    /// Only servers of this platform type; explorers enabled.
    Platform(Platform),
}

impl Scope {
    /// Whether a server of this type passes the filter.
    pub fn allows(&self, platform: &Platform) -> bool {
        match self {
            Self::Unbounded | Self::ServerOnly => true,
            Self::Platform(p) => p == platform,
        }
    }

    /// Whether explorer sessions are spawned.
    pub fn explores(&self) -> bool {
        !matches!(self, Self::ServerOnly)
    }
}

impl FromStr for Scope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Err(Error::Config("scope must not be empty".to_string())),
            "unbounded" => Ok(Self::Unbounded),
            "server" => Ok(Self::ServerOnly),
            other => Ok(Self::Platform(Platform::from(other))),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unbounded => f.write_str("unbounded"),
            Self::ServerOnly => f.write_str("server"),
            Self::Platform(p) => write!(f, "{}", p),
        }
    }
}

/// Configuration for the crawl manager and its sessions.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    /// Root of the on-disk archive.
    pub download_dir: PathBuf,

    /// Timelines archived for every in-scope server.
    pub timelines: Vec<Timeline>,

    /// Scope filter.
    pub scope: Scope,

    /// Download assets. When false a discard worker drains each queue.
    pub media_enabled: bool,

    /// Downloader workers per archiver.
    pub parallel_downloads: usize,

    /// Capacity of each archiver's download queue.
    pub queue_capacity: usize,

    /// Capacity of the shared new-server intake channel.
    pub intake_capacity: usize,

    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,

    /// When set, a full download queue spills items here instead of blocking.
    pub overflow_file: Option<PathBuf>,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            timelines: vec![Timeline::Local],
            scope: Scope::ServerOnly,
            media_enabled: false,
            parallel_downloads: 4,
            queue_capacity: 100,
            intake_capacity: 100,
            reconnect_delay: Duration::from_secs(5),
            overflow_file: None,
        }
    }
}

/// `name` is exactly one directory entry: no separators, not `.` or `..`.
fn is_single_component(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(c)), None) if c == OsStr::new(name)
    )
}

/// `rel` is non-empty and every component of it stays below the directory it
/// is joined to. Scheme-prefixed URLs such as `wss://relay.test` nest.
fn is_contained(rel: &str) -> bool {
    !rel.is_empty()
        && Path::new(rel)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

impl CrawlConfig {
    /// `{download_dir}/{platform}`
    ///
    /// Platform names come from remote NodeInfo documents, so anything that is
    /// not a single plain path component is refused.
    pub fn platform_dir(&self, platform: &Platform) -> crate::Result<PathBuf> {
        let name = platform.as_str();
        if !is_single_component(name) {
            return Err(Error::UnsafePath(name.to_string()));
        }
        Ok(self.download_dir.join(name))
    }

    /// `{download_dir}/{platform}/server_list.txt`
    pub fn server_list_path(&self, platform: &Platform) -> crate::Result<PathBuf> {
        Ok(self.platform_dir(platform)?.join(SERVER_LIST_FILE))
    }

    /// `{download_dir}/{platform}/{url}`
    pub fn server_dir(&self, server: &Server) -> crate::Result<PathBuf> {
        if !is_contained(&server.url) {
            return Err(Error::UnsafePath(server.url.clone()));
        }
        Ok(self.platform_dir(&server.platform)?.join(&server.url))
    }

    /// Validate values that would otherwise fail at runtime.
    pub fn validate(&self) -> crate::Result<()> {
        if self.timelines.is_empty() {
            return Err(Error::Config("at least one timeline is required".into()));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Config("queue capacity must be positive".into()));
        }
        if self.intake_capacity == 0 {
            return Err(Error::Config("intake capacity must be positive".into()));
        }
        if self.media_enabled && self.parallel_downloads == 0 {
            return Err(Error::Config(
                "parallel downloads must be positive when media is enabled".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_parse() {
        assert_eq!("unbounded".parse::<Scope>().unwrap(), Scope::Unbounded);
        assert_eq!("server".parse::<Scope>().unwrap(), Scope::ServerOnly);
        assert_eq!(
            "misskey".parse::<Scope>().unwrap(),
            Scope::Platform(Platform::Misskey)
        );
        assert!("".parse::<Scope>().is_err());
    }

    #[test]
    fn test_scope_filter() {
        let misskey = Scope::Platform(Platform::Misskey);
        assert!(misskey.allows(&Platform::Misskey));
        assert!(!misskey.allows(&Platform::Mastodon));
        assert!(misskey.explores());

        assert!(Scope::Unbounded.allows(&Platform::Nostr));
        assert!(Scope::ServerOnly.allows(&Platform::Bluesky));
        assert!(!Scope::ServerOnly.explores());
    }

    #[test]
    fn test_scope_display_round_trips() {
        for s in ["unbounded", "server", "nostr"] {
            assert_eq!(s.parse::<Scope>().unwrap().to_string(), s);
        }
    }

    #[test]
    fn test_paths() {
        let config = CrawlConfig {
            download_dir: PathBuf::from("/data"),
            ..Default::default()
        };
        let server = Server::new("misskey", "misskey.io");
        assert_eq!(
            config.server_list_path(&server.platform).unwrap(),
            PathBuf::from("/data/misskey/server_list.txt")
        );
        assert_eq!(
            config.server_dir(&server).unwrap(),
            PathBuf::from("/data/misskey/misskey.io")
        );

        let relay = Server::new("nostr", "wss://relay.test");
        assert_eq!(
            config.server_dir(&relay).unwrap(),
            PathBuf::from("/data/nostr/wss:/relay.test")
        );
    }

    #[test]
    fn test_paths_reject_escaping_names() {
        let config = CrawlConfig {
            download_dir: PathBuf::from("/data"),
            ..Default::default()
        };

        for name in ["/etc", "../up", "..", ".", "a/b", ""] {
            let platform = Platform::from(name);
            assert!(
                matches!(config.platform_dir(&platform), Err(Error::UnsafePath(_))),
                "{name:?}"
            );
            assert!(config.server_list_path(&platform).is_err(), "{name:?}");
        }

        for url in ["/tmp/pwned", "../../x", "a.test/../../x", "", "./a.test"] {
            let server = Server::new("misskey", url);
            assert!(
                matches!(config.server_dir(&server), Err(Error::UnsafePath(_))),
                "{url:?}"
            );
        }

        assert!(config.platform_dir(&Platform::from("pleroma")).is_ok());
    }

    #[test]
    fn test_validate() {
        assert!(CrawlConfig::default().validate().is_ok());

        let no_timelines = CrawlConfig {
            timelines: vec![],
            ..Default::default()
        };
        assert!(matches!(no_timelines.validate(), Err(Error::Config(_))));

        let no_workers = CrawlConfig {
            media_enabled: true,
            parallel_downloads: 0,
            ..Default::default()
        };
        assert!(no_workers.validate().is_err());
    }
}
