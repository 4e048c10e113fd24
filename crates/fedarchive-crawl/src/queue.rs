//! Download and discovery queues.
//!
//! Each archiver owns the only [`DownloadSink`] for its DLQueue, so the queue
//! closes when the archiver terminates. Consumers share the receiving half
//! through a [`SharedReceiver`].
//!
//! Two producer policies exist:
//! - **Backpressure** (default): `push` waits for queue space.
//! - **Overflow**: when an overflow file is configured, a full queue spills the
//!   item to that file as a JSON line and `push` returns immediately.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use fedarchive_core::{DownloadItem, Server, append_line};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};

use crate::{Error, Result};

/// Receiving half of a DLQueue shared by a pool of workers.
pub type SharedReceiver = Arc<Mutex<mpsc::Receiver<DownloadItem>>>;

/// Create a bounded DLQueue.
pub fn download_queue(capacity: usize, overflow: Option<PathBuf>) -> (DownloadSink, SharedReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        DownloadSink { tx, overflow },
        Arc::new(Mutex::new(rx)),
    )
}

/// Producer side of a DLQueue.
#[derive(Debug)]
pub struct DownloadSink {
    tx: mpsc::Sender<DownloadItem>,
    overflow: Option<PathBuf>,
}

impl DownloadSink {
    /// Queue one item according to the configured policy.
    ///
    /// Fails only when every consumer is gone.
    pub async fn push(&self, item: DownloadItem) -> Result<()> {
        counter!("crawl_download_items_total").increment(1);

        let Some(path) = &self.overflow else {
            return self.tx.send(item).await.map_err(|_| Error::ChannelClosed);
        };

        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(item)) => {
                tracing::warn!("Queue full, saving to overflow file: {}", item.url);
                counter!("crawl_download_overflow_total").increment(1);
                let line = serde_json::to_string(&item)?;
                append_line(path, &line)?;
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::ChannelClosed),
        }
    }

    /// Queue a batch of URLs sharing one timestamp, dropping empty strings.
    pub async fn push_urls<I, S>(&self, urls: I, observed_at: chrono::DateTime<chrono::Utc>) -> Result<usize>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut queued = 0;
        for url in urls {
            let url = url.into();
            if url.is_empty() {
                continue;
            }
            self.push(DownloadItem::new(url, observed_at)).await?;
            queued += 1;
        }
        Ok(queued)
    }
}

/// Producer side of the shared new-server intake channel.
#[derive(Debug, Clone)]
pub struct ServerSink {
    tx: mpsc::Sender<Server>,
}

impl ServerSink {
    pub fn new(tx: mpsc::Sender<Server>) -> Self {
        Self { tx }
    }

    /// Hand a discovered server to the manager.
    pub async fn push(&self, server: Server) -> Result<()> {
        self.tx.send(server).await.map_err(|_| Error::ChannelClosed)
    }
}

/// A queued item that did not get downloaded before shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDownload {
    /// Archive directory of the server the item came from.
    pub server_dir: PathBuf,
    #[serde(flatten)]
    pub item: DownloadItem,
}

/// Close a DLQueue and move whatever is still queued to the recovery file.
///
/// Returns the number of items written.
pub async fn drain_to_file(rx: &SharedReceiver, server_dir: &Path, path: &Path) -> Result<usize> {
    let mut rx = rx.lock().await;
    rx.close();

    let mut drained = 0;
    while let Ok(item) = rx.try_recv() {
        let pending = PendingDownload {
            server_dir: server_dir.to_path_buf(),
            item,
        };
        append_line(path, &serde_json::to_string(&pending)?)?;
        drained += 1;
    }
    Ok(drained)
}

/// Read the recovery file left by a previous run and remove it.
///
/// A missing file yields an empty list. Malformed lines are skipped.
pub fn take_pending(path: &Path) -> Result<Vec<PendingDownload>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut pending = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<PendingDownload>(line) {
            Ok(item) => pending.push(item),
            Err(e) => tracing::warn!("Skipping pending download line {}: {}", idx + 1, e),
        }
    }

    std::fs::remove_file(path)?;
    tracing::info!("Loaded {} pending downloads from {}", pending.len(), path.display());
    Ok(pending)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn item(url: &str) -> DownloadItem {
        DownloadItem::new(url, Utc::now())
    }

    // =========================================================================
    // Backpressure
    // =========================================================================

    #[tokio::test]
    async fn test_full_queue_blocks_until_consumer_resumes() {
        let (sink, rx) = download_queue(2, None);

        let producer = tokio::spawn(async move {
            for i in 0..5 {
                sink.push(item(&format!("https://x.test/{i}.png"))).await.unwrap();
            }
        });

        // Consumer paused: the producer fills the queue and parks.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());

        let mut received = Vec::new();
        {
            let mut rx = rx.lock().await;
            while let Some(item) = rx.recv().await {
                received.push(item.url);
            }
        }

        producer.await.unwrap();
        assert_eq!(received.len(), 5);
        assert_eq!(received[0], "https://x.test/0.png");
        assert_eq!(received[4], "https://x.test/4.png");
    }

    #[tokio::test]
    async fn test_overflow_policy_spills_to_file() {
        let tmp = TempDir::new().unwrap();
        let overflow = tmp.path().join("overflow.jsonl");
        let (sink, rx) = download_queue(1, Some(overflow.clone()));

        sink.push(item("https://x.test/a.png")).await.unwrap();
        sink.push(item("https://x.test/b.png")).await.unwrap();
        sink.push(item("https://x.test/c.png")).await.unwrap();

        let lines: Vec<DownloadItem> = std::fs::read_to_string(&overflow)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].url, "https://x.test/b.png");

        let queued = rx.lock().await.try_recv().unwrap();
        assert_eq!(queued.url, "https://x.test/a.png");
    }

    #[tokio::test]
    async fn test_push_fails_when_consumers_are_gone() {
        let (sink, rx) = download_queue(1, None);
        drop(rx);
        assert!(matches!(
            sink.push(item("https://x.test/a.png")).await,
            Err(Error::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_push_urls_skips_empty() {
        let (sink, rx) = download_queue(8, None);
        let n = sink
            .push_urls(["https://x.test/a.png", "", "https://x.test/b.png"], Utc::now())
            .await
            .unwrap();
        assert_eq!(n, 2);
        drop(sink);

        let mut rx = rx.lock().await;
        assert_eq!(rx.recv().await.unwrap().url, "https://x.test/a.png");
        assert_eq!(rx.recv().await.unwrap().url, "https://x.test/b.png");
        assert!(rx.recv().await.is_none());
    }

    // =========================================================================
    // Shutdown drain / recovery
    // =========================================================================

    #[tokio::test]
    async fn test_drain_then_take_pending() {
        let tmp = TempDir::new().unwrap();
        let pending_path = tmp.path().join("pending_downloads.jsonl");
        let server_dir = tmp.path().join("misskey/example.test");
        let (sink, rx) = download_queue(4, None);

        sink.push(item("https://x.test/a.png")).await.unwrap();
        sink.push(item("https://x.test/b.png")).await.unwrap();

        let drained = drain_to_file(&rx, &server_dir, &pending_path).await.unwrap();
        assert_eq!(drained, 2);

        // The queue is closed after draining.
        assert!(matches!(
            sink.push(item("https://x.test/c.png")).await,
            Err(Error::ChannelClosed)
        ));

        let pending = take_pending(&pending_path).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].server_dir, server_dir);
        assert_eq!(pending[1].item.url, "https://x.test/b.png");
        assert!(!pending_path.exists());
    }

    #[test]
    fn test_take_pending_missing_file() {
        let tmp = TempDir::new().unwrap();
        assert!(take_pending(&tmp.path().join("nope.jsonl")).unwrap().is_empty());
    }

    #[test]
    fn test_take_pending_skips_malformed_lines() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("pending.jsonl");
        let good = PendingDownload {
            server_dir: PathBuf::from("d"),
            item: item("https://x.test/a.png"),
        };
        std::fs::write(
            &path,
            format!("not json\n{}\n", serde_json::to_string(&good).unwrap()),
        )
        .unwrap();

        let pending = take_pending(&path).unwrap();
        assert_eq!(pending, vec![good]);
    }
}
