//! Asset downloads.
//!
//! A pool of workers shares each archiver's DLQueue receiver. Files are named
//! by the SHA-256 of their content plus the URL's extension and written to
//! `{server_dir}/{date}/data/assets/`, with one mapping line per download in
//! `{server_dir}/{date}/data/filename_url_mapping.jsonl`.

use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use fedarchive_core::metrics::increment;
use fedarchive_core::{DownloadItem, FilenameUrlMapping, append_line};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::queue::{PendingDownload, SharedReceiver};
use crate::{Error, Result};

const MAPPING_FILE: &str = "filename_url_mapping.jsonl";

/// `<sha256 hex><.ext>` for a downloaded body.
pub fn asset_file_name(url: &str, body: &[u8]) -> String {
    let hash = hex::encode(Sha256::digest(body));
    match url_extension(url) {
        Some(ext) => format!("{hash}.{ext}"),
        None => hash,
    }
}

fn url_extension(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let name = parsed.path_segments()?.next_back()?;
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_string())
}

/// Downloads assets for one server directory.
#[derive(Debug, Clone)]
pub struct MediaDownloader {
    http: reqwest::Client,
    server_dir: PathBuf,
}

impl MediaDownloader {
    pub fn new(http: reqwest::Client, server_dir: impl Into<PathBuf>) -> Self {
        Self {
            http,
            server_dir: server_dir.into(),
        }
    }

    pub fn server_dir(&self) -> &Path {
        &self.server_dir
    }

    /// Fetch one item and save it. Returns the saved path, or `None` for an
    /// empty URL.
    pub async fn download(&self, item: &DownloadItem) -> Result<Option<PathBuf>> {
        if item.url.is_empty() {
            return Ok(None);
        }

        let response = self.http.get(&item.url).send().await?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(Error::UnexpectedStatus {
                url: item.url.clone(),
                status: response.status().as_u16(),
            });
        }
        let body = response.bytes().await?;

        self.save(item, &body).await.map(Some)
    }

    /// Write a downloaded body and its mapping line.
    pub async fn save(&self, item: &DownloadItem, body: &[u8]) -> Result<PathBuf> {
        let date = item.observed_at.format("%Y-%m-%d").to_string();
        let data_dir = self.server_dir.join(&date).join("data");
        let assets_dir = data_dir.join("assets");
        tokio::fs::create_dir_all(&assets_dir).await?;

        let file_name = asset_file_name(&item.url, body);
        let path = assets_dir.join(&file_name);
        if tokio::fs::try_exists(&path).await? {
            tracing::debug!("Asset already saved: {}", path.display());
        } else {
            tokio::fs::write(&path, body).await?;
        }

        let mapping = FilenameUrlMapping {
            filepath: format!("data/assets/{file_name}"),
            url: item.url.clone(),
            downloadtime: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        append_line(
            &data_dir.join(MAPPING_FILE),
            &serde_json::to_string(&mapping)?,
        )?;
        Ok(path)
    }

    async fn download_logged(&self, item: &DownloadItem) {
        match self.download(item).await {
            Ok(Some(path)) => {
                increment("media_downloads_total", 1);
                tracing::debug!("Saved {} to {}", item.url, path.display());
            }
            Ok(None) => {}
            Err(e) => {
                increment("media_download_failures_total", 1);
                tracing::warn!("Failed to download {}: {}", item.url, e);
            }
        }
    }
}

/// Take the next item, or `None` once the queue is closed or shutdown starts.
async fn next_item(rx: &SharedReceiver, shutdown: &CancellationToken) -> Option<DownloadItem> {
    tokio::select! {
        _ = shutdown.cancelled() => None,
        item = async { rx.lock().await.recv().await } => item,
    }
}

/// Spawn `count` workers pulling from one DLQueue.
pub fn spawn_download_workers(
    downloader: MediaDownloader,
    rx: SharedReceiver,
    count: usize,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|worker| {
            let downloader = downloader.clone();
            let rx = rx.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                while let Some(item) = next_item(&rx, &shutdown).await {
                    downloader.download_logged(&item).await;
                }
                tracing::debug!(
                    "Download worker {} for {} stopped",
                    worker,
                    downloader.server_dir.display()
                );
            })
        })
        .collect()
}

/// Spawn a worker that drops every item, for runs with media disabled.
pub fn spawn_discard_worker(rx: SharedReceiver, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut discarded = 0u64;
        while next_item(&rx, &shutdown).await.is_some() {
            discarded += 1;
        }
        tracing::debug!("Discard worker stopped after {} items", discarded);
    })
}

/// Download items left over from a previous run.
pub fn recover_pending(
    items: Vec<PendingDownload>,
    http: reqwest::Client,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let total = items.len();
        for pending in items {
            if shutdown.is_cancelled() {
                break;
            }
            MediaDownloader::new(http.clone(), pending.server_dir)
                .download_logged(&pending.item)
                .await;
        }
        tracing::info!("Recovery of {} pending downloads finished", total);
    })
}
