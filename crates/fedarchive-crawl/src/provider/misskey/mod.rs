//! Misskey streaming provider.
//!
//! Connects to `wss://{host}/streaming` and subscribes with a `connect`
//! envelope for `localTimeline` or `globalTimeline`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use fedarchive_core::{Server, Timeline};
use uuid::Uuid;

use super::{Frame, PlatformProvider, ProviderBase, WsTransport, url_adjust};
use crate::Result;
use crate::nodeinfo::NodeInfoLookup;
use crate::queue::{DownloadSink, ServerSink};

pub mod extract;
pub mod types;

pub use extract::{note_urls, remote_hosts};
use types::{Note, StreamingMessage};

/// Channel name for a timeline.
pub fn channel_name(timeline: Timeline) -> &'static str {
    match timeline {
        Timeline::Local => "localTimeline",
        Timeline::Global => "globalTimeline",
    }
}

/// Subscription envelope for a channel.
pub fn connect_message(timeline: Timeline, id: Uuid) -> String {
    serde_json::json!({
        "type": "connect",
        "body": {
            "channel": channel_name(timeline),
            "id": id.to_string(),
        }
    })
    .to_string()
}

/// Extract the note from a streaming frame, if it carries one.
pub fn parse_note(raw: &[u8]) -> Option<Note> {
    match serde_json::from_slice::<StreamingMessage>(raw) {
        Ok(msg) => msg.body.body,
        Err(e) => {
            tracing::debug!("Failed to parse Misskey message: {}", e);
            None
        }
    }
}

pub struct MisskeyProvider {
    base: ProviderBase,
    nodeinfo: Arc<dyn NodeInfoLookup>,
}

impl MisskeyProvider {
    pub(crate) fn new(base: ProviderBase, nodeinfo: Arc<dyn NodeInfoLookup>) -> Self {
        Self { base, nodeinfo }
    }
}

#[async_trait]
impl PlatformProvider for MisskeyProvider {
    async fn connect(&mut self, crawl_session_id: Uuid) -> Result<String> {
        self.base.crawl_session_id = crawl_session_id;
        let (ws_url, _) = url_adjust(self.base.url());
        let stream_url = format!("{ws_url}/streaming");

        self.base.transport = Some(WsTransport::connect(&stream_url, None).await?);
        tracing::info!("Connected to {}", stream_url);
        Ok(stream_url)
    }

    async fn subscribe_channel(&mut self) -> Result<Option<Vec<u8>>> {
        let msg = connect_message(self.base.target.timeline, Uuid::new_v4());
        tracing::debug!("Send message: {}", msg);
        self.base.transport()?.send_text(msg.clone()).await?;
        tracing::info!(
            "Connected to channel {} on {}",
            channel_name(self.base.target.timeline),
            self.base.url()
        );
        Ok(Some(msg.into_bytes()))
    }

    async fn receive_messages(&mut self, sink: &DownloadSink) -> Result<()> {
        loop {
            let frame = self.base.transport()?.next_frame().await?;
            let raw = frame.as_bytes();

            let note = parse_note(raw);
            let created_at = note
                .as_ref()
                .and_then(|n| n.created_at)
                .unwrap_or_else(Utc::now);
            self.base.save_raw(raw, created_at.date_naive());

            if let Some(note) = note {
                tracing::debug!("Received note {}", note.id);
                sink.push_urls(note_urls(&note), created_at).await?;
            }
        }
    }

    async fn crawl_new_servers(&mut self, sink: &ServerSink) -> Result<()> {
        loop {
            let frame = self.base.transport()?.next_frame().await?;
            let Frame::Text(text) = frame else { continue };
            let Some(note) = parse_note(text.as_bytes()) else {
                continue;
            };

            for host in remote_hosts(&note) {
                if host == self.base.url() {
                    continue;
                }
                match self.nodeinfo.software_name(&host).await {
                    Ok(software) => sink.push(Server::new(software, host)).await?,
                    Err(e) => tracing::debug!("Failed to get software name for {}: {}", host, e),
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.base.close_transport().await
    }
}

#[cfg(test)]
mod tests {
    use fedarchive_core::Target;
    use futures_util::{SinkExt, StreamExt};
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::protocol::Message;

    use super::*;
    use crate::Error;
    use crate::queue::download_queue;
    use crate::testing::{StubNodeInfo, ws_server};

    const NOTE_FRAME: &str = r#"{"type":"channel","body":{"id":"c","type":"note","body":{
        "id":"n1","createdAt":"2025-05-01T12:00:00.000Z",
        "files":[{"url":"https://m.test/a.jpg"}]}}}"#;

    #[test]
    fn test_connect_message() {
        let id = Uuid::nil();
        let msg: serde_json::Value =
            serde_json::from_str(&connect_message(Timeline::Local, id)).unwrap();
        assert_eq!(msg["type"], "connect");
        assert_eq!(msg["body"]["channel"], "localTimeline");
        assert_eq!(msg["body"]["id"], id.to_string());
        assert_eq!(channel_name(Timeline::Global), "globalTimeline");
    }

    #[test]
    fn test_parse_note_from_frame() {
        let note = parse_note(NOTE_FRAME.as_bytes()).unwrap();
        assert_eq!(note.id, "n1");
        assert_eq!(note_urls(&note), vec!["https://m.test/a.jpg"]);
    }

    #[test]
    fn test_parse_note_ignores_non_notes() {
        assert!(parse_note(br#"{"type":"connected","body":{"id":"c"}}"#).is_none());
        assert!(parse_note(b"garbage").is_none());
    }

    #[tokio::test]
    async fn test_subscribes_and_archives_over_websocket() {
        let tmp = TempDir::new().unwrap();
        let (sub_tx, mut sub_rx) = mpsc::unbounded_channel();
        let url = ws_server(move |mut ws| {
            let sub_tx = sub_tx.clone();
            async move {
                if let Some(Ok(Message::Text(sub))) = ws.next().await {
                    sub_tx.send(sub).unwrap();
                }
                ws.send(Message::Text(NOTE_FRAME.to_string())).await.unwrap();
                ws.send(Message::Close(None)).await.unwrap();
                while let Some(Ok(_)) = ws.next().await {}
            }
        })
        .await;

        let target = Target::new(Server::new("misskey", url.as_str()), Timeline::Local);
        let mut provider = MisskeyProvider::new(
            ProviderBase::new(&target, tmp.path()),
            Arc::new(StubNodeInfo::default()),
        );
        assert_eq!(
            provider.connect(Uuid::new_v4()).await.unwrap(),
            format!("{url}/streaming")
        );
        let sent = provider.subscribe_channel().await.unwrap().unwrap();

        let received = sub_rx.recv().await.unwrap();
        assert_eq!(received.as_bytes(), sent.as_slice());
        let envelope: serde_json::Value = serde_json::from_str(&received).unwrap();
        assert_eq!(envelope["type"], "connect");
        assert_eq!(envelope["body"]["channel"], "localTimeline");

        let (sink, rx) = download_queue(8, None);
        assert!(matches!(
            provider.receive_messages(&sink).await,
            Err(Error::Receive(_))
        ));
        provider.close().await.unwrap();
        drop(sink);

        let mut rx = rx.lock().await;
        assert_eq!(rx.recv().await.unwrap().url, "https://m.test/a.jpg");
        assert!(rx.recv().await.is_none());

        let log = tmp.path().join("2025-05-01/2025-05-01_local.jsonl");
        let line = std::fs::read_to_string(log).unwrap();
        let record: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(record["record_type"], "response");
        assert_eq!(record["data"]["raw"]["body"]["body"]["id"], "n1");
    }
}
