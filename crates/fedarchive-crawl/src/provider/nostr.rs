//! Nostr relay provider.
//!
//! Subscribes with an empty filter and archives only events that arrive after
//! `EOSE`, so stored history replayed by the relay is skipped.

use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nostr::JsonUtil;
use regex::Regex;
use uuid::Uuid;

use super::{PlatformProvider, ProviderBase, WsTransport, url_adjust};
use crate::Result;
use crate::queue::{DownloadSink, ServerSink};

static URL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://[^\s"'<>\\\[\]{}|^`]+"#).expect("URL regex should compile")
});

/// Characters that end a sentence rather than a URL.
const TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?', ')'];

/// http(s) URLs in a raw relay message.
pub fn find_urls(raw: &str) -> Vec<String> {
    URL_REGEX
        .find_iter(raw)
        .map(|m| m.as_str().trim_end_matches(TRAILING_PUNCTUATION))
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn req_message(subscription_id: &str) -> String {
    serde_json::json!(["REQ", subscription_id, {}]).to_string()
}

pub fn close_message(subscription_id: &str) -> String {
    serde_json::json!(["CLOSE", subscription_id]).to_string()
}

/// The relay messages this provider reacts to.
#[derive(Debug)]
pub enum RelayFrame {
    Event(Box<nostr::Event>),
    EndOfStoredEvents,
    Other,
}

impl RelayFrame {
    pub fn parse(raw: &str) -> Self {
        let Ok(parts) = serde_json::from_str::<Vec<serde_json::Value>>(raw) else {
            return Self::Other;
        };
        match parts.first().and_then(|t| t.as_str()) {
            Some("EVENT") => match parts.get(2).map(|e| nostr::Event::from_json(e.to_string())) {
                Some(Ok(event)) => Self::Event(Box::new(event)),
                Some(Err(e)) => {
                    tracing::debug!("Failed to parse Nostr event: {}", e);
                    Self::Other
                }
                None => Self::Other,
            },
            Some("EOSE") => Self::EndOfStoredEvents,
            Some("NOTICE") => {
                tracing::info!("Relay notice: {}", parts.get(1).unwrap_or(&serde_json::Value::Null));
                Self::Other
            }
            _ => Self::Other,
        }
    }
}

fn created_at(event: &nostr::Event) -> DateTime<Utc> {
    i64::try_from(event.created_at.as_u64())
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now)
}

pub struct NostrProvider {
    base: ProviderBase,
    subscription_id: Option<String>,
}

impl NostrProvider {
    pub(crate) fn new(base: ProviderBase) -> Self {
        Self {
            base,
            subscription_id: None,
        }
    }
}

#[async_trait]
impl PlatformProvider for NostrProvider {
    async fn connect(&mut self, crawl_session_id: Uuid) -> Result<String> {
        self.base.crawl_session_id = crawl_session_id;
        self.subscription_id = None;
        let (ws_url, _) = url_adjust(self.base.url());
        self.base.transport = Some(WsTransport::connect(&ws_url, None).await?);
        tracing::info!("Connected to {}", ws_url);
        Ok(ws_url)
    }

    async fn subscribe_channel(&mut self) -> Result<Option<Vec<u8>>> {
        let id = Uuid::new_v4().to_string();
        let msg = req_message(&id);
        tracing::debug!("Send message: {}", msg);
        self.base.transport()?.send_text(msg.clone()).await?;
        self.subscription_id = Some(id);
        tracing::info!("Subscribed to {}", self.base.url());
        Ok(Some(msg.into_bytes()))
    }

    async fn receive_messages(&mut self, sink: &DownloadSink) -> Result<()> {
        let mut live = false;
        loop {
            let frame = self.base.transport()?.next_frame().await?;
            let raw = String::from_utf8_lossy(frame.as_bytes()).into_owned();

            match RelayFrame::parse(&raw) {
                RelayFrame::EndOfStoredEvents => {
                    tracing::info!("End of stored events from {}, streaming live", self.base.url());
                    live = true;
                }
                RelayFrame::Event(event) if live => {
                    let observed_at = created_at(&event);
                    tracing::debug!("Received event {}", event.id.to_hex());
                    self.base.save_raw(raw.as_bytes(), observed_at.date_naive());
                    sink.push_urls(find_urls(&raw), observed_at).await?;
                }
                _ => {}
            }
        }
    }

    async fn crawl_new_servers(&mut self, _sink: &ServerSink) -> Result<()> {
        // Discovery is not implemented for relays; the explorer ends here.
        tracing::debug!("No server discovery for {}", self.base.url());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let (Some(id), Some(transport)) = (self.subscription_id.take(), self.base.transport.as_mut())
        {
            let msg = close_message(&id);
            match transport.send_text(msg).await {
                Ok(()) => tracing::info!("Closed subscription {}", id),
                Err(e) => tracing::debug!("Failed to send CLOSE for {}: {}", id, e),
            }
        }
        self.base.close_transport().await
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use fedarchive_core::{Server, Target, Timeline};
    use futures_util::{SinkExt, StreamExt};
    use nostr::{EventBuilder, Keys, Timestamp};
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::protocol::Message;

    use super::*;
    use crate::Error;
    use crate::queue::download_queue;
    use crate::testing::{refused_url, ws_server};

    const CREATED_AT: u64 = 1_750_000_000;

    fn provider(url: &str, dir: &Path) -> NostrProvider {
        let target = Target::new(Server::new("nostr", url), Timeline::Local);
        NostrProvider::new(ProviderBase::new(&target, dir))
    }

    fn event_frame(content: &str, created_at: u64) -> String {
        let event = EventBuilder::text_note(content)
            .custom_created_at(Timestamp::from(created_at))
            .sign_with_keys(&Keys::generate())
            .unwrap();
        format!(r#"["EVENT","sub",{}]"#, event.as_json())
    }

    #[test]
    fn test_find_urls() {
        let raw = r#"["EVENT","s",{"content":"look https://img.test/a.png. and http://x.test/b?q=1\nhttps://c.test/d)","tags":[["r","wss://relay.test"]]}]"#;
        assert_eq!(
            find_urls(raw),
            vec![
                "https://img.test/a.png",
                "http://x.test/b?q=1",
                "https://c.test/d"
            ]
        );
    }

    #[test]
    fn test_messages() {
        let req: serde_json::Value = serde_json::from_str(&req_message("abc")).unwrap();
        assert_eq!(req, serde_json::json!(["REQ", "abc", {}]));
        let close: serde_json::Value = serde_json::from_str(&close_message("abc")).unwrap();
        assert_eq!(close, serde_json::json!(["CLOSE", "abc"]));
    }

    #[test]
    fn test_parse_frames() {
        assert!(matches!(
            RelayFrame::parse(r#"["EOSE","sub"]"#),
            RelayFrame::EndOfStoredEvents
        ));
        assert!(matches!(RelayFrame::parse(r#"["NOTICE","hi"]"#), RelayFrame::Other));
        assert!(matches!(RelayFrame::parse("not json"), RelayFrame::Other));

        let RelayFrame::Event(event) = RelayFrame::parse(&event_frame("hello", 1_750_000_000))
        else {
            panic!("expected an event");
        };
        assert_eq!(created_at(&event).timestamp(), 1_750_000_000);
    }

    // =========================================================================
    // Against a relay
    // =========================================================================

    #[tokio::test]
    async fn test_archives_only_events_after_eose() {
        let tmp = TempDir::new().unwrap();
        let stored = event_frame("old https://img.test/old.png", CREATED_AT);
        let live = event_frame("new https://img.test/new.png", CREATED_AT);
        let (req_tx, mut req_rx) = mpsc::unbounded_channel();

        let url = ws_server(move |mut ws| {
            let frames = [stored.clone(), r#"["EOSE","sub"]"#.to_string(), live.clone()];
            let req_tx = req_tx.clone();
            async move {
                if let Some(Ok(Message::Text(req))) = ws.next().await {
                    req_tx.send(req).unwrap();
                }
                for frame in frames {
                    ws.send(Message::Text(frame)).await.unwrap();
                }
                ws.send(Message::Close(None)).await.unwrap();
                while let Some(Ok(_)) = ws.next().await {}
            }
        })
        .await;

        let mut provider = provider(&url, tmp.path());
        assert_eq!(provider.connect(Uuid::new_v4()).await.unwrap(), url);
        let sent = provider.subscribe_channel().await.unwrap().unwrap();

        let (sink, rx) = download_queue(8, None);
        assert!(matches!(
            provider.receive_messages(&sink).await,
            Err(Error::Receive(_))
        ));
        provider.close().await.unwrap();
        provider.close().await.unwrap();
        drop(sink);

        let req = req_rx.recv().await.unwrap();
        assert_eq!(req.as_bytes(), sent.as_slice());
        let req: serde_json::Value = serde_json::from_str(&req).unwrap();
        assert_eq!(req[0], "REQ");
        assert_eq!(req[2], serde_json::json!({}));

        let mut rx = rx.lock().await;
        assert_eq!(rx.recv().await.unwrap().url, "https://img.test/new.png");
        assert!(rx.recv().await.is_none());

        let date = DateTime::from_timestamp(CREATED_AT as i64, 0)
            .unwrap()
            .format("%Y-%m-%d")
            .to_string();
        let log = tmp.path().join(&date).join(format!("{date}_local.jsonl"));
        let records: Vec<serde_json::Value> = std::fs::read_to_string(log)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["record_type"], "response");
        assert_eq!(records[0]["data"]["raw"][2]["content"], "new https://img.test/new.png");
    }

    #[tokio::test]
    async fn test_close_after_failed_connect_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let mut provider = provider(&refused_url().await, tmp.path());

        assert!(matches!(
            provider.connect(Uuid::new_v4()).await,
            Err(Error::Connection(_))
        ));
        provider.close().await.unwrap();
        provider.close().await.unwrap();
        assert!(provider.subscribe_channel().await.is_err());
    }

    #[tokio::test]
    async fn test_close_sends_close_for_the_subscription() {
        let tmp = TempDir::new().unwrap();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let url = ws_server(move |mut ws| {
            let seen_tx = seen_tx.clone();
            async move {
                while let Some(Ok(msg)) = ws.next().await {
                    if let Message::Text(text) = msg {
                        seen_tx.send(text).unwrap();
                    }
                }
            }
        })
        .await;

        let mut provider = provider(&url, tmp.path());
        provider.connect(Uuid::new_v4()).await.unwrap();
        provider.subscribe_channel().await.unwrap();
        provider.close().await.unwrap();

        let req: serde_json::Value = serde_json::from_str(&seen_rx.recv().await.unwrap()).unwrap();
        let close: serde_json::Value =
            serde_json::from_str(&seen_rx.recv().await.unwrap()).unwrap();
        assert_eq!(close, serde_json::json!(["CLOSE", req[1]]));
    }
}
