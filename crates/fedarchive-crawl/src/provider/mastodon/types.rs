//! Mastodon streaming message shapes.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::provider::nullable;

/// `{"stream": [...], "event": "update", "payload": "<json string>"}`
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StreamingMessage {
    #[serde(deserialize_with = "nullable")]
    pub stream: Vec<String>,
    pub event: String,
    #[serde(deserialize_with = "nullable")]
    pub payload: String,
}

impl StreamingMessage {
    /// Decode the status carried by an `update` event.
    pub fn status(&self) -> Option<Status> {
        if self.event != "update" {
            return None;
        }
        match serde_json::from_str(&self.payload) {
            Ok(status) => Some(status),
            Err(e) => {
                tracing::debug!("Failed to parse Mastodon payload: {}", e);
                None
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Status {
    pub id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub uri: Option<String>,
    pub url: Option<String>,
    pub account: Account,
    #[serde(deserialize_with = "nullable")]
    pub media_attachments: Vec<MediaAttachment>,
    #[serde(deserialize_with = "nullable")]
    pub emojis: Vec<CustomEmoji>,
    pub poll: Option<Poll>,
    pub reblog: Option<Box<Status>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Account {
    pub id: String,
    pub acct: String,
    pub avatar: Option<String>,
    pub avatar_static: Option<String>,
    pub header: Option<String>,
    pub header_static: Option<String>,
    #[serde(deserialize_with = "nullable")]
    pub emojis: Vec<CustomEmoji>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CustomEmoji {
    pub shortcode: String,
    pub url: Option<String>,
    pub static_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct MediaAttachment {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub url: Option<String>,
    pub preview_url: Option<String>,
    pub remote_url: Option<String>,
    pub text_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Poll {
    pub id: String,
    #[serde(deserialize_with = "nullable")]
    pub emojis: Vec<CustomEmoji>,
}

/// Asset URLs referenced by a status: attachments, emojis, account images and
/// poll emojis. Empty values are dropped.
pub fn status_urls(status: &Status) -> Vec<String> {
    let mut urls: Vec<Option<&str>> = Vec::new();

    for media in &status.media_attachments {
        urls.push(media.url.as_deref());
        urls.push(media.preview_url.as_deref());
        urls.push(media.remote_url.as_deref());
        urls.push(media.text_url.as_deref());
    }
    for emoji in status.emojis.iter().chain(&status.account.emojis) {
        urls.push(emoji.url.as_deref());
        urls.push(emoji.static_url.as_deref());
    }
    urls.push(status.account.avatar.as_deref());
    urls.push(status.account.avatar_static.as_deref());
    urls.push(status.account.header.as_deref());
    urls.push(status.account.header_static.as_deref());
    if let Some(poll) = &status.poll {
        for emoji in &poll.emojis {
            urls.push(emoji.url.as_deref());
            urls.push(emoji.static_url.as_deref());
        }
    }

    urls.into_iter()
        .flatten()
        .filter(|u| !u.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(status: &str) -> StreamingMessage {
        StreamingMessage {
            stream: vec!["public:local".into()],
            event: "update".into(),
            payload: status.into(),
        }
    }

    #[test]
    fn test_payload_is_a_json_string() {
        let raw = r#"{"stream":["public"],"event":"update","payload":"{\"id\":\"1\",\"created_at\":\"2025-02-03T04:05:06.000Z\"}"}"#;
        let msg: StreamingMessage = serde_json::from_str(raw).unwrap();
        let status = msg.status().unwrap();
        assert_eq!(status.id, "1");
        assert!(status.created_at.is_some());
    }

    #[test]
    fn test_delete_has_no_status() {
        let msg: StreamingMessage =
            serde_json::from_str(r#"{"stream":["public"],"event":"delete","payload":"109"}"#)
                .unwrap();
        assert!(msg.status().is_none());
    }

    #[test]
    fn test_status_urls() {
        let status = update(
            r#"{"id":"1",
                "media_attachments":[{"id":"m","type":"image",
                    "url":"https://files.test/a.png","preview_url":"https://files.test/a_small.png",
                    "remote_url":null,"text_url":null}],
                "emojis":[{"shortcode":"x","url":"https://files.test/x.png","static_url":"https://files.test/x_s.png"}],
                "account":{"id":"a","avatar":"https://files.test/av.png","avatar_static":"https://files.test/av.png",
                           "header":"","header_static":null,"emojis":null},
                "poll":null}"#,
        )
        .status()
        .unwrap();

        assert_eq!(
            status_urls(&status),
            vec![
                "https://files.test/a.png",
                "https://files.test/a_small.png",
                "https://files.test/x.png",
                "https://files.test/x_s.png",
                "https://files.test/av.png",
                "https://files.test/av.png",
            ]
        );
    }
}
