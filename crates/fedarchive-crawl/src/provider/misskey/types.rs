//! Misskey streaming message shapes.
//!
//! Only the fields used for asset extraction and discovery are modelled.
//! Misskey sends `null` for many absent values, so collections and strings go
//! through [`nullable`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::provider::nullable;

/// `{"type": "channel", "body": {"id", "type": "note", "body": Note}}`
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StreamingMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub body: StreamingBody,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StreamingBody {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub body: Option<Note>,
}

/// Custom emoji references: a name → URL map on current servers, a list of
/// `{name, url}` objects on older ones.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Emojis {
    Map(BTreeMap<String, String>),
    List(Vec<EmojiEntry>),
}

impl Default for Emojis {
    fn default() -> Self {
        Self::Map(BTreeMap::new())
    }
}

impl Emojis {
    pub fn urls(&self) -> Vec<&str> {
        match self {
            Self::Map(map) => map.values().map(String::as_str).collect(),
            Self::List(list) => list.iter().filter_map(|e| e.url.as_deref()).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EmojiEntry {
    pub name: String,
    pub url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Note {
    pub id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub user: User,
    pub reply: Option<Box<Note>>,
    pub renote: Option<Box<Note>>,
    #[serde(deserialize_with = "nullable")]
    pub files: Vec<DriveFile>,
    #[serde(deserialize_with = "nullable")]
    pub emojis: Emojis,
    #[serde(deserialize_with = "nullable")]
    pub reaction_emojis: Emojis,
    pub uri: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    /// `None` for local users.
    pub host: Option<String>,
    pub avatar_url: Option<String>,
    #[serde(deserialize_with = "nullable")]
    pub avatar_decorations: Vec<AvatarDecoration>,
    #[serde(deserialize_with = "nullable")]
    pub emojis: Emojis,
    #[serde(deserialize_with = "nullable")]
    pub badge_roles: Vec<BadgeRole>,
    pub instance: Option<Instance>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AvatarDecoration {
    pub id: String,
    pub url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BadgeRole {
    pub name: String,
    pub icon_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Instance {
    pub name: Option<String>,
    pub software_name: Option<String>,
    pub icon_url: Option<String>,
    pub favicon_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    #[serde(rename = "type")]
    pub mime: String,
    pub url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub user: Option<User>,
}
