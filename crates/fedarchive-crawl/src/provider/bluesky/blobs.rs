//! Blob references inside repo records.

use ciborium::Value;
use cid::Cid;

use super::car::Block;

const BLOB_ENDPOINT: &str = "https://bsky.social/xrpc/com.atproto.sync.getBlob";

/// CBOR tag for IPLD links.
const CID_TAG: u64 = 42;

/// Look up a text key in a CBOR map.
pub(crate) fn field<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    value
        .as_map()?
        .iter()
        .find(|(k, _)| k.as_text() == Some(key))
        .map(|(_, v)| v)
}

pub(crate) fn text_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    field(value, key)?.as_text()
}

/// Decode a tag-42 link. The payload carries a leading multibase `0x00`.
pub(crate) fn link_to_cid(value: &Value) -> Option<Cid> {
    let (tag, inner) = value.as_tag()?;
    if tag != CID_TAG {
        return None;
    }
    let bytes: &[u8] = inner.as_bytes()?;
    let bytes = bytes.strip_prefix(&[0x00]).unwrap_or(bytes);
    Cid::try_from(bytes).ok()
}

/// CID string of a blob object: `ref` as a tag-42 link, or `ref.$link`.
fn blob_cid(blob: &Value) -> Option<String> {
    let reference = field(blob, "ref")?;
    if let Some(cid) = link_to_cid(reference) {
        return Some(cid.to_string());
    }
    text_field(reference, "$link").map(str::to_string)
}

pub fn blob_url(did: &str, cid: &str) -> String {
    format!("{BLOB_ENDPOINT}?did={did}&cid={cid}")
}

fn image_blobs(container: &Value, out: &mut Vec<String>) {
    let Some(images) = field(container, "images").and_then(Value::as_array) else {
        return;
    };
    for image in images {
        if let Some(cid) = field(image, "image").and_then(blob_cid) {
            out.push(cid);
        }
    }
}

fn post_blobs(record: &Value) -> Vec<String> {
    let mut cids = Vec::new();
    let Some(embed) = field(record, "embed") else {
        return cids;
    };

    match text_field(embed, "$type") {
        Some("app.bsky.embed.images") => image_blobs(embed, &mut cids),
        Some("app.bsky.embed.video") => cids.extend(field(embed, "video").and_then(blob_cid)),
        Some("app.bsky.embed.external") => cids.extend(
            field(embed, "external")
                .and_then(|e| field(e, "thumb"))
                .and_then(blob_cid),
        ),
        Some("app.bsky.embed.recordWithMedia") => {
            if let Some(media) = field(embed, "media")
                && text_field(media, "$type") == Some("app.bsky.embed.images")
            {
                image_blobs(media, &mut cids);
            }
        }
        _ => {}
    }
    cids
}

fn profile_blobs(record: &Value) -> Vec<String> {
    ["avatar", "banner"]
        .into_iter()
        .filter_map(|key| field(record, key).and_then(blob_cid))
        .collect()
}

/// Blob URLs referenced by the post and profile records among `blocks`.
pub fn blob_urls(repo: &str, blocks: &[Block<'_>]) -> Vec<String> {
    let mut urls = Vec::new();
    for block in blocks {
        let Ok(record) = ciborium::from_reader::<Value, _>(block.data) else {
            continue;
        };
        let cids = match text_field(&record, "$type") {
            Some("app.bsky.feed.post") => post_blobs(&record),
            Some("app.bsky.actor.profile") => profile_blobs(&record),
            _ => continue,
        };
        urls.extend(cids.iter().map(|cid| blob_url(repo, cid)));
    }
    urls
}
