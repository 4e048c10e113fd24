//! Asset URL extraction from Misskey notes.

use super::types::{DriveFile, Note, User};

/// Every asset URL referenced by a note, renotes and replies included.
///
/// Empty strings are dropped; duplicates are kept in encounter order.
pub fn note_urls(note: &Note) -> Vec<String> {
    let mut urls = Vec::new();
    collect_note(note, &mut urls);
    urls.retain(|u| !u.is_empty());
    urls
}

fn push(urls: &mut Vec<String>, url: Option<&str>) {
    if let Some(url) = url {
        urls.push(url.to_string());
    }
}

fn collect_note(note: &Note, urls: &mut Vec<String>) {
    collect_user(&note.user, urls);
    urls.extend(note.emojis.urls().into_iter().map(str::to_string));
    urls.extend(note.reaction_emojis.urls().into_iter().map(str::to_string));
    for file in &note.files {
        collect_file(file, urls);
    }
    if let Some(renote) = &note.renote {
        collect_note(renote, urls);
    }
    if let Some(reply) = &note.reply {
        collect_note(reply, urls);
    }
}

fn collect_user(user: &User, urls: &mut Vec<String>) {
    push(urls, user.avatar_url.as_deref());
    for decoration in &user.avatar_decorations {
        push(urls, decoration.url.as_deref());
    }
    urls.extend(user.emojis.urls().into_iter().map(str::to_string));
    for role in &user.badge_roles {
        push(urls, role.icon_url.as_deref());
    }
    if let Some(instance) = &user.instance {
        push(urls, instance.icon_url.as_deref());
        push(urls, instance.favicon_url.as_deref());
    }
}

fn collect_file(file: &DriveFile, urls: &mut Vec<String>) {
    push(urls, file.url.as_deref());
    push(urls, file.thumbnail_url.as_deref());
    if let Some(user) = &file.user {
        collect_user(user, urls);
    }
}

/// Remote hosts a note mentions through its author, renote or reply.
pub fn remote_hosts(note: &Note) -> Vec<String> {
    let mut hosts = Vec::new();
    let mut visit = |user: &User| {
        if let Some(host) = user.host.as_deref()
            && !host.is_empty()
            && !hosts.iter().any(|h| h == host)
        {
            hosts.push(host.to_string());
        }
    };

    visit(&note.user);
    if let Some(renote) = &note.renote {
        visit(&renote.user);
    }
    if let Some(reply) = &note.reply {
        visit(&reply.user);
    }
    hosts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(json: &str) -> Note {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_files_in_order() {
        let n = note(
            r#"{"id":"1","files":[
                {"url":"https://m.test/a.jpg","thumbnailUrl":""},
                {"url":"https://m.test/b.png","thumbnailUrl":"https://m.test/b-thumb.webp"}
            ]}"#,
        );
        assert_eq!(
            note_urls(&n),
            vec![
                "https://m.test/a.jpg",
                "https://m.test/b.png",
                "https://m.test/b-thumb.webp"
            ]
        );
    }

    #[test]
    fn test_user_assets() {
        let n = note(
            r#"{"id":"1","user":{
                "avatarUrl":"https://m.test/avatar.webp",
                "avatarDecorations":[{"id":"d","url":"https://m.test/deco.png"}],
                "emojis":{"wave":"https://m.test/wave.png"},
                "badgeRoles":[{"name":"mod","iconUrl":"https://m.test/badge.png"}],
                "instance":{"iconUrl":"https://r.test/icon.png","faviconUrl":null}
            }}"#,
        );
        assert_eq!(
            note_urls(&n),
            vec![
                "https://m.test/avatar.webp",
                "https://m.test/deco.png",
                "https://m.test/wave.png",
                "https://m.test/badge.png",
                "https://r.test/icon.png",
            ]
        );
    }

    #[test]
    fn test_recurses_into_renote_and_reply() {
        let n = note(
            r#"{"id":"1",
                "renote":{"id":"2","files":[{"url":"https://m.test/renote.png"}],
                          "reply":{"id":"3","reactionEmojis":{"x":"https://m.test/x.png"}}},
                "reply":{"id":"4","user":{"avatarUrl":"https://m.test/replier.png"}}
            }"#,
        );
        assert_eq!(
            note_urls(&n),
            vec![
                "https://m.test/renote.png",
                "https://m.test/x.png",
                "https://m.test/replier.png",
            ]
        );
    }

    #[test]
    fn test_empty_note_has_no_urls() {
        assert!(note_urls(&Note::default()).is_empty());
    }

    #[test]
    fn test_remote_hosts() {
        let n = note(
            r#"{"id":"1","user":{"host":null},
                "renote":{"id":"2","user":{"host":"mstdn.jp"}},
                "reply":{"id":"3","user":{"host":"mstdn.jp"}}}"#,
        );
        assert_eq!(remote_hosts(&n), vec!["mstdn.jp"]);
    }
}
