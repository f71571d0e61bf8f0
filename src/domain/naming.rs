//! Filesystem naming rules (spec §3, §6): channel directory name, per-item
//! filename, and extension derivation. Pure functions — no I/O here.

use crate::domain::entities::{MessageDescriptor, MessageKind};

const INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
const MAX_TITLE_CODEPOINTS: usize = 100;

/// Sanitizes a channel title for use in a directory name: replaces the
/// forbidden character class and control bytes with `_`, trims surrounding
/// whitespace and dots, and truncates to 100 code points. Idempotent:
/// sanitizing an already-sanitized string is a fixpoint (spec §8 "Filename
/// idempotence").
pub fn sanitize_component(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .map(|c| {
            if INVALID_CHARS.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();
    let trimmed = replaced.trim_matches(|c: char| c.is_whitespace() || c == '.');
    trimmed.chars().take(MAX_TITLE_CODEPOINTS).collect()
}

/// Builds the per-run channel directory name: `"@"<username>"-"<sanitized-title>`.
pub fn channel_dir_name(username: &str, title: &str) -> String {
    format!("@{}-{}", username, sanitize_component(title))
}

/// Builds the on-disk filename for a message descriptor (spec §3).
///
/// Album members: `<album_id>-<id><ext>`. Singletons: `msg-<id><ext>`.
pub fn filename_for(desc: &MessageDescriptor) -> String {
    let base = match &desc.album_id {
        Some(album_id) => format!("{}-{}", album_id, desc.id),
        None => format!("msg-{}", desc.id),
    };
    let ext = extension_for(desc);
    sanitize_component(&format!("{base}.{ext}"))
}

/// Extension precedence (spec §3): source filename's extension, then MIME
/// mapping, then kind default, falling back to `.bin` only when the kind
/// default itself is unknown territory (it never is — every `MessageKind`
/// defines one).
pub fn extension_for(desc: &MessageDescriptor) -> String {
    if let Some(name) = &desc.source_filename {
        if let Some(ext) = std::path::Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
        {
            if !ext.is_empty() {
                return normalize_ext(ext);
            }
        }
    }
    if let Some(mime) = &desc.mime_type {
        if let Some(ext) = extension_from_mime(mime) {
            return ext.to_string();
        }
    }
    desc.kind.default_extension().to_string()
}

/// Crates like `mime_guess` only map extension->mime; we need the reverse,
/// so keep an explicit table of the common document/photo/video types this
/// crate actually sees coming back from Telegram.
fn extension_from_mime(mime: &str) -> Option<&'static str> {
    Some(match mime {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "video/mp4" => "mp4",
        "video/x-matroska" => "mkv",
        "video/quicktime" => "mov",
        "audio/mpeg" => "mp3",
        "audio/ogg" => "ogg",
        "audio/wav" | "audio/x-wav" => "wav",
        "application/pdf" => "pdf",
        "application/zip" => "zip",
        "application/x-tgsticker" => "tgs",
        "text/plain" => "txt",
        _ => return None,
    })
}

fn normalize_ext(ext: &str) -> String {
    match ext.to_ascii_lowercase().as_str() {
        "jpeg" => "jpg".to_string(),
        other => other.to_string(),
    }
}

/// `MessageKind` inferred from a declared MIME type, used by the transport
/// mapper (spec §4.B "classifies each as carries-media ... or absent").
pub fn kind_from_mime(mime: &str) -> Option<MessageKind> {
    if mime.starts_with("video/") {
        Some(MessageKind::Video)
    } else if mime.starts_with("audio/") {
        Some(MessageKind::Audio)
    } else if mime == "application/x-tgsticker" {
        Some(MessageKind::Sticker)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_forbidden_characters() {
        let s = sanitize_component(r#"weird<name>:"with/bad\chars|?*"#);
        assert!(!s.contains(['<', '>', ':', '"', '/', '\\', '|', '?', '*']));
    }

    #[test]
    fn trims_whitespace_and_dots() {
        assert_eq!(sanitize_component("  ..my title..  "), "my title");
    }

    #[test]
    fn truncates_to_100_codepoints() {
        let long = "a".repeat(500);
        assert_eq!(sanitize_component(&long).chars().count(), 100);
    }

    #[test]
    fn sanitization_is_idempotent() {
        let once = sanitize_component(r#"a<b>c  .."#);
        let twice = sanitize_component(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn channel_dir_name_format() {
        assert_eq!(channel_dir_name("csdkl", "My Channel"), "@csdkl-My Channel");
    }

    fn desc(id: i32, album: Option<&str>, kind: MessageKind) -> MessageDescriptor {
        MessageDescriptor {
            id,
            album_id: album.map(String::from),
            kind,
            size_estimate: 0,
            caption: None,
            source_filename: None,
            mime_type: None,
            date: 0,
            text: String::new(),
        }
    }

    #[test]
    fn singleton_filename() {
        let d = desc(72710, None, MessageKind::Photo);
        assert_eq!(filename_for(&d), "msg-72710.jpg");
    }

    #[test]
    fn album_member_filename() {
        let d = desc(101, Some("A1"), MessageKind::Video);
        assert_eq!(filename_for(&d), "A1-101.mp4");
    }

    #[test]
    fn extension_prefers_source_filename() {
        let mut d = desc(1, None, MessageKind::Document);
        d.source_filename = Some("report.PDF".to_string());
        assert_eq!(extension_for(&d), "pdf");
    }

    #[test]
    fn extension_falls_back_to_mime_then_kind_default() {
        let mut d = desc(1, None, MessageKind::Document);
        d.mime_type = Some("video/mp4".to_string());
        assert_eq!(extension_for(&d), "mp4");

        let d2 = desc(2, None, MessageKind::Document);
        assert_eq!(extension_for(&d2), "bin");
    }
}
