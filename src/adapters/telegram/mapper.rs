//! Maps raw grammers TL message/media shapes into `MessageDescriptor`
//! (spec §9 "dynamic message shapes -> tagged descriptors"). Every other
//! component works against the descriptor, never against `tl::enums::*`.

use crate::domain::{Chat, MessageDescriptor, MessageKind};
use grammers_client::tl;

pub fn chat_from_channel(id: i64, title: &str, username: Option<&str>) -> Chat {
    Chat {
        id,
        title: title.to_string(),
        username: username.map(String::from),
    }
}

/// Maps one `tl::enums::Message`. Returns `None` for `Empty`/`Service`
/// variants, which the probe treats the same as an absent message.
pub fn message_to_descriptor(msg: &tl::enums::Message) -> Option<MessageDescriptor> {
    let tl::enums::Message::Message(m) = msg else {
        return None;
    };

    let album_id = m.grouped_id.map(|g| g.to_string());
    let caption = if m.message.is_empty() { None } else { Some(m.message.clone()) };

    let (kind, size_estimate, source_filename, mime_type) = match &m.media {
        Some(media) => classify_media(media),
        None => (MessageKind::Text, MessageKind::Text.default_size_estimate(), None, None),
    };

    let text = if kind == MessageKind::Text {
        m.message.clone()
    } else {
        String::new()
    };

    Some(MessageDescriptor {
        id: m.id,
        album_id,
        kind,
        size_estimate,
        caption: if kind == MessageKind::Text { None } else { caption },
        source_filename,
        mime_type,
        date: m.date as i64,
        text,
    })
}

fn classify_media(
    media: &tl::enums::MessageMedia,
) -> (MessageKind, u64, Option<String>, Option<String>) {
    match media {
        tl::enums::MessageMedia::Photo(p) => {
            let size = p
                .photo
                .as_ref()
                .and_then(photo_largest_size)
                .unwrap_or_else(|| MessageKind::Photo.default_size_estimate());
            (MessageKind::Photo, size, None, Some("image/jpeg".to_string()))
        }
        tl::enums::MessageMedia::Document(d) => match d.document.as_ref() {
            Some(tl::enums::Document::Document(doc)) => {
                let mut is_sticker = false;
                let mut is_animated = false;
                let mut video_round = None;
                let mut audio_voice = None;
                for attr in &doc.attributes {
                    match attr {
                        tl::enums::DocumentAttribute::Sticker(_) => is_sticker = true,
                        tl::enums::DocumentAttribute::Animated => is_animated = true,
                        tl::enums::DocumentAttribute::Video(v) => video_round = Some(v.round_message),
                        tl::enums::DocumentAttribute::Audio(a) => audio_voice = Some(a.voice),
                        _ => {}
                    }
                }
                let kind = kind_from_flags(is_sticker, is_animated, video_round, audio_voice, &doc.mime_type);
                let size = if doc.size > 0 {
                    doc.size as u64
                } else {
                    kind.default_size_estimate()
                };
                let filename = doc.attributes.iter().find_map(|a| match a {
                    tl::enums::DocumentAttribute::Filename(f) => Some(f.file_name.clone()),
                    _ => None,
                });
                (kind, size, filename, Some(doc.mime_type.clone()))
            }
            _ => (
                MessageKind::Document,
                MessageKind::Document.default_size_estimate(),
                None,
                None,
            ),
        },
        _ => (
            MessageKind::Document,
            MessageKind::Document.default_size_estimate(),
            None,
            None,
        ),
    }
}

fn photo_largest_size(photo: &tl::enums::Photo) -> Option<u64> {
    let tl::enums::Photo::Photo(p) = photo else { return None };
    p.sizes
        .iter()
        .filter_map(|s| match s {
            tl::enums::PhotoSize::Size(s) => Some(s.size as u64),
            tl::enums::PhotoSize::Progressive(s) => s.sizes.iter().max().map(|&v| v as u64),
            _ => None,
        })
        .max()
}

/// Precedence mirrors the source's `if hasattr(message, X)` chain: sticker,
/// round video note, voice, animation, video, audio, else generic document.
/// Pure function of the flags so it's testable without a live `tl` fixture.
fn kind_from_flags(
    is_sticker: bool,
    is_animated: bool,
    video_round: Option<bool>,
    audio_voice: Option<bool>,
    mime_type: &str,
) -> MessageKind {
    if is_sticker {
        MessageKind::Sticker
    } else if video_round == Some(true) {
        MessageKind::VideoNote
    } else if audio_voice == Some(true) {
        MessageKind::Voice
    } else if is_animated {
        MessageKind::Animation
    } else if video_round == Some(false) {
        MessageKind::Video
    } else if audio_voice == Some(false) {
        MessageKind::Audio
    } else {
        crate::domain::naming::kind_from_mime(mime_type).unwrap_or(MessageKind::Document)
    }
}
