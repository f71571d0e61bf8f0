//! Implements `TgGateway` using grammers `Client`.
//!
//! Handles FloodWait by sleeping and retrying. Uses raw invoke for GetHistory
//! (spec §6 batch lookup) and for SendMedia/SendMultiMedia (uploads, spec
//! §4.E), following the same raw-invoke idiom the history lookup already
//! used before this port.

use crate::adapters::telegram::mapper;
use crate::domain::{Chat, DomainError, MessageDescriptor, MessageKind};
use crate::ports::outbound::{MediaChunkStream, UploadItem};
use crate::ports::TgGateway;
use async_trait::async_trait;
use futures_util::stream;
use grammers_client::media::Media;
use grammers_client::peer::Peer;
use grammers_client::{tl, Client, InvocationError};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const FLOOD_WAIT_RETRIES: u32 = 3;
const UPLOAD_PART_SIZE: usize = 512 * 1024;

/// Wraps one grammers `Client` bound to a single authenticated session.
/// The pool serializes access per session, so a plain `Mutex` around the
/// handle (rather than `Arc<Mutex<_>>`, the pre-port shape) is enough.
pub struct GrammersTgGateway {
    client: Mutex<Client>,
}

impl GrammersTgGateway {
    pub fn new(client: Client) -> Self {
        Self { client: Mutex::new(client) }
    }

    /// Resolves a `@handle` to a `Peer`, preferring username resolution and
    /// falling back to a dialog scan (spec §6 "GetChat").
    async fn resolve_peer(&self, channel: &str) -> Result<Peer, DomainError> {
        let guard = self.client.lock().await;
        let username = channel.trim_start_matches('@');
        if let Some(peer) = guard
            .resolve_username(username)
            .await
            .map_err(|e| DomainError::TgGateway(e.to_string()))?
        {
            return Ok(peer);
        }

        let mut dialogs = guard.iter_dialogs();
        while let Some(dialog) = dialogs
            .next()
            .await
            .map_err(|e| DomainError::TgGateway(e.to_string()))?
        {
            let peer = dialog.peer();
            if peer.username() == Some(username) {
                return Ok(peer.clone());
            }
        }
        Err(DomainError::TgGateway(format!("channel {} not found", channel)))
    }

    async fn to_input_peer(
        &self,
        peer: &Peer,
    ) -> Result<tl::enums::InputPeer, DomainError> {
        let peer_ref = peer
            .to_ref()
            .await
            .ok_or_else(|| DomainError::TgGateway("peer not in session cache".into()))?;
        Ok(peer_ref.into())
    }

    async fn lookup_media(&self, channel: &str, message_id: i32) -> Result<Media, DomainError> {
        let peer = self.resolve_peer(channel).await?;
        let peer_ref = peer
            .to_ref()
            .await
            .ok_or_else(|| DomainError::Media("peer not in session cache".into()))?;
        let guard = self.client.lock().await;
        let messages = guard
            .get_messages_by_id(peer_ref, &[message_id])
            .await
            .map_err(|e| DomainError::Media(e.to_string()))?;
        let msg = messages
            .into_iter()
            .next()
            .flatten()
            .ok_or_else(|| DomainError::Media(format!("message {} not found", message_id)))?;
        msg.media()
            .ok_or_else(|| DomainError::Media(format!("message {} has no media", message_id)))
    }

    /// Uploads bytes part-by-part via raw `upload.SaveFilePart` and wraps
    /// the result as an `InputFile` (spec §4.E "flushing" needs this to
    /// build `InputSingleMedia`/`InputMedia` for re-upload).
    async fn upload_bytes(&self, bytes: &[u8], name: &str) -> Result<tl::enums::InputFile, DomainError> {
        let file_id = rand_id();
        let total_parts = bytes.len().div_ceil(UPLOAD_PART_SIZE).max(1) as i32;
        let guard = self.client.lock().await;
        for (part, chunk) in bytes.chunks(UPLOAD_PART_SIZE).enumerate() {
            let req = tl::functions::upload::SaveFilePart {
                file_id,
                file_part: part as i32,
                bytes: chunk.to_vec(),
            };
            guard
                .invoke(&req)
                .await
                .map_err(|e| DomainError::TgGateway(e.to_string()))?;
        }
        Ok(tl::enums::InputFile::File(tl::types::InputFile {
            id: file_id,
            parts: total_parts,
            name: name.to_string(),
            md5_checksum: String::new(),
        }))
    }
}

#[async_trait]
impl TgGateway for GrammersTgGateway {
    async fn get_chat(&self, handle: &str) -> Result<Chat, DomainError> {
        let peer = self.resolve_peer(handle).await?;
        Ok(mapper::chat_from_channel(
            peer.id().bot_api_dialog_id(),
            peer.name().unwrap_or_default(),
            peer.username(),
        ))
    }

    async fn get_messages(
        &self,
        channel: &str,
        ids: &[i32],
    ) -> Result<Vec<Option<MessageDescriptor>>, DomainError> {
        let peer = self.resolve_peer(channel).await?;
        for attempt in 0..FLOOD_WAIT_RETRIES {
            let peer_ref = peer
                .to_ref()
                .await
                .ok_or_else(|| DomainError::TgGateway("peer not in session cache".into()))?;
            let guard = self.client.lock().await;
            match guard.get_messages_by_id(peer_ref, ids).await {
                Ok(messages) => {
                    return Ok(messages
                        .into_iter()
                        .map(|opt| opt.and_then(|m| mapper::message_to_descriptor(m.raw())))
                        .collect());
                }
                Err(InvocationError::Rpc(rpc)) if rpc.code == 420 => {
                    let wait_secs = rpc.value.unwrap_or(60) as u64;
                    warn!(attempt, wait_secs, "FloodWait on GetMessages, sleeping");
                    drop(guard);
                    tokio::time::sleep(Duration::from_secs(wait_secs)).await;
                }
                Err(e) => return Err(DomainError::TgGateway(e.to_string())),
            }
        }
        Err(DomainError::RateLimited { seconds: 60 })
    }

    async fn stream_media(
        &self,
        channel: &str,
        message_id: i32,
    ) -> Result<MediaChunkStream, DomainError> {
        let media = self.lookup_media(channel, message_id).await?;
        let guard = self.client.lock().await;
        let iter = guard.iter_download(&media);
        drop(guard);
        let s = stream::unfold(iter, |mut iter| async move {
            match iter.next().await {
                Ok(Some(chunk)) => Some((Ok(chunk), iter)),
                Ok(None) => None,
                Err(InvocationError::Rpc(rpc)) if rpc.code == 420 => {
                    let wait_secs = rpc.value.unwrap_or(60);
                    Some((Err(DomainError::RateLimited { seconds: wait_secs as u64 }), iter))
                }
                Err(e) => Some((Err(DomainError::TgGateway(e.to_string())), iter)),
            }
        });
        Ok(Box::pin(s))
    }

    async fn download_media(
        &self,
        channel: &str,
        message_id: i32,
        dest_path: &Path,
    ) -> Result<PathBuf, DomainError> {
        let media = self.lookup_media(channel, message_id).await?;
        let guard = self.client.lock().await;
        guard
            .download_media(&media, dest_path)
            .await
            .map_err(|e| DomainError::Media(e.to_string()))?;
        debug!(channel, message_id, path = %dest_path.display(), "media downloaded");
        Ok(dest_path.to_path_buf())
    }

    async fn send_message(&self, target: &str, text: &str) -> Result<(), DomainError> {
        let peer = self.resolve_peer(target).await?;
        let input_peer = self.to_input_peer(&peer).await?;
        let guard = self.client.lock().await;
        let req = tl::functions::messages::SendMessage {
            no_webpage: false,
            silent: false,
            background: false,
            clear_draft: false,
            noforwards: false,
            update_stickersets_order: false,
            invert_media: false,
            allow_paid_floodskip: false,
            peer: input_peer,
            reply_to: None,
            message: text.to_string(),
            random_id: rand_id(),
            reply_markup: None,
            entities: None,
            schedule_date: None,
            schedule_repeat_period: None,
            send_as: None,
            quick_reply_shortcut: None,
            effect: None,
            allow_paid_stars: None,
            suggested_post: None,
            rich_message: None,
        };
        guard
            .invoke(&req)
            .await
            .map_err(|e| DomainError::TgGateway(e.to_string()))?;
        Ok(())
    }

    async fn send_single_media(
        &self,
        target: &str,
        kind: MessageKind,
        bytes: &[u8],
        filename: &str,
        caption: Option<&str>,
    ) -> Result<(), DomainError> {
        let input_file = self.upload_bytes(bytes, filename).await?;
        let media = input_media_for(kind, input_file, filename);
        let peer = self.resolve_peer(target).await?;
        let input_peer = self.to_input_peer(&peer).await?;
        let guard = self.client.lock().await;
        let req = tl::functions::messages::SendMedia {
            silent: false,
            background: false,
            clear_draft: false,
            noforwards: false,
            update_stickersets_order: false,
            invert_media: false,
            allow_paid_floodskip: false,
            peer: input_peer,
            reply_to: None,
            media,
            message: caption.unwrap_or_default().to_string(),
            random_id: rand_id(),
            reply_markup: None,
            entities: None,
            schedule_date: None,
            schedule_repeat_period: None,
            send_as: None,
            quick_reply_shortcut: None,
            effect: None,
            allow_paid_stars: None,
            suggested_post: None,
        };
        guard
            .invoke(&req)
            .await
            .map_err(|e| DomainError::TgGateway(e.to_string()))?;
        Ok(())
    }

    async fn send_media_group(
        &self,
        target: &str,
        items: &[UploadItem<'_>],
    ) -> Result<(), DomainError> {
        let mut multi = Vec::with_capacity(items.len());
        for item in items {
            let input_file = self.upload_bytes(item.bytes, item.filename).await?;
            let media = input_media_for(item.kind, input_file, item.filename);
            multi.push(tl::enums::InputSingleMedia::Media(tl::types::InputSingleMedia {
                media,
                random_id: rand_id(),
                message: item.caption.unwrap_or_default().to_string(),
                entities: None,
            }));
        }

        let peer = self.resolve_peer(target).await?;
        let input_peer = self.to_input_peer(&peer).await?;
        let guard = self.client.lock().await;
        let req = tl::functions::messages::SendMultiMedia {
            silent: false,
            background: false,
            clear_draft: false,
            noforwards: false,
            update_stickersets_order: false,
            invert_media: false,
            allow_paid_floodskip: false,
            peer: input_peer,
            reply_to: None,
            multi_media: multi,
            schedule_date: None,
            send_as: None,
            quick_reply_shortcut: None,
            effect: None,
            allow_paid_stars: None,
        };
        guard
            .invoke(&req)
            .await
            .map_err(|e| DomainError::TgGateway(e.to_string()))?;
        Ok(())
    }
}

fn input_media_for(kind: MessageKind, file: tl::enums::InputFile, filename: &str) -> tl::enums::InputMedia {
    if kind == MessageKind::Photo {
        tl::enums::InputMedia::UploadedPhoto(tl::types::InputMediaUploadedPhoto {
            file,
            stickers: None,
            ttl_seconds: None,
            spoiler: false,
            live_photo: false,
            video: None,
        })
    } else {
        tl::enums::InputMedia::UploadedDocument(tl::types::InputMediaUploadedDocument {
            nosound_video: false,
            force_file: false,
            file,
            thumb: None,
            mime_type: kind.default_mime().to_string(),
            attributes: vec![tl::enums::DocumentAttribute::Filename(
                tl::types::DocumentAttributeFilename { file_name: filename.to_string() },
            )],
            stickers: None,
            ttl_seconds: None,
            spoiler: false,
            video_cover: None,
            video_timestamp: None,
        })
    }
}

/// Client-generated id Telegram uses to dedupe retried sends. Collisions
/// are inconsequential here since albums are never retried (spec §4.E).
fn rand_id() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
