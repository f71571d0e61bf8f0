//! Outbound ports. Application calls into infrastructure.
//!
//! Implemented by adapters. `TgGateway` is the sole abstraction over the
//! transport library named in spec §1/§6 — every other component works
//! against `MessageDescriptor`/`MessageKind`, never against the
//! transport's own message shape (spec §9).

use crate::domain::{Chat, DomainError, MessageDescriptor, MessageKind};
use futures_util::stream::BoxStream;
use std::path::{Path, PathBuf};

/// A chunk stream as produced by `StreamMedia` (spec §4.D "Streamed" mode).
pub type MediaChunkStream = BoxStream<'static, Result<Vec<u8>, DomainError>>;

/// One item in an outgoing `SendMediaGroup` call (spec §4.E "flushing").
pub struct UploadItem<'a> {
    pub kind: MessageKind,
    pub bytes: &'a [u8],
    pub filename: &'a str,
    /// Only the first member of an album carries a caption (spec §4.E).
    pub caption: Option<&'a str>,
}

/// Telegram MTProto transport, abstracted to exactly the operations the
/// core pipeline needs (spec §1, §6).
#[async_trait::async_trait]
pub trait TgGateway: Send + Sync {
    /// `GetChat`: called once per run for directory naming (spec §4.D, §6).
    async fn get_chat(&self, handle: &str) -> Result<Chat, DomainError>;

    /// `GetMessages`: batch lookup, ≤200 ids per call (spec §6). Returns one
    /// slot per requested id, `None` where the message doesn't exist
    /// (deleted or never existed).
    async fn get_messages(
        &self,
        channel: &str,
        ids: &[i32],
    ) -> Result<Vec<Option<MessageDescriptor>>, DomainError>;

    /// `StreamMedia`: chunk-by-chunk download, used when the item will also
    /// be handed to the uploader (spec §4.D "Streamed").
    async fn stream_media(
        &self,
        channel: &str,
        message_id: i32,
    ) -> Result<MediaChunkStream, DomainError>;

    /// `DownloadMedia`: whole-file download to `dest_path`, used in raw mode
    /// (spec §4.D "Whole-file"). Returns the final path written.
    async fn download_media(
        &self,
        channel: &str,
        message_id: i32,
        dest_path: &Path,
    ) -> Result<PathBuf, DomainError>;

    /// `SendMessage`: plain text, used for text-only singles (spec §6).
    async fn send_message(&self, target: &str, text: &str) -> Result<(), DomainError>;

    /// `SendPhoto`/`SendVideo`/`SendAudio`/`SendDocument`: kind-appropriate
    /// single-media send (spec §4.E "idle" state).
    async fn send_single_media(
        &self,
        target: &str,
        kind: MessageKind,
        bytes: &[u8],
        filename: &str,
        caption: Option<&str>,
    ) -> Result<(), DomainError>;

    /// `SendMediaGroup`: atomic album post, 2-10 items, in collection order
    /// (spec §4.E "flushing"). Never retried by the caller (spec §4.E, §7).
    async fn send_media_group(
        &self,
        target: &str,
        items: &[UploadItem<'_>],
    ) -> Result<(), DomainError>;
}
