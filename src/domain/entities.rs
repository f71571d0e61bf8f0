//! Domain entities. Pure data structures for the core business.
//!
//! No Telegram/IO types here — these are mapped from adapters.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Channel metadata, fetched once per run via `GetChat` (spec §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: i64,
    pub title: String,
    pub username: Option<String>,
}

/// Closed set of media shapes the transport adapter can branch on. Every
/// other component works against this enum, never against raw transport
/// message objects (spec §9, "dynamic message shapes → tagged descriptors").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Photo,
    Video,
    Audio,
    Voice,
    VideoNote,
    Animation,
    Document,
    Sticker,
    Text,
}

impl MessageKind {
    /// Per-kind constant used when the transport doesn't declare `file_size`
    /// (spec §3).
    pub fn default_size_estimate(self) -> u64 {
        const MIB: u64 = 1024 * 1024;
        const KIB: u64 = 1024;
        match self {
            MessageKind::Photo => 3 * MIB,
            MessageKind::Video => 37 * MIB,
            MessageKind::Audio => 5 * MIB,
            MessageKind::Document => 10 * MIB,
            MessageKind::Voice => MIB,
            MessageKind::Animation => 3 * MIB,
            MessageKind::VideoNote => MIB,
            MessageKind::Sticker => MIB,
            MessageKind::Text => KIB,
        }
    }

    pub fn is_downloadable(self) -> bool {
        !matches!(self, MessageKind::Text)
    }

    /// Kind-default filename extension, used when neither the source
    /// filename nor a MIME mapping produced one.
    pub fn default_extension(self) -> &'static str {
        match self {
            MessageKind::Photo => "jpg",
            MessageKind::Video => "mp4",
            MessageKind::Audio => "mp3",
            MessageKind::Voice => "ogg",
            MessageKind::VideoNote => "mp4",
            MessageKind::Animation => "gif",
            MessageKind::Document => "bin",
            MessageKind::Sticker => "webp",
            MessageKind::Text => "txt",
        }
    }

    /// MIME type used when re-uploading and the source didn't declare one
    /// (spec §4.E; photos go through `InputMediaUploadedPhoto` instead).
    pub fn default_mime(self) -> &'static str {
        match self {
            MessageKind::Photo => "image/jpeg",
            MessageKind::Video => "video/mp4",
            MessageKind::Audio => "audio/mpeg",
            MessageKind::Voice => "audio/ogg",
            MessageKind::VideoNote => "video/mp4",
            MessageKind::Animation => "video/mp4",
            MessageKind::Document => "application/octet-stream",
            MessageKind::Sticker => "application/x-tgsticker",
            MessageKind::Text => "text/plain",
        }
    }
}

/// Immutable message descriptor produced by the probe (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDescriptor {
    pub id: i32,
    pub album_id: Option<String>,
    pub kind: MessageKind,
    pub size_estimate: u64,
    pub caption: Option<String>,
    /// Source filename, if the transport declared one (documents mostly).
    pub source_filename: Option<String>,
    /// MIME type, if the transport declared one.
    pub mime_type: Option<String>,
    pub date: i64,
    pub text: String,
}

impl MessageDescriptor {
    pub fn is_album_member(&self) -> bool {
        self.album_id.is_some()
    }
}

/// A unit of assignment: either a real album (possibly a split sub-group)
/// or a synthetic singleton group (spec §3).
#[derive(Debug, Clone)]
pub struct Group {
    /// `<album_id>` for a whole album, `<album_id>_part_<n>` for an
    /// oversized-album sub-group, or `single:<id>` for a singleton.
    pub group_id: String,
    pub members: Vec<MessageDescriptor>,
    pub is_album: bool,
}

impl Group {
    pub fn file_count(&self) -> usize {
        self.members
            .iter()
            .filter(|m| m.kind.is_downloadable())
            .count()
    }

    pub fn message_count(&self) -> usize {
        self.members.len()
    }

    pub fn estimated_size(&self) -> u64 {
        self.members.iter().map(|m| m.size_estimate).sum()
    }

    /// The `album_id` this group's members should be re-uploaded under, if
    /// any. Distinct from `group_id`: a split sub-group keeps its parent's
    /// `album_id` (spec §3) even though its `group_id` is suffixed.
    pub fn album_id(&self) -> Option<&str> {
        if self.is_album {
            self.members.first().and_then(|m| m.album_id.as_deref())
        } else {
            None
        }
    }

    pub fn min_id(&self) -> Option<i32> {
        self.members.iter().map(|m| m.id).min()
    }

    pub fn max_id(&self) -> Option<i32> {
        self.members.iter().map(|m| m.id).max()
    }
}

/// Session lifecycle state (spec §3, §4.A).
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Offline,
    Connecting,
    Online,
    RateLimitedUntil(chrono::DateTime<chrono::Utc>),
    Failed(String),
}

impl SessionState {
    pub fn is_online(&self) -> bool {
        matches!(
            self,
            SessionState::Online | SessionState::RateLimitedUntil(_)
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SessionState::Failed(_))
    }
}

/// Session descriptor tracked by the pool (spec §3).
#[derive(Debug, Clone)]
pub struct SessionDescriptor {
    pub name: String,
    pub state: SessionState,
}

/// Distributor output: which session owns which groups, in assignment
/// order (spec §3, §4.C).
#[derive(Debug, Clone, Default)]
pub struct Assignment {
    pub per_session: Vec<(String, Vec<Group>)>,
}

impl Assignment {
    pub fn groups_for(&self, session: &str) -> Option<&[Group]> {
        self.per_session
            .iter()
            .find(|(name, _)| name == session)
            .map(|(_, groups)| groups.as_slice())
    }

    pub fn total_groups(&self) -> usize {
        self.per_session.iter().map(|(_, g)| g.len()).sum()
    }

    pub fn total_valid_ids(&self) -> usize {
        self.per_session
            .iter()
            .flat_map(|(_, groups)| groups.iter())
            .map(|g| g.message_count())
            .sum()
    }
}

/// Per-session load/coverage report for operator logging (spec §4.C).
#[derive(Debug, Clone, Default)]
pub struct BalanceReport {
    pub per_session_file_counts: Vec<(String, usize)>,
    pub min: usize,
    pub max: usize,
    pub mean: f64,
}

/// Where a fetched item's bytes currently live (spec §3).
#[derive(Debug, Clone)]
pub enum MediaPayload {
    InMemory(Vec<u8>),
    OnDisk(PathBuf),
}

/// Flows fetcher -> uploader (spec §3). Ownership: the fetcher produces it
/// and hands it to the uploader queue; the uploader owns it from there.
#[derive(Debug, Clone)]
pub struct FetchedItem {
    pub descriptor: MessageDescriptor,
    pub payload: MediaPayload,
    pub origin_session: String,
}

/// End-of-run summary (spec §7 "user-visible reporting").
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub downloaded: usize,
    pub failed: usize,
    pub albums_uploaded: usize,
    pub singles_uploaded: usize,
    pub per_session: Vec<SessionReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub name: String,
    pub downloaded: usize,
    pub failed: usize,
    pub min_id: Option<i32>,
    pub max_id: Option<i32>,
}
