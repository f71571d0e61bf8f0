//! Domain errors. Used by ports and use cases.
//!
//! Adapters map infrastructure errors into these.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Telegram gateway error: {0}")]
    TgGateway(String),

    #[error("Media download failed: {0}")]
    Media(String),

    /// Transport-level signal that the caller must wait `seconds` before
    /// retrying the exact same call. Never surfaced to the operator log;
    /// callers sleep and retry.
    #[error("rate limited: retry after {seconds} seconds")]
    RateLimited { seconds: u64 },

    /// Generic network failure, retried up to 3x with a base-1s backoff.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Session credential rejected by Telegram. The session is moved to
    /// `failed` and excluded from the rest of the run.
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    /// Chat is private/inaccessible to this session, or the operation is
    /// not permitted. The containing batch is marked invalid; the run
    /// continues.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A message returned by the transport couldn't be interpreted.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Upload failed. `album` distinguishes the two retry policies in
    /// spec §4.E / §7: albums are never retried, singles are retried once
    /// on non-rate-limit errors.
    #[error("upload failed (album={album}): {reason}")]
    UploadFailure { album: bool, reason: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    /// Operator-issued cancellation. Propagated to stop the run.
    #[error("run cancelled")]
    CoordinatorCancel,

    #[error("session pool error: {0}")]
    SessionPool(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl DomainError {
    /// True for errors that must never be retried automatically (either
    /// because the caller already waited out a rate limit, or because the
    /// failure is permanent for this item/session).
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, DomainError::RateLimited { .. })
    }
}
