//! Uploader (spec §4.E). Single consumer draining the fetchers' shared
//! queue, re-emitting fetched media to the target channel while preserving
//! album grouping.
//!
//! The source keeps a `current_media_group_id` field plus a cache dict —
//! effectively a pair of optional fields standing in for a state machine.
//! Replaced here with an explicit three-state enum (spec §9 "uploader state
//! machine as enum, not optional-field pair").

use crate::domain::{DomainError, FetchedItem, MediaPayload};
use crate::domain::naming;
use crate::ports::{TgGateway, UploadItem};
use crate::usecases::fetcher::UploadMessage;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Any buffered album older than this is swept and discarded even without a
/// boundary-changing item arriving (supplements the source's
/// `cleanup_expired_media_groups`, which used the same 5-minute window).
const STALE_ALBUM_TIMEOUT: Duration = Duration::from_secs(300);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const MAX_ALBUM_SIZE: usize = 10;

enum UploaderState {
    Idle,
    Buffering { album_id: String, collected: Vec<FetchedItem>, started_at: Instant },
}

#[derive(Debug, Clone, Default)]
pub struct UploadStats {
    pub albums_uploaded: usize,
    pub singles_uploaded: usize,
    pub failed: usize,
}

pub struct UploaderConfig {
    pub target: String,
    pub preserve_captions: bool,
    pub preserve_media_groups: bool,
    pub upload_delay: Duration,
}

pub async fn run_uploader(
    gateway: &dyn TgGateway,
    cfg: &UploaderConfig,
    mut rx: mpsc::Receiver<UploadMessage>,
) -> UploadStats {
    let mut state = UploaderState::Idle;
    let mut stats = UploadStats::default();
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);

    loop {
        tokio::select! {
            biased;
            msg = rx.recv() => {
                match msg {
                    None | Some(UploadMessage::Shutdown) => {
                        flush_if_buffering(gateway, cfg, &mut state, &mut stats).await;
                        break;
                    }
                    Some(UploadMessage::Item(item)) => {
                        handle_item(gateway, cfg, &mut state, &mut stats, item).await;
                    }
                }
            }
            _ = sweep.tick() => {
                sweep_stale(gateway, cfg, &mut state, &mut stats).await;
            }
        }
    }

    stats
}

async fn handle_item(
    gateway: &dyn TgGateway,
    cfg: &UploaderConfig,
    state: &mut UploaderState,
    stats: &mut UploadStats,
    item: FetchedItem,
) {
    let is_album_member = cfg.preserve_media_groups && item.descriptor.is_album_member();

    if !is_album_member {
        if let UploaderState::Buffering { album_id, collected, .. } = state {
            flush_album(gateway, cfg, album_id.clone(), std::mem::take(collected), stats).await;
            *state = UploaderState::Idle;
        }
        send_singleton(gateway, cfg, item, stats).await;
        return;
    }

    let album_id = item.descriptor.album_id.clone().unwrap();

    match state {
        UploaderState::Buffering { album_id: current, collected, .. } if *current == album_id => {
            collected.push(item);
            if collected.len() >= MAX_ALBUM_SIZE {
                let (id, members) = (current.clone(), std::mem::take(collected));
                flush_album(gateway, cfg, id, members, stats).await;
                *state = UploaderState::Idle;
            }
        }
        UploaderState::Buffering { album_id: current, collected, .. } => {
            let (id, members) = (current.clone(), std::mem::take(collected));
            flush_album(gateway, cfg, id, members, stats).await;
            *state = UploaderState::Buffering {
                album_id,
                collected: vec![item],
                started_at: Instant::now(),
            };
        }
        UploaderState::Idle => {
            *state = UploaderState::Buffering {
                album_id,
                collected: vec![item],
                started_at: Instant::now(),
            };
        }
    }
}

async fn flush_if_buffering(
    gateway: &dyn TgGateway,
    cfg: &UploaderConfig,
    state: &mut UploaderState,
    stats: &mut UploadStats,
) {
    if let UploaderState::Buffering { album_id, collected, .. } =
        std::mem::replace(state, UploaderState::Idle)
    {
        flush_album(gateway, cfg, album_id, collected, stats).await;
    }
}

async fn sweep_stale(
    gateway: &dyn TgGateway,
    cfg: &UploaderConfig,
    state: &mut UploaderState,
    stats: &mut UploadStats,
) {
    if let UploaderState::Buffering { started_at, .. } = state {
        if started_at.elapsed() > STALE_ALBUM_TIMEOUT {
            if let UploaderState::Buffering { album_id, collected, .. } =
                std::mem::replace(state, UploaderState::Idle)
            {
                warn!(album_id = %album_id, "sweeping stale buffered album");
                flush_album(gateway, cfg, album_id, collected, stats).await;
            }
        }
    }
}

/// Invokes `SendMediaGroup` once. Never retried — a retried album send can
/// double-post (spec §4.E "idempotence caveat").
async fn flush_album(
    gateway: &dyn TgGateway,
    cfg: &UploaderConfig,
    album_id: String,
    members: Vec<FetchedItem>,
    stats: &mut UploadStats,
) {
    if members.is_empty() {
        return;
    }
    let bytes = match load_all(&members).await {
        Ok(b) => b,
        Err(e) => {
            warn!(album_id = %album_id, error = %e, "failed to materialize album payloads, dropping");
            stats.failed += members.len();
            return;
        }
    };
    let filenames: Vec<String> = members.iter().map(|m| naming::filename_for(&m.descriptor)).collect();
    let items: Vec<UploadItem<'_>> = members
        .iter()
        .zip(bytes.iter())
        .zip(filenames.iter())
        .enumerate()
        .map(|(i, ((m, b), f))| UploadItem {
            kind: m.descriptor.kind,
            bytes: b.as_slice(),
            filename: f.as_str(),
            caption: if i == 0 && cfg.preserve_captions {
                m.descriptor.caption.as_deref()
            } else {
                None
            },
        })
        .collect();

    match gateway.send_media_group(&cfg.target, &items).await {
        Ok(()) => {
            stats.albums_uploaded += 1;
            info!(album_id = %album_id, members = members.len(), "album uploaded");
        }
        Err(e) => {
            stats.failed += members.len();
            warn!(album_id = %album_id, error = %e, "album upload failed, not retried");
        }
    }
}

async fn send_singleton(gateway: &dyn TgGateway, cfg: &UploaderConfig, item: FetchedItem, stats: &mut UploadStats) {
    let filename = naming::filename_for(&item.descriptor);
    let bytes = match load_one(&item).await {
        Ok(b) => b,
        Err(e) => {
            warn!(id = item.descriptor.id, error = %e, "failed to materialize payload, dropping");
            stats.failed += 1;
            return;
        }
    };
    let caption = if cfg.preserve_captions {
        item.descriptor.caption.as_deref()
    } else {
        None
    };

    let mut retried = false;
    loop {
        match gateway
            .send_single_media(&cfg.target, item.descriptor.kind, &bytes, &filename, caption)
            .await
        {
            Ok(()) => {
                stats.singles_uploaded += 1;
                tokio::time::sleep(cfg.upload_delay).await;
                return;
            }
            Err(DomainError::RateLimited { seconds }) => {
                tokio::time::sleep(Duration::from_secs(seconds)).await;
                // rate limits are waited out, never charged against the retry budget
            }
            Err(e) if !retried => {
                retried = true;
                warn!(id = item.descriptor.id, error = %e, "retrying single upload once");
            }
            Err(e) => {
                stats.failed += 1;
                warn!(id = item.descriptor.id, error = %e, "single upload failed");
                return;
            }
        }
    }
}

async fn load_one(item: &FetchedItem) -> Result<Vec<u8>, DomainError> {
    match &item.payload {
        MediaPayload::InMemory(bytes) => Ok(bytes.clone()),
        MediaPayload::OnDisk(path) => tokio::fs::read(path)
            .await
            .map_err(|e| DomainError::Filesystem(e.to_string())),
    }
}

async fn load_all(items: &[FetchedItem]) -> Result<Vec<Vec<u8>>, DomainError> {
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        out.push(load_one(item).await?);
    }
    Ok(out)
}
