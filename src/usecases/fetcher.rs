//! Fetcher (spec §4.D). One instance per online session, run concurrently
//! with its siblings; internally strictly sequential.

use crate::domain::{naming, DomainError, FetchedItem, Group, MediaPayload};
use crate::ports::TgGateway;
use crate::shared::config::StorageMode;
use crate::usecases::session_pool::SessionPool;
use chrono::{TimeZone, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One item ready for the uploader, or the end-of-run sentinel (spec §4.E
/// "shutdown"). A single shared queue, not one per session (spec §4.E).
pub enum UploadMessage {
    Item(FetchedItem),
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct FetchProgress {
    pub session: String,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub downloaded: usize,
    pub failed: usize,
    pub duration: Duration,
    pub min_id: Option<i32>,
    pub max_id: Option<i32>,
}

pub struct FetcherConfig {
    pub channel: String,
    pub channel_dir: PathBuf,
    pub batch_size: usize,
    pub storage_mode: StorageMode,
}

const TRANSIENT_RETRIES: u32 = 3;
const TRANSIENT_BASE_DELAY: Duration = Duration::from_secs(1);
const INTER_BATCH_DELAY: Duration = Duration::from_millis(100);

/// Runs one session's assignment to completion. Never returns early on a
/// per-item failure; only an inability to create the channel directory
/// would (that's checked by the coordinator before any fetcher starts).
///
/// Stops at the next suspension point once `cancel` fires (spec §5): the
/// batch in flight finishes, then no further batch or item is started. The
/// partial outcome is still returned so the coordinator can log it before
/// propagating `CoordinatorCancel`.
pub async fn run_fetcher(
    session_name: &str,
    gateway: &dyn TgGateway,
    pool: &SessionPool,
    groups: &[Group],
    cfg: &FetcherConfig,
    upload_tx: Option<&mpsc::Sender<UploadMessage>>,
    progress_tx: Option<&mpsc::Sender<FetchProgress>>,
    cancel: &CancellationToken,
) -> Result<FetchOutcome, DomainError> {
    let started = Instant::now();
    let ids: Vec<i32> = groups
        .iter()
        .flat_map(|g| g.members.iter().map(|m| m.id))
        .collect();

    let mut outcome = FetchOutcome::default();
    if !ids.is_empty() {
        outcome.min_id = ids.iter().copied().min();
        outcome.max_id = ids.iter().copied().max();
    }

    for (batch_index, batch) in ids.chunks(cfg.batch_size.max(1)).enumerate() {
        if cancel.is_cancelled() {
            info!(session = session_name, "cancellation requested, stopping fetcher");
            break;
        }

        let mut succeeded = 0usize;
        let mut failed = 0usize;

        let messages = match fetch_batch_with_rate_limit_retry(gateway, pool, session_name, &cfg.channel, batch).await {
            Ok(messages) => messages,
            Err(e) => {
                // Mirrors probe.rs's probe_batch: a non-rate-limited batch
                // error marks its ids failed instead of aborting the run
                // (spec §7 propagation policy, §8 invariant #6).
                warn!(
                    session = session_name,
                    first = batch.first(),
                    last = batch.last(),
                    error = %e,
                    "batch fetch failed, marking ids failed"
                );
                vec![None; batch.len()]
            }
        };

        for (id, message) in batch.iter().zip(messages.into_iter()) {
            if cancel.is_cancelled() {
                info!(session = session_name, "cancellation requested, stopping mid-batch");
                break;
            }
            match message {
                None => {
                    warn!(session = session_name, id, "message missing at fetch time");
                    failed += 1;
                }
                Some(desc) if !desc.kind.is_downloadable() => {
                    if let Err(e) = append_text_line(&cfg.channel_dir, &desc).await {
                        warn!(session = session_name, id, error = %e, "failed to append text line");
                        failed += 1;
                    } else {
                        succeeded += 1;
                    }
                }
                Some(desc) => {
                    let filename = naming::filename_for(&desc);
                    let dest_path = cfg.channel_dir.join(&filename);
                    let needs_upload = cfg.storage_mode.uploads();

                    let payload_result = if needs_upload {
                        fetch_streamed(
                            gateway,
                            pool,
                            session_name,
                            &cfg.channel,
                            desc.id,
                            &dest_path,
                            cfg.storage_mode,
                        )
                        .await
                    } else {
                        fetch_whole_file(gateway, pool, session_name, &cfg.channel, desc.id, &dest_path)
                            .await
                            .map(MediaPayload::OnDisk)
                    };

                    match payload_result {
                        Ok(payload) => {
                            succeeded += 1;
                            if let Some(tx) = upload_tx {
                                let item = FetchedItem {
                                    descriptor: desc,
                                    payload,
                                    origin_session: session_name.to_string(),
                                };
                                if tx.send(UploadMessage::Item(item)).await.is_err() {
                                    warn!(session = session_name, "upload queue closed");
                                }
                            }
                        }
                        Err(e) => {
                            warn!(session = session_name, id, error = %e, "download failed");
                            failed += 1;
                        }
                    }
                }
            }
        }

        outcome.downloaded += succeeded;
        outcome.failed += failed;

        if let Some(tx) = progress_tx {
            let _ = tx
                .send(FetchProgress {
                    session: session_name.to_string(),
                    processed: batch.len(),
                    succeeded,
                    failed,
                })
                .await;
        }
        debug!(session = session_name, batch = batch_index, succeeded, failed, "batch complete");

        if !cancel.is_cancelled() && batch_index + 1 < ids.len().div_ceil(cfg.batch_size.max(1)) {
            tokio::time::sleep(INTER_BATCH_DELAY).await;
        }
    }

    outcome.duration = started.elapsed();
    Ok(outcome)
}

async fn fetch_batch_with_rate_limit_retry(
    gateway: &dyn TgGateway,
    pool: &SessionPool,
    session_name: &str,
    channel: &str,
    batch: &[i32],
) -> Result<Vec<Option<crate::domain::MessageDescriptor>>, DomainError> {
    loop {
        match gateway.get_messages(channel, batch).await {
            Err(DomainError::RateLimited { seconds }) => {
                pool.mark_rate_limited(session_name, seconds).await;
                tokio::time::sleep(Duration::from_secs(seconds)).await;
            }
            other => return other,
        }
    }
}

async fn fetch_streamed(
    gateway: &dyn TgGateway,
    pool: &SessionPool,
    session_name: &str,
    channel: &str,
    message_id: i32,
    dest_path: &std::path::Path,
    storage_mode: StorageMode,
) -> Result<MediaPayload, DomainError> {
    use futures_util::StreamExt;

    loop {
        let mut stream = match gateway.stream_media(channel, message_id).await {
            Err(DomainError::RateLimited { seconds }) => {
                pool.mark_rate_limited(session_name, seconds).await;
                tokio::time::sleep(Duration::from_secs(seconds)).await;
                continue;
            }
            Err(e) => return Err(e),
            Ok(s) => s,
        };

        let to_disk = storage_mode == StorageMode::Hybrid;
        let mut file = if to_disk {
            Some(
                tokio::fs::File::create(dest_path)
                    .await
                    .map_err(|e| DomainError::Filesystem(e.to_string()))?,
            )
        } else {
            None
        };
        let mut buffer = Vec::new();

        let mut stream_err = None;
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    if let Some(f) = file.as_mut() {
                        if let Err(e) = f.write_all(&bytes).await {
                            stream_err = Some(DomainError::Filesystem(e.to_string()));
                            break;
                        }
                    } else {
                        buffer.extend_from_slice(&bytes);
                    }
                }
                Err(DomainError::RateLimited { seconds }) => {
                    pool.mark_rate_limited(session_name, seconds).await;
                    tokio::time::sleep(Duration::from_secs(seconds)).await;
                    stream_err = Some(DomainError::RateLimited { seconds });
                    break;
                }
                Err(e) => {
                    stream_err = Some(e);
                    break;
                }
            }
        }

        if let Some(err) = stream_err {
            if to_disk {
                let _ = tokio::fs::remove_file(dest_path).await;
            }
            if err.is_rate_limited() {
                continue;
            }
            return Err(err);
        }

        if let Some(mut f) = file {
            f.flush().await.map_err(|e| DomainError::Filesystem(e.to_string()))?;
            return Ok(MediaPayload::OnDisk(dest_path.to_path_buf()));
        }
        return Ok(MediaPayload::InMemory(buffer));
    }
}

async fn fetch_whole_file(
    gateway: &dyn TgGateway,
    pool: &SessionPool,
    session_name: &str,
    channel: &str,
    message_id: i32,
    dest_path: &std::path::Path,
) -> Result<PathBuf, DomainError> {
    let mut attempt = 0;
    loop {
        match gateway.download_media(channel, message_id, dest_path).await {
            Ok(path) => return Ok(path),
            Err(DomainError::RateLimited { seconds }) => {
                pool.mark_rate_limited(session_name, seconds).await;
                tokio::time::sleep(Duration::from_secs(seconds)).await;
            }
            Err(e) if attempt < TRANSIENT_RETRIES => {
                attempt += 1;
                warn!(session = session_name, message_id, attempt, error = %e, "retrying download");
                tokio::time::sleep(TRANSIENT_BASE_DELAY * 2u32.pow(attempt - 1)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn append_text_line(
    channel_dir: &std::path::Path,
    desc: &crate::domain::MessageDescriptor,
) -> Result<(), DomainError> {
    let path = channel_dir.join("messages.txt");
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .map_err(|e| DomainError::Filesystem(e.to_string()))?;
    let timestamp = Utc
        .timestamp_opt(desc.date, 0)
        .single()
        .unwrap_or_else(Utc::now);
    let mut block = match &desc.album_id {
        Some(album_id) => format!("消息ID: {} (媒体组: {})\n", desc.id, album_id),
        None => format!("消息ID: {}\n", desc.id),
    };
    block.push_str(&format!("时间: {}\n", timestamp.to_rfc3339()));
    let content = if desc.text.is_empty() { "无文本内容" } else { &desc.text };
    block.push_str(&format!("内容: {}\n", content));
    block.push_str(&"-".repeat(50));
    block.push('\n');
    file.write_all(block.as_bytes())
        .await
        .map_err(|e| DomainError::Filesystem(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Chat, MessageDescriptor, MessageKind};
    use crate::ports::{MediaChunkStream, UploadItem};
    use futures_util::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakeGateway {
        get_messages_calls: AtomicUsize,
        batches: Mutex<Vec<Vec<Option<MessageDescriptor>>>>,
    }

    #[async_trait::async_trait]
    impl TgGateway for FakeGateway {
        async fn get_chat(&self, _handle: &str) -> Result<Chat, DomainError> {
            unimplemented!()
        }
        async fn get_messages(
            &self,
            _channel: &str,
            _ids: &[i32],
        ) -> Result<Vec<Option<MessageDescriptor>>, DomainError> {
            self.get_messages_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.batches.lock().unwrap().remove(0))
        }
        async fn stream_media(
            &self,
            _channel: &str,
            _message_id: i32,
        ) -> Result<MediaChunkStream, DomainError> {
            Ok(Box::pin(stream::iter(vec![Ok(vec![1, 2, 3])])))
        }
        async fn download_media(
            &self,
            _channel: &str,
            _message_id: i32,
            dest_path: &std::path::Path,
        ) -> Result<PathBuf, DomainError> {
            Ok(dest_path.to_path_buf())
        }
        async fn send_message(&self, _target: &str, _text: &str) -> Result<(), DomainError> {
            unimplemented!()
        }
        async fn send_single_media(
            &self,
            _target: &str,
            _kind: MessageKind,
            _bytes: &[u8],
            _filename: &str,
            _caption: Option<&str>,
        ) -> Result<(), DomainError> {
            unimplemented!()
        }
        async fn send_media_group(
            &self,
            _target: &str,
            _items: &[UploadItem<'_>],
        ) -> Result<(), DomainError> {
            unimplemented!()
        }
    }

    fn photo_desc(id: i32) -> MessageDescriptor {
        MessageDescriptor {
            id,
            album_id: None,
            kind: MessageKind::Photo,
            size_estimate: 100,
            caption: None,
            source_filename: None,
            mime_type: None,
            date: 1_700_000_000,
            text: String::new(),
        }
    }

    fn text_desc(id: i32) -> MessageDescriptor {
        MessageDescriptor {
            id,
            album_id: None,
            kind: MessageKind::Text,
            size_estimate: 10,
            caption: None,
            source_filename: None,
            mime_type: None,
            date: 1_700_000_000,
            text: "hi there".into(),
        }
    }

    fn group(members: Vec<MessageDescriptor>) -> Group {
        Group {
            group_id: "g".into(),
            is_album: false,
            members,
        }
    }

    #[tokio::test]
    async fn raw_mode_downloads_media_and_appends_text() {
        let dir = tempdir();
        let gw = FakeGateway {
            get_messages_calls: AtomicUsize::new(0),
            batches: Mutex::new(vec![vec![Some(photo_desc(1)), Some(text_desc(2))]]),
        };
        let pool = SessionPool::spawn(vec![]);
        let cfg = FetcherConfig {
            channel: "@chan".into(),
            channel_dir: dir.clone(),
            batch_size: 50,
            storage_mode: StorageMode::Raw,
        };
        let groups = vec![group(vec![photo_desc(1), text_desc(2)])];
        let outcome = run_fetcher("s1", &gw, &pool, &groups, &cfg, None, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.downloaded, 2);
        assert_eq!(outcome.failed, 0);
        let contents = std::fs::read_to_string(dir.join("messages.txt")).unwrap();
        let expected = format!(
            "消息ID: 2\n时间: {}\n内容: hi there\n{}\n",
            chrono::Utc.timestamp_opt(1_700_000_000, 0).unwrap().to_rfc3339(),
            "-".repeat(50)
        );
        assert_eq!(contents, expected);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn text_message_with_empty_body_uses_placeholder() {
        let dir = tempdir();
        let mut empty = text_desc(5);
        empty.text = String::new();
        let gw = FakeGateway {
            get_messages_calls: AtomicUsize::new(0),
            batches: Mutex::new(vec![vec![Some(empty)]]),
        };
        let pool = SessionPool::spawn(vec![]);
        let cfg = FetcherConfig {
            channel: "@chan".into(),
            channel_dir: dir.clone(),
            batch_size: 50,
            storage_mode: StorageMode::Raw,
        };
        let groups = vec![group(vec![text_desc(5)])];
        run_fetcher("s1", &gw, &pool, &groups, &cfg, None, None, &CancellationToken::new())
            .await
            .unwrap();
        let contents = std::fs::read_to_string(dir.join("messages.txt")).unwrap();
        assert!(contents.contains("内容: 无文本内容\n"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn album_member_text_message_includes_album_suffix() {
        let dir = tempdir();
        let mut member = text_desc(7);
        member.album_id = Some("A1".into());
        let gw = FakeGateway {
            get_messages_calls: AtomicUsize::new(0),
            batches: Mutex::new(vec![vec![Some(member.clone())]]),
        };
        let pool = SessionPool::spawn(vec![]);
        let cfg = FetcherConfig {
            channel: "@chan".into(),
            channel_dir: dir.clone(),
            batch_size: 50,
            storage_mode: StorageMode::Raw,
        };
        let groups = vec![group(vec![member])];
        run_fetcher("s1", &gw, &pool, &groups, &cfg, None, None, &CancellationToken::new())
            .await
            .unwrap();
        let contents = std::fs::read_to_string(dir.join("messages.txt")).unwrap();
        assert!(contents.starts_with("消息ID: 7 (媒体组: A1)\n"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn upload_mode_streams_into_memory_and_enqueues() {
        let dir = tempdir();
        let gw = FakeGateway {
            get_messages_calls: AtomicUsize::new(0),
            batches: Mutex::new(vec![vec![Some(photo_desc(1))]]),
        };
        let pool = SessionPool::spawn(vec![]);
        let cfg = FetcherConfig {
            channel: "@chan".into(),
            channel_dir: dir.clone(),
            batch_size: 50,
            storage_mode: StorageMode::Upload,
        };
        let groups = vec![group(vec![photo_desc(1)])];
        let (tx, mut rx) = mpsc::channel(10);
        let outcome = run_fetcher("s1", &gw, &pool, &groups, &cfg, Some(&tx), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.downloaded, 1);
        match rx.recv().await.unwrap() {
            UploadMessage::Item(item) => assert!(matches!(item.payload, MediaPayload::InMemory(_))),
            UploadMessage::Shutdown => panic!("expected item"),
        }
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn missing_message_counts_as_failed_without_aborting() {
        let dir = tempdir();
        let gw = FakeGateway {
            get_messages_calls: AtomicUsize::new(0),
            batches: Mutex::new(vec![vec![None, Some(photo_desc(2))]]),
        };
        let pool = SessionPool::spawn(vec![]);
        let cfg = FetcherConfig {
            channel: "@chan".into(),
            channel_dir: dir.clone(),
            batch_size: 50,
            storage_mode: StorageMode::Raw,
        };
        let groups = vec![group(vec![photo_desc(1), photo_desc(2)])];
        let outcome = run_fetcher("s1", &gw, &pool, &groups, &cfg, None, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.downloaded, 1);
        assert_eq!(outcome.failed, 1);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn batch_error_marks_ids_failed_without_aborting() {
        let dir = tempdir();
        let gw = FailingGateway;
        let pool = SessionPool::spawn(vec![]);
        let cfg = FetcherConfig {
            channel: "@chan".into(),
            channel_dir: dir.clone(),
            batch_size: 50,
            storage_mode: StorageMode::Raw,
        };
        let groups = vec![group(vec![photo_desc(1), photo_desc(2)])];
        let outcome = run_fetcher("s1", &gw, &pool, &groups, &cfg, None, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.downloaded, 0);
        assert_eq!(outcome.failed, 2);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_first_batch() {
        let dir = tempdir();
        let gw = FakeGateway {
            get_messages_calls: AtomicUsize::new(0),
            batches: Mutex::new(vec![vec![Some(photo_desc(1))]]),
        };
        let pool = SessionPool::spawn(vec![]);
        let cfg = FetcherConfig {
            channel: "@chan".into(),
            channel_dir: dir.clone(),
            batch_size: 50,
            storage_mode: StorageMode::Raw,
        };
        let groups = vec![group(vec![photo_desc(1)])];
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = run_fetcher("s1", &gw, &pool, &groups, &cfg, None, None, &cancel)
            .await
            .unwrap();
        assert_eq!(outcome.downloaded, 0);
        assert_eq!(outcome.failed, 0);
        assert_eq!(gw.get_messages_calls.load(Ordering::SeqCst), 0);
        let _ = std::fs::remove_dir_all(&dir);
    }

    struct FailingGateway;

    #[async_trait::async_trait]
    impl TgGateway for FailingGateway {
        async fn get_chat(&self, _handle: &str) -> Result<Chat, DomainError> {
            unimplemented!()
        }
        async fn get_messages(
            &self,
            _channel: &str,
            _ids: &[i32],
        ) -> Result<Vec<Option<MessageDescriptor>>, DomainError> {
            Err(DomainError::Forbidden("channel not accessible".into()))
        }
        async fn stream_media(
            &self,
            _channel: &str,
            _message_id: i32,
        ) -> Result<MediaChunkStream, DomainError> {
            unimplemented!()
        }
        async fn download_media(
            &self,
            _channel: &str,
            _message_id: i32,
            _dest_path: &std::path::Path,
        ) -> Result<PathBuf, DomainError> {
            unimplemented!()
        }
        async fn send_message(&self, _target: &str, _text: &str) -> Result<(), DomainError> {
            unimplemented!()
        }
        async fn send_single_media(
            &self,
            _target: &str,
            _kind: MessageKind,
            _bytes: &[u8],
            _filename: &str,
            _caption: Option<&str>,
        ) -> Result<(), DomainError> {
            unimplemented!()
        }
        async fn send_media_group(
            &self,
            _target: &str,
            _items: &[UploadItem<'_>],
        ) -> Result<(), DomainError> {
            unimplemented!()
        }
    }

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "tg-archiver-fetcher-test-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
