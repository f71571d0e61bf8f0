//! Coordinator. Drives one run through A -> B -> C -> D -> E (spec §2
//! control flow) and implements `CoordinatorPort`.

use crate::domain::{DomainError, Group, RunReport, SessionReport};
use crate::ports::{CoordinatorPort, RunRequest, TgGateway};
use crate::shared::config::AppConfig;
use crate::usecases::distributor::{self, DistributorConfig};
use crate::usecases::fetcher::{self, FetchProgress, FetcherConfig, UploadMessage};
use crate::usecases::probe;
use crate::usecases::session_pool::SessionPool;
use crate::usecases::uploader::{self, UploaderConfig};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct Coordinator {
    config: AppConfig,
    pool: SessionPool,
    data_dir: std::path::PathBuf,
    progress_tx: Option<mpsc::Sender<FetchProgress>>,
    cancel: CancellationToken,
}

impl Coordinator {
    pub fn new(config: AppConfig, sessions: Vec<(String, Arc<dyn TgGateway>)>) -> Self {
        let pool = SessionPool::spawn(sessions);
        let data_dir = std::path::PathBuf::from(&config.data_dir);
        Self {
            config,
            pool,
            data_dir,
            progress_tx: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Wires a progress sink (spec §7's report is unaffected either way;
    /// this only feeds the optional indicatif display in the TUI).
    pub fn with_progress(mut self, tx: mpsc::Sender<FetchProgress>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    /// A clone of the run's cancellation token (spec §5). Firing it stops
    /// every fetcher at its next suspension point, then drains into the
    /// uploader so any open album still flushes before the run exits.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[async_trait::async_trait]
impl CoordinatorPort for Coordinator {
    async fn run(&self, request: RunRequest) -> Result<RunReport, DomainError> {
        // 1. Bring sessions online.
        let descriptors = self.pool.bring_online().await;
        let online = self.pool.online().await;
        if online.is_empty() {
            return Err(DomainError::SessionPool(
                "no sessions came online; aborting run".into(),
            ));
        }
        info!(online = online.len(), total = descriptors.len(), "sessions online");
        for d in descriptors.iter().filter(|d| d.state.is_failed()) {
            warn!(session = %d.name, state = ?d.state, "session failed to come online");
        }

        // 2. Probe the range on the first online session.
        let probe_gateway = self.pool.acquire(&online[0]).await?;
        let probe_out = probe::probe(
            probe_gateway.as_ref(),
            &request.channel_handle,
            request.start_id,
            request.end_id,
        )
        .await?;

        // Resolve the channel directory once, up front (spec §3 "created once per run, cached").
        let chat = probe_gateway.get_chat(&request.channel_handle).await?;
        let dir_name = crate::domain::naming::channel_dir_name(
            chat.username.as_deref().unwrap_or(&request.channel_handle),
            &chat.title,
        );
        let channel_dir = self.data_dir.join(dir_name);
        tokio::fs::create_dir_all(&channel_dir)
            .await
            .map_err(|e| DomainError::Filesystem(e.to_string()))?;

        // 3. Distribute.
        let dist_cfg = DistributorConfig {
            metric: self.config.distribution_metric,
            prefer_large_groups_first: self.config.prefer_large_groups_first,
            oversized_threshold: self.config.oversized_album_split_threshold(),
            session_count: online.len(),
        };
        let groups: Vec<Group> = distributor::build_groups(probe_out.valid, &dist_cfg);
        let (assignment, balance) = distributor::distribute(groups, &online, &dist_cfg);
        info!(
            min = balance.min,
            max = balance.max,
            mean = balance.mean,
            "assignment balanced across sessions"
        );

        // 4. Launch fetchers concurrently, wire into the uploader queue if enabled.
        let uploads_enabled = self.config.storage_mode.uploads();
        let (upload_tx, uploader_handle) = if uploads_enabled {
            let target = self
                .config
                .target_channel
                .clone()
                .ok_or_else(|| DomainError::Config("target_channel required for uploads".into()))?;
            let (tx, rx) = mpsc::channel::<UploadMessage>(100);
            let upload_gateway = self.pool.acquire(&online[0]).await?;
            let uploader_cfg = UploaderConfig {
                target,
                preserve_captions: self.config.preserve_captions,
                preserve_media_groups: self.config.preserve_media_groups,
                upload_delay: std::time::Duration::from_secs_f64(self.config.upload_delay_seconds),
            };
            let handle = tokio::spawn(async move {
                uploader::run_uploader(upload_gateway.as_ref(), &uploader_cfg, rx).await
            });
            (Some(tx), Some(handle))
        } else {
            (None, None)
        };

        let fetcher_cfg = FetcherConfig {
            channel: request.channel_handle.clone(),
            channel_dir: channel_dir.clone(),
            batch_size: self.config.message_batch_size,
            storage_mode: self.config.storage_mode,
        };

        let mut fetcher_tasks = Vec::new();
        for session_name in &online {
            let groups = assignment.groups_for(session_name).unwrap_or(&[]).to_vec();
            if groups.is_empty() {
                continue;
            }
            let gateway = self.pool.acquire(session_name).await?;
            let pool = self.pool.clone();
            let session_name = session_name.clone();
            let upload_tx = upload_tx.clone();
            let progress_tx = self.progress_tx.clone();
            let channel = fetcher_cfg.channel.clone();
            let channel_dir = fetcher_cfg.channel_dir.clone();
            let batch_size = fetcher_cfg.batch_size;
            let storage_mode = fetcher_cfg.storage_mode;
            let cancel = self.cancel.clone();

            fetcher_tasks.push(tokio::spawn(async move {
                let cfg = FetcherConfig {
                    channel,
                    channel_dir,
                    batch_size,
                    storage_mode,
                };
                let outcome = fetcher::run_fetcher(
                    &session_name,
                    gateway.as_ref(),
                    &pool,
                    &groups,
                    &cfg,
                    upload_tx.as_ref(),
                    progress_tx.as_ref(),
                    &cancel,
                )
                .await;
                (session_name, outcome)
            }));
        }

        // 5. Await all fetchers, then signal the uploader to flush.
        let mut per_session = Vec::new();
        let mut downloaded = 0;
        let mut failed = 0;
        for task in fetcher_tasks {
            match task.await {
                Ok((session_name, Ok(outcome))) => {
                    downloaded += outcome.downloaded;
                    failed += outcome.failed;
                    per_session.push(SessionReport {
                        name: session_name,
                        downloaded: outcome.downloaded,
                        failed: outcome.failed,
                        min_id: outcome.min_id,
                        max_id: outcome.max_id,
                    });
                }
                Ok((session_name, Err(e))) => {
                    warn!(session = %session_name, error = %e, "fetcher exited with error");
                    self.pool.mark_failed(&session_name, e.to_string()).await;
                }
                Err(e) => warn!(error = %e, "fetcher task panicked"),
            }
        }

        let mut report = RunReport {
            downloaded,
            failed,
            albums_uploaded: 0,
            singles_uploaded: 0,
            per_session,
        };

        if let (Some(tx), Some(handle)) = (upload_tx, uploader_handle) {
            let _ = tx.send(UploadMessage::Shutdown).await;
            drop(tx);
            if let Ok(stats) = handle.await {
                report.albums_uploaded = stats.albums_uploaded;
                report.singles_uploaded = stats.singles_uploaded;
                report.failed += stats.failed;
            }
        }

        self.pool.shutdown().await;
        info!(
            downloaded = report.downloaded,
            failed = report.failed,
            albums_uploaded = report.albums_uploaded,
            singles_uploaded = report.singles_uploaded,
            "run complete"
        );

        if self.cancel.is_cancelled() {
            warn!("run cancelled; partial results above are the final tally");
            return Err(DomainError::CoordinatorCancel);
        }
        Ok(report)
    }
}
