//! Wiring & DI. Entry point: bootstrap adapters, inject into the coordinator, run the TUI.
//! No business logic here; sessions are expected pre-authenticated (spec §1 non-goal).

use dotenv::dotenv;
use std::path::PathBuf;
use std::sync::Arc;
use tg_archiver::adapters::telegram::{client::GrammersTgGateway, session};
use tg_archiver::adapters::ui;
use tg_archiver::ports::TgGateway;
use tg_archiver::shared::config::{AppConfig, SessionCredential};
use tg_archiver::usecases::coordinator::Coordinator;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let env_loaded = dotenv();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match &env_loaded {
        Ok(path) => info!(path = %path.display(), "loaded .env"),
        Err(_) => info!(cwd = %cwd.display(), "no .env found (check CWD)"),
    }

    ui::init_ui();

    let cfg = AppConfig::load().map_err(|e| anyhow::anyhow!("{}", e))?;

    let data_path = PathBuf::from(&cfg.data_dir);
    tokio::fs::create_dir_all(&data_path)
        .await
        .map_err(|e| anyhow::anyhow!("create data dir: {}", e))?;
    info!(path = %data_path.display(), "data directory");

    let mut sessions: Vec<(String, Arc<dyn TgGateway>)> = Vec::new();
    for cred in &cfg.sessions {
        match connect_session(&cfg, cred).await {
            Ok(Some(client)) => {
                let gateway: Arc<dyn TgGateway> = Arc::new(GrammersTgGateway::new(client));
                sessions.push((cred.name.clone(), gateway));
            }
            Ok(None) => {
                warn!(session = %cred.name, "session is not authorized, skipping (no login flow here)");
            }
            Err(e) => {
                warn!(session = %cred.name, error = %e, "failed to connect session, skipping");
            }
        }
    }

    if sessions.is_empty() {
        anyhow::bail!("no authorized sessions available; check session_path entries");
    }
    info!(count = sessions.len(), "sessions connected");

    let (progress_tx, progress_rx) = tokio::sync::mpsc::channel(256);
    let progress_handle = ui::progress::spawn_tracker(progress_rx);

    let coordinator = Coordinator::new(cfg, sessions).with_progress(progress_tx);

    let cancel = coordinator.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("ctrl-c received, cancelling run");
            cancel.cancel();
        }
    });

    let report = ui::tui::run(&coordinator)
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    drop(coordinator);
    let _ = progress_handle.await;

    info!(
        downloaded = report.downloaded,
        failed = report.failed,
        albums_uploaded = report.albums_uploaded,
        singles_uploaded = report.singles_uploaded,
        "run finished"
    );
    for session in &report.per_session {
        info!(
            session = %session.name,
            downloaded = session.downloaded,
            failed = session.failed,
            min_id = ?session.min_id,
            max_id = ?session.max_id,
            "session summary"
        );
    }

    Ok(())
}

/// Connects one pre-authenticated session. Returns `Ok(None)` rather than an
/// error when the session file exists but login never completed (spec §1:
/// login/2FA flows are out of scope, so such sessions are excluded, not
/// driven through a flow here).
async fn connect_session(
    cfg: &AppConfig,
    cred: &SessionCredential,
) -> anyhow::Result<Option<grammers_client::Client>> {
    let store = session::open_file_session(&cred.session_path).await?;
    let store = Arc::new(store);
    let pool = grammers_client::SenderPool::new(store, cfg.api_id);
    let handle = pool.handle.clone();
    tokio::spawn(async move {
        pool.runner.run().await;
    });
    let client = grammers_client::Client::new(handle);

    if !client.is_authorized().await? {
        return Ok(None);
    }
    Ok(Some(client))
}
