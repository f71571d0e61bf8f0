//! Live per-session fetch progress, rendered with indicatif. Purely a UI
//! concern: the coordinator runs identically with no progress sink wired
//! up (spec §7, report fields don't depend on this).

use crate::usecases::fetcher::FetchProgress;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Spawns a task that drains `rx` and renders one spinner per session,
/// added lazily as each session reports its first batch (the final
/// per-session count isn't known until the run finishes).
pub fn spawn_tracker(mut rx: mpsc::Receiver<FetchProgress>) -> JoinHandle<()> {
    let multi = MultiProgress::new();
    let style = ProgressStyle::with_template("{prefix:.cyan} {spinner} {pos} processed ({msg})")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ");

    tokio::spawn(async move {
        let mut bars: HashMap<String, ProgressBar> = HashMap::new();
        let mut failed_totals: HashMap<String, usize> = HashMap::new();
        while let Some(update) = rx.recv().await {
            let bar = bars.entry(update.session.clone()).or_insert_with(|| {
                let bar = multi.add(ProgressBar::new_spinner());
                bar.set_style(style.clone());
                bar.set_prefix(update.session.clone());
                bar
            });
            bar.inc(update.processed as u64);
            let failed = failed_totals.entry(update.session.clone()).or_insert(0);
            *failed += update.failed;
            bar.set_message(format!("{} failed", failed));
        }
        for bar in bars.values() {
            bar.finish();
        }
    })
}
