//! Message Probe (spec §4.B). Turns a raw id range into the set of
//! descriptors the Distributor can work with.

use crate::domain::{DomainError, MessageDescriptor};
use crate::ports::TgGateway;
use tracing::{info, warn};

pub const PROBE_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ProbeStats {
    pub total: usize,
    pub valid: usize,
    pub invalid: usize,
}

impl ProbeStats {
    pub fn valid_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.valid as f64 / self.total as f64
        }
    }
}

pub struct ProbeOutput {
    pub valid: Vec<MessageDescriptor>,
    pub invalid_ids: Vec<i32>,
    pub stats: ProbeStats,
}

/// Fetches `[start_id, end_id]` in batches, classifying each id as valid
/// (downloadable media) or invalid (deleted, or text-only; spec §4.B).
/// Never aborts on a single batch's failure.
pub async fn probe(
    gateway: &dyn TgGateway,
    channel: &str,
    start_id: i32,
    end_id: i32,
) -> Result<ProbeOutput, DomainError> {
    debug_assert!(start_id <= end_id);
    let ids: Vec<i32> = (start_id..=end_id).collect();
    let mut valid = Vec::new();
    let mut invalid_ids = Vec::new();

    info!(channel, count = ids.len(), "probing message range");

    for batch in ids.chunks(PROBE_BATCH_SIZE) {
        probe_batch(gateway, channel, batch, &mut valid, &mut invalid_ids).await;
    }

    let stats = ProbeStats {
        total: ids.len(),
        valid: valid.len(),
        invalid: invalid_ids.len(),
    };
    info!(
        valid = stats.valid,
        invalid = stats.invalid,
        rate = stats.valid_rate(),
        "probe complete"
    );
    if !invalid_ids.is_empty() {
        let preview: Vec<i32> = invalid_ids.iter().take(10).copied().collect();
        warn!(count = invalid_ids.len(), preview = ?preview, "invalid ids found");
    }

    Ok(ProbeOutput {
        valid,
        invalid_ids,
        stats,
    })
}

async fn probe_batch(
    gateway: &dyn TgGateway,
    channel: &str,
    batch: &[i32],
    valid: &mut Vec<MessageDescriptor>,
    invalid_ids: &mut Vec<i32>,
) {
    loop {
        match gateway.get_messages(channel, batch).await {
            Ok(messages) => {
                for (id, message) in batch.iter().zip(messages.into_iter()) {
                    match message {
                        Some(desc) if desc.kind.is_downloadable() => valid.push(desc),
                        _ => invalid_ids.push(*id),
                    }
                }
                return;
            }
            Err(DomainError::RateLimited { seconds }) => {
                warn!(seconds, "probe batch rate limited, sleeping");
                tokio::time::sleep(std::time::Duration::from_secs(seconds)).await;
                // retry same batch
            }
            Err(e) => {
                warn!(
                    first = batch.first(),
                    last = batch.last(),
                    error = %e,
                    "probe batch failed, marking ids invalid"
                );
                invalid_ids.extend_from_slice(batch);
                return;
            }
        }
    }
}
