//! Application configuration. Session credentials, pipeline knobs.

use serde::Deserialize;

/// How fetched media is persisted and (optionally) re-uploaded (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Download to disk only, never upload.
    #[default]
    Raw,
    /// Download in-memory and upload without local persistence.
    Upload,
    /// Download to disk and upload from disk.
    Hybrid,
}

impl StorageMode {
    pub fn uploads(self) -> bool {
        matches!(self, StorageMode::Upload | StorageMode::Hybrid)
    }

    pub fn persists_to_disk(self) -> bool {
        matches!(self, StorageMode::Raw | StorageMode::Hybrid)
    }
}

/// The metric the distributor balances sessions on (spec §4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DistributionMetric {
    #[default]
    FileCount,
    MessageCount,
    SizeEstimate,
    Mixed,
}

/// One pre-authenticated session this process will drive. Creation of the
/// underlying credential material is out of scope (spec §1); the pool only
/// consumes a stable `name` plus the path to an already-logged-in session
/// file.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionCredential {
    pub name: String,
    pub session_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub api_id: i32,
    pub api_hash: String,
    pub data_dir: String,

    pub sessions: Vec<SessionCredential>,

    #[serde(default)]
    pub storage_mode: StorageMode,

    /// Required when `storage_mode` uploads.
    #[serde(default)]
    pub target_channel: Option<String>,

    #[serde(default = "default_true")]
    pub preserve_captions: bool,

    #[serde(default = "default_true")]
    pub preserve_media_groups: bool,

    #[serde(default = "default_upload_delay")]
    pub upload_delay_seconds: f64,

    /// Defaults to session count when unset; see `max_concurrent_clients_or_default`.
    #[serde(default)]
    pub max_concurrent_clients: Option<usize>,

    #[serde(default = "default_batch_size")]
    pub message_batch_size: usize,

    #[serde(default)]
    pub distribution_metric: DistributionMetric,

    #[serde(default = "default_true")]
    pub prefer_large_groups_first: bool,
}

fn default_true() -> bool {
    true
}

fn default_upload_delay() -> f64 {
    1.5
}

fn default_batch_size() -> usize {
    50
}

/// Hard cap on `message_batch_size` (spec §6); `GetMessages` batches above
/// this are rejected at config load rather than silently clamped.
pub const MAX_MESSAGE_BATCH_SIZE: usize = 100;

impl AppConfig {
    pub fn load() -> Result<Self, crate::domain::DomainError> {
        dotenv::dotenv().ok();
        let mut builder = config::Config::builder();
        builder = builder.add_source(config::Environment::with_prefix("TG_ARCHIVER").separator("__"));
        if let Ok(path) = std::env::var("TG_ARCHIVER_CONFIG") {
            builder = builder.add_source(config::File::with_name(&path));
        }
        let raw = builder
            .build()
            .map_err(|e| crate::domain::DomainError::Config(e.to_string()))?;
        let cfg: Self = raw
            .try_deserialize()
            .map_err(|e| crate::domain::DomainError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), crate::domain::DomainError> {
        if self.sessions.is_empty() || self.sessions.len() > 4 {
            return Err(crate::domain::DomainError::Config(format!(
                "expected 1-4 sessions, got {}",
                self.sessions.len()
            )));
        }
        if self.message_batch_size == 0 || self.message_batch_size > MAX_MESSAGE_BATCH_SIZE {
            return Err(crate::domain::DomainError::Config(format!(
                "message_batch_size must be in 1..={MAX_MESSAGE_BATCH_SIZE}, got {}",
                self.message_batch_size
            )));
        }
        if self.storage_mode.uploads() && self.target_channel.is_none() {
            return Err(crate::domain::DomainError::Config(
                "target_channel is required when storage_mode uploads".into(),
            ));
        }
        Ok(())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn max_concurrent_clients_or_default(&self) -> usize {
        self.max_concurrent_clients.unwrap_or_else(|| self.session_count())
    }

    /// `2 × session_count` (spec §3, §6).
    pub fn oversized_album_split_threshold(&self) -> usize {
        2 * self.session_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(sessions: usize) -> AppConfig {
        AppConfig {
            api_id: 1,
            api_hash: "h".into(),
            data_dir: "/tmp/x".into(),
            sessions: (0..sessions)
                .map(|i| SessionCredential {
                    name: format!("s{i}"),
                    session_path: format!("/tmp/s{i}.session"),
                })
                .collect(),
            storage_mode: StorageMode::Raw,
            target_channel: None,
            preserve_captions: true,
            preserve_media_groups: true,
            upload_delay_seconds: 1.5,
            max_concurrent_clients: None,
            message_batch_size: 50,
            distribution_metric: DistributionMetric::FileCount,
            prefer_large_groups_first: true,
        }
    }

    #[test]
    fn rejects_zero_sessions() {
        assert!(sample(0).validate().is_err());
    }

    #[test]
    fn rejects_more_than_four_sessions() {
        assert!(sample(5).validate().is_err());
    }

    #[test]
    fn rejects_batch_size_above_hard_cap() {
        let mut c = sample(2);
        c.message_batch_size = 101;
        assert!(c.validate().is_err());
    }

    #[test]
    fn upload_mode_requires_target_channel() {
        let mut c = sample(2);
        c.storage_mode = StorageMode::Upload;
        assert!(c.validate().is_err());
        c.target_channel = Some("@dest".into());
        assert!(c.validate().is_ok());
    }

    #[test]
    fn oversized_threshold_is_double_session_count() {
        assert_eq!(sample(3).oversized_album_split_threshold(), 6);
    }

    #[test]
    fn max_concurrent_clients_defaults_to_session_count() {
        assert_eq!(sample(3).max_concurrent_clients_or_default(), 3);
    }
}
