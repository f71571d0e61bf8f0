//! Inbound port. UI (adapter) calls into the application.

use crate::domain::{DomainError, RunReport};

/// What the entry point asks the coordinator to do for one run (spec §2
/// control flow). Held here rather than in `shared::config` because it
/// varies per invocation, not per deployment.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub channel_handle: String,
    pub start_id: i32,
    pub end_id: i32,
}

/// Input port: the entry point invokes the coordinator through this trait
/// so `main.rs` stays pure wiring (spec §1: CLI/GUI are out of scope).
#[async_trait::async_trait]
pub trait CoordinatorPort: Send + Sync {
    /// Run the full archive pipeline for one id range and return the
    /// end-of-run report (spec §7).
    async fn run(&self, request: RunRequest) -> Result<RunReport, DomainError>;
}
