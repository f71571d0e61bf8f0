//! Cross-cutting concerns that don't belong to a hexagon layer.

pub mod config;

pub use config::{AppConfig, DistributionMetric, SessionCredential, StorageMode};
