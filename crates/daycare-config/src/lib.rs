//! # daycare-config
//!
//! Configuration system for the Daycare runtime. Reads from `daycare.toml`, then
//! applies environment variable overrides.
//!
//! Supports hot-reload via filesystem watcher. Reloads take an exclusive lock that
//! in-flight model calls hold in shared mode, so a reload never lands mid-call.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::DaycareConfig;
pub use schema::{AgentConfig, ConfigWarning, HistoryConfig, LoggingConfig, RlmConfig, WarningSeverity};
