//! muttpu-core: job orchestration and the bridge to the muttpu exporter.
//!
//! This crate drives the external mailbox exporter, including:
//! - Parsing the exporter's text output
//! - Spawning the exporter with buffered or streamed output
//! - Configuration readiness checks
//! - The export job queue with progress and cancellation
//! - Periodic mailbox refresh
//! - Activity log, settings store and config discovery

pub mod activity;
pub mod bridge;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod parse;
pub mod paths;
pub mod readiness;
pub mod registry;
pub mod scheduler;
pub mod settings;
pub mod types;

#[cfg(test)]
mod testing;

pub use activity::ActivityLog;
pub use bridge::{CommandOutput, ExporterBridge, ProcessBridge};
pub use config::{AppConfig, ExporterConfig, QueueConfig};
pub use error::{Error, Result};
pub use orchestrator::{Event, Orchestrator, OrchestratorOptions, RefreshOutcome};
pub use paths::AppPaths;
pub use readiness::Readiness;
pub use scheduler::AutoRefreshStatus;
pub use settings::{JsonSettingsStore, SettingsStore};
pub use types::{
    AppSettings, ConfigurationStatus, ExportFormat, ExportJob, ExportOptions, JobId, JobStatus,
    LogEntry, LogLevel, Mailbox, ResumeMode,
};
