//! Common types used across muttpu.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Exchange folders that hold no mail.
pub const NON_MAIL_FOLDERS: &[&str] = &[
    "Calendar",
    "Contacts",
    "Tasks",
    "Notes",
    "Journal",
    "RSS Feeds",
    "Conversation History",
];

/// A mailbox reported by the exporter's `list` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mailbox {
    pub id: Uuid,
    pub name: String,
    pub message_count: Option<u64>,
    pub is_hidden: bool,
}

impl Mailbox {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let is_hidden = is_non_mail_folder(&name);
        Self {
            id: Uuid::new_v4(),
            name,
            message_count: None,
            is_hidden,
        }
    }

    /// Name with the message count appended when known, e.g. `Archive (1,234)`.
    pub fn display_name(&self) -> String {
        match self.message_count {
            Some(count) => format!("{} ({})", self.name, group_thousands(count)),
            None => self.name.clone(),
        }
    }
}

/// Whether a folder name looks like a calendar, contacts, or similar folder.
pub fn is_non_mail_folder(name: &str) -> bool {
    NON_MAIL_FOLDERS.iter().any(|folder| name.contains(folder))
}

fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Export file format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExportFormat {
    /// One `.eml` file per message.
    #[default]
    Eml,
    /// A single mbox file per mailbox.
    Mbox,
}

impl ExportFormat {
    /// Value passed to the exporter's `--format` flag.
    pub fn as_arg(&self) -> &'static str {
        match self {
            ExportFormat::Eml => "eml",
            ExportFormat::Mbox => "mbox",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportFormat::Eml => write!(f, "EML"),
            ExportFormat::Mbox => write!(f, "MBOX"),
        }
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "eml" => Ok(ExportFormat::Eml),
            "mbox" => Ok(ExportFormat::Mbox),
            _ => Err(format!("unknown format: {} (valid: eml, mbox)", s)),
        }
    }
}

/// What to do with state left by an earlier export of the same mailbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResumeMode {
    /// Continue an interrupted export.
    #[default]
    Resume,
    /// Start over, ignoring previous state.
    Fresh,
    /// Only export messages not exported before.
    Incremental,
}

impl ResumeMode {
    /// Whether the exporter gets `--fresh`.
    pub fn is_fresh(&self) -> bool {
        matches!(self, ResumeMode::Fresh)
    }
}

impl fmt::Display for ResumeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResumeMode::Resume => write!(f, "resume"),
            ResumeMode::Fresh => write!(f, "fresh"),
            ResumeMode::Incremental => write!(f, "incremental"),
        }
    }
}

impl FromStr for ResumeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "resume" => Ok(ResumeMode::Resume),
            "fresh" => Ok(ResumeMode::Fresh),
            "incremental" => Ok(ResumeMode::Incremental),
            _ => Err(format!(
                "unknown resume mode: {} (valid: resume, fresh, incremental)",
                s
            )),
        }
    }
}

/// Options attached to an export job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportOptions {
    pub format: ExportFormat,
    pub output_directory: PathBuf,
    pub year: Option<i32>,
    pub resume_mode: ResumeMode,
    pub include_non_mail_folders: bool,
}

impl ExportOptions {
    /// Options pre-filled from the user's defaults.
    pub fn from_settings(settings: &AppSettings, output_directory: PathBuf) -> Self {
        Self {
            format: settings.default_export_format,
            output_directory,
            year: None,
            resume_mode: settings.default_resume_mode,
            include_non_mail_folders: !settings.hide_non_mail_folders,
        }
    }

    /// Exporter argv for exporting `mailbox` with these options.
    pub fn export_args(&self, mailbox: &str) -> Vec<String> {
        let mut args = vec![
            "export".to_string(),
            mailbox.to_string(),
            self.output_directory.display().to_string(),
            "--format".to_string(),
            self.format.as_arg().to_string(),
        ];
        if let Some(year) = self.year {
            args.push("--year".to_string());
            args.push(year.to_string());
        }
        if self.resume_mode.is_fresh() {
            args.push("--fresh".to_string());
        }
        args
    }
}

/// Lifecycle of an export job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Allowed transitions; everything else is rejected.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Queued, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.pad(label)
    }
}

pub type JobId = Uuid;

/// One export request tracked from enqueue to a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportJob {
    pub id: JobId,
    pub mailbox: Mailbox,
    pub options: ExportOptions,
    pub status: JobStatus,
    pub progress: f64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExportJob {
    pub fn new(mailbox: Mailbox, options: ExportOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            mailbox,
            options,
            status: JobStatus::Queued,
            progress: 0.0,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Elapsed run time; still growing while the job has no completion time.
    pub fn duration(&self, now: DateTime<Utc>) -> Option<Duration> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or(now);
        Some(end - started)
    }

    /// Duration as `1h 2m 3s`, omitting leading zero units.
    pub fn formatted_duration(&self, now: DateTime<Utc>) -> Option<String> {
        let secs = self.duration(now)?.num_seconds().max(0);
        let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
        Some(if h > 0 {
            format!("{h}h {m}m {s}s")
        } else if m > 0 {
            format!("{m}m {s}s")
        } else {
            format!("{s}s")
        })
    }
}

/// Severity of an activity log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LogLevel::Info => "info",
            LogLevel::Success => "success",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        };
        f.write_str(label)
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(LogLevel::Info),
            "success" => Ok(LogLevel::Success),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            _ => Err(format!(
                "unknown level: {} (valid: info, success, warning, error)",
                s
            )),
        }
    }
}

/// An immutable activity log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// User preferences persisted by the settings store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppSettings {
    pub hide_non_mail_folders: bool,
    pub default_export_format: ExportFormat,
    pub default_output_directory: Option<PathBuf>,
    pub default_resume_mode: ResumeMode,
    /// Minutes between automatic mailbox refreshes.
    pub auto_refresh_interval: Option<i64>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            hide_non_mail_folders: true,
            default_export_format: ExportFormat::Eml,
            default_output_directory: None,
            default_resume_mode: ResumeMode::Resume,
            auto_refresh_interval: None,
        }
    }
}

impl AppSettings {
    /// Refresh interval in minutes, if auto-refresh is enabled.
    pub fn refresh_minutes(&self) -> Option<u64> {
        self.auto_refresh_interval
            .filter(|m| *m > 0)
            .map(|m| m as u64)
    }
}

/// Readiness of the exporter for talking to the mail server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "kebab-case")]
pub enum ConfigurationStatus {
    Configured,
    NotConfigured,
    Error(String),
    MissingDependencies(Vec<String>),
}

impl ConfigurationStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, ConfigurationStatus::Configured)
    }
}

impl fmt::Display for ConfigurationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigurationStatus::Configured => write!(f, "configured"),
            ConfigurationStatus::NotConfigured => write!(f, "not configured"),
            ConfigurationStatus::Error(msg) => write!(f, "error: {msg}"),
            ConfigurationStatus::MissingDependencies(names) => {
                write!(f, "missing dependencies: {}", names.join(", "))
            }
        }
    }
}
