//! Export job orchestration.
//!
//! One owner task holds all mutable state: configuration status, the mailbox
//! registry, export jobs, settings, the activity log and the auto-refresh
//! loop. [`Orchestrator`] handles send it commands; slow work (probes,
//! listings, exports) runs on worker tasks that report back to the owner as
//! commands too, so every mutation happens in one place and in order.
//! Changes are published as [`Event`]s.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, warn};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::activity::ActivityLog;
use crate::bridge::{ProcessBridge, count_args, list_args, setup_args};
use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::parse::{extract_login_url, parse_mailbox_list, parse_message_count, parse_progress};
use crate::readiness::{Readiness, probe_status};
use crate::registry::MailboxRegistry;
use crate::scheduler::{AutoRefresh, AutoRefreshStatus};
use crate::settings::SettingsStore;
use crate::types::{
    AppSettings, ConfigurationStatus, ExportJob, ExportOptions, JobId, JobStatus, LogEntry,
    LogLevel, Mailbox,
};

const EVENT_CAPACITY: usize = 256;

/// How long a running export may ignore a cancel request before the job is
/// marked cancelled anyway.
pub const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Construction parameters besides the injected collaborators.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub credential_file: PathBuf,
    pub dependencies: Vec<String>,
    /// Maximum number of running exports; `None` means no limit.
    pub max_concurrent: Option<usize>,
}

impl OrchestratorOptions {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            credential_file: config.exporter.credential_path()?,
            dependencies: config.exporter.dependencies.clone(),
            max_concurrent: config.queue.limit(),
        })
    }
}

/// State change published to subscribers.
#[derive(Debug, Clone)]
pub enum Event {
    Log(LogEntry),
    LogCleared,
    JobUpdated(ExportJob),
    MailboxesChanged(Vec<Mailbox>),
    LoadingChanged(bool),
    ConfigurationChanged(ConfigurationStatus),
    SettingsChanged(AppSettings),
    /// Raw output of a running `setup`.
    SetupOutput(String),
    /// Sign-in URL found in `setup` output, reported once per URL.
    LoginUrl(String),
}

/// Result of a mailbox refresh request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Configuration was not ready, or a reset interrupted the refresh.
    Skipped,
    Loaded(Vec<Mailbox>),
    Failed(String),
}

enum StatusReply {
    Check(oneshot::Sender<ConfigurationStatus>),
    Setup(oneshot::Sender<Result<ConfigurationStatus>>),
}

impl StatusReply {
    fn send(self, status: ConfigurationStatus) {
        match self {
            StatusReply::Check(tx) => {
                let _ = tx.send(status);
            }
            StatusReply::Setup(tx) => {
                let _ = tx.send(Ok(status));
            }
        }
    }
}

enum Command {
    // Requests from handles.
    CheckConfiguration(oneshot::Sender<ConfigurationStatus>),
    ValidateConfiguration(oneshot::Sender<ConfigurationStatus>),
    CheckDependencies(oneshot::Sender<Vec<String>>),
    Status(oneshot::Sender<ConfigurationStatus>),
    ResetConfiguration(oneshot::Sender<Result<()>>),
    RunSetup {
        cancel: CancellationToken,
        reply: oneshot::Sender<Result<ConfigurationStatus>>,
    },
    RefreshMailboxes(oneshot::Sender<RefreshOutcome>),
    RefreshCount {
        name: String,
        reply: oneshot::Sender<Result<u64>>,
    },
    Mailboxes(oneshot::Sender<Vec<Mailbox>>),
    VisibleMailboxes(oneshot::Sender<Vec<Mailbox>>),
    IsLoading(oneshot::Sender<bool>),
    Enqueue {
        mailbox: Mailbox,
        options: ExportOptions,
        reply: oneshot::Sender<JobId>,
    },
    Cancel {
        id: JobId,
        reply: oneshot::Sender<bool>,
    },
    Jobs(oneshot::Sender<Vec<ExportJob>>),
    Job {
        id: JobId,
        reply: oneshot::Sender<Option<ExportJob>>,
    },
    WaitForJob {
        id: JobId,
        reply: oneshot::Sender<Option<ExportJob>>,
    },
    Settings(oneshot::Sender<AppSettings>),
    UpdateSettings {
        settings: AppSettings,
        reply: oneshot::Sender<()>,
    },
    StopAutoRefresh(oneshot::Sender<bool>),
    AutoRefreshState(oneshot::Sender<AutoRefreshStatus>),
    Log {
        level: LogLevel,
        message: String,
    },
    LogEntries(oneshot::Sender<Vec<LogEntry>>),
    LogFiltered {
        level: Option<LogLevel>,
        query: Option<String>,
        reply: oneshot::Sender<Vec<LogEntry>>,
    },
    ClearLog,
    Shutdown(oneshot::Sender<()>),

    // Reports from worker tasks.
    ProbeFinished {
        epoch: u64,
        status: ConfigurationStatus,
        reply: StatusReply,
    },
    SetupChunk(String),
    SetupFinished {
        result: Result<()>,
        reply: oneshot::Sender<Result<ConfigurationStatus>>,
    },
    MailboxesListed {
        generation: u64,
        names: Vec<String>,
    },
    CountFetched {
        generation: u64,
        index: usize,
        count: u64,
    },
    RefreshFinished {
        generation: u64,
    },
    RefreshFailed {
        generation: u64,
        message: String,
    },
    CountUpdated {
        name: String,
        result: Result<u64>,
        reply: oneshot::Sender<Result<u64>>,
    },
    JobProgress {
        id: JobId,
        fraction: f64,
    },
    JobFinished {
        id: JobId,
        result: Result<()>,
    },
    CancelDeadline(JobId),
    AutoRefreshTick,
}

/// Handle to the orchestrator task. Cheap to clone.
///
/// Every method fails with [`Error::Closed`] once the task has stopped.
#[derive(Clone)]
pub struct Orchestrator {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<Event>,
}

impl Orchestrator {
    /// Start the owner task. Must be called inside a tokio runtime.
    ///
    /// Saved settings are loaded immediately and the auto-refresh loop starts
    /// if they enable it.
    pub fn spawn(
        bridge: Arc<dyn ProcessBridge>,
        store: Arc<dyn SettingsStore>,
        options: OrchestratorOptions,
    ) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let owner = Owner::new(bridge, store, options, commands.downgrade(), events.clone());
        tokio::spawn(owner.run(receiver));
        Self { commands, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::Closed)
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.send(command(reply))?;
        response.await.map_err(|_| Error::Closed)
    }

    /// Full check: credential file, then a `list` probe against the server.
    pub async fn check_configuration(&self) -> Result<ConfigurationStatus> {
        self.request(Command::CheckConfiguration).await
    }

    /// Credential and dependency check without contacting the server.
    pub async fn validate_configuration(&self) -> Result<ConfigurationStatus> {
        self.request(Command::ValidateConfiguration).await
    }

    pub async fn check_dependencies(&self) -> Result<Vec<String>> {
        self.request(Command::CheckDependencies).await
    }

    pub async fn configuration_status(&self) -> Result<ConfigurationStatus> {
        self.request(Command::Status).await
    }

    /// Delete the credential file and forget every mailbox.
    pub async fn reset_configuration(&self) -> Result<()> {
        self.request(Command::ResetConfiguration).await?
    }

    /// Run the exporter's interactive `setup`, then re-check configuration.
    ///
    /// Output and sign-in URLs arrive as [`Event::SetupOutput`] and
    /// [`Event::LoginUrl`] while it runs.
    pub async fn run_setup(&self, cancel: CancellationToken) -> Result<ConfigurationStatus> {
        self.request(|reply| Command::RunSetup { cancel, reply })
            .await?
    }

    pub async fn refresh_mailboxes(&self) -> Result<RefreshOutcome> {
        self.request(Command::RefreshMailboxes).await
    }

    /// Re-count one mailbox.
    pub async fn refresh_count(&self, name: impl Into<String>) -> Result<u64> {
        let name = name.into();
        self.request(|reply| Command::RefreshCount { name, reply })
            .await?
    }

    pub async fn mailboxes(&self) -> Result<Vec<Mailbox>> {
        self.request(Command::Mailboxes).await
    }

    /// Mailboxes with non-mail folders hidden when the settings say so.
    pub async fn visible_mailboxes(&self) -> Result<Vec<Mailbox>> {
        self.request(Command::VisibleMailboxes).await
    }

    pub async fn is_loading(&self) -> Result<bool> {
        self.request(Command::IsLoading).await
    }

    pub async fn enqueue(&self, mailbox: Mailbox, options: ExportOptions) -> Result<JobId> {
        self.request(|reply| Command::Enqueue {
            mailbox,
            options,
            reply,
        })
        .await
    }

    /// Cancel a queued or running job. Returns `false` for finished or
    /// unknown jobs.
    pub async fn cancel(&self, id: JobId) -> Result<bool> {
        self.request(|reply| Command::Cancel { id, reply }).await
    }

    pub async fn jobs(&self) -> Result<Vec<ExportJob>> {
        self.request(Command::Jobs).await
    }

    pub async fn job(&self, id: JobId) -> Result<Option<ExportJob>> {
        self.request(|reply| Command::Job { id, reply }).await
    }

    /// Wait until the job reaches a terminal status. `None` for unknown ids.
    pub async fn wait_for_job(&self, id: JobId) -> Result<Option<ExportJob>> {
        self.request(|reply| Command::WaitForJob { id, reply }).await
    }

    pub async fn settings(&self) -> Result<AppSettings> {
        self.request(Command::Settings).await
    }

    /// Replace and persist the settings. A failed save is logged, not returned.
    pub async fn update_settings(&self, settings: AppSettings) -> Result<()> {
        self.request(|reply| Command::UpdateSettings { settings, reply })
            .await
    }

    pub async fn stop_auto_refresh(&self) -> Result<bool> {
        self.request(Command::StopAutoRefresh).await
    }

    pub async fn auto_refresh(&self) -> Result<AutoRefreshStatus> {
        self.request(Command::AutoRefreshState).await
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) -> Result<()> {
        self.send(Command::Log {
            level,
            message: message.into(),
        })
    }

    pub async fn log_entries(&self) -> Result<Vec<LogEntry>> {
        self.request(Command::LogEntries).await
    }

    pub async fn log_filtered(
        &self,
        level: Option<LogLevel>,
        query: Option<&str>,
    ) -> Result<Vec<LogEntry>> {
        let query = query.map(str::to_string);
        self.request(|reply| Command::LogFiltered {
            level,
            query,
            reply,
        })
        .await
    }

    pub fn clear_log(&self) -> Result<()> {
        self.send(Command::ClearLog)
    }

    /// Kill running exports, stop auto-refresh and end the owner task.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await
    }
}

struct RefreshState {
    generation: u64,
    waiters: Vec<oneshot::Sender<RefreshOutcome>>,
}

struct Owner {
    bridge: Arc<dyn ProcessBridge>,
    store: Arc<dyn SettingsStore>,
    readiness: Readiness,
    max_concurrent: Option<usize>,
    commands: mpsc::WeakUnboundedSender<Command>,
    events: broadcast::Sender<Event>,

    status: ConfigurationStatus,
    // Bumped on reset so probes started before it are ignored.
    config_epoch: u64,
    registry: MailboxRegistry,
    refresh: Option<RefreshState>,
    generation: u64,
    jobs: Vec<ExportJob>,
    pending: VecDeque<JobId>,
    running: HashMap<JobId, CancellationToken>,
    cancelling: HashSet<JobId>,
    job_waiters: HashMap<JobId, Vec<oneshot::Sender<Option<ExportJob>>>>,
    login_urls: HashSet<String>,
    settings: AppSettings,
    activity: ActivityLog,
    scheduler: AutoRefresh,
}

impl Owner {
    fn new(
        bridge: Arc<dyn ProcessBridge>,
        store: Arc<dyn SettingsStore>,
        options: OrchestratorOptions,
        commands: mpsc::WeakUnboundedSender<Command>,
        events: broadcast::Sender<Event>,
    ) -> Self {
        let mut activity = ActivityLog::new();
        let settings = match store.load() {
            Ok(saved) => saved.unwrap_or_default(),
            Err(err) => {
                warn!("using default settings: {err}");
                activity.append(LogLevel::Warning, format!("Failed to load settings: {err}"));
                AppSettings::default()
            }
        };

        Self {
            bridge,
            store,
            readiness: Readiness::new(options.credential_file, options.dependencies),
            max_concurrent: options.max_concurrent,
            commands,
            events,
            status: ConfigurationStatus::NotConfigured,
            config_epoch: 0,
            registry: MailboxRegistry::new(),
            refresh: None,
            generation: 0,
            jobs: Vec::new(),
            pending: VecDeque::new(),
            running: HashMap::new(),
            cancelling: HashSet::new(),
            job_waiters: HashMap::new(),
            login_urls: HashSet::new(),
            settings,
            activity,
            scheduler: AutoRefresh::new(),
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        self.restart_auto_refresh();
        while let Some(command) = commands.recv().await {
            if !self.handle(command) {
                break;
            }
        }
        self.stop();
        debug!("orchestrator stopped");
    }

    /// Returns `false` when the task should stop.
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::CheckConfiguration(reply) => self.begin_check(StatusReply::Check(reply)),
            Command::ValidateConfiguration(reply) => {
                let status = self.readiness.validate();
                // Only a probe can prove the server accepts the credentials.
                if !status.is_ready() {
                    self.set_status(status.clone());
                }
                let _ = reply.send(status);
            }
            Command::CheckDependencies(reply) => {
                let _ = reply.send(self.readiness.check_dependencies());
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status.clone());
            }
            Command::ResetConfiguration(reply) => {
                let _ = reply.send(self.reset_configuration());
            }
            Command::RunSetup { cancel, reply } => self.begin_setup(cancel, reply),
            Command::RefreshMailboxes(reply) => self.begin_refresh(Some(reply)),
            Command::RefreshCount { name, reply } => self.begin_count(name, reply),
            Command::Mailboxes(reply) => {
                let _ = reply.send(self.registry.mailboxes().to_vec());
            }
            Command::VisibleMailboxes(reply) => {
                let _ = reply.send(self.registry.visible(self.settings.hide_non_mail_folders));
            }
            Command::IsLoading(reply) => {
                let _ = reply.send(self.registry.is_loading());
            }
            Command::Enqueue {
                mailbox,
                options,
                reply,
            } => {
                let _ = reply.send(self.enqueue(mailbox, options));
            }
            Command::Cancel { id, reply } => {
                let _ = reply.send(self.cancel_job(id));
            }
            Command::Jobs(reply) => {
                let _ = reply.send(self.jobs.clone());
            }
            Command::Job { id, reply } => {
                let _ = reply.send(self.find_job(id).cloned());
            }
            Command::WaitForJob { id, reply } => match self.find_job(id).cloned() {
                Some(job) if !job.status.is_terminal() => {
                    self.job_waiters.entry(id).or_default().push(reply);
                }
                found => {
                    let _ = reply.send(found);
                }
            },
            Command::Settings(reply) => {
                let _ = reply.send(self.settings.clone());
            }
            Command::UpdateSettings { settings, reply } => {
                self.update_settings(settings);
                let _ = reply.send(());
            }
            Command::StopAutoRefresh(reply) => {
                let stopped = self.scheduler.stop();
                self.log(LogLevel::Info, "Auto-refresh disabled");
                let _ = reply.send(stopped);
            }
            Command::AutoRefreshState(reply) => {
                let _ = reply.send(self.scheduler.status());
            }
            Command::Log { level, message } => self.log(level, message),
            Command::LogEntries(reply) => {
                let _ = reply.send(self.activity.entries());
            }
            Command::LogFiltered {
                level,
                query,
                reply,
            } => {
                let _ = reply.send(self.activity.filter(level, query.as_deref()));
            }
            Command::ClearLog => {
                self.activity.clear();
                self.emit(Event::LogCleared);
            }
            Command::Shutdown(reply) => {
                self.stop();
                let _ = reply.send(());
                return false;
            }

            Command::ProbeFinished {
                epoch,
                status,
                reply,
            } => self.finish_probe(epoch, status, reply),
            Command::SetupChunk(chunk) => self.setup_output(chunk),
            Command::SetupFinished { result, reply } => self.finish_setup(result, reply),
            Command::MailboxesListed { generation, names } => {
                if self.is_current(generation) {
                    self.registry.replace(names);
                    self.publish_mailboxes();
                }
            }
            Command::CountFetched {
                generation,
                index,
                count,
            } => {
                if self.is_current(generation) && self.registry.set_count_at(index, count) {
                    self.publish_mailboxes();
                }
            }
            Command::RefreshFinished { generation } => {
                if self.is_current(generation) {
                    let mailboxes = self.registry.mailboxes().to_vec();
                    self.log(
                        LogLevel::Success,
                        format!("Loaded {} mailboxes", mailboxes.len()),
                    );
                    self.end_refresh(RefreshOutcome::Loaded(mailboxes));
                }
            }
            Command::RefreshFailed {
                generation,
                message,
            } => {
                if self.is_current(generation) {
                    self.log(
                        LogLevel::Error,
                        format!("Failed to refresh mailboxes: {message}"),
                    );
                    self.end_refresh(RefreshOutcome::Failed(message));
                }
            }
            Command::CountUpdated {
                name,
                result,
                reply,
            } => {
                if let Ok(count) = &result {
                    if self.registry.set_count(&name, *count) {
                        self.publish_mailboxes();
                    }
                }
                let _ = reply.send(result);
            }
            Command::JobProgress { id, fraction } => {
                if let Some(job) = self.jobs.iter_mut().find(|j| j.id == id) {
                    if job.status == JobStatus::Running {
                        job.progress = fraction.clamp(0.0, 1.0);
                        self.publish_job(id);
                    }
                }
            }
            Command::JobFinished { id, result } => self.finish_job(id, result),
            Command::CancelDeadline(id) => {
                // The slot stays taken until the worker reports back.
                if self.cancelling.remove(&id) {
                    debug!("job {id} ignored cancellation; marking it cancelled");
                    self.mark_cancelled(id);
                }
            }
            Command::AutoRefreshTick => self.begin_refresh(None),
        }
        true
    }

    fn worker_sender(&self) -> Option<mpsc::UnboundedSender<Command>> {
        self.commands.upgrade()
    }

    fn emit(&self, event: Event) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        let entry = self.activity.append(level, message);
        self.emit(Event::Log(entry));
    }

    fn set_status(&mut self, status: ConfigurationStatus) {
        if self.status != status {
            debug!("configuration: {} -> {}", self.status, status);
            self.status = status.clone();
            self.emit(Event::ConfigurationChanged(status));
        }
    }

    // Configuration

    fn begin_check(&mut self, reply: StatusReply) {
        if !self.readiness.credentials_present() {
            self.set_status(ConfigurationStatus::NotConfigured);
            reply.send(self.status.clone());
            return;
        }
        let Some(owner) = self.worker_sender() else {
            return;
        };
        let bridge = self.bridge.clone();
        let epoch = self.config_epoch;
        tokio::spawn(async move {
            let status = probe_status(bridge.invoke(&list_args()).await);
            let _ = owner.send(Command::ProbeFinished {
                epoch,
                status,
                reply,
            });
        });
    }

    fn finish_probe(&mut self, epoch: u64, status: ConfigurationStatus, reply: StatusReply) {
        if epoch == self.config_epoch {
            match &status {
                ConfigurationStatus::Configured => {
                    self.log(LogLevel::Info, "Configuration validated successfully")
                }
                ConfigurationStatus::Error(message) => {
                    self.log(LogLevel::Error, format!("Configuration error: {message}"))
                }
                _ => {}
            }
            self.set_status(status);
        } else {
            debug!("discarding probe result from before a reset");
        }
        reply.send(self.status.clone());
    }

    fn reset_configuration(&mut self) -> Result<()> {
        if let Err(err) = self.readiness.delete_credentials() {
            self.log(
                LogLevel::Error,
                format!("Failed to delete credentials: {err}"),
            );
            return Err(err);
        }
        self.config_epoch += 1;
        self.set_status(ConfigurationStatus::NotConfigured);
        self.end_refresh(RefreshOutcome::Skipped);
        self.registry.clear();
        self.publish_mailboxes();
        self.log(LogLevel::Warning, "Configuration reset");
        Ok(())
    }

    fn begin_setup(
        &mut self,
        cancel: CancellationToken,
        reply: oneshot::Sender<Result<ConfigurationStatus>>,
    ) {
        let missing = self.readiness.check_dependencies();
        if !missing.is_empty() {
            self.log(
                LogLevel::Error,
                format!("Missing dependencies: {}", missing.join(", ")),
            );
            self.set_status(ConfigurationStatus::MissingDependencies(missing.clone()));
            let _ = reply.send(Err(Error::MissingDependencies(missing)));
            return;
        }
        let Some(owner) = self.worker_sender() else {
            return;
        };

        self.login_urls.clear();
        self.log(LogLevel::Info, "Starting OAuth2 setup");
        let bridge = self.bridge.clone();
        tokio::spawn(async move {
            let result = stream_chunks(bridge.as_ref(), &setup_args(), cancel, |chunk| {
                let _ = owner.send(Command::SetupChunk(chunk));
            })
            .await;
            let _ = owner.send(Command::SetupFinished {
                result: result.map(|_| ()),
                reply,
            });
        });
    }

    fn setup_output(&mut self, chunk: String) {
        if let Some(url) = extract_login_url(&chunk) {
            if self.login_urls.insert(url.clone()) {
                self.log(LogLevel::Info, format!("Sign in at {url}"));
                self.emit(Event::LoginUrl(url));
            }
        }
        self.emit(Event::SetupOutput(chunk));
    }

    fn finish_setup(
        &mut self,
        result: Result<()>,
        reply: oneshot::Sender<Result<ConfigurationStatus>>,
    ) {
        match result {
            Ok(()) => {
                self.log(LogLevel::Success, "Setup completed");
                self.begin_check(StatusReply::Setup(reply));
            }
            Err(Error::Cancelled) => {
                self.log(LogLevel::Warning, "Setup cancelled");
                let _ = reply.send(Err(Error::Cancelled));
            }
            Err(err) => {
                self.log(LogLevel::Error, format!("Setup failed: {}", err.summary()));
                let _ = reply.send(Err(err));
            }
        }
    }

    // Mailboxes

    fn is_current(&self, generation: u64) -> bool {
        self.refresh
            .as_ref()
            .is_some_and(|refresh| refresh.generation == generation)
    }

    fn publish_mailboxes(&self) {
        self.emit(Event::MailboxesChanged(self.registry.mailboxes().to_vec()));
    }

    fn set_loading(&mut self, loading: bool) {
        if self.registry.is_loading() != loading {
            self.registry.set_loading(loading);
            self.emit(Event::LoadingChanged(loading));
        }
    }

    fn begin_refresh(&mut self, waiter: Option<oneshot::Sender<RefreshOutcome>>) {
        if !self.status.is_ready() {
            if let Some(waiter) = waiter {
                let _ = waiter.send(RefreshOutcome::Skipped);
            }
            return;
        }
        if let Some(refresh) = &mut self.refresh {
            refresh.waiters.extend(waiter);
            return;
        }
        let Some(owner) = self.worker_sender() else {
            return;
        };

        self.generation += 1;
        let generation = self.generation;
        self.refresh = Some(RefreshState {
            generation,
            waiters: waiter.into_iter().collect(),
        });
        self.set_loading(true);
        self.log(LogLevel::Info, "Refreshing mailboxes...");
        tokio::spawn(list_and_count(self.bridge.clone(), owner, generation));
    }

    /// Finish the in-flight refresh, if any, answering everyone waiting on it.
    fn end_refresh(&mut self, outcome: RefreshOutcome) {
        if let Some(refresh) = self.refresh.take() {
            for waiter in refresh.waiters {
                let _ = waiter.send(outcome.clone());
            }
        }
        self.set_loading(false);
    }

    fn begin_count(&mut self, name: String, reply: oneshot::Sender<Result<u64>>) {
        if !self.status.is_ready() {
            let _ = reply.send(Err(Error::Configuration(self.status.to_string())));
            return;
        }
        let Some(owner) = self.worker_sender() else {
            return;
        };
        let bridge = self.bridge.clone();
        tokio::spawn(async move {
            let result = bridge
                .invoke(&count_args(&name))
                .await
                .map(|output| parse_message_count(&output.combined()));
            let _ = owner.send(Command::CountUpdated {
                name,
                result,
                reply,
            });
        });
    }

    // Jobs

    fn find_job(&self, id: JobId) -> Option<&ExportJob> {
        self.jobs.iter().find(|job| job.id == id)
    }

    fn publish_job(&self, id: JobId) {
        if let Some(job) = self.find_job(id) {
            self.emit(Event::JobUpdated(job.clone()));
        }
    }

    /// Move a job to `next` if the state machine allows it.
    fn transition(&mut self, id: JobId, next: JobStatus) -> Option<&mut ExportJob> {
        let job = self.jobs.iter_mut().find(|job| job.id == id)?;
        if !job.status.can_transition_to(next) {
            debug!("job {id}: ignoring {} -> {next}", job.status);
            return None;
        }
        debug!("job {id}: {} -> {next}", job.status);
        job.status = next;
        Some(job)
    }

    fn notify_waiters(&mut self, id: JobId) {
        let Some(waiters) = self.job_waiters.remove(&id) else {
            return;
        };
        let job = self.find_job(id).cloned();
        for waiter in waiters {
            let _ = waiter.send(job.clone());
        }
    }

    fn enqueue(&mut self, mailbox: Mailbox, options: ExportOptions) -> JobId {
        let job = ExportJob::new(mailbox, options);
        let id = job.id;
        let name = job.mailbox.name.clone();
        self.jobs.push(job);
        self.log(LogLevel::Info, format!("Queued export for {name}"));
        self.publish_job(id);
        self.pending.push_back(id);
        self.start_pending();
        id
    }

    fn has_capacity(&self) -> bool {
        self.max_concurrent
            .is_none_or(|limit| self.running.len() < limit)
    }

    fn start_pending(&mut self) {
        while self.has_capacity() {
            let Some(id) = self.pending.pop_front() else {
                break;
            };
            self.start_job(id);
        }
    }

    fn start_job(&mut self, id: JobId) {
        let Some(owner) = self.worker_sender() else {
            return;
        };
        let Some(job) = self.transition(id, JobStatus::Running) else {
            return;
        };
        job.started_at = Some(Utc::now());
        let name = job.mailbox.name.clone();
        let args = job.options.export_args(&name);

        let cancel = CancellationToken::new();
        self.running.insert(id, cancel.clone());
        self.log(LogLevel::Info, format!("Starting export of {name}"));
        self.publish_job(id);
        tokio::spawn(run_export(self.bridge.clone(), owner, id, args, cancel));
    }

    fn finish_job(&mut self, id: JobId, result: Result<()>) {
        self.running.remove(&id);
        let cancel_requested = self.cancelling.remove(&id);
        let next = match &result {
            Ok(()) => JobStatus::Completed,
            Err(_) if cancel_requested => JobStatus::Cancelled,
            Err(Error::Cancelled) => JobStatus::Cancelled,
            Err(_) => JobStatus::Failed,
        };

        if let Some(job) = self.transition(id, next) {
            job.completed_at = Some(Utc::now());
            let name = job.mailbox.name.clone();
            let (level, message) = match (next, &result) {
                (JobStatus::Completed, _) => {
                    job.progress = 1.0;
                    (LogLevel::Success, format!("Completed export of {name}"))
                }
                (JobStatus::Failed, Err(err)) => {
                    let summary = err.summary();
                    job.error = Some(summary.clone());
                    (LogLevel::Error, format!("Export failed for {name}: {summary}"))
                }
                _ => (LogLevel::Warning, format!("Cancelled export of {name}")),
            };
            self.log(level, message);
            self.publish_job(id);
            self.notify_waiters(id);
        }
        self.start_pending();
    }

    fn mark_cancelled(&mut self, id: JobId) {
        let Some(job) = self.transition(id, JobStatus::Cancelled) else {
            return;
        };
        job.completed_at = Some(Utc::now());
        let name = job.mailbox.name.clone();
        self.log(LogLevel::Warning, format!("Cancelled export of {name}"));
        self.publish_job(id);
        self.notify_waiters(id);
    }

    fn cancel_job(&mut self, id: JobId) -> bool {
        match self.find_job(id).map(|job| job.status) {
            Some(JobStatus::Queued) => {
                self.pending.retain(|queued| *queued != id);
                self.mark_cancelled(id);
                true
            }
            Some(JobStatus::Running) => {
                if let Some(cancel) = self.running.get(&id) {
                    cancel.cancel();
                }
                if self.cancelling.insert(id) {
                    if let Some(owner) = self.worker_sender() {
                        tokio::spawn(async move {
                            tokio::time::sleep(CANCEL_GRACE).await;
                            let _ = owner.send(Command::CancelDeadline(id));
                        });
                    }
                }
                true
            }
            _ => false,
        }
    }

    // Settings and auto-refresh

    fn update_settings(&mut self, settings: AppSettings) {
        self.settings = settings;
        match self.store.save(&self.settings) {
            Ok(()) => self.log(LogLevel::Info, "Settings saved"),
            Err(err) => self.log(LogLevel::Error, format!("Failed to save settings: {err}")),
        }
        self.emit(Event::SettingsChanged(self.settings.clone()));
        if self.settings.refresh_minutes() != self.scheduler.interval() {
            self.restart_auto_refresh();
        }
    }

    fn restart_auto_refresh(&mut self) {
        let minutes = self.settings.refresh_minutes();
        let commands = self.commands.clone();
        let started = self.scheduler.restart(minutes, move || match commands.upgrade() {
            Some(owner) => owner.send(Command::AutoRefreshTick).is_ok(),
            None => false,
        });
        if let (true, Some(minutes)) = (started, minutes) {
            self.log(
                LogLevel::Info,
                format!("Auto-refresh enabled (every {minutes} minutes)"),
            );
        }
    }

    fn stop(&mut self) {
        self.scheduler.stop();
        for cancel in self.running.values() {
            cancel.cancel();
        }
    }
}

/// Run a streaming exporter call, handing every chunk to `on_chunk` as it
/// arrives.
async fn stream_chunks(
    bridge: &dyn ProcessBridge,
    args: &[String],
    cancel: CancellationToken,
    mut on_chunk: impl FnMut(String),
) -> Result<String> {
    let (chunk_tx, mut chunks) = mpsc::unbounded_channel();
    let mut call = bridge.invoke_streaming(args, chunk_tx, cancel);
    let result = loop {
        tokio::select! {
            result = &mut call => break result,
            Some(chunk) = chunks.recv() => on_chunk(chunk),
        }
    };
    while let Ok(chunk) = chunks.try_recv() {
        on_chunk(chunk);
    }
    result
}

async fn run_export(
    bridge: Arc<dyn ProcessBridge>,
    owner: mpsc::UnboundedSender<Command>,
    id: JobId,
    args: Vec<String>,
    cancel: CancellationToken,
) {
    let result = stream_chunks(bridge.as_ref(), &args, cancel, |chunk| {
        if let Some(fraction) = parse_progress(&chunk) {
            let _ = owner.send(Command::JobProgress { id, fraction });
        }
    })
    .await;
    let _ = owner.send(Command::JobFinished {
        id,
        result: result.map(|_| ()),
    });
}

async fn list_and_count(
    bridge: Arc<dyn ProcessBridge>,
    owner: mpsc::UnboundedSender<Command>,
    generation: u64,
) {
    let names = match bridge.invoke(&list_args()).await {
        Ok(output) => parse_mailbox_list(&output.combined()),
        Err(err) => {
            let _ = owner.send(Command::RefreshFailed {
                generation,
                message: err.summary(),
            });
            return;
        }
    };

    let listed = Command::MailboxesListed {
        generation,
        names: names.clone(),
    };
    if owner.send(listed).is_err() {
        return;
    }
    for (index, name) in names.iter().enumerate() {
        match bridge.invoke(&count_args(name)).await {
            Ok(output) => {
                let count = parse_message_count(&output.combined());
                let fetched = Command::CountFetched {
                    generation,
                    index,
                    count,
                };
                if owner.send(fetched).is_err() {
                    return;
                }
            }
            Err(err) => debug!("count for {name} failed: {err}"),
        }
    }
    let _ = owner.send(Command::RefreshFinished { generation });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBridge, MemoryStore, Reply};
    use crate::types::{ExportFormat, ResumeMode};
    use std::fs;
    use tempfile::TempDir;
    use tokio::sync::broadcast::error::RecvError;

    struct Harness {
        orch: Orchestrator,
        bridge: Arc<FakeBridge>,
        store: Arc<MemoryStore>,
        temp: TempDir,
    }

    impl Harness {
        fn credential_file(&self) -> PathBuf {
            self.temp.path().join("token.gpg")
        }
    }

    fn harness_with(
        bridge: FakeBridge,
        store: MemoryStore,
        configure: impl FnOnce(&mut OrchestratorOptions),
    ) -> Harness {
        let temp = TempDir::new().unwrap();
        let credential_file = temp.path().join("token.gpg");
        fs::write(&credential_file, b"token").unwrap();
        let mut options = OrchestratorOptions {
            credential_file,
            dependencies: Vec::new(),
            max_concurrent: None,
        };
        configure(&mut options);

        let bridge = Arc::new(bridge);
        let store = Arc::new(store);
        let orch = Orchestrator::spawn(bridge.clone(), store.clone(), options);
        Harness {
            orch,
            bridge,
            store,
            temp,
        }
    }

    fn harness(bridge: FakeBridge) -> Harness {
        harness_with(bridge, MemoryStore::default(), |_| {})
    }

    fn limited(bridge: FakeBridge, limit: usize) -> Harness {
        harness_with(bridge, MemoryStore::default(), |o| {
            o.max_concurrent = Some(limit)
        })
    }

    fn export_options() -> ExportOptions {
        ExportOptions {
            format: ExportFormat::Eml,
            output_directory: PathBuf::from("/tmp/muttpu-export"),
            year: None,
            resume_mode: ResumeMode::Resume,
            include_non_mail_folders: false,
        }
    }

    async fn wait_for(events: &mut broadcast::Receiver<Event>, matches: impl Fn(&Event) -> bool) {
        let found = async {
            loop {
                match events.recv().await {
                    Ok(event) if matches(&event) => return,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => panic!("event stream closed"),
                }
            }
        };
        // Longer than any auto-refresh interval the tests schedule.
        tokio::time::timeout(Duration::from_secs(10 * 60), found)
            .await
            .expect("expected event");
    }

    async fn wait_running(events: &mut broadcast::Receiver<Event>, id: JobId) {
        wait_for(events, |e| {
            matches!(e, Event::JobUpdated(job) if job.id == id && job.status == JobStatus::Running)
        })
        .await;
    }

    async fn messages(orch: &Orchestrator) -> Vec<String> {
        orch.log_entries()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.message)
            .collect()
    }

    #[tokio::test]
    async fn test_check_without_credentials() {
        let h = harness(FakeBridge::new().on(&["list"], vec![Reply::ok("1. INBOX\n")]));
        fs::remove_file(h.credential_file()).unwrap();

        let status = h.orch.check_configuration().await.unwrap();
        assert_eq!(status, ConfigurationStatus::NotConfigured);
        assert!(h.bridge.calls().is_empty());
    }

    #[tokio::test]
    async fn test_check_probe_success() {
        let h = harness(FakeBridge::new().on(&["list"], vec![Reply::ok("  1. INBOX\n")]));
        let status = h.orch.check_configuration().await.unwrap();
        assert_eq!(status, ConfigurationStatus::Configured);
        assert_eq!(
            h.orch.configuration_status().await.unwrap(),
            ConfigurationStatus::Configured
        );
        assert!(messages(&h.orch)
            .await
            .contains(&"Configuration validated successfully".to_string()));
    }

    #[tokio::test]
    async fn test_check_probe_failure() {
        let h = harness(FakeBridge::new().on(
            &["list"],
            vec![Reply::fail("ℹ Connecting...\n✗ Authentication failed: token expired\n")],
        ));
        let status = h.orch.check_configuration().await.unwrap();
        assert_eq!(
            status,
            ConfigurationStatus::Error("Authentication failed: token expired".into())
        );

        let errors = h.orch.log_filtered(Some(LogLevel::Error), None).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("token expired"));
    }

    #[tokio::test]
    async fn test_validate_reports_missing_dependencies() {
        let h = harness_with(FakeBridge::new(), MemoryStore::default(), |o| {
            o.dependencies = vec!["muttpu-no-such-binary".into()]
        });
        let expected = ConfigurationStatus::MissingDependencies(vec!["muttpu-no-such-binary".into()]);
        assert_eq!(h.orch.validate_configuration().await.unwrap(), expected);
        assert_eq!(h.orch.configuration_status().await.unwrap(), expected);
        assert_eq!(
            h.orch.check_dependencies().await.unwrap(),
            vec!["muttpu-no-such-binary".to_string()]
        );
    }

    #[tokio::test]
    async fn test_export_happy_path() {
        let h = harness(FakeBridge::new().on(
            &["export"],
            vec![Reply::chunks(&[
                "Exporting INBOX\n",
                "[1/4] 25.0%\n",
                "[2/4] 50.0%\n",
                "Done\n",
            ])],
        ));
        let mut events = h.orch.subscribe();
        let id = h
            .orch
            .enqueue(Mailbox::new("INBOX"), export_options())
            .await
            .unwrap();

        let job = h.orch.wait_for_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_some());
        assert!(job.duration(Utc::now()).unwrap() >= chrono::Duration::zero());
        assert_eq!(job.progress, 1.0);
        assert!(job.error.is_none());

        assert_eq!(
            h.bridge.calls(),
            vec![vec!["export", "INBOX", "/tmp/muttpu-export", "--format", "eml"]]
        );

        let mut progress = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let Event::JobUpdated(job) = event {
                progress.push(job.progress);
            }
        }
        assert!(progress.contains(&0.25));
        assert!(progress.contains(&0.5));

        assert_eq!(
            messages(&h.orch).await,
            vec![
                "Completed export of INBOX",
                "Starting export of INBOX",
                "Queued export for INBOX",
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_job_leaves_others_alone() {
        let h = harness(
            FakeBridge::new()
                .on(
                    &["export", "INBOX"],
                    vec![Reply::fail("[1/9] 11.1%\n✗ Mailbox not found: INBOX\n")],
                )
                .on(&["export", "Archive"], vec![Reply::ok("[1/1] 100.0%\n")]),
        );
        let failing = h
            .orch
            .enqueue(Mailbox::new("INBOX"), export_options())
            .await
            .unwrap();
        let passing = h
            .orch
            .enqueue(Mailbox::new("Archive"), export_options())
            .await
            .unwrap();

        let failed = h.orch.wait_for_job(failing).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("Mailbox not found: INBOX"));
        assert!(failed.completed_at.is_some());

        let done = h.orch.wait_for_job(passing).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);

        let again = h
            .orch
            .enqueue(Mailbox::new("Archive"), export_options())
            .await
            .unwrap();
        let job = h.orch.wait_for_job(again).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(h.orch.jobs().await.unwrap().len(), 3);
        assert!(messages(&h.orch)
            .await
            .contains(&"Export failed for INBOX: Mailbox not found: INBOX".to_string()));
    }

    #[tokio::test]
    async fn test_concurrency_limit_runs_in_order() {
        let h = limited(
            FakeBridge::new().on(&["export"], vec![Reply::ok("done\n").gated()]),
            1,
        );
        let mut events = h.orch.subscribe();
        let mut ids = Vec::new();
        for name in ["INBOX", "Archive", "Sent"] {
            ids.push(
                h.orch
                    .enqueue(Mailbox::new(name), export_options())
                    .await
                    .unwrap(),
            );
        }
        wait_running(&mut events, ids[0]).await;

        let statuses: Vec<JobStatus> = h
            .orch
            .jobs()
            .await
            .unwrap()
            .iter()
            .map(|j| j.status)
            .collect();
        assert_eq!(
            statuses,
            vec![JobStatus::Running, JobStatus::Queued, JobStatus::Queued]
        );

        h.bridge.release(3);
        for id in &ids {
            let job = h.orch.wait_for_job(*id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Completed);
        }
        let started: Vec<String> = h.bridge.calls().iter().map(|args| args[1].clone()).collect();
        assert_eq!(started, vec!["INBOX", "Archive", "Sent"]);
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let h = limited(
            FakeBridge::new().on(&["export"], vec![Reply::ok("done\n").gated()]),
            1,
        );
        let mut events = h.orch.subscribe();
        let first = h
            .orch
            .enqueue(Mailbox::new("INBOX"), export_options())
            .await
            .unwrap();
        let second = h
            .orch
            .enqueue(Mailbox::new("Archive"), export_options())
            .await
            .unwrap();
        wait_running(&mut events, first).await;

        assert!(h.orch.cancel(second).await.unwrap());
        let cancelled = h.orch.job(second).await.unwrap().unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());
        assert!(cancelled.started_at.is_none());

        h.bridge.release(1);
        let done = h.orch.wait_for_job(first).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(h.bridge.calls_to("export"), 1);
        assert!(!h.orch.cancel(second).await.unwrap());
        assert!(!h.orch.cancel(first).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_running_job() {
        let h = harness(FakeBridge::new().on(&["export"], vec![Reply::ok("done\n").gated()]));
        let mut events = h.orch.subscribe();
        let id = h
            .orch
            .enqueue(Mailbox::new("INBOX"), export_options())
            .await
            .unwrap();
        wait_running(&mut events, id).await;

        assert!(h.orch.cancel(id).await.unwrap());
        let job = h.orch.wait_for_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.error.is_none());
        assert!(!h.orch.cancel(id).await.unwrap());

        let warnings = h.orch.log_filtered(Some(LogLevel::Warning), None).await.unwrap();
        assert_eq!(warnings[0].message, "Cancelled export of INBOX");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_gives_up_waiting_for_stubborn_export() {
        let h = harness(FakeBridge::new().on(&["export"], vec![Reply::ok("done\n").stubborn()]));
        let mut events = h.orch.subscribe();
        let id = h
            .orch
            .enqueue(Mailbox::new("INBOX"), export_options())
            .await
            .unwrap();
        wait_running(&mut events, id).await;

        assert!(h.orch.cancel(id).await.unwrap());
        let job = h.orch.wait_for_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);

        // The late success must not resurrect the job.
        h.bridge.release(1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let job = h.orch.job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.progress, 0.0);
    }

    #[tokio::test]
    async fn test_wait_for_unknown_job() {
        let h = harness(FakeBridge::new());
        assert!(h.orch.wait_for_job(uuid::Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_refresh_skipped_until_configured() {
        let h = harness(FakeBridge::new().on(&["list"], vec![Reply::ok("1. INBOX\n")]));
        assert_eq!(
            h.orch.refresh_mailboxes().await.unwrap(),
            RefreshOutcome::Skipped
        );
        assert!(h.bridge.calls().is_empty());
        assert!(matches!(
            h.orch.refresh_count("INBOX").await,
            Err(Error::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_loads_mailboxes_and_counts() {
        let h = harness(
            FakeBridge::new()
                .on(
                    &["list"],
                    vec![Reply::ok(
                        "=== Mailboxes ===\n  1. INBOX\n  2. Archive\n  3. Calendar\n",
                    )],
                )
                .on(&["count", "INBOX"], vec![Reply::ok("INBOX: 1,234 messages\n")])
                .on(&["count", "Archive"], vec![Reply::fail("✗ Timed out\n")])
                .on(&["count", "Calendar"], vec![Reply::ok("Calendar: 3 messages\n")]),
        );
        h.orch.check_configuration().await.unwrap();

        let RefreshOutcome::Loaded(mailboxes) = h.orch.refresh_mailboxes().await.unwrap() else {
            panic!("expected mailboxes");
        };
        let names: Vec<&str> = mailboxes.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["INBOX", "Archive", "Calendar"]);
        let counts: Vec<Option<u64>> = mailboxes.iter().map(|m| m.message_count).collect();
        assert_eq!(counts, vec![Some(1234), None, Some(3)]);

        assert!(!h.orch.is_loading().await.unwrap());
        let visible = h.orch.visible_mailboxes().await.unwrap();
        assert_eq!(visible.len(), 2);
        assert!(messages(&h.orch)
            .await
            .contains(&"Loaded 3 mailboxes".to_string()));
    }

    #[tokio::test]
    async fn test_failed_list_keeps_previous_mailboxes() {
        let h = harness(
            FakeBridge::new()
                .on(
                    &["list"],
                    vec![
                        Reply::ok("1. INBOX\n"),
                        Reply::ok("1. INBOX\n"),
                        Reply::fail("✗ Connection lost\n"),
                    ],
                )
                .on(&["count"], vec![Reply::ok("INBOX: 5 messages\n")]),
        );
        h.orch.check_configuration().await.unwrap();
        assert!(matches!(
            h.orch.refresh_mailboxes().await.unwrap(),
            RefreshOutcome::Loaded(_)
        ));

        assert_eq!(
            h.orch.refresh_mailboxes().await.unwrap(),
            RefreshOutcome::Failed("Connection lost".into())
        );
        let mailboxes = h.orch.mailboxes().await.unwrap();
        assert_eq!(mailboxes.len(), 1);
        assert_eq!(mailboxes[0].message_count, Some(5));
        assert!(!h.orch.is_loading().await.unwrap());
        assert_eq!(
            messages(&h.orch).await[0],
            "Failed to refresh mailboxes: Connection lost"
        );
    }

    #[tokio::test]
    async fn test_refresh_count() {
        let h = harness(
            FakeBridge::new()
                .on(&["list"], vec![Reply::ok("1. INBOX\n")])
                .on(
                    &["count"],
                    vec![Reply::ok("INBOX: 5 messages\n"), Reply::ok("INBOX: 7 messages\n")],
                ),
        );
        h.orch.check_configuration().await.unwrap();
        h.orch.refresh_mailboxes().await.unwrap();

        assert_eq!(h.orch.refresh_count("INBOX").await.unwrap(), 7);
        assert_eq!(h.orch.mailboxes().await.unwrap()[0].message_count, Some(7));
    }

    #[tokio::test]
    async fn test_refresh_reads_stderr_too() {
        let h = harness(
            FakeBridge::new()
                .on(&["list"], vec![Reply::streams("", "  1. INBOX\n")])
                .on(&["count"], vec![Reply::streams("", "ℹ INBOX: 1,204 messages\n")]),
        );
        h.orch.check_configuration().await.unwrap();
        let RefreshOutcome::Loaded(mailboxes) = h.orch.refresh_mailboxes().await.unwrap() else {
            panic!("refresh did not load");
        };
        assert_eq!(mailboxes.len(), 1);
        assert_eq!(mailboxes[0].message_count, Some(1204));
        assert_eq!(h.orch.refresh_count("INBOX").await.unwrap(), 1204);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stubborn_export_keeps_its_slot() {
        let h = limited(
            FakeBridge::new().on(
                &["export"],
                vec![Reply::ok("done\n").stubborn(), Reply::ok("done\n")],
            ),
            1,
        );
        let mut events = h.orch.subscribe();
        let first = h
            .orch
            .enqueue(Mailbox::new("INBOX"), export_options())
            .await
            .unwrap();
        let second = h
            .orch
            .enqueue(Mailbox::new("Archive"), export_options())
            .await
            .unwrap();
        wait_running(&mut events, first).await;

        assert!(h.orch.cancel(first).await.unwrap());
        let job = h.orch.wait_for_job(first).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);

        // The first child has not exited, so the second job must wait.
        tokio::time::sleep(Duration::from_secs(60)).await;
        let waiting = h.orch.job(second).await.unwrap().unwrap();
        assert_eq!(waiting.status, JobStatus::Queued);
        assert_eq!(h.bridge.calls_to("export"), 1);

        h.bridge.release(1);
        let done = h.orch.wait_for_job(second).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(h.bridge.calls_to("export"), 2);
    }

    #[tokio::test]
    async fn test_reset_configuration() {
        let h = harness(
            FakeBridge::new()
                .on(&["list"], vec![Reply::ok("1. INBOX\n")])
                .on(&["count"], vec![Reply::ok("INBOX: 1 messages\n")]),
        );
        h.orch.check_configuration().await.unwrap();
        h.orch.refresh_mailboxes().await.unwrap();

        h.orch.reset_configuration().await.unwrap();
        assert!(!h.credential_file().exists());
        assert_eq!(
            h.orch.configuration_status().await.unwrap(),
            ConfigurationStatus::NotConfigured
        );
        assert!(h.orch.mailboxes().await.unwrap().is_empty());
        assert_eq!(messages(&h.orch).await[0], "Configuration reset");

        h.orch.reset_configuration().await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_interrupts_refresh() {
        let h = harness(FakeBridge::new().on(
            &["list"],
            vec![Reply::ok("1. INBOX\n"), Reply::ok("1. INBOX\n").gated()],
        ));
        h.orch.check_configuration().await.unwrap();

        let mut events = h.orch.subscribe();
        let refreshing = {
            let orch = h.orch.clone();
            tokio::spawn(async move { orch.refresh_mailboxes().await })
        };
        wait_for(&mut events, |e| matches!(e, Event::LoadingChanged(true))).await;

        h.orch.reset_configuration().await.unwrap();
        assert_eq!(refreshing.await.unwrap().unwrap(), RefreshOutcome::Skipped);
        assert!(!h.orch.is_loading().await.unwrap());
        assert!(h.orch.mailboxes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_settings_loaded_on_spawn() {
        let saved = AppSettings {
            hide_non_mail_folders: false,
            default_export_format: ExportFormat::Mbox,
            ..Default::default()
        };
        let h = harness_with(FakeBridge::new(), MemoryStore::with(saved.clone()), |_| {});
        assert_eq!(h.orch.settings().await.unwrap(), saved);
    }

    #[tokio::test]
    async fn test_update_settings_persists() {
        let h = harness(FakeBridge::new());
        let settings = AppSettings {
            default_resume_mode: ResumeMode::Fresh,
            ..Default::default()
        };
        h.orch.update_settings(settings.clone()).await.unwrap();
        assert_eq!(h.store.saved(), Some(settings));
        assert_eq!(messages(&h.orch).await[0], "Settings saved");
    }

    #[tokio::test]
    async fn test_settings_save_failure_is_logged() {
        let h = harness_with(FakeBridge::new(), MemoryStore::failing(), |_| {});
        let settings = AppSettings {
            hide_non_mail_folders: false,
            ..Default::default()
        };
        h.orch.update_settings(settings.clone()).await.unwrap();
        assert_eq!(h.orch.settings().await.unwrap(), settings);

        let errors = h.orch.log_filtered(Some(LogLevel::Error), None).await.unwrap();
        assert!(errors[0].message.starts_with("Failed to save settings"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_change_keeps_single_loop() {
        let h = harness(FakeBridge::new());
        for minutes in [5, 15] {
            let settings = AppSettings {
                auto_refresh_interval: Some(minutes),
                ..Default::default()
            };
            h.orch.update_settings(settings).await.unwrap();
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        let status = h.orch.auto_refresh().await.unwrap();
        assert_eq!(status.interval_minutes, Some(15));
        assert_eq!(status.active_loops, 1);

        tokio::time::sleep(Duration::from_secs(40 * 60)).await;
        assert_eq!(h.orch.auto_refresh().await.unwrap().active_loops, 1);
        assert!(messages(&h.orch)
            .await
            .contains(&"Auto-refresh enabled (every 15 minutes)".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_refresh_tick_refreshes_when_configured() {
        let store = MemoryStore::with(AppSettings {
            auto_refresh_interval: Some(1),
            ..Default::default()
        });
        let h = harness_with(
            FakeBridge::new()
                .on(&["list"], vec![Reply::ok("1. INBOX\n")])
                .on(&["count"], vec![Reply::ok("INBOX: 2 messages\n")]),
            store,
            |_| {},
        );
        let mut events = h.orch.subscribe();
        h.orch.check_configuration().await.unwrap();

        wait_for(&mut events, |e| {
            matches!(e, Event::Log(entry) if entry.message == "Loaded 1 mailboxes")
        })
        .await;
        assert_eq!(h.bridge.calls_to("list"), 2);

        assert!(h.orch.stop_auto_refresh().await.unwrap());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.orch.auto_refresh().await.unwrap().active_loops, 0);
        assert_eq!(messages(&h.orch).await[0], "Auto-refresh disabled");
    }

    #[tokio::test]
    async fn test_huge_refresh_interval_keeps_owner_alive() {
        let h = harness(FakeBridge::new());
        h.orch
            .update_settings(AppSettings {
                auto_refresh_interval: Some(i64::MAX),
                ..Default::default()
            })
            .await
            .unwrap();

        let state = h.orch.auto_refresh().await.unwrap();
        assert_eq!(state.interval_minutes, Some(i64::MAX as u64));
        assert!(h.orch.jobs().await.unwrap().is_empty());
        assert_eq!(
            h.store.saved().unwrap().auto_refresh_interval,
            Some(i64::MAX)
        );
    }

    #[tokio::test]
    async fn test_setup_reports_login_url_once() {
        let url = "https://login.microsoftonline.com/common/oauth2/v2.0/devicecode?code=ABC";
        let line = format!("Open {url} in your browser\n");
        let h = harness(
            FakeBridge::new()
                .on(
                    &["setup"],
                    vec![Reply::chunks(&[
                        "Starting OAuth2 flow\n",
                        line.as_str(),
                        line.as_str(),
                        "✓ Token saved\n",
                    ])],
                )
                .on(&["list"], vec![Reply::ok("1. INBOX\n")]),
        );
        let mut events = h.orch.subscribe();

        let status = h.orch.run_setup(CancellationToken::new()).await.unwrap();
        assert_eq!(status, ConfigurationStatus::Configured);

        let mut urls = Vec::new();
        let mut output = String::new();
        while let Ok(event) = events.try_recv() {
            match event {
                Event::LoginUrl(found) => urls.push(found),
                Event::SetupOutput(chunk) => output.push_str(&chunk),
                _ => {}
            }
        }
        assert_eq!(urls, vec![url.to_string()]);
        assert!(output.contains("Token saved"));
    }

    #[tokio::test]
    async fn test_setup_requires_dependencies() {
        let h = harness_with(
            FakeBridge::new().on(&["setup"], vec![Reply::ok("")]),
            MemoryStore::default(),
            |o| o.dependencies = vec!["muttpu-no-such-binary".into()],
        );
        let err = h.orch.run_setup(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::MissingDependencies(ref names) if names.len() == 1));
        assert!(h.bridge.calls().is_empty());
    }

    #[tokio::test]
    async fn test_setup_failure() {
        let h = harness(FakeBridge::new().on(&["setup"], vec![Reply::fail("✗ Device code expired\n")]));
        let err = h.orch.run_setup(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));
        assert_eq!(messages(&h.orch).await[0], "Setup failed: Device code expired");
    }

    #[tokio::test]
    async fn test_log_filter_and_clear() {
        let h = harness(FakeBridge::new());
        let mut events = h.orch.subscribe();
        h.orch.log(LogLevel::Warning, "Disk almost full").unwrap();
        h.orch.log(LogLevel::Info, "Queued export for INBOX").unwrap();

        let warnings = h.orch.log_filtered(Some(LogLevel::Warning), None).await.unwrap();
        assert_eq!(warnings.len(), 1);
        let inbox = h.orch.log_filtered(None, Some("inbox")).await.unwrap();
        assert_eq!(inbox.len(), 1);

        h.orch.clear_log().unwrap();
        assert!(h.orch.log_entries().await.unwrap().is_empty());
        wait_for(&mut events, |e| matches!(e, Event::LogCleared)).await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_handle() {
        let h = harness(FakeBridge::new());
        h.orch.shutdown().await.unwrap();
        assert!(matches!(h.orch.jobs().await, Err(Error::Closed)));
    }
}
