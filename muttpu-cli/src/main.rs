//! muttpu-ctl - queue and monitor mailbox exports.

use std::collections::HashSet;
use std::env;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use env_logger::fmt::WriteStyle;
use log::{LevelFilter, debug};
use muttpu_core::{
    AppConfig, AppPaths, AppSettings, ConfigurationStatus, Event, ExportFormat, ExportJob,
    ExportOptions, ExporterBridge, JobId, JobStatus, JsonSettingsStore, LogEntry, LogLevel,
    Mailbox, Orchestrator, OrchestratorOptions, RefreshOutcome, ResumeMode, SettingsStore,
};
use owo_colors::OwoColorize;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

const APP_NAME: &str = "muttpu-ctl";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    let bootstrap = !matches!(cli.command, Command::Init(_));
    let ctx = RuntimeContext::new(cli.common.clone(), bootstrap)?;
    ctx.init_logging()?;
    debug!("config loaded from {}", ctx.paths.global_config.display());

    match cli.command {
        Command::Settings { command } => handle_settings(&ctx, command),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Completions { shell } => handle_completions(shell),
        command => {
            let runtime = tokio::runtime::Runtime::new().context("starting async runtime")?;
            runtime.block_on(run_async(&ctx, command))
        }
    }
}

async fn run_async(ctx: &RuntimeContext, command: Command) -> Result<()> {
    match command {
        Command::Status => handle_status(ctx).await,
        Command::Check => handle_check(ctx).await,
        Command::Deps => handle_deps(ctx).await,
        Command::Setup => handle_setup(ctx).await,
        Command::Reset => handle_reset(ctx).await,
        Command::Mailboxes(args) => handle_mailboxes(ctx, args).await,
        Command::Count(args) => handle_count(ctx, args).await,
        Command::Export(args) => handle_export(ctx, args).await,
        Command::Watch(args) => handle_watch(ctx, args).await,
        Command::Settings { .. }
        | Command::Config { .. }
        | Command::Init(_)
        | Command::Completions { .. } => unreachable!("handled synchronously"),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Queue and monitor mailbox exports driven by muttpu.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[arg(long, global = true)]
    debug: bool,
    #[arg(long, global = true)]
    trace: bool,
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    #[arg(long, global = true)]
    yaml: bool,
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    #[arg(short = 'y', long = "yes", alias = "force", global = true)]
    assume_yes: bool,
    /// Kill any exporter call running longer than this
    #[arg(long = "timeout", value_name = "SECONDS", global = true)]
    timeout: Option<u64>,
    #[arg(long = "no-progress", global = true)]
    no_progress: bool,
    #[arg(long = "diagnostics", global = true)]
    diagnostics: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check credentials and dependencies without contacting the server
    Status,
    /// Verify the exporter can reach the mail server
    Check,
    /// List missing external dependencies
    Deps,
    /// Run the exporter's OAuth2 setup
    Setup,
    /// Delete stored credentials
    Reset,
    /// List mailboxes with message counts
    #[command(alias = "ls")]
    Mailboxes(MailboxesArgs),
    /// Count the messages in one mailbox
    Count(CountArgs),
    /// Export one or more mailboxes
    Export(ExportArgs),
    /// Refresh mailboxes periodically and print activity
    Watch(WatchArgs),
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    Init(InitCommand),
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Args)]
struct MailboxesArgs {
    /// Include calendar, contacts and other non-mail folders
    #[arg(short, long)]
    all: bool,
}

#[derive(Debug, Args)]
struct CountArgs {
    mailbox: String,
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[arg(required = true)]
    mailboxes: Vec<String>,
    /// Output directory (defaults to the saved setting)
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,
    /// eml or mbox
    #[arg(short, long)]
    format: Option<ExportFormat>,
    /// Only export messages from this year
    #[arg(long)]
    year: Option<i32>,
    /// resume, fresh or incremental
    #[arg(short, long)]
    mode: Option<ResumeMode>,
    /// Maximum exports running at once (overrides queue.max_concurrent)
    #[arg(short = 'j', long)]
    concurrency: Option<usize>,
}

#[derive(Debug, Args)]
struct WatchArgs {
    /// Minutes between refreshes (saved as the new default)
    #[arg(short, long, value_name = "MIN")]
    interval: Option<i64>,
    /// Only show entries of this level
    #[arg(short, long)]
    level: Option<LogLevel>,
}

#[derive(Debug, Subcommand)]
enum SettingsCommand {
    Show,
    Path,
    Set(SettingsSetArgs),
}

#[derive(Debug, Args)]
struct SettingsSetArgs {
    #[arg(value_enum)]
    key: SettingKey,
    value: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SettingKey {
    HideNonMailFolders,
    Format,
    OutputDir,
    ResumeMode,
    AutoRefresh,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    Show,
    Path,
    Reset,
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts, bootstrap: bool) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        if bootstrap {
            AppConfig::ensure_default(&paths.global_config)?;
        }
        let mut config = AppConfig::load(&paths)?;
        if let Some(timeout) = common.timeout {
            config.exporter.timeout_secs = Some(timeout);
        }
        Ok(Self {
            common,
            paths,
            config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));

        builder.filter_level(self.effective_log_level());

        if self.color_disabled() {
            builder.write_style(WriteStyle::Never);
        } else if self.color_forced() {
            builder.write_style(WriteStyle::Always);
        } else {
            builder.write_style(WriteStyle::Auto);
        }

        if self.common.diagnostics {
            builder.format_timestamp_millis();
            builder.format_module_path(true);
            builder.format_target(true);
        }

        builder.try_init().or_else(|err| {
            if self.common.verbose > 0 {
                eprintln!("logger already initialized: {err}");
            }
            Ok(())
        })
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => LevelFilter::Info,
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn color_forced(&self) -> bool {
        self.common.color == ColorOption::Always || env::var_os("FORCE_COLOR").is_some()
    }

    fn color_disabled(&self) -> bool {
        self.common.no_color
            || self.common.color == ColorOption::Never
            || env::var_os("NO_COLOR").is_some()
    }

    fn use_color(&self) -> bool {
        !self.color_disabled() && (self.color_forced() || io::stdout().is_terminal())
    }

    fn structured(&self) -> bool {
        self.common.json || self.common.yaml
    }

    fn settings_store(&self) -> JsonSettingsStore {
        JsonSettingsStore::new(&self.paths.settings_file)
    }

    fn orchestrator(&self, max_concurrent: Option<usize>) -> Result<Orchestrator> {
        let bridge = ExporterBridge::from_config(&self.config.exporter)
            .context("configuring exporter")?;
        let mut options = OrchestratorOptions::from_config(&self.config)?;
        if let Some(limit) = max_concurrent {
            options.max_concurrent = (limit > 0).then_some(limit);
        }
        Ok(Orchestrator::spawn(
            Arc::new(bridge),
            Arc::new(self.settings_store()),
            options,
        ))
    }
}

async fn handle_status(ctx: &RuntimeContext) -> Result<()> {
    let orch = ctx.orchestrator(None)?;
    let status = orch.validate_configuration().await?;
    print_status(ctx, &status)
}

async fn handle_check(ctx: &RuntimeContext) -> Result<()> {
    let orch = ctx.orchestrator(None)?;
    let status = orch.check_configuration().await?;
    print_status(ctx, &status)?;
    if let ConfigurationStatus::Error(message) = status {
        bail!("configuration check failed: {message}");
    }
    Ok(())
}

async fn handle_deps(ctx: &RuntimeContext) -> Result<()> {
    let orch = ctx.orchestrator(None)?;
    let missing = orch.check_dependencies().await?;
    if ctx.structured() {
        return emit_output(&ctx.common, &missing);
    }
    if missing.is_empty() {
        println!("All dependencies installed");
    } else {
        for name in &missing {
            println!("missing: {name}");
        }
        println!("Install them with your package manager (e.g. brew install {})", missing.join(" "));
    }
    Ok(())
}

async fn handle_setup(ctx: &RuntimeContext) -> Result<()> {
    let orch = ctx.orchestrator(None)?;
    let color = ctx.use_color();
    let mut events = orch.subscribe();
    let cancel = CancellationToken::new();

    let setup = orch.run_setup(cancel.clone());
    tokio::pin!(setup);
    let result = loop {
        tokio::select! {
            result = &mut setup => break result,
            _ = tokio::signal::ctrl_c() => cancel.cancel(),
            event = events.recv() => print_setup_event(event, color),
        }
    };
    while let Ok(event) = events.try_recv() {
        print_setup_event(Ok(event), color);
    }

    let status = result.context("running setup")?;
    print_status(ctx, &status)
}

fn print_setup_event(event: std::result::Result<Event, RecvError>, color: bool) {
    match event {
        Ok(Event::SetupOutput(chunk)) => {
            print!("{chunk}");
            let _ = io::stdout().flush();
        }
        Ok(Event::LoginUrl(url)) => {
            if color {
                println!("\n{} {}", "Open in your browser:".bold(), url.cyan());
            } else {
                println!("\nOpen in your browser: {url}");
            }
        }
        _ => {}
    }
}

async fn handle_reset(ctx: &RuntimeContext) -> Result<()> {
    let credential_file = ctx.config.exporter.credential_path()?;
    if !ctx.common.assume_yes {
        let confirmed = dialoguer::Confirm::new()
            .with_prompt(format!("Delete {}?", credential_file.display()))
            .default(false)
            .interact()
            .context("reading confirmation")?;
        if !confirmed {
            println!("Aborted");
            return Ok(());
        }
    }
    if ctx.common.dry_run {
        println!("dry-run: would delete {}", credential_file.display());
        return Ok(());
    }
    let orch = ctx.orchestrator(None)?;
    orch.reset_configuration().await?;
    println!("Configuration reset");
    Ok(())
}

async fn ensure_configured(orch: &Orchestrator) -> Result<()> {
    match orch.check_configuration().await? {
        ConfigurationStatus::Configured => Ok(()),
        ConfigurationStatus::NotConfigured => {
            bail!("not configured; run `{APP_NAME} setup` first")
        }
        status => bail!("exporter is not ready: {status}"),
    }
}

async fn handle_mailboxes(ctx: &RuntimeContext, args: MailboxesArgs) -> Result<()> {
    let orch = ctx.orchestrator(None)?;
    ensure_configured(&orch).await?;
    match orch.refresh_mailboxes().await? {
        RefreshOutcome::Loaded(_) => {}
        RefreshOutcome::Failed(message) => bail!("failed to list mailboxes: {message}"),
        RefreshOutcome::Skipped => bail!("mailbox refresh was skipped"),
    }
    let mailboxes = if args.all {
        orch.mailboxes().await?
    } else {
        orch.visible_mailboxes().await?
    };

    if ctx.structured() {
        return emit_output(&ctx.common, &mailboxes);
    }
    let color = ctx.use_color();
    for mailbox in &mailboxes {
        print_mailbox(mailbox, color);
    }
    Ok(())
}

fn print_mailbox(mailbox: &Mailbox, color: bool) {
    if color && mailbox.is_hidden {
        println!("  {}", mailbox.display_name().dimmed());
    } else {
        println!("  {}", mailbox.display_name());
    }
}

async fn handle_count(ctx: &RuntimeContext, args: CountArgs) -> Result<()> {
    let orch = ctx.orchestrator(None)?;
    ensure_configured(&orch).await?;
    let count = orch
        .refresh_count(args.mailbox.as_str())
        .await
        .with_context(|| format!("counting {}", args.mailbox))?;

    #[derive(Debug, Serialize)]
    struct CountOutput<'a> {
        mailbox: &'a str,
        messages: u64,
    }
    if ctx.structured() {
        return emit_output(
            &ctx.common,
            &CountOutput {
                mailbox: &args.mailbox,
                messages: count,
            },
        );
    }
    println!("{}: {count} messages", args.mailbox);
    Ok(())
}

async fn handle_export(ctx: &RuntimeContext, args: ExportArgs) -> Result<()> {
    let orch = ctx.orchestrator(args.concurrency)?;
    let settings = orch.settings().await?;
    let output = args
        .output
        .clone()
        .or_else(|| settings.default_output_directory.clone())
        .ok_or_else(|| {
            anyhow!("no output directory; pass --output or `{APP_NAME} settings set output-dir DIR`")
        })?;

    let mut options = ExportOptions::from_settings(&settings, output);
    if let Some(format) = args.format {
        options.format = format;
    }
    if let Some(mode) = args.mode {
        options.resume_mode = mode;
    }
    options.year = args.year;

    ensure_configured(&orch).await?;

    let color = ctx.use_color();
    let show_progress = !ctx.common.no_progress && !ctx.structured();
    let mut events = orch.subscribe();
    let mut waiting = HashSet::new();
    for name in &args.mailboxes {
        waiting.insert(orch.enqueue(Mailbox::new(name.as_str()), options.clone()).await?);
    }

    let mut interrupted = false;
    while !waiting.is_empty() {
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                eprintln!("Cancelling exports...");
                for id in &waiting {
                    orch.cancel(*id).await?;
                }
            }
            event = events.recv() => match event {
                Ok(Event::JobUpdated(job)) if waiting.contains(&job.id) => {
                    if show_progress {
                        println!("{}", job_line(&job, color));
                    }
                    if job.status.is_terminal() {
                        waiting.remove(&job.id);
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!("missed {skipped} events; polling jobs");
                    forget_finished(&orch, &mut waiting).await?;
                }
                Err(RecvError::Closed) => bail!("orchestrator stopped unexpectedly"),
            },
        }
    }

    let jobs = orch.jobs().await?;
    if ctx.structured() {
        emit_output(&ctx.common, &jobs)?;
    } else {
        print_job_summary(&jobs, color);
    }

    let failed = jobs
        .iter()
        .filter(|job| job.status == JobStatus::Failed)
        .count();
    if failed > 0 {
        bail!("{failed} of {} exports failed", jobs.len());
    }
    Ok(())
}

async fn forget_finished(orch: &Orchestrator, waiting: &mut HashSet<JobId>) -> Result<()> {
    for job in orch.jobs().await? {
        if job.status.is_terminal() {
            waiting.remove(&job.id);
        }
    }
    Ok(())
}

fn status_label(status: JobStatus, color: bool) -> String {
    let label = format!("{status:<9}");
    if !color {
        return label;
    }
    match status {
        JobStatus::Queued => label.dimmed().to_string(),
        JobStatus::Running => label.cyan().to_string(),
        JobStatus::Completed => label.green().to_string(),
        JobStatus::Failed => label.red().to_string(),
        JobStatus::Cancelled => label.yellow().to_string(),
    }
}

fn job_line(job: &ExportJob, color: bool) -> String {
    format!(
        "{} {:>5.1}%  {}",
        status_label(job.status, color),
        job.progress * 100.0,
        job.mailbox.name
    )
}

fn print_job_summary(jobs: &[ExportJob], color: bool) {
    let now = Utc::now();
    for job in jobs {
        let duration = job.formatted_duration(now).unwrap_or_default();
        print!("{} {:<30} {}", status_label(job.status, color), job.mailbox.name, duration);
        match &job.error {
            Some(error) if color => println!("  {}", error.red()),
            Some(error) => println!("  {error}"),
            None => println!(),
        }
    }
}

async fn handle_watch(ctx: &RuntimeContext, args: WatchArgs) -> Result<()> {
    let orch = ctx.orchestrator(None)?;
    let color = ctx.use_color();
    let mut events = orch.subscribe();

    ensure_configured(&orch).await?;
    if let Some(minutes) = args.interval {
        let mut settings = orch.settings().await?;
        settings.auto_refresh_interval = Some(minutes);
        orch.update_settings(settings).await?;
    }
    let settings = orch.settings().await?;
    let Some(minutes) = settings.refresh_minutes() else {
        bail!("auto-refresh is disabled; pass --interval MIN");
    };
    debug!("watching every {minutes} minutes");
    orch.refresh_mailboxes().await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(Event::Log(entry)) if args.level.is_none_or(|l| l == entry.level) => {
                    if !ctx.structured() {
                        println!("{}", log_line(&entry, color));
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => debug!("missed {skipped} events"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    orch.stop_auto_refresh().await?;
    let entries = orch.log_filtered(args.level, None).await?;
    if ctx.structured() {
        return emit_output(&ctx.common, &entries);
    }
    let errors = entries
        .iter()
        .filter(|entry| entry.level == LogLevel::Error)
        .count();
    println!("{} log entries, {errors} errors", entries.len());
    Ok(())
}

fn level_icon(level: LogLevel, color: bool) -> String {
    let icon = match level {
        LogLevel::Info => "ℹ",
        LogLevel::Success => "✓",
        LogLevel::Warning => "⚠",
        LogLevel::Error => "✗",
    };
    if !color {
        return icon.to_string();
    }
    match level {
        LogLevel::Info => icon.blue().to_string(),
        LogLevel::Success => icon.green().to_string(),
        LogLevel::Warning => icon.yellow().to_string(),
        LogLevel::Error => icon.red().to_string(),
    }
}

fn log_line(entry: &LogEntry, color: bool) -> String {
    let time = entry
        .timestamp
        .with_timezone(&chrono::Local)
        .format("%H:%M:%S")
        .to_string();
    if color {
        format!("{} {} {}", time.dimmed(), level_icon(entry.level, color), entry.message)
    } else {
        format!("{time} {} {}", level_icon(entry.level, color), entry.message)
    }
}

fn print_status(ctx: &RuntimeContext, status: &ConfigurationStatus) -> Result<()> {
    if ctx.structured() {
        return emit_output(&ctx.common, status);
    }
    let color = ctx.use_color();
    let line = match status {
        ConfigurationStatus::Configured => format!("{} configured", level_icon(LogLevel::Success, color)),
        ConfigurationStatus::NotConfigured => format!(
            "{} not configured (run `{APP_NAME} setup`)",
            level_icon(LogLevel::Warning, color)
        ),
        other => format!("{} {other}", level_icon(LogLevel::Error, color)),
    };
    println!("{line}");
    Ok(())
}

fn handle_settings(ctx: &RuntimeContext, command: SettingsCommand) -> Result<()> {
    let store = ctx.settings_store();
    match command {
        SettingsCommand::Show => {
            let settings = store.load()?.unwrap_or_default();
            emit_output(&ctx.common, &settings)
        }
        SettingsCommand::Path => {
            println!("{}", store.path().display());
            Ok(())
        }
        SettingsCommand::Set(args) => {
            let mut settings = store.load()?.unwrap_or_default();
            apply_setting(&mut settings, args.key, &args.value)?;
            if ctx.common.dry_run {
                return emit_output(&ctx.common, &settings);
            }
            store
                .save(&settings)
                .with_context(|| format!("saving {}", store.path().display()))
        }
    }
}

fn apply_setting(settings: &mut AppSettings, key: SettingKey, value: &str) -> Result<()> {
    match key {
        SettingKey::HideNonMailFolders => {
            settings.hide_non_mail_folders = value
                .parse()
                .map_err(|_| anyhow!("expected true or false, got {value}"))?;
        }
        SettingKey::Format => {
            settings.default_export_format = value.parse().map_err(|e: String| anyhow!(e))?;
        }
        SettingKey::ResumeMode => {
            settings.default_resume_mode = value.parse().map_err(|e: String| anyhow!(e))?;
        }
        SettingKey::OutputDir => {
            settings.default_output_directory = match value {
                "" | "none" => None,
                dir => Some(muttpu_core::paths::expand_str_path(dir)?),
            };
        }
        SettingKey::AutoRefresh => {
            settings.auto_refresh_interval = match value {
                "off" | "none" => None,
                minutes => {
                    let minutes: i64 = minutes
                        .parse()
                        .map_err(|_| anyhow!("expected minutes or `off`, got {value}"))?;
                    (minutes > 0).then_some(minutes)
                }
            };
        }
    }
    Ok(())
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => emit_output(&ctx.common, &ctx.config),
        ConfigCommand::Path => {
            println!("{}", ctx.paths.global_config.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            AppConfig::write_default(&ctx.paths.global_config)?;
            Ok(())
        }
    }
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.paths.global_config.exists() && !(cmd.force || ctx.common.assume_yes) {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.global_config.display()
        ));
    }
    if ctx.common.dry_run {
        println!(
            "dry-run: would write default config to {}",
            ctx.paths.global_config.display()
        );
        return Ok(());
    }
    AppConfig::write_default(&ctx.paths.global_config)?;
    Ok(())
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

fn emit_output<T: ?Sized + Serialize + std::fmt::Debug>(
    opts: &CommonOpts,
    value: &T,
) -> Result<()> {
    if opts.json {
        let json = serde_json::to_string_pretty(value)?;
        println!("{json}");
        return Ok(());
    }
    if opts.yaml {
        let yaml = serde_yaml::to_string(value)?;
        println!("{yaml}");
        return Ok(());
    }

    let v = serde_json::to_value(value)?;
    pretty_print_value(&v);
    Ok(())
}

fn pretty_print_value(v: &serde_json::Value) {
    use serde_json::Value;
    match v {
        Value::Array(items) => {
            for item in items {
                pretty_print_value(item);
                println!();
            }
        }
        Value::Object(map) => {
            for (key, value) in map {
                match value {
                    Value::String(s) => println!("{key}: {s}"),
                    Value::Null => println!("{key}: -"),
                    Value::Array(_) | Value::Object(_) => println!("{key}: {value}"),
                    other => println!("{key}: {other}"),
                }
            }
        }
        Value::String(s) => println!("{s}"),
        _ => println!("{v}"),
    }
}
