use std::env;
use std::fmt;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};
use log::{LevelFilter, debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use ember::backend::{
    Backend, BackendKind, LaunchPool, LaunchPoolConfig, ProcessRegistry, SparkBackend, SparkBackendConfig,
    SparkSubmitRunner,
};
use ember::db::Database;
use ember::lock::{
    self, InMemoryLockProvider, LockBackend, LockConfig, LockCoordinator, LockProvider,
    SqliteLockProvider,
};
use ember::reconcile::{Collaborators, ReconcileConfig, Reconciler, Scheduler};
use ember::session::{SessionRepository, SessionService, SessionState, SessionStore, SubmitParams};
use ember::statement::StatementRepository;
use ember::status::RepositoryStatusTracker;

const APP_NAME: &str = "ember";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_serve(ctx: RuntimeContext, cmd: ServeCommand) -> Result<()> {
    handle_serve(&ctx, cmd).await
}

#[tokio::main]
async fn async_session(ctx: RuntimeContext, cmd: SessionCommand) -> Result<()> {
    handle_session(&ctx, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {}", ctx.paths);

    match cli.command {
        Command::Serve(cmd) => async_serve(ctx, cmd),
        Command::Init => handle_init(&ctx),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Session { command } => async_session(ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Ember - Spark session reconciliation service.",
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
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON (logs and command output)
    #[arg(long, global = true)]
    json: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true)]
    no_color: bool,
    /// Do not change anything on disk
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    /// Assume "yes" for interactive prompts
    #[arg(short = 'y', long = "yes", alias = "force", global = true)]
    assume_yes: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the reconciliation loops until interrupted
    Serve(ServeCommand),
    /// Create config directories and default files (overwrite with --yes)
    Init,
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Inspect and manage session records
    Session {
        #[command(subcommand)]
        command: SessionCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Identifier of this replica in lease records (default: hostname plus random suffix)
    #[arg(long, value_name = "ID")]
    replica_id: Option<String>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Subcommand)]
enum SessionCommand {
    /// List sessions, newest first
    List {
        /// Only sessions in this state (e.g. not_started, running, idle)
        #[arg(long)]
        state: Option<SessionState>,
        /// Maximum number of sessions to list
        #[arg(short, long, default_value = "100")]
        limit: i64,
    },
    /// Queue a new session
    Create(CreateSessionCommand),
    /// Delete a session record
    Delete {
        /// ID of the session to delete
        id: String,
    },
}

#[derive(Debug, Clone, Args)]
struct CreateSessionCommand {
    /// Application resource (jar or Python file)
    #[arg(long)]
    file: String,
    /// Session name
    #[arg(long, default_value = "session")]
    name: String,
    /// Reserve a specific session ID
    #[arg(long)]
    id: Option<String>,
    /// Main class for JVM applications
    #[arg(long = "class", value_name = "CLASS")]
    main_class: Option<String>,
    /// Application argument (repeatable)
    #[arg(long = "arg", value_name = "ARG", allow_hyphen_values = true)]
    args: Vec<String>,
    /// Spark configuration entry KEY=VALUE (repeatable)
    #[arg(long = "conf", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    conf: Vec<(String, String)>,
    #[arg(long)]
    driver_memory: Option<String>,
    #[arg(long)]
    executor_memory: Option<String>,
    #[arg(long)]
    num_executors: Option<u32>,
}

impl CreateSessionCommand {
    fn into_params(self) -> SubmitParams {
        SubmitParams {
            name: self.name,
            file: self.file,
            main_class: self.main_class,
            args: self.args,
            conf: self.conf.into_iter().collect(),
            driver_memory: self.driver_memory,
            executor_memory: self.executor_memory,
            num_executors: self.num_executors,
            ..Default::default()
        }
    }
}

fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got {raw:?}")),
    }
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
    /// The config file did not exist and was written during startup.
    created_config: bool,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        let created_config = !paths.config_file.exists() && !common.dry_run;
        let config = load_or_init_config(&paths, &common)?;
        let paths = paths.apply_overrides(&config)?;
        Ok(Self {
            common,
            paths,
            config,
            created_config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Error);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("ember={level},sqlx=warn")));

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            let disable_color = self.common.no_color
                || env::var_os("NO_COLOR").is_some()
                || !io::stderr().is_terminal();

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color),
                )
                .try_init()
                .ok();
        }

        // Library modules log through the `log` facade.
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.effective_log_level());
        builder.filter_module("sqlx", LevelFilter::Warn);
        builder.try_init().ok();

        Ok(())
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

    fn database_path(&self) -> Result<PathBuf> {
        match self.config.database.path {
            Some(ref path) => expand_str_path(path),
            None => Ok(self.paths.data_dir.join("ember.db")),
        }
    }

    async fn open_database(&self) -> Result<Database> {
        let path = self.database_path()?;
        debug!("Opening database at {}", path.display());
        Database::new(&path)
            .await
            .with_context(|| format!("opening database {}", path.display()))
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
    data_dir: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self {
            config_file,
            data_dir: default_data_dir()?,
        })
    }

    fn apply_overrides(mut self, cfg: &AppConfig) -> Result<Self> {
        if let Some(ref data_override) = cfg.paths.data_dir {
            self.data_dir = expand_str_path(data_override)?;
        }
        Ok(self)
    }
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config: {}, data: {}",
            self.config_file.display(),
            self.data_dir.display()
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    paths: PathsConfig,
    database: DatabaseConfig,
    backend: SparkBackendConfig,
    launcher: LaunchPoolConfig,
    lock: LockConfig,
    reconcile: ReconcileConfig,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
struct PathsConfig {
    data_dir: Option<String>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
struct DatabaseConfig {
    /// SQLite file shared by the replicas. Defaults to `<data_dir>/ember.db`.
    path: Option<String>,
}

impl AppConfig {
    /// Checks that only matter when serving, so `config reset` still works on
    /// a broken file.
    fn validate(&self) -> Result<()> {
        self.lock.lease().validate()?;
        self.reconcile.validate()?;
        // Local drivers are children of the replica that launched them and
        // are invisible to any other replica.
        if self.backend.kind == BackendKind::Local && self.lock.provider == LockBackend::Database {
            bail!(
                "the local backend only supports a single replica; \
                 set lock.provider = \"memory\" or use the kubernetes backend"
            );
        }
        Ok(())
    }
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    let config = &ctx.config;
    config
        .validate()
        .with_context(|| format!("invalid config {}", ctx.paths.config_file.display()))?;
    let db = ctx.open_database().await?;

    let registry = ProcessRegistry::new();
    let backend: Arc<dyn Backend> =
        Arc::new(SparkBackend::new(config.backend.clone(), registry.clone()));
    let runner = Arc::new(SparkSubmitRunner::new(registry, config.launcher.timeout_seconds));
    let (launcher, workers) = LaunchPool::start(runner, &config.launcher);

    let sessions = SessionRepository::new(db.pool().clone());
    let collaborators = Collaborators {
        store: Arc::new(SessionService::new(sessions.clone(), backend.clone())),
        backend: backend.clone(),
        launcher: Arc::new(launcher),
        activity: Arc::new(StatementRepository::new(db.pool().clone())),
        tracker: Arc::new(RepositoryStatusTracker::new(sessions, backend)),
    };

    let provider: Arc<dyn LockProvider> = match config.lock.provider {
        LockBackend::Database => Arc::new(SqliteLockProvider::new(db.pool().clone())),
        LockBackend::Memory => Arc::new(InMemoryLockProvider::new()),
    };
    let replica_id = cmd.replica_id.unwrap_or_else(lock::replica_id);
    let coordinator = LockCoordinator::new(provider, replica_id, config.lock.lease())
        .context("configuring lease coordinator")?;

    info!(
        "Starting {} as replica {} ({} backend, {:?} leases)",
        APP_NAME,
        coordinator.replica_id(),
        config.backend.kind,
        config.lock.provider
    );
    if let Some((id, params)) = config.reconcile.permanent_session() {
        info!("Keeping permanent session {} ({}) alive", id, params.name);
    }

    let reconciler = Arc::new(Reconciler::new(
        collaborators,
        coordinator,
        config.reconcile.clone(),
    ));
    let cancel = CancellationToken::new();
    let timers = Scheduler::new(reconciler, cancel.clone()).start();

    shutdown_signal().await?;
    info!("Shutdown signal received, stopping duty timers...");
    cancel.cancel();
    for timer in timers {
        if let Err(e) = timer.await {
            warn!("Duty timer ended abnormally: {}", e);
        }
    }

    // Children are spawned with kill_on_drop. Aborted workers and the
    // driver watchers dropped with the runtime take them down.
    info!("Stopping {} launch worker(s)", workers.len());
    for worker in workers {
        worker.abort();
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate =
            signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("listening for Ctrl+C")?,
            _ = terminate.recv() => {},
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("listening for Ctrl+C")?;

    Ok(())
}

async fn handle_session(ctx: &RuntimeContext, command: SessionCommand) -> Result<()> {
    let db = ctx.open_database().await?;
    let repo = SessionRepository::new(db.pool().clone());

    match command {
        SessionCommand::List { state, limit } => {
            let sessions = match state {
                Some(state) => repo.list_by_state(state, limit).await?,
                None => repo.list(limit).await?,
            };

            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&sessions).context("serializing sessions")?
                );
            } else if sessions.is_empty() {
                println!("No sessions");
            } else {
                for session in sessions {
                    println!(
                        "{:<38} {:<12} {:<24} {}",
                        session.id,
                        session.state,
                        session.submit_params.name,
                        session.created_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }
            Ok(())
        }
        SessionCommand::Create(cmd) => {
            let id = cmd.id.clone();
            let params = cmd.into_params();
            if ctx.common.dry_run {
                info!("dry-run: would queue session {:?}", params.name);
                return Ok(());
            }

            let backend: Arc<dyn Backend> = Arc::new(SparkBackend::new(
                ctx.config.backend.clone(),
                ProcessRegistry::new(),
            ));
            let service = SessionService::new(repo, backend);
            let session = service.create_session(params, id.as_deref()).await?;

            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&session).context("serializing session")?
                );
            } else {
                println!("{}", session.id);
            }
            Ok(())
        }
        SessionCommand::Delete { id } => {
            if ctx.common.dry_run {
                info!("dry-run: would delete session {}", id);
                return Ok(());
            }
            if !repo.delete(&id).await? {
                warn!("Session {} does not exist", id);
            }
            Ok(())
        }
    }
}

fn handle_init(ctx: &RuntimeContext) -> Result<()> {
    if !ctx.created_config && ctx.paths.config_file.exists() && !ctx.common.assume_yes {
        return Err(anyhow!(
            "config already exists at {} (use --yes to overwrite)",
            ctx.paths.config_file.display()
        ));
    }

    if ctx.common.dry_run {
        info!(
            "dry-run: would write default config to {} and create {}",
            ctx.paths.config_file.display(),
            ctx.paths.data_dir.display()
        );
        return Ok(());
    }

    write_default_config(&ctx.paths.config_file)?;
    fs::create_dir_all(&ctx.paths.data_dir).with_context(|| {
        format!("creating data directory {}", ctx.paths.data_dir.display())
    })?;
    info!("Wrote {}", ctx.paths.config_file.display());
    Ok(())
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let rendered = if ctx.common.json {
                serde_json::to_string_pretty(&ctx.config).context("serializing config to JSON")?
            } else {
                toml::to_string_pretty(&ctx.config).context("serializing config to TOML")?
            };
            println!("{rendered}");
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!(
                    "dry-run: would reset config at {}",
                    ctx.paths.config_file.display()
                );
                return Ok(());
            }
            write_default_config(&ctx.paths.config_file)
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

fn load_or_init_config(paths: &AppPaths, common: &CommonOpts) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        if common.dry_run {
            info!(
                "dry-run: would create default config at {}",
                paths.config_file.display()
            );
        } else {
            write_default_config(&paths.config_file)?;
        }
    }

    load_config(&paths.config_file, &env_prefix())
}

fn load_config(path: &Path, env_prefix: &str) -> Result<AppConfig> {
    let defaults = ReconcileConfig::default();
    let built = Config::builder()
        .set_default(
            "reconcile.schedule_batch_size",
            defaults.schedule_batch_size as i64,
        )?
        .set_default("launcher.workers", LaunchPoolConfig::default().workers as i64)?
        .add_source(
            File::from(path)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(
            Environment::with_prefix(env_prefix)
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    built
        .try_deserialize()
        .with_context(|| format!("loading config from {}", path.display()))
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    format!(
        "# Configuration for {APP_NAME}\n# File: {}\n# Environment overrides: {}__SECTION__KEY\n\n",
        path.display(),
        env_prefix()
    )
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
        .map(|dir| dir.join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    dirs::data_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local").join("share")))
        .map(|dir| dir.join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

fn env_prefix() -> String {
    APP_NAME.to_ascii_uppercase()
}
