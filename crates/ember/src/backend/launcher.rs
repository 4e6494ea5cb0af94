//! Launch worker pool.
//!
//! Launch requests are queued on a channel and picked up by a fixed number of
//! workers. A worker only covers the submission step: a driver that keeps
//! running after submission is watched by its own task, so long-lived local
//! sessions never hold a worker. The caller never waits for a launch;
//! failures are reported through the per-launch error callback.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::session::SubmitParams;

use super::{
    AppState, BackendError, BackendResult, DeployMode, LaunchErrorHandler, Launcher,
    ProcessRegistry, Registration, SubmitConfig, build_submit_args,
};

/// Number of stderr lines kept for error reports.
const STDERR_TAIL_LINES: usize = 20;

/// Launch pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchPoolConfig {
    /// Number of concurrent submissions.
    pub workers: usize,
    /// Maximum seconds a cluster-mode submission may take. `None` waits
    /// indefinitely. Client-mode drivers run for the whole session and are
    /// not bounded.
    pub timeout_seconds: Option<u64>,
}

impl Default for LaunchPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            timeout_seconds: None,
        }
    }
}

/// What a submission step left behind.
pub enum Submission {
    /// The submit process ran to completion.
    Finished,
    /// The submit process is the driver and keeps running. The future
    /// resolves once it exits.
    Detached(BoxFuture<'static, BackendResult<()>>),
    /// The session was killed before its launch started.
    Cancelled,
}

/// Runs one submission.
#[async_trait]
pub trait SubmitRunner: Send + Sync {
    async fn run(
        &self,
        session_id: &str,
        params: &SubmitParams,
        config: &SubmitConfig,
    ) -> BackendResult<Submission>;
}

struct LaunchTask {
    session_id: String,
    params: SubmitParams,
    config: SubmitConfig,
    on_error: LaunchErrorHandler,
}

/// Channel-backed [`Launcher`].
#[derive(Clone)]
pub struct LaunchPool {
    sender: mpsc::UnboundedSender<LaunchTask>,
}

impl LaunchPool {
    /// Spawn the workers. They exit once every pool handle is dropped and the
    /// queue is drained.
    pub fn start(
        runner: Arc<dyn SubmitRunner>,
        config: &LaunchPoolConfig,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(Mutex::new(receiver));
        let workers = config.workers.max(1);

        info!("Starting launch pool with {} worker(s)", workers);

        let handles = (0..workers)
            .map(|worker| {
                let runner = Arc::clone(&runner);
                let receiver = Arc::clone(&receiver);
                tokio::spawn(worker_loop(worker, runner, receiver))
            })
            .collect();

        (Self { sender }, handles)
    }
}

impl Launcher for LaunchPool {
    fn launch(
        &self,
        session_id: &str,
        params: SubmitParams,
        config: SubmitConfig,
        on_error: LaunchErrorHandler,
    ) {
        let task = LaunchTask {
            session_id: session_id.to_string(),
            params,
            config,
            on_error,
        };

        if let Err(mpsc::error::SendError(task)) = self.sender.send(task) {
            warn!("Launch queue closed, dropping launch of {}", task.session_id);
            tokio::spawn((task.on_error)(BackendError::QueueClosed));
        }
    }
}

async fn worker_loop(
    worker: usize,
    runner: Arc<dyn SubmitRunner>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<LaunchTask>>>,
) {
    loop {
        let task = receiver.lock().await.recv().await;
        let Some(task) = task else {
            debug!("Launch worker {} stopping", worker);
            return;
        };

        debug!("Launch worker {} picked up {}", worker, task.session_id);
        match runner.run(&task.session_id, &task.params, &task.config).await {
            Ok(Submission::Finished) => debug!("Launch of {} finished", task.session_id),
            Ok(Submission::Cancelled) => {
                info!("Dropped launch of {}, it was killed while queued", task.session_id)
            }
            Ok(Submission::Detached(exit)) => {
                debug!("Driver of {} is running", task.session_id);
                let LaunchTask {
                    session_id,
                    on_error,
                    ..
                } = task;
                tokio::spawn(async move {
                    if let Err(e) = exit.await {
                        warn!("Driver of {} failed: {}", session_id, e);
                        on_error(e).await;
                    }
                });
            }
            Err(e) => {
                warn!("Launch of {} failed: {}", task.session_id, e);
                (task.on_error)(e).await;
            }
        }
    }
}

/// Runs `spark-submit` as a child process.
///
/// In client mode the submit process is the driver itself; it is handed back
/// as [`Submission::Detached`] as soon as it has been spawned.
#[derive(Debug, Clone)]
pub struct SparkSubmitRunner {
    registry: ProcessRegistry,
    timeout: Option<Duration>,
}

impl SparkSubmitRunner {
    pub fn new(registry: ProcessRegistry, timeout_seconds: Option<u64>) -> Self {
        Self {
            registry,
            timeout: timeout_seconds.map(Duration::from_secs),
        }
    }
}

#[async_trait]
impl SubmitRunner for SparkSubmitRunner {
    async fn run(
        &self,
        session_id: &str,
        params: &SubmitParams,
        config: &SubmitConfig,
    ) -> BackendResult<Submission> {
        let args = build_submit_args(params, config)?;
        let program = config.spark_submit.display().to_string();

        let Some(registration) = self.registry.register(session_id).await else {
            return Ok(Submission::Cancelled);
        };

        info!("Submitting {} via {} ({})", session_id, program, config.master);
        debug!("{} {}", program, args.join(" "));

        let spawned = Command::new(&config.spark_submit)
            .args(&args)
            .envs(&config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let message = format!("spawning: {e}");
                self.registry
                    .mark_exited(session_id, &registration, AppState::Failed, Some(message.clone()))
                    .await;
                return Err(BackendError::CommandFailed {
                    command: program,
                    message,
                });
            }
        };

        let watch = SubmitProcess::new(
            child,
            session_id,
            program,
            self.registry.clone(),
            registration,
        );
        match config.deploy_mode {
            DeployMode::Client => Ok(Submission::Detached(watch.wait(None).boxed())),
            DeployMode::Cluster => {
                watch.wait(self.timeout).await?;
                Ok(Submission::Finished)
            }
        }
    }
}

/// A spawned submit process and the bookkeeping for its exit.
struct SubmitProcess {
    child: Child,
    session_id: String,
    program: String,
    registry: ProcessRegistry,
    registration: Registration,
    stderr_tail: JoinHandle<String>,
}

impl SubmitProcess {
    fn new(
        mut child: Child,
        session_id: &str,
        program: String,
        registry: ProcessRegistry,
        registration: Registration,
    ) -> Self {
        let stderr = child.stderr.take();
        let log_id = session_id.to_string();
        let stderr_tail = tokio::spawn(async move {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[{}] {}", log_id, line);
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
            tail.into_iter().collect::<Vec<_>>().join("\n")
        });

        Self {
            child,
            session_id: session_id.to_string(),
            program,
            registry,
            registration,
            stderr_tail,
        }
    }

    /// Wait for the process to exit, be killed or overrun `timeout`, and
    /// record the outcome in the registry.
    async fn wait(mut self, timeout: Option<Duration>) -> BackendResult<()> {
        let deadline = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        let (state, detail, result) = tokio::select! {
            status = self.child.wait() => match status {
                Ok(status) if status.success() => (AppState::Succeeded, None, Ok(())),
                Ok(status) => {
                    let tail = (&mut self.stderr_tail).await.unwrap_or_default();
                    let message = if tail.is_empty() {
                        format!("exited with {status}")
                    } else {
                        format!("exited with {status}: {tail}")
                    };
                    let err = BackendError::CommandFailed {
                        command: self.program.clone(),
                        message: message.clone(),
                    };
                    (AppState::Failed, Some(message), Err(err))
                }
                Err(e) => (AppState::Failed, Some(format!("waiting: {e}")), Err(e.into())),
            },
            _ = self.registration.token.cancelled() => {
                info!("Killing submit process of {}", self.session_id);
                if let Err(e) = self.child.kill().await {
                    warn!("Failed to kill submit process of {}: {}", self.session_id, e);
                }
                (AppState::Failed, Some("killed".to_string()), Ok(()))
            }
            _ = deadline => {
                if let Err(e) = self.child.kill().await {
                    warn!("Failed to kill submit process of {}: {}", self.session_id, e);
                }
                let secs = timeout.map(|t| t.as_secs()).unwrap_or_default();
                let detail = Some("timed out".to_string());
                (AppState::Failed, detail, Err(BackendError::Timeout(secs)))
            }
        };

        self.registry
            .mark_exited(&self.session_id, &self.registration, state, detail)
            .await;
        result
    }
}
