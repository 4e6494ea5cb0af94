//! Execution backend module.
//!
//! Turns session parameters into `spark-submit` invocations, runs them on a
//! bounded worker pool and answers liveness/kill requests for launched
//! applications. Local and Kubernetes clusters are supported.

mod command;
mod error;
mod launcher;
mod process;
mod spark;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::session::{Session, SubmitParams};

pub use command::build_submit_args;
pub use error::{BackendError, BackendResult};
pub use launcher::{LaunchPool, LaunchPoolConfig, SparkSubmitRunner, Submission, SubmitRunner};
pub use process::{ProcessRegistry, Registration};
pub use spark::{SparkBackend, SparkBackendConfig};

/// Cluster flavour the backend submits to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// `local[*]` driver processes on this host.
    #[default]
    Local,
    /// Driver pods on a Kubernetes cluster.
    Kubernetes,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Local => write!(f, "local"),
            BackendKind::Kubernetes => write!(f, "kubernetes"),
        }
    }
}

/// Spark deploy mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployMode {
    Client,
    Cluster,
}

impl DeployMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployMode::Client => "client",
            DeployMode::Cluster => "cluster",
        }
    }
}

/// Runnable submission produced for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitConfig {
    /// `spark-submit` binary to execute.
    pub spark_submit: PathBuf,
    pub master: String,
    pub deploy_mode: DeployMode,
    /// Backend handle recorded on the session.
    pub app_id: String,
    /// Backend-level `--conf` entries, merged under the session's own.
    pub conf: BTreeMap<String, String>,
    /// Extra environment for the submit process.
    pub env: BTreeMap<String, String>,
}

/// Observed state of a launched application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Running,
    Succeeded,
    Failed,
}

/// Backend view of a launched application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInfo {
    pub state: AppState,
    pub detail: Option<String>,
}

/// Async callback invoked when a launch fails.
pub type LaunchErrorHandler = Box<dyn FnOnce(BackendError) -> BoxFuture<'static, ()> + Send>;

/// Backend abstraction for testability.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Build the submission for `session`.
    fn submit_configuration(&self, session: &Session) -> BackendResult<SubmitConfig>;

    /// Terminate the application behind `session`.
    ///
    /// Returns `BackendError::NotFound` when the backend has no such application.
    async fn kill(&self, session: &Session) -> BackendResult<()>;

    /// Current backend view of `session`.
    ///
    /// Returns `BackendError::NotFound` when the backend has no such application.
    async fn info(&self, session: &Session) -> BackendResult<AppInfo>;
}

/// Fire-and-forget application launcher.
pub trait Launcher: Send + Sync {
    /// Queue a launch and return immediately. `on_error` runs if the launch fails.
    fn launch(
        &self,
        session_id: &str,
        params: SubmitParams,
        config: SubmitConfig,
        on_error: LaunchErrorHandler,
    );
}
