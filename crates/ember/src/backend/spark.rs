//! Spark backend for local and Kubernetes clusters.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::session::Session;

use super::{
    AppInfo, AppState, Backend, BackendError, BackendKind, BackendResult, DeployMode,
    ProcessRegistry, SubmitConfig,
};

/// Prefix used for application handles created by this service.
const APP_ID_PREFIX: &str = "ember-";

/// Kubernetes object names are DNS labels.
const MAX_K8S_NAME_LEN: usize = 63;

/// Suffix Spark conventionally uses for driver pods.
const DRIVER_POD_SUFFIX: &str = "-driver";

/// Spark backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SparkBackendConfig {
    /// Cluster flavour.
    pub kind: BackendKind,
    /// Spark installation. `spark-submit` is taken from `PATH` when unset.
    pub spark_home: Option<String>,
    /// Master URL override.
    pub master: Option<String>,
    /// Namespace for driver pods (Kubernetes only).
    pub namespace: String,
    /// Driver and executor image (Kubernetes only).
    pub container_image: Option<String>,
    /// Driver service account (Kubernetes only).
    pub service_account: Option<String>,
    /// kubectl binary used to inspect and delete driver pods.
    pub kubectl: String,
    /// `--conf` entries applied to every session.
    pub conf: BTreeMap<String, String>,
    /// Extra environment for `spark-submit`.
    pub env: BTreeMap<String, String>,
}

impl Default for SparkBackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Local,
            spark_home: None,
            master: None,
            namespace: "spark".to_string(),
            container_image: None,
            service_account: None,
            kubectl: "kubectl".to_string(),
            conf: BTreeMap::new(),
            env: BTreeMap::new(),
        }
    }
}

impl SparkBackendConfig {
    fn master(&self) -> String {
        match (&self.master, self.kind) {
            (Some(master), _) => master.clone(),
            (None, BackendKind::Local) => "local[*]".to_string(),
            (None, BackendKind::Kubernetes) => "k8s://https://kubernetes.default.svc".to_string(),
        }
    }

    fn spark_submit(&self) -> PathBuf {
        match self.spark_home {
            Some(ref home) => PathBuf::from(home).join("bin").join("spark-submit"),
            None => PathBuf::from("spark-submit"),
        }
    }
}

/// [`Backend`] that submits with `spark-submit`.
///
/// Local sessions are tracked through the [`ProcessRegistry`] shared with the
/// launch pool; Kubernetes sessions through their driver pod.
#[derive(Debug, Clone)]
pub struct SparkBackend {
    config: SparkBackendConfig,
    registry: ProcessRegistry,
}

impl SparkBackend {
    pub fn new(config: SparkBackendConfig, registry: ProcessRegistry) -> Self {
        Self { config, registry }
    }

    fn driver_pod(&self, session: &Session) -> String {
        session
            .app_id
            .clone()
            .unwrap_or_else(|| driver_pod_name(&session.id))
    }

    async fn kubectl(&self, args: &[&str]) -> BackendResult<String> {
        debug!("{} {}", self.config.kubectl, args.join(" "));
        let output = Command::new(&self.config.kubectl)
            .args(args)
            .output()
            .await
            .map_err(|e| BackendError::CommandFailed {
                command: self.config.kubectl.clone(),
                message: format!("spawning: {e}"),
            })?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("NotFound") || stderr.contains("not found") {
            return Err(BackendError::NotFound(args.last().copied().unwrap_or_default().to_string()));
        }
        Err(BackendError::CommandFailed {
            command: format!("{} {}", self.config.kubectl, args.first().copied().unwrap_or_default()),
            message: stderr,
        })
    }
}

#[async_trait]
impl Backend for SparkBackend {
    fn submit_configuration(&self, session: &Session) -> BackendResult<SubmitConfig> {
        let mut conf = self.config.conf.clone();
        let mut env = self.config.env.clone();
        if let Some(ref home) = self.config.spark_home {
            env.insert("SPARK_HOME".to_string(), home.clone());
        }

        let (deploy_mode, app_id) = match self.config.kind {
            BackendKind::Local => (DeployMode::Client, app_handle(&session.id)),
            BackendKind::Kubernetes => {
                let pod = driver_pod_name(&session.id);
                conf.insert(
                    "spark.kubernetes.namespace".to_string(),
                    self.config.namespace.clone(),
                );
                conf.insert("spark.kubernetes.driver.pod.name".to_string(), pod.clone());
                conf.insert(
                    "spark.kubernetes.submission.waitAppCompletion".to_string(),
                    "false".to_string(),
                );
                conf.insert(
                    "spark.kubernetes.driver.label.ember-session".to_string(),
                    app_handle(&session.id),
                );
                if let Some(ref image) = self.config.container_image {
                    conf.insert("spark.kubernetes.container.image".to_string(), image.clone());
                }
                if let Some(ref account) = self.config.service_account {
                    conf.insert(
                        "spark.kubernetes.authenticate.driver.serviceAccountName".to_string(),
                        account.clone(),
                    );
                }
                (DeployMode::Cluster, pod)
            }
        };

        Ok(SubmitConfig {
            spark_submit: self.config.spark_submit(),
            master: self.config.master(),
            deploy_mode,
            app_id,
            conf,
            env,
        })
    }

    async fn kill(&self, session: &Session) -> BackendResult<()> {
        match self.config.kind {
            BackendKind::Local => {
                // Also covers a launch still waiting in the queue.
                if self.registry.kill(&session.id).await {
                    info!("Stopped local session {}", session.id);
                    Ok(())
                } else {
                    Err(BackendError::NotFound(session.id.clone()))
                }
            }
            BackendKind::Kubernetes => {
                let pod = self.driver_pod(session);
                self.kubectl(&["delete", "pod", "--wait=false", "-n", &self.config.namespace, &pod])
                    .await?;
                info!("Deleted driver pod {} of session {}", pod, session.id);
                Ok(())
            }
        }
    }

    async fn info(&self, session: &Session) -> BackendResult<AppInfo> {
        match self.config.kind {
            BackendKind::Local => self
                .registry
                .info(&session.id)
                .await
                .ok_or_else(|| BackendError::NotFound(session.id.clone())),
            BackendKind::Kubernetes => {
                let pod = self.driver_pod(session);
                let phase = self
                    .kubectl(&[
                        "get",
                        "pod",
                        "-n",
                        &self.config.namespace,
                        "-o",
                        "jsonpath={.status.phase}",
                        &pod,
                    ])
                    .await?;
                Ok(pod_phase_info(&phase))
            }
        }
    }
}

fn pod_phase_info(phase: &str) -> AppInfo {
    let state = match phase {
        "Succeeded" => AppState::Succeeded,
        "Failed" => AppState::Failed,
        _ => AppState::Running,
    };
    AppInfo {
        state,
        detail: Some(format!("driver pod phase {phase}")),
    }
}

/// Stable application handle derived from the session ID.
fn app_handle(session_id: &str) -> String {
    let sanitized: String = session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let mut handle = format!("{APP_ID_PREFIX}{}", sanitized.trim_matches('-'));
    handle.truncate(MAX_K8S_NAME_LEN - DRIVER_POD_SUFFIX.len());
    handle.trim_end_matches('-').to_string()
}

fn driver_pod_name(session_id: &str) -> String {
    format!("{}{DRIVER_POD_SUFFIX}", app_handle(session_id))
}
