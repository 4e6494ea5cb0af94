//! Session reconciliation.
//!
//! Four periodic duties drive sessions through their lifecycle:
//!
//! - keep the permanent session alive,
//! - launch queued sessions,
//! - classify running sessions as busy or idle,
//! - kill sessions that outlived the timeout.
//!
//! Each duty runs under a cluster-wide lease named after it, so any number of
//! replicas can run the same schedule.

mod classifier;
mod config;
mod scheduler;
mod timeout;

use std::sync::Arc;

use anyhow::{Result, bail};
use chrono::Utc;
use futures::FutureExt;
use log::{debug, info, warn};
use tracing::instrument;

use crate::backend::{Backend, BackendError, Launcher};
use crate::lock::LockCoordinator;
use crate::session::{Session, SessionState, SessionStore};
use crate::statement::StatementActivity;
use crate::status::StatusTracker;

pub use classifier::{Partition, partition_by_activity};
pub use config::{IntervalConfig, ReconcileConfig};
pub use scheduler::Scheduler;
pub use timeout::TimeoutPolicy;

/// Lease names, shared by every replica.
pub const KEEP_PERMANENT_SESSION: &str = "keepPermanentSession";
pub const PROCESS_SCHEDULED_SESSIONS: &str = "processScheduledSessions";
pub const TRACK_RUNNING_SESSIONS: &str = "trackRunningSessions";
pub const HANDLE_TIMEOUT_SESSIONS: &str = "handleTimeoutSessions";

/// Services the reconciler works through.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn SessionStore>,
    pub backend: Arc<dyn Backend>,
    pub launcher: Arc<dyn Launcher>,
    pub activity: Arc<dyn StatementActivity>,
    pub tracker: Arc<dyn StatusTracker>,
}

/// Result of one tracking round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackSummary {
    pub running: usize,
    pub idle: usize,
}

/// Runs the reconciliation duties.
///
/// Every public duty returns `Ok(None)` when another replica holds its lease.
pub struct Reconciler {
    store: Arc<dyn SessionStore>,
    backend: Arc<dyn Backend>,
    launcher: Arc<dyn Launcher>,
    activity: Arc<dyn StatementActivity>,
    tracker: Arc<dyn StatusTracker>,
    coordinator: LockCoordinator,
    config: ReconcileConfig,
    timeout: Option<TimeoutPolicy>,
}

impl Reconciler {
    pub fn new(
        collaborators: Collaborators,
        coordinator: LockCoordinator,
        config: ReconcileConfig,
    ) -> Self {
        let timeout = config
            .timeout_minutes
            .map(|minutes| TimeoutPolicy::new(minutes, config.permanent_session_id.clone()));

        Self {
            store: collaborators.store,
            backend: collaborators.backend,
            launcher: collaborators.launcher,
            activity: collaborators.activity,
            tracker: collaborators.tracker,
            coordinator,
            config,
            timeout,
        }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Recreate the permanent session if it is missing or finished.
    /// Yields whether a restart happened.
    #[instrument(skip(self))]
    pub async fn keep_permanent_session(&self) -> Result<Option<bool>> {
        self.coordinator
            .try_run_exclusive(KEEP_PERMANENT_SESSION, || self.restart_permanent_if_needed())
            .await
    }

    /// Launch the oldest queued sessions. Yields how many were launched.
    #[instrument(skip(self))]
    pub async fn process_scheduled_sessions(&self) -> Result<Option<usize>> {
        self.coordinator
            .try_run_exclusive(PROCESS_SCHEDULED_SESSIONS, || self.launch_scheduled())
            .await
    }

    /// Report every running session as busy or idle.
    #[instrument(skip(self))]
    pub async fn track_running_sessions(&self) -> Result<Option<TrackSummary>> {
        self.coordinator
            .try_run_exclusive(TRACK_RUNNING_SESSIONS, || self.track_running())
            .await
    }

    /// Kill sessions past the timeout. Yields how many were killed.
    #[instrument(skip(self))]
    pub async fn handle_timeout_sessions(&self) -> Result<Option<usize>> {
        self.coordinator
            .try_run_exclusive(HANDLE_TIMEOUT_SESSIONS, || self.kill_timed_out())
            .await
    }

    async fn restart_permanent_if_needed(&self) -> Result<bool> {
        let Some((id, params)) = self.config.permanent_session() else {
            return Ok(false);
        };

        match self.store.fetch_one(id).await? {
            Some(session) if !session.state.is_complete() => Ok(false),
            existing => {
                let previous = existing.map_or("absent".to_string(), |s| s.state.to_string());
                info!("Restarting permanent session {} (was {})", id, previous);

                self.store.delete_one(id).await?;
                let session = self
                    .store
                    .create_session(params.clone(), Some(id))
                    .await?;
                self.launch_session(&session).await?;
                Ok(true)
            }
        }
    }

    async fn launch_scheduled(&self) -> Result<usize> {
        let sessions = self
            .store
            .fetch_by_state(SessionState::NotStarted, self.config.schedule_batch_size)
            .await?;

        if !sessions.is_empty() {
            debug!("Launching {} scheduled session(s)", sessions.len());
        }
        for session in &sessions {
            self.launch_session(session).await?;
        }
        Ok(sessions.len())
    }

    async fn track_running(&self) -> Result<TrackSummary> {
        let sessions = self.store.fetch_running().await?;
        let partition = partition_by_activity(sessions, self.activity.as_ref()).await;

        let mut failed = Vec::new();
        for session in &partition.waiting {
            if let Err(e) = self.tracker.process_application_running(session).await {
                warn!("Failed to record session {} as running: {:#}", session.id, e);
                failed.push(session.id.as_str());
            }
        }
        for session in &partition.idle {
            if let Err(e) = self.tracker.process_application_idle(session).await {
                warn!("Failed to record session {} as idle: {:#}", session.id, e);
                failed.push(session.id.as_str());
            }
        }

        if !failed.is_empty() {
            bail!(
                "failed to track {} of {} session(s): {}",
                failed.len(),
                partition.len(),
                failed.join(", ")
            );
        }

        Ok(TrackSummary {
            running: partition.waiting.len(),
            idle: partition.idle.len(),
        })
    }

    async fn kill_timed_out(&self) -> Result<usize> {
        let Some(policy) = &self.timeout else {
            return Ok(0);
        };

        let sessions = self.store.fetch_running().await?;
        let expired = policy.expired(&sessions, Utc::now());

        let mut killed = 0;
        let mut failed = Vec::new();
        for session in &expired {
            info!("Session {} exceeded the timeout, killing it", session.id);
            match self.store.kill_one(session).await {
                Ok(()) => killed += 1,
                Err(e) => {
                    warn!("Failed to kill session {}: {:#}", session.id, e);
                    failed.push(session.id.as_str());
                }
            }
        }

        if !failed.is_empty() {
            bail!(
                "failed to kill {} of {} timed out session(s): {}",
                failed.len(),
                expired.len(),
                failed.join(", ")
            );
        }
        Ok(killed)
    }

    /// Mark the session starting and hand it to the launcher. Launch failures
    /// are reported to the tracker and do not fail the caller.
    async fn launch_session(&self, session: &Session) -> Result<()> {
        self.tracker.process_application_starting(session).await?;

        let config = match self.backend.submit_configuration(session) {
            Ok(config) => config,
            Err(e) => {
                warn!("Cannot build submission for session {}: {}", session.id, e);
                self.tracker
                    .process_application_error(session, &e.to_string())
                    .await?;
                return Ok(());
            }
        };

        let tracker = Arc::clone(&self.tracker);
        let failed = session.clone();
        self.launcher.launch(
            &session.id,
            session.submit_params.clone(),
            config,
            Box::new(move |err: BackendError| {
                async move {
                    if let Err(e) = tracker
                        .process_application_error(&failed, &err.to_string())
                        .await
                    {
                        warn!("Failed to record launch failure of {}: {:#}", failed.id, e);
                    }
                }
                .boxed()
            }),
        );
        Ok(())
    }
}
