//! Session status tracking.
//!
//! The reconciler reports what it observes; the tracker decides which state
//! transition that observation implies and persists it.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};

use crate::backend::{AppState, Backend};
use crate::session::{Session, SessionRepository, SessionState};

/// Receives lifecycle observations for sessions.
#[async_trait]
pub trait StatusTracker: Send + Sync {
    /// The session is about to be launched.
    async fn process_application_starting(&self, session: &Session) -> Result<()>;

    /// The session has work waiting or in flight.
    async fn process_application_running(&self, session: &Session) -> Result<()>;

    /// The session has no pending work.
    async fn process_application_idle(&self, session: &Session) -> Result<()>;

    /// Launching or running the session failed.
    async fn process_application_error(&self, session: &Session, error: &str) -> Result<()>;
}

/// [`StatusTracker`] that writes transitions to the session table.
///
/// Live observations are checked against the backend first so that finished
/// or vanished applications end up terminal. Terminal sessions are never
/// moved back to a live state.
#[derive(Clone)]
pub struct RepositoryStatusTracker {
    repo: SessionRepository,
    backend: Arc<dyn Backend>,
}

impl RepositoryStatusTracker {
    pub fn new(repo: SessionRepository, backend: Arc<dyn Backend>) -> Self {
        Self { repo, backend }
    }

    /// Current record, or `None` when it is gone or already terminal.
    async fn live(&self, session: &Session) -> Result<Option<Session>> {
        match self.repo.get(&session.id).await? {
            Some(current) if current.state.is_complete() => {
                debug!(
                    "Ignoring update for session {} in terminal state {}",
                    current.id, current.state
                );
                Ok(None)
            }
            Some(current) => Ok(Some(current)),
            None => {
                debug!("Ignoring update for deleted session {}", session.id);
                Ok(None)
            }
        }
    }

    async fn observe(&self, session: &Session, observed: SessionState) -> Result<()> {
        let Some(current) = self.live(session).await? else {
            return Ok(());
        };

        let (target, message) = match self.backend.info(&current).await {
            Ok(app) => match app.state {
                AppState::Running => (observed, None),
                AppState::Succeeded => (SessionState::Complete, None),
                AppState::Failed => (
                    SessionState::Error,
                    Some(app.detail.unwrap_or_else(|| "application failed".to_string())),
                ),
            },
            Err(e) if e.is_not_found() && current.state == SessionState::Starting => {
                debug!("Session {} has not reached the backend yet", current.id);
                return Ok(());
            }
            Err(e) if e.is_not_found() => {
                warn!("Application of session {} disappeared", current.id);
                (SessionState::Error, Some(e.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        if target == current.state {
            return Ok(());
        }

        self.write(&current, target, message.as_deref()).await
    }

    /// Persist `target` unless the session turned terminal in the meantime.
    async fn write(
        &self,
        current: &Session,
        target: SessionState,
        message: Option<&str>,
    ) -> Result<()> {
        if self.repo.update_state(&current.id, target, message).await? {
            info!("Session {}: {} -> {}", current.id, current.state, target);
        } else {
            debug!("Session {} ended before it could move to {}", current.id, target);
        }
        Ok(())
    }
}

#[async_trait]
impl StatusTracker for RepositoryStatusTracker {
    async fn process_application_starting(&self, session: &Session) -> Result<()> {
        let Some(current) = self.live(session).await? else {
            return Ok(());
        };

        if current.state != SessionState::Starting {
            self.write(&current, SessionState::Starting, None).await?;
        }

        if let Ok(config) = self.backend.submit_configuration(&current) {
            self.repo.set_app_id(&current.id, &config.app_id).await?;
        }
        Ok(())
    }

    async fn process_application_running(&self, session: &Session) -> Result<()> {
        self.observe(session, SessionState::Running).await
    }

    async fn process_application_idle(&self, session: &Session) -> Result<()> {
        self.observe(session, SessionState::Idle).await
    }

    async fn process_application_error(&self, session: &Session, error: &str) -> Result<()> {
        let Some(current) = self.live(session).await? else {
            return Ok(());
        };

        if self
            .repo
            .update_state(&current.id, SessionState::Error, Some(error))
            .await?
        {
            warn!("Session {} failed: {}", current.id, error);
        }
        Ok(())
    }
}
