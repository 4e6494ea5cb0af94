//! Session service - the default [`SessionStore`].
//!
//! Persists sessions through the repository and terminates them on the
//! backend when they are killed.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use uuid::Uuid;

use crate::backend::Backend;

use super::SessionStore;
use super::models::{Session, SessionState, SubmitParams};
use super::repository::SessionRepository;

/// Service for managing session records.
#[derive(Clone)]
pub struct SessionService {
    repo: SessionRepository,
    backend: Arc<dyn Backend>,
}

impl SessionService {
    pub fn new(repo: SessionRepository, backend: Arc<dyn Backend>) -> Self {
        Self { repo, backend }
    }

    pub fn repository(&self) -> &SessionRepository {
        &self.repo
    }
}

#[async_trait]
impl SessionStore for SessionService {
    async fn fetch_one(&self, id: &str) -> Result<Option<Session>> {
        self.repo.get(id).await
    }

    async fn fetch_by_state(&self, state: SessionState, limit: usize) -> Result<Vec<Session>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.repo.list_by_state(state, limit).await
    }

    async fn fetch_running(&self) -> Result<Vec<Session>> {
        self.repo.list_running().await
    }

    async fn create_session(&self, params: SubmitParams, id: Option<&str>) -> Result<Session> {
        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let session = Session::new(id, params);
        self.repo
            .create(&session)
            .await
            .with_context(|| format!("creating session {}", session.id))?;
        info!("Created session {} ({})", session.id, session.submit_params.name);
        Ok(session)
    }

    async fn delete_one(&self, id: &str) -> Result<()> {
        if self.repo.delete(id).await? {
            info!("Deleted session {}", id);
        } else {
            debug!("Session {} already absent", id);
        }
        Ok(())
    }

    async fn kill_one(&self, session: &Session) -> Result<()> {
        let current = match self.repo.get(&session.id).await? {
            Some(current) => current,
            None => {
                debug!("Session {} is gone, nothing to kill", session.id);
                return Ok(());
            }
        };

        if current.state.is_complete() {
            debug!(
                "Session {} is already in terminal state {}",
                session.id, current.state
            );
            return Ok(());
        }

        match self.backend.kill(&current).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                warn!("Application of session {} already gone: {}", session.id, e);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("killing session {}", session.id));
            }
        }

        if self
            .repo
            .update_state(&session.id, SessionState::Complete, None)
            .await?
        {
            info!("Session {} killed", session.id);
        } else {
            debug!("Session {} ended on its own while being killed", session.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AppInfo, BackendError, BackendResult, SubmitConfig};
    use crate::db::Database;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeBackend {
        killed: Mutex<Vec<String>>,
        missing: bool,
        broken: bool,
    }

    #[async_trait]
    impl Backend for FakeBackend {
        fn submit_configuration(&self, _session: &Session) -> BackendResult<SubmitConfig> {
            Err(BackendError::InvalidSubmission("unused".to_string()))
        }

        async fn kill(&self, session: &Session) -> BackendResult<()> {
            if self.broken {
                return Err(BackendError::CommandFailed {
                    command: "kubectl delete".to_string(),
                    message: "connection refused".to_string(),
                });
            }
            if self.missing {
                return Err(BackendError::NotFound(session.id.clone()));
            }
            self.killed.lock().unwrap().push(session.id.clone());
            Ok(())
        }

        async fn info(&self, session: &Session) -> BackendResult<AppInfo> {
            Err(BackendError::NotFound(session.id.clone()))
        }
    }

    async fn service(backend: FakeBackend) -> (SessionService, Arc<FakeBackend>) {
        let db = Database::in_memory().await.unwrap();
        let backend = Arc::new(backend);
        let service = SessionService::new(SessionRepository::new(db.pool().clone()), backend.clone());
        (service, backend)
    }

    fn params() -> SubmitParams {
        SubmitParams {
            name: "shell".to_string(),
            file: "local:///opt/shell.py".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_session_uses_reserved_or_generated_id() {
        let (service, _) = service(FakeBackend::default()).await;

        let reserved = service.create_session(params(), Some("permanent")).await.unwrap();
        assert_eq!(reserved.id, "permanent");
        assert_eq!(reserved.state, SessionState::NotStarted);

        let generated = service.create_session(params(), None).await.unwrap();
        assert!(Uuid::parse_str(&generated.id).is_ok());
        assert!(service.fetch_one(&generated.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_one_is_idempotent() {
        let (service, _) = service(FakeBackend::default()).await;
        service.create_session(params(), Some("s1")).await.unwrap();

        service.delete_one("s1").await.unwrap();
        service.delete_one("s1").await.unwrap();
        assert!(service.fetch_one("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn kill_one_marks_session_complete() {
        let (service, backend) = service(FakeBackend::default()).await;
        let session = service.create_session(params(), Some("s1")).await.unwrap();
        service
            .repository()
            .update_state("s1", SessionState::Idle, None)
            .await
            .unwrap();

        service.kill_one(&session).await.unwrap();

        assert_eq!(*backend.killed.lock().unwrap(), vec!["s1".to_string()]);
        let stored = service.fetch_one("s1").await.unwrap().unwrap();
        assert_eq!(stored.state, SessionState::Complete);
    }

    #[tokio::test]
    async fn kill_one_tolerates_gone_sessions_and_applications() {
        let (service, backend) = service(FakeBackend {
            missing: true,
            ..Default::default()
        })
        .await;
        let session = service.create_session(params(), Some("s1")).await.unwrap();
        service
            .repository()
            .update_state("s1", SessionState::Running, None)
            .await
            .unwrap();

        service.kill_one(&session).await.unwrap();
        assert_eq!(
            service.fetch_one("s1").await.unwrap().unwrap().state,
            SessionState::Complete
        );

        // Already terminal: the backend is not asked again.
        service.kill_one(&session).await.unwrap();
        service.delete_one("s1").await.unwrap();
        service.kill_one(&session).await.unwrap();
        assert!(backend.killed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn kill_one_propagates_backend_failures() {
        let (service, _) = service(FakeBackend {
            broken: true,
            ..Default::default()
        })
        .await;
        let session = service.create_session(params(), Some("s1")).await.unwrap();
        service
            .repository()
            .update_state("s1", SessionState::Running, None)
            .await
            .unwrap();

        let err = service.kill_one(&session).await.unwrap_err();
        assert!(format!("{err:#}").contains("connection refused"));
        assert_eq!(
            service.fetch_one("s1").await.unwrap().unwrap().state,
            SessionState::Running
        );
    }
}
