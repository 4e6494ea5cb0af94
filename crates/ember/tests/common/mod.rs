//! Shared test doubles for the reconciliation tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;

use ember::backend::{
    AppInfo, AppState, Backend, BackendError, BackendResult, DeployMode, LaunchErrorHandler,
    Launcher, SubmitConfig,
};
use ember::lock::{InMemoryLockProvider, LeaseConfig, LockCoordinator, LockProvider};
use ember::reconcile::{Collaborators, ReconcileConfig, Reconciler};
use ember::session::{Session, SessionState, SessionStore, SubmitParams};
use ember::statement::StatementActivity;
use ember::status::StatusTracker;

pub fn params(name: &str) -> SubmitParams {
    SubmitParams {
        name: name.to_string(),
        file: format!("local:///opt/jobs/{name}.py"),
        ..Default::default()
    }
}

/// A session in `state` created `minutes_ago` minutes before now.
pub fn session(id: &str, state: SessionState, minutes_ago: i64) -> Session {
    let mut session = Session::new(id, params(id));
    session.state = state;
    session.created_at = Utc::now() - chrono::Duration::minutes(minutes_ago);
    session.updated_at = session.created_at;
    session
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Session store backed by a map.
#[derive(Default)]
pub struct FakeStore {
    sessions: Mutex<BTreeMap<String, Session>>,
    failing_kills: Mutex<HashSet<String>>,
    pub deleted: Mutex<Vec<String>>,
    pub killed: Mutex<Vec<String>>,
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, session: Session) {
        self.sessions
            .lock()
            .unwrap()
            .insert(session.id.clone(), session);
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions.lock().unwrap().get(id).cloned()
    }

    pub fn set_state(&self, id: &str, state: SessionState, error: Option<&str>) {
        if let Some(session) = self.sessions.lock().unwrap().get_mut(id) {
            session.state = state;
            session.error_message = error.map(str::to_string);
        }
    }

    pub fn fail_kill(&self, id: &str) {
        self.failing_kills.lock().unwrap().insert(id.to_string());
    }

    pub fn killed(&self) -> Vec<String> {
        self.killed.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionStore for FakeStore {
    async fn fetch_one(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.get(id))
    }

    async fn fetch_by_state(&self, state: SessionState, limit: usize) -> Result<Vec<Session>> {
        let mut matching: Vec<Session> = self
            .sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.state == state)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn fetch_running(&self) -> Result<Vec<Session>> {
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.state.is_running())
            .cloned()
            .collect())
    }

    async fn create_session(&self, params: SubmitParams, id: Option<&str>) -> Result<Session> {
        let id = id.map(str::to_string).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let session = Session::new(id, params);
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(&session.id) {
            bail!("session {} already exists", session.id);
        }
        sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn delete_one(&self, id: &str) -> Result<()> {
        self.sessions.lock().unwrap().remove(id);
        self.deleted.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn kill_one(&self, session: &Session) -> Result<()> {
        if self.failing_kills.lock().unwrap().contains(&session.id) {
            bail!("backend refused to kill {}", session.id);
        }
        self.set_state(&session.id, SessionState::Complete, None);
        self.killed.lock().unwrap().push(session.id.clone());
        Ok(())
    }
}

/// Backend producing canned submissions.
#[derive(Default)]
pub struct FakeBackend {
    broken_configs: Mutex<HashSet<String>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn break_config(&self, id: &str) {
        self.broken_configs.lock().unwrap().insert(id.to_string());
    }
}

#[async_trait]
impl Backend for FakeBackend {
    fn submit_configuration(&self, session: &Session) -> BackendResult<SubmitConfig> {
        if self.broken_configs.lock().unwrap().contains(&session.id) {
            return Err(BackendError::InvalidSubmission(format!(
                "no application resource for {}",
                session.id
            )));
        }
        Ok(SubmitConfig {
            spark_submit: PathBuf::from("spark-submit"),
            master: "local[*]".to_string(),
            deploy_mode: DeployMode::Client,
            app_id: format!("app-{}", session.id),
            conf: BTreeMap::new(),
            env: BTreeMap::new(),
        })
    }

    async fn kill(&self, _session: &Session) -> BackendResult<()> {
        Ok(())
    }

    async fn info(&self, _session: &Session) -> BackendResult<AppInfo> {
        Ok(AppInfo {
            state: AppState::Running,
            detail: None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Launch {
    pub session_id: String,
    pub params: SubmitParams,
    pub app_id: String,
}

/// Launcher that records launches and optionally fails them.
#[derive(Default)]
pub struct RecordingLauncher {
    launches: Mutex<Vec<Launch>>,
    failure: Mutex<Option<String>>,
}

impl RecordingLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every later launch fails with `message`.
    pub fn fail_with(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn launches(&self) -> Vec<Launch> {
        self.launches.lock().unwrap().clone()
    }

    pub fn launched_ids(&self) -> Vec<String> {
        self.launches()
            .into_iter()
            .map(|launch| launch.session_id)
            .collect()
    }
}

impl Launcher for RecordingLauncher {
    fn launch(
        &self,
        session_id: &str,
        params: SubmitParams,
        config: SubmitConfig,
        on_error: LaunchErrorHandler,
    ) {
        self.launches.lock().unwrap().push(Launch {
            session_id: session_id.to_string(),
            params,
            app_id: config.app_id,
        });

        if let Some(message) = self.failure.lock().unwrap().clone() {
            tokio::spawn(on_error(BackendError::CommandFailed {
                command: "spark-submit".to_string(),
                message,
            }));
        }
    }
}

/// Gate used to hold a duty inside its body.
#[derive(Default)]
pub struct Gate {
    pub entered: Notify,
    pub proceed: Notify,
}

/// Activity checker answering from fixed sets.
#[derive(Default)]
pub struct FakeActivity {
    busy: Mutex<HashSet<String>>,
    broken: Mutex<HashSet<String>>,
    gate: Option<Arc<Gate>>,
}

impl FakeActivity {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn gated(gate: Arc<Gate>) -> Arc<Self> {
        Arc::new(Self {
            gate: Some(gate),
            ..Default::default()
        })
    }

    pub fn mark_busy(&self, id: &str) {
        self.busy.lock().unwrap().insert(id.to_string());
    }

    pub fn break_check(&self, id: &str) {
        self.broken.lock().unwrap().insert(id.to_string());
    }
}

#[async_trait]
impl StatementActivity for FakeActivity {
    async fn has_waiting_statement(&self, session: &Session) -> Result<bool> {
        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.proceed.notified().await;
        }
        if self.broken.lock().unwrap().contains(&session.id) {
            bail!("statement store unavailable");
        }
        Ok(self.busy.lock().unwrap().contains(&session.id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Starting(String),
    Running(String),
    Idle(String),
    Error(String, String),
}

/// Tracker that records observations and mirrors them into the store.
pub struct RecordingTracker {
    store: Arc<FakeStore>,
    events: Mutex<Vec<Event>>,
}

impl RecordingTracker {
    pub fn new(store: Arc<FakeStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl StatusTracker for RecordingTracker {
    async fn process_application_starting(&self, session: &Session) -> Result<()> {
        self.record(Event::Starting(session.id.clone()));
        self.store.set_state(&session.id, SessionState::Starting, None);
        Ok(())
    }

    async fn process_application_running(&self, session: &Session) -> Result<()> {
        self.record(Event::Running(session.id.clone()));
        self.store.set_state(&session.id, SessionState::Running, None);
        Ok(())
    }

    async fn process_application_idle(&self, session: &Session) -> Result<()> {
        self.record(Event::Idle(session.id.clone()));
        self.store.set_state(&session.id, SessionState::Idle, None);
        Ok(())
    }

    async fn process_application_error(&self, session: &Session, error: &str) -> Result<()> {
        self.record(Event::Error(session.id.clone(), error.to_string()));
        self.store
            .set_state(&session.id, SessionState::Error, Some(error));
        Ok(())
    }
}

pub fn lease() -> LeaseConfig {
    LeaseConfig {
        lock_at_most_for: Duration::from_secs(60),
        lock_at_least_for: Duration::ZERO,
    }
}

/// One replica's view of a shared world.
pub struct Harness {
    pub store: Arc<FakeStore>,
    pub backend: Arc<FakeBackend>,
    pub launcher: Arc<RecordingLauncher>,
    pub activity: Arc<FakeActivity>,
    pub tracker: Arc<RecordingTracker>,
    pub provider: Arc<dyn LockProvider>,
    pub reconciler: Arc<Reconciler>,
}

impl Harness {
    pub fn new(config: ReconcileConfig) -> Self {
        let store = FakeStore::new();
        let tracker = RecordingTracker::new(store.clone());
        Self::build(
            store,
            FakeBackend::new(),
            RecordingLauncher::new(),
            FakeActivity::new(),
            tracker,
            Arc::new(InMemoryLockProvider::new()),
            "replica-a",
            config,
        )
    }

    /// Another replica sharing this one's store, tracker and leases.
    pub fn replica(&self, name: &str, activity: Arc<FakeActivity>) -> Self {
        Self::build(
            self.store.clone(),
            self.backend.clone(),
            self.launcher.clone(),
            activity,
            self.tracker.clone(),
            self.provider.clone(),
            name,
            self.reconciler.config().clone(),
        )
    }

    pub fn build(
        store: Arc<FakeStore>,
        backend: Arc<FakeBackend>,
        launcher: Arc<RecordingLauncher>,
        activity: Arc<FakeActivity>,
        tracker: Arc<RecordingTracker>,
        provider: Arc<dyn LockProvider>,
        replica: &str,
        config: ReconcileConfig,
    ) -> Self {
        let coordinator = LockCoordinator::new(provider.clone(), replica, lease())
            .expect("valid lease settings");
        let reconciler = Arc::new(Reconciler::new(
            Collaborators {
                store: store.clone(),
                backend: backend.clone(),
                launcher: launcher.clone(),
                activity: activity.clone(),
                tracker: tracker.clone(),
            },
            coordinator,
            config,
        ));

        Self {
            store,
            backend,
            launcher,
            activity,
            tracker,
            provider,
            reconciler,
        }
    }
}
