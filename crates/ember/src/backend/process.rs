//! Tracking of locally running submit processes.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{AppInfo, AppState};

/// Detail recorded for a launch that was killed while still queued.
const CANCELLED_BEFORE_LAUNCH: &str = "cancelled before launch";

#[derive(Debug)]
enum Entry {
    Running { generation: u64, token: CancellationToken },
    /// Killed before its launch started. The next registration is refused.
    Cancelled,
    Exited(AppInfo),
}

/// Handle held by the worker waiting on a process.
#[derive(Debug, Clone)]
pub struct Registration {
    generation: u64,
    pub token: CancellationToken,
}

/// Per-session registry of submit processes started on this host.
///
/// The launch worker registers a process while it waits on it; kill requests
/// cancel the token and the worker terminates the child.
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    next_generation: Arc<AtomicU64>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a process about to be started. A process already registered
    /// for the session is cancelled.
    ///
    /// Returns `None` when the session was killed before its launch came up;
    /// the launch must then be dropped.
    pub async fn register(&self, session_id: &str) -> Option<Registration> {
        let mut entries = self.entries.lock().await;
        if matches!(entries.get(session_id), Some(Entry::Cancelled)) {
            entries.insert(
                session_id.to_string(),
                Entry::Exited(AppInfo {
                    state: AppState::Failed,
                    detail: Some(CANCELLED_BEFORE_LAUNCH.to_string()),
                }),
            );
            return None;
        }

        let registration = Registration {
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
            token: CancellationToken::new(),
        };
        let entry = Entry::Running {
            generation: registration.generation,
            token: registration.token.clone(),
        };
        if let Some(Entry::Running { token, .. }) = entries.insert(session_id.to_string(), entry) {
            token.cancel();
        }
        Some(registration)
    }

    /// Record how the process for `session_id` ended.
    ///
    /// Ignored when a newer process has been registered since.
    pub async fn mark_exited(
        &self,
        session_id: &str,
        registration: &Registration,
        state: AppState,
        detail: Option<String>,
    ) {
        let mut entries = self.entries.lock().await;
        let superseded = matches!(
            entries.get(session_id),
            Some(Entry::Running { generation, .. }) if *generation != registration.generation
        );
        if superseded {
            return;
        }
        entries.insert(session_id.to_string(), Entry::Exited(AppInfo { state, detail }));
    }

    /// Ask the process to stop. A session that was never registered is
    /// marked so that its queued launch is dropped.
    ///
    /// Returns false if the process already exited or was already cancelled.
    pub async fn kill(&self, session_id: &str) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.get(session_id) {
            Some(Entry::Running { token, .. }) => {
                token.cancel();
                true
            }
            Some(_) => false,
            None => {
                entries.insert(session_id.to_string(), Entry::Cancelled);
                true
            }
        }
    }

    pub async fn info(&self, session_id: &str) -> Option<AppInfo> {
        let entries = self.entries.lock().await;
        entries.get(session_id).map(|entry| match entry {
            Entry::Running { .. } => AppInfo {
                state: AppState::Running,
                detail: None,
            },
            Entry::Cancelled => AppInfo {
                state: AppState::Failed,
                detail: Some(CANCELLED_BEFORE_LAUNCH.to_string()),
            },
            Entry::Exited(info) => info.clone(),
        })
    }
}
