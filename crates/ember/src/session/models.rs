//! Session data models.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Queued, waiting for the scheduler to launch it.
    NotStarted,
    /// Handed to the backend, not yet observed running.
    Starting,
    /// Running with pending work.
    Running,
    /// Running with nothing to do.
    Idle,
    /// Launch failed or the application crashed.
    Error,
    /// Finished or killed.
    Complete,
}

impl SessionState {
    /// All states, in lifecycle order.
    pub const ALL: [SessionState; 6] = [
        SessionState::NotStarted,
        SessionState::Starting,
        SessionState::Running,
        SessionState::Idle,
        SessionState::Error,
        SessionState::Complete,
    ];

    /// States returned by `fetch_running`: not terminal and not queued.
    pub const RUNNING: [SessionState; 3] = [
        SessionState::Starting,
        SessionState::Running,
        SessionState::Idle,
    ];

    /// Terminal states. A session never leaves them.
    pub const TERMINAL: [SessionState; 2] = [SessionState::Error, SessionState::Complete];

    /// Whether the state is terminal.
    pub fn is_complete(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    /// Whether the session has been launched and has not terminated.
    pub fn is_running(&self) -> bool {
        Self::RUNNING.contains(self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::NotStarted => "not_started",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Idle => "idle",
            SessionState::Error => "error",
            SessionState::Complete => "complete",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "not_started" => Ok(SessionState::NotStarted),
            "starting" => Ok(SessionState::Starting),
            "running" => Ok(SessionState::Running),
            "idle" => Ok(SessionState::Idle),
            "error" => Ok(SessionState::Error),
            "complete" => Ok(SessionState::Complete),
            _ => Err(format!("unknown session state: {}", s)),
        }
    }
}

/// Parameters handed to `spark-submit` when the session is launched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmitParams {
    /// Application name.
    pub name: String,
    /// Application resource (jar or python file).
    pub file: String,
    /// Main class for JVM applications.
    pub main_class: Option<String>,
    /// Application arguments.
    pub args: Vec<String>,
    pub jars: Vec<String>,
    pub py_files: Vec<String>,
    pub files: Vec<String>,
    /// Extra `--conf` entries.
    pub conf: BTreeMap<String, String>,
    pub driver_memory: Option<String>,
    pub driver_cores: Option<u32>,
    pub executor_memory: Option<String>,
    pub executor_cores: Option<u32>,
    pub num_executors: Option<u32>,
}

/// A long-running compute session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Unique session ID.
    pub id: String,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Launch parameters.
    pub submit_params: SubmitParams,
    /// Backend handle (driver pod name, local submission tag).
    pub app_id: Option<String>,
    /// Error message if the session failed.
    pub error_message: Option<String>,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// When the state was last written.
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Build a new queued session.
    pub fn new(id: impl Into<String>, submit_params: SubmitParams) -> Self {
        // Stored timestamps carry microseconds.
        let now = Utc::now().trunc_subsecs(6);
        Self {
            id: id.into(),
            state: SessionState::NotStarted,
            submit_params,
            app_id: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Age of the session at `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}

/// Raw `sessions` row.
#[derive(Debug, FromRow)]
pub(crate) struct SessionRow {
    pub id: String,
    pub state: String,
    pub submit_params: String,
    pub app_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl TryFrom<SessionRow> for Session {
    type Error = anyhow::Error;

    fn try_from(row: SessionRow) -> Result<Self> {
        let state = row
            .state
            .parse::<SessionState>()
            .map_err(anyhow::Error::msg)?;
        let submit_params = serde_json::from_str(&row.submit_params)
            .with_context(|| format!("decoding submit params of session {}", row.id))?;

        Ok(Self {
            state,
            submit_params,
            app_id: row.app_id,
            error_message: row.error_message,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
            id: row.id,
        })
    }
}

/// Fixed-width RFC 3339 so lexical order matches chronological order.
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("parsing timestamp {raw:?}"))?
        .with_timezone(&Utc))
}
