//! Reconciler settings.

use std::time::Duration;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::session::SubmitParams;

/// What the reconciler keeps alive, launches and evicts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Reserved ID of the session kept running at all times. Disabled when unset.
    pub permanent_session_id: Option<String>,
    /// Parameters the permanent session is (re)created with. Required with
    /// `permanent_session_id`.
    pub permanent_session_params: Option<SubmitParams>,
    /// Sessions running longer than this are killed. Disabled when unset.
    pub timeout_minutes: Option<u64>,
    /// Queued sessions launched per cycle.
    pub schedule_batch_size: usize,
    pub intervals: IntervalConfig,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            permanent_session_id: None,
            permanent_session_params: None,
            timeout_minutes: None,
            schedule_batch_size: 10,
            intervals: IntervalConfig::default(),
        }
    }
}

impl ReconcileConfig {
    /// Reserved ID and parameters of the permanent session, when both are set.
    pub fn permanent_session(&self) -> Option<(&str, &SubmitParams)> {
        self.permanent_session_id
            .as_deref()
            .zip(self.permanent_session_params.as_ref())
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(ref id) = self.permanent_session_id {
            match self.permanent_session_params {
                None => bail!("permanent session {id} has no permanent_session_params"),
                Some(ref params) if params.file.trim().is_empty() => {
                    bail!("permanent session {id} has no application file")
                }
                Some(_) => {}
            }
        }
        if self.schedule_batch_size == 0 {
            bail!("schedule_batch_size must be at least 1");
        }
        Ok(())
    }
}

/// Timer periods of the duties, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntervalConfig {
    pub keep_permanent_session_seconds: u64,
    pub process_scheduled_sessions_seconds: u64,
    pub track_running_sessions_seconds: u64,
    pub handle_timeout_sessions_seconds: u64,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            keep_permanent_session_seconds: 60,
            process_scheduled_sessions_seconds: 60,
            track_running_sessions_seconds: 120,
            handle_timeout_sessions_seconds: 600,
        }
    }
}

impl IntervalConfig {
    pub fn keep_permanent_session(&self) -> Duration {
        period(self.keep_permanent_session_seconds)
    }

    pub fn process_scheduled_sessions(&self) -> Duration {
        period(self.process_scheduled_sessions_seconds)
    }

    pub fn track_running_sessions(&self) -> Duration {
        period(self.track_running_sessions_seconds)
    }

    pub fn handle_timeout_sessions(&self) -> Duration {
        period(self.handle_timeout_sessions_seconds)
    }
}

// tokio intervals panic on a zero period.
fn period(seconds: u64) -> Duration {
    Duration::from_secs(seconds.max(1))
}
