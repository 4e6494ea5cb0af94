//! Session age limit.

use chrono::{DateTime, Duration, Utc};

use crate::session::Session;

/// Decides which running sessions have outlived the timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutPolicy {
    timeout: Duration,
    permanent_session_id: Option<String>,
}

impl TimeoutPolicy {
    pub fn new(timeout_minutes: u64, permanent_session_id: Option<String>) -> Self {
        let minutes = i64::try_from(timeout_minutes).unwrap_or(i64::MAX);
        Self {
            timeout: Duration::try_minutes(minutes).unwrap_or(Duration::MAX),
            permanent_session_id,
        }
    }

    /// The permanent session never expires. Others expire once strictly
    /// older than the timeout.
    pub fn is_expired(&self, session: &Session, now: DateTime<Utc>) -> bool {
        if self.permanent_session_id.as_deref() == Some(session.id.as_str()) {
            return false;
        }
        session.age(now) > self.timeout
    }

    pub fn expired<'a>(&self, sessions: &'a [Session], now: DateTime<Utc>) -> Vec<&'a Session> {
        sessions
            .iter()
            .filter(|session| self.is_expired(session, now))
            .collect()
    }
}
