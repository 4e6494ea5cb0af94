//! Splits running sessions by whether they still have work.

use log::warn;

use crate::session::Session;
use crate::statement::StatementActivity;

/// Running sessions split by pending work. Both buckets always exist.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Partition {
    /// Sessions with at least one waiting or running statement.
    pub waiting: Vec<Session>,
    /// Sessions with nothing to do.
    pub idle: Vec<Session>,
}

impl Partition {
    pub fn len(&self) -> usize {
        self.waiting.len() + self.idle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Classify each session once. Sessions whose activity cannot be determined
/// are left out of both buckets for this round.
pub async fn partition_by_activity(
    sessions: Vec<Session>,
    activity: &dyn StatementActivity,
) -> Partition {
    let mut partition = Partition::default();
    for session in sessions {
        match activity.has_waiting_statement(&session).await {
            Ok(true) => partition.waiting.push(session),
            Ok(false) => partition.idle.push(session),
            Err(e) => warn!("Could not check activity of session {}: {:#}", session.id, e),
        }
    }
    partition
}
