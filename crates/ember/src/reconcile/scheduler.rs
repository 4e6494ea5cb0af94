//! Timers driving the reconciliation duties.

use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{
    HANDLE_TIMEOUT_SESSIONS, KEEP_PERMANENT_SESSION, PROCESS_SCHEDULED_SESSIONS, Reconciler,
    TRACK_RUNNING_SESSIONS,
};

/// One independent timer task per duty.
pub struct Scheduler {
    reconciler: Arc<Reconciler>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(reconciler: Arc<Reconciler>, cancel: CancellationToken) -> Self {
        Self { reconciler, cancel }
    }

    /// Start the duty timers. The first tick of each fires immediately.
    /// Cancelling the token stops the loops between ticks; a duty already
    /// running completes first.
    ///
    /// Startup does not force a restart of the permanent session. Its first
    /// tick only recreates it when missing or finished, so replicas starting
    /// together leave a healthy one alone.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let intervals = self.reconciler.config().intervals.clone();
        info!(
            keep_permanent_session = ?intervals.keep_permanent_session(),
            process_scheduled_sessions = ?intervals.process_scheduled_sessions(),
            track_running_sessions = ?intervals.track_running_sessions(),
            handle_timeout_sessions = ?intervals.handle_timeout_sessions(),
            "Starting reconciliation scheduler"
        );

        let reconciler = &self.reconciler;
        vec![
            self.every(KEEP_PERMANENT_SESSION, intervals.keep_permanent_session(), {
                let reconciler = Arc::clone(reconciler);
                move || {
                    let reconciler = Arc::clone(&reconciler);
                    async move { reconciler.keep_permanent_session().await }
                }
            }),
            self.every(
                PROCESS_SCHEDULED_SESSIONS,
                intervals.process_scheduled_sessions(),
                {
                    let reconciler = Arc::clone(reconciler);
                    move || {
                        let reconciler = Arc::clone(&reconciler);
                        async move { reconciler.process_scheduled_sessions().await }
                    }
                },
            ),
            self.every(TRACK_RUNNING_SESSIONS, intervals.track_running_sessions(), {
                let reconciler = Arc::clone(reconciler);
                move || {
                    let reconciler = Arc::clone(&reconciler);
                    async move { reconciler.track_running_sessions().await }
                }
            }),
            self.every(HANDLE_TIMEOUT_SESSIONS, intervals.handle_timeout_sessions(), {
                let reconciler = Arc::clone(reconciler);
                move || {
                    let reconciler = Arc::clone(&reconciler);
                    async move { reconciler.handle_timeout_sessions().await }
                }
            }),
        ]
    }

    fn every<F, Fut, T>(&self, duty: &'static str, period: Duration, run: F) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<T>>> + Send + 'static,
        T: Debug + Send + 'static,
    {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match run().await {
                    Ok(Some(outcome)) => debug!(duty, ?outcome, "Duty finished"),
                    Ok(None) => trace!(duty, "Duty skipped, lease held elsewhere"),
                    Err(e) => warn!(duty, error = %format!("{e:#}"), "Duty failed"),
                }
            }

            debug!(duty, "Duty timer stopped");
        })
    }
}
