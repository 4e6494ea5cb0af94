//! Session management module.
//!
//! Session records, their persistence and the store seam the reconciler
//! talks to.

mod models;
mod repository;
mod service;

use anyhow::Result;
use async_trait::async_trait;

pub use models::{Session, SessionState, SubmitParams};
pub use repository::SessionRepository;
pub use service::SessionService;

pub(crate) use models::{format_timestamp, parse_timestamp};

/// Session store abstraction for testability.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn fetch_one(&self, id: &str) -> Result<Option<Session>>;

    /// Sessions in `state`, oldest first, at most `limit`.
    async fn fetch_by_state(&self, state: SessionState, limit: usize) -> Result<Vec<Session>>;

    /// Sessions that were launched and have not terminated.
    async fn fetch_running(&self) -> Result<Vec<Session>>;

    /// Create a queued session. A fresh ID is generated when `id` is `None`.
    async fn create_session(&self, params: SubmitParams, id: Option<&str>) -> Result<Session>;

    /// Delete a session. Missing sessions are not an error.
    async fn delete_one(&self, id: &str) -> Result<()>;

    /// Terminate a session on the backend and mark it complete.
    /// Already-terminated sessions are not an error.
    async fn kill_one(&self, session: &Session) -> Result<()>;
}
