//! Session database repository.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use super::models::{Session, SessionRow, SessionState, format_timestamp};

/// All session columns for SELECT queries.
const SESSION_COLUMNS: &str = r#"
    id, state, submit_params, app_id, error_message, created_at, updated_at
"#;

/// Repository for session persistence.
#[derive(Debug, Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    /// Create a new repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new session.
    pub async fn create(&self, session: &Session) -> Result<()> {
        let submit_params =
            serde_json::to_string(&session.submit_params).context("encoding submit params")?;

        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, state, submit_params, app_id, error_message, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(session.state.as_str())
        .bind(submit_params)
        .bind(&session.app_id)
        .bind(&session.error_message)
        .bind(format_timestamp(session.created_at))
        .bind(format_timestamp(session.updated_at))
        .execute(&self.pool)
        .await
        .context("creating session")?;

        Ok(())
    }

    /// Get a session by ID.
    pub async fn get(&self, id: &str) -> Result<Option<Session>> {
        let query = format!("SELECT {} FROM sessions WHERE id = ?", SESSION_COLUMNS);
        let row = sqlx::query_as::<_, SessionRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching session")?;

        row.map(Session::try_from).transpose()
    }

    /// List sessions in `state`, oldest first.
    pub async fn list_by_state(&self, state: SessionState, limit: i64) -> Result<Vec<Session>> {
        let query = format!(
            "SELECT {} FROM sessions WHERE state = ? ORDER BY created_at ASC, id ASC LIMIT ?",
            SESSION_COLUMNS
        );
        let rows = sqlx::query_as::<_, SessionRow>(&query)
            .bind(state.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("listing sessions by state")?;

        rows.into_iter().map(Session::try_from).collect()
    }

    /// List launched sessions that have not terminated.
    pub async fn list_running(&self) -> Result<Vec<Session>> {
        let query = format!(
            "SELECT {} FROM sessions WHERE state IN (?, ?, ?) ORDER BY created_at ASC, id ASC",
            SESSION_COLUMNS
        );
        let [starting, running, idle] = SessionState::RUNNING;
        let rows = sqlx::query_as::<_, SessionRow>(&query)
            .bind(starting.as_str())
            .bind(running.as_str())
            .bind(idle.as_str())
            .fetch_all(&self.pool)
            .await
            .context("listing running sessions")?;

        rows.into_iter().map(Session::try_from).collect()
    }

    /// List all sessions, newest first.
    pub async fn list(&self, limit: i64) -> Result<Vec<Session>> {
        let query = format!(
            "SELECT {} FROM sessions ORDER BY created_at DESC, id DESC LIMIT ?",
            SESSION_COLUMNS
        );
        let rows = sqlx::query_as::<_, SessionRow>(&query)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("listing sessions")?;

        rows.into_iter().map(Session::try_from).collect()
    }

    /// Write a new state. Clears the error message unless one is given.
    ///
    /// Terminal sessions are left untouched. Returns false when the session
    /// is missing or already terminal, which also covers losing a race
    /// against a concurrent kill.
    pub async fn update_state(
        &self,
        id: &str,
        state: SessionState,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let [error, complete] = SessionState::TERMINAL;
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET state = ?, error_message = ?, updated_at = ?
            WHERE id = ? AND state NOT IN (?, ?)
            "#,
        )
        .bind(state.as_str())
        .bind(error_message)
        .bind(format_timestamp(Utc::now()))
        .bind(id)
        .bind(error.as_str())
        .bind(complete.as_str())
        .execute(&self.pool)
        .await
        .context("updating session state")?;

        Ok(result.rows_affected() > 0)
    }

    /// Record the backend handle assigned at launch.
    pub async fn set_app_id(&self, id: &str, app_id: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET app_id = ?, updated_at = ? WHERE id = ?")
            .bind(app_id)
            .bind(format_timestamp(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating session app id")?;

        Ok(())
    }

    /// Delete a session. Returns whether a row was removed.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("deleting session")?;

        Ok(result.rows_affected() > 0)
    }
}
