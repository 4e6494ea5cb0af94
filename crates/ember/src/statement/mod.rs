//! Statements submitted to interactive sessions.
//!
//! The reconciler only asks one question of them: does a session still have
//! work waiting or in flight.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::session::{Session, format_timestamp, parse_timestamp};

/// Answers whether a session has pending work.
#[async_trait]
pub trait StatementActivity: Send + Sync {
    async fn has_waiting_statement(&self, session: &Session) -> Result<bool>;
}

/// Statement lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementState {
    Waiting,
    Running,
    Available,
    Error,
    Cancelled,
}

impl StatementState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatementState::Waiting => "waiting",
            StatementState::Running => "running",
            StatementState::Available => "available",
            StatementState::Error => "error",
            StatementState::Cancelled => "cancelled",
        }
    }

    /// Whether the statement still occupies its session.
    pub fn is_pending(&self) -> bool {
        matches!(self, StatementState::Waiting | StatementState::Running)
    }
}

impl std::str::FromStr for StatementState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(StatementState::Waiting),
            "running" => Ok(StatementState::Running),
            "available" => Ok(StatementState::Available),
            "error" => Ok(StatementState::Error),
            "cancelled" => Ok(StatementState::Cancelled),
            other => Err(format!("unknown statement state: {other}")),
        }
    }
}

/// A unit of code executed inside a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
    pub id: String,
    pub session_id: String,
    pub code: String,
    pub state: StatementState,
    pub output: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct StatementRow {
    id: String,
    session_id: String,
    code: String,
    state: String,
    output: Option<String>,
    created_at: String,
}

impl TryFrom<StatementRow> for Statement {
    type Error = anyhow::Error;

    fn try_from(row: StatementRow) -> Result<Self> {
        Ok(Self {
            state: row
                .state
                .parse()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("statement {}", row.id))?,
            created_at: parse_timestamp(&row.created_at)?,
            id: row.id,
            session_id: row.session_id,
            code: row.code,
            output: row.output,
        })
    }
}

/// Repository for statement persistence.
#[derive(Debug, Clone)]
pub struct StatementRepository {
    pool: SqlitePool,
}

impl StatementRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Queue a statement for a session.
    pub async fn create(&self, session_id: &str, code: &str) -> Result<Statement> {
        let statement = Statement {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            code: code.to_string(),
            state: StatementState::Waiting,
            output: None,
            created_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO statements (id, session_id, code, state, output, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&statement.id)
        .bind(&statement.session_id)
        .bind(&statement.code)
        .bind(statement.state.as_str())
        .bind(&statement.output)
        .bind(format_timestamp(statement.created_at))
        .execute(&self.pool)
        .await
        .context("creating statement")?;

        Ok(statement)
    }

    pub async fn update_state(
        &self,
        id: &str,
        state: StatementState,
        output: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE statements SET state = ?, output = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(output)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating statement state")?;

        Ok(result.rows_affected() > 0)
    }

    /// Statements of a session in submission order.
    pub async fn list_for_session(&self, session_id: &str) -> Result<Vec<Statement>> {
        let rows = sqlx::query_as::<_, StatementRow>(
            r#"
            SELECT id, session_id, code, state, output, created_at
            FROM statements
            WHERE session_id = ?
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .context("listing statements")?;

        rows.into_iter().map(Statement::try_from).collect()
    }

    /// Whether any statement of the session is waiting or running.
    pub async fn has_pending(&self, session_id: &str) -> Result<bool> {
        let pending: i64 = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM statements
                WHERE session_id = ? AND state IN (?, ?)
            )
            "#,
        )
        .bind(session_id)
        .bind(StatementState::Waiting.as_str())
        .bind(StatementState::Running.as_str())
        .fetch_one(&self.pool)
        .await
        .context("checking pending statements")?;

        Ok(pending != 0)
    }
}

#[async_trait]
impl StatementActivity for StatementRepository {
    async fn has_waiting_statement(&self, session: &Session) -> Result<bool> {
        self.has_pending(&session.id).await
    }
}
