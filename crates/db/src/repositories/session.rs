use async_trait::async_trait;
use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row};

use crmsight_core::domain::turn::{SessionContext, SessionId, TurnRecord};
use crmsight_core::store::{SessionStore, StoreError};

use super::RepositoryError;
use crate::DbPool;

/// Session history in SQLite. Each turn is stored as its JSON record next to a
/// few indexed columns; the rolling summary lives on the session row.
pub struct SqlSessionStore {
    pool: DbPool,
}

impl SqlSessionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn load_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<SessionContext>, RepositoryError> {
        let Some(row) = sqlx::query("SELECT summary FROM sessions WHERE id = ?")
            .bind(&session_id.0)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        let summary: String = row.try_get("summary")?;

        let turns = sqlx::query(
            "SELECT record_json FROM session_turns WHERE session_id = ? ORDER BY sequence ASC",
        )
        .bind(&session_id.0)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(turn_from_row)
        .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(SessionContext { session_id: session_id.clone(), turns, summary }))
    }

    async fn insert_turn(
        &self,
        session_id: &SessionId,
        record: &TurnRecord,
        summary: &str,
    ) -> Result<bool, RepositoryError> {
        let now = Utc::now().to_rfc3339();
        let record_json = serde_json::to_string(record)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO sessions (id, summary, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET summary = excluded.summary, updated_at = excluded.updated_at
            "#,
        )
        .bind(&session_id.0)
        .bind(summary)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        let exists: i64 = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM session_turns WHERE session_id = ?1 AND sequence = ?2)",
        )
        .bind(&session_id.0)
        .bind(i64::from(record.sequence))
        .fetch_one(&mut *tx)
        .await?;
        if exists == 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO session_turns (
                id, session_id, sequence, status, reason_code, question, record_json, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.turn_id.0)
        .bind(&session_id.0)
        .bind(i64::from(record.sequence))
        .bind(record.status.as_str())
        .bind(record.reason_code.as_deref())
        .bind(&record.question)
        .bind(record_json)
        .bind(record.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }
}

#[async_trait]
impl SessionStore for SqlSessionStore {
    async fn load(&self, session_id: &SessionId) -> Result<Option<SessionContext>, StoreError> {
        Ok(self.load_session(session_id).await?)
    }

    async fn append_turn(
        &self,
        session_id: &SessionId,
        record: &TurnRecord,
        summary: &str,
    ) -> Result<(), StoreError> {
        if self.insert_turn(session_id, record, summary).await? {
            Ok(())
        } else {
            Err(StoreError::DuplicateTurn {
                session_id: session_id.0.clone(),
                sequence: record.sequence,
            })
        }
    }
}

fn turn_from_row(row: &SqliteRow) -> Result<TurnRecord, RepositoryError> {
    let record_json: String = row.try_get("record_json")?;
    serde_json::from_str(&record_json)
        .map_err(|error| RepositoryError::Decode(format!("invalid turn record: {error}")))
}
