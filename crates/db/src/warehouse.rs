use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures_util::TryStreamExt;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Executor, Row, Sqlite, TypeInfo, ValueRef};
use tokio::sync::Notify;

use crmsight_core::domain::result::{RawColumn, Scalar};
use crmsight_core::warehouse::{QueryJobId, QueryRequest, Warehouse, WarehouseError, WarehouseRows};

use crate::DbPool;

/// SQLite VM steps between interrupt checks inside a running statement.
const INTERRUPT_CHECK_OPS: i32 = 1_000;

struct RunningQuery {
    /// Read by the connection's progress handler; set aborts the statement.
    interrupted: Arc<AtomicBool>,
    cancelled: Notify,
}

/// Warehouse adapter over a SQLite replica of the CRM.
pub struct SqliteWarehouse {
    pool: DbPool,
    running: Mutex<HashMap<QueryJobId, Arc<RunningQuery>>>,
}

impl SqliteWarehouse {
    /// `pool` should come from [`crate::connect_read_only`] outside of tests.
    pub fn new(pool: DbPool) -> Self {
        Self { pool, running: Mutex::new(HashMap::new()) }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Names from `tables` with no matching table or view in the warehouse.
    pub async fn missing_tables(&self, tables: &[&str]) -> Result<Vec<String>, sqlx::Error> {
        let mut conn = self.checkout(Arc::default()).await?;
        let mut missing = Vec::new();
        for table in tables {
            let exists: i64 = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1 COLLATE NOCASE)",
            )
            .bind(*table)
            .fetch_one(&mut *conn)
            .await?;
            if exists != 1 {
                missing.push((*table).to_owned());
            }
        }
        Ok(missing)
    }

    fn running(&self) -> MutexGuard<'_, HashMap<QueryJobId, Arc<RunningQuery>>> {
        match self.running.lock() {
            Ok(running) => running,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn register(&self, job_id: &QueryJobId) -> Arc<RunningQuery> {
        let job = Arc::new(RunningQuery {
            interrupted: Arc::new(AtomicBool::new(false)),
            cancelled: Notify::new(),
        });
        self.running().insert(job_id.clone(), job.clone());
        job
    }

    fn release(&self, job_id: &QueryJobId) {
        self.running().remove(job_id);
    }

    /// Pooled connection whose statements abort once `interrupted` is set.
    /// Installing the handler replaces whatever an earlier job left behind.
    async fn checkout(
        &self,
        interrupted: Arc<AtomicBool>,
    ) -> Result<PoolConnection<Sqlite>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        let mut handle = conn.lock_handle().await?;
        handle.set_progress_handler(INTERRUPT_CHECK_OPS, move || {
            !interrupted.load(Ordering::Relaxed)
        });
        drop(handle);
        Ok(conn)
    }

    async fn run(
        &self,
        request: &QueryRequest,
        job: &RunningQuery,
    ) -> Result<WarehouseRows, sqlx::Error> {
        let mut conn = self.checkout(job.interrupted.clone()).await?;
        let described = (&mut *conn).describe(request.sql.as_str()).await?;
        let columns = described
            .columns()
            .iter()
            .map(|column| {
                let declared = column.type_info().name();
                RawColumn {
                    name: column.name().to_owned(),
                    declared_type: (declared != "NULL").then(|| declared.to_owned()),
                }
            })
            .collect::<Vec<_>>();

        let mut rows = Vec::new();
        let mut truncated = false;
        let mut stream = sqlx::query(request.sql.as_str()).fetch(&mut *conn);
        while let Some(row) = stream.try_next().await? {
            if rows.len() == request.max_rows {
                truncated = true;
                break;
            }
            rows.push(decode_row(&row, columns.len())?);
        }

        Ok(WarehouseRows { columns, rows, truncated })
    }
}

#[async_trait]
impl Warehouse for SqliteWarehouse {
    async fn execute(&self, request: QueryRequest) -> Result<WarehouseRows, WarehouseError> {
        let job = self.register(&request.job_id);
        let outcome = tokio::select! {
            result = self.run(&request, &job) => result.map_err(|error| {
                if job.interrupted.load(Ordering::Relaxed) {
                    WarehouseError::Cancelled
                } else {
                    classify_error(error)
                }
            }),
            _ = job.cancelled.notified() => Err(WarehouseError::Cancelled),
        };
        self.release(&request.job_id);

        match &outcome {
            Ok(rows) => tracing::debug!(
                event_name = "warehouse.query_finished",
                job_id = %request.job_id,
                rows = rows.rows.len(),
                truncated = rows.truncated,
                "warehouse query finished"
            ),
            Err(error) => tracing::warn!(
                event_name = "warehouse.query_failed",
                job_id = %request.job_id,
                kind = error.kind().as_str(),
                error = %error,
                "warehouse query failed"
            ),
        }
        outcome
    }

    /// Interrupts the job's statement on its connection. Returns `false` once
    /// the job has already finished.
    async fn cancel(&self, job_id: &QueryJobId) -> bool {
        let Some(job) = self.running().get(job_id).cloned() else {
            return false;
        };
        job.interrupted.store(true, Ordering::Relaxed);
        job.cancelled.notify_one();
        tracing::info!(
            event_name = "warehouse.query_cancelled",
            job_id = %job_id,
            "warehouse query cancelled"
        );
        true
    }
}

fn decode_row(row: &SqliteRow, width: usize) -> Result<Vec<Scalar>, sqlx::Error> {
    (0..width.min(row.len())).map(|index| decode_value(row, index)).collect()
}

fn decode_value(row: &SqliteRow, index: usize) -> Result<Scalar, sqlx::Error> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(Scalar::Null);
    }
    let storage = raw.type_info().name().to_owned();
    match storage.as_str() {
        "INTEGER" => Ok(Scalar::Integer(row.try_get::<i64, _>(index)?)),
        "REAL" | "NUMERIC" => Ok(Scalar::Float(row.try_get::<f64, _>(index)?)),
        "BOOLEAN" => Ok(Scalar::Bool(row.try_get::<bool, _>(index)?)),
        "BLOB" => {
            let bytes = row.try_get::<Vec<u8>, _>(index)?;
            Ok(Scalar::Text(format!("<{} bytes>", bytes.len())))
        }
        _ => Ok(Scalar::Text(row.try_get::<String, _>(index)?)),
    }
}

/// Maps driver errors onto the execution categories shown to users.
fn classify_error(error: sqlx::Error) -> WarehouseError {
    match &error {
        sqlx::Error::Database(db) => {
            let message = db.message().to_ascii_lowercase();
            if message.contains("readonly")
                || message.contains("read-only")
                || message.contains("not authorized")
                || message.contains("query_only")
            {
                WarehouseError::PermissionDenied(db.message().to_owned())
            } else {
                WarehouseError::Malformed(db.message().to_owned())
            }
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            WarehouseError::Unavailable(error.to_string())
        }
        _ => WarehouseError::Malformed(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tempfile::TempDir;

    use crmsight_core::domain::result::Scalar;
    use crmsight_core::errors::ExecutionErrorKind;
    use crmsight_core::warehouse::{QueryJobId, QueryRequest, Warehouse, WarehouseError};

    use super::SqliteWarehouse;
    use crate::fixtures::DemoWarehouseDataset;
    use crate::{connect_read_only, connect_warehouse_writer};

    const SLOW_COUNT: &str = "WITH RECURSIVE counter(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM counter WHERE n < 5000000000) SELECT COUNT(*) AS n FROM counter";

    fn request(sql: &str, max_rows: usize) -> QueryRequest {
        QueryRequest { job_id: QueryJobId::generate(), sql: sql.to_owned(), max_rows }
    }

    async fn seeded_warehouse() -> (TempDir, SqliteWarehouse) {
        let dir = TempDir::new().expect("temp dir");
        let url = format!("sqlite://{}", dir.path().join("warehouse.db").display());
        let writer = connect_warehouse_writer(&url, 5).await.expect("writer");
        DemoWarehouseDataset::load(&writer).await.expect("seed");
        writer.close().await;
        let pool = connect_read_only(&url, 2, 5).await.expect("read-only pool");
        (dir, SqliteWarehouse::new(pool))
    }

    #[tokio::test]
    async fn returns_typed_rows_and_declared_columns() {
        let (_dir, warehouse) = seeded_warehouse().await;
        let rows = warehouse
            .execute(request(
                "SELECT BillingCountry AS country, COUNT(*) AS accounts FROM Account GROUP BY BillingCountry ORDER BY country",
                100,
            ))
            .await
            .expect("query runs");

        let names: Vec<&str> = rows.columns.iter().map(|column| column.name.as_str()).collect();
        assert_eq!(names, vec!["country", "accounts"]);
        assert_eq!(rows.rows.len(), 4);
        assert_eq!(rows.rows[0], vec![Scalar::Text("Germany".to_owned()), Scalar::Integer(7)]);
        assert!(!rows.truncated);
    }

    #[tokio::test]
    async fn missing_tables_lists_only_absent_names() {
        let (_dir, warehouse) = seeded_warehouse().await;
        let missing = warehouse
            .missing_tables(&["Account", "lead", "Quota"])
            .await
            .expect("missing-table lookup runs");
        assert_eq!(missing, vec!["Quota".to_owned()]);
    }

    #[tokio::test]
    async fn row_cap_truncates_and_flags_result() {
        let (_dir, warehouse) = seeded_warehouse().await;
        let rows = warehouse
            .execute(request("SELECT Id FROM Lead ORDER BY Id", 10))
            .await
            .expect("query runs");
        assert_eq!(rows.rows.len(), 10);
        assert!(rows.truncated);
    }

    #[tokio::test]
    async fn empty_results_keep_their_column_schema() {
        let (_dir, warehouse) = seeded_warehouse().await;
        let rows = warehouse
            .execute(request("SELECT Name AS customer FROM Account WHERE 1 = 0", 10))
            .await
            .expect("query runs");
        assert!(rows.rows.is_empty());
        assert_eq!(rows.columns.len(), 1);
        assert_eq!(rows.columns[0].name, "customer");
    }

    #[tokio::test]
    async fn errors_are_categorized() {
        let (_dir, warehouse) = seeded_warehouse().await;

        let malformed = warehouse
            .execute(request("SELECT NoSuchColumn FROM Account", 10))
            .await
            .expect_err("unknown column fails");
        assert_eq!(malformed.kind(), ExecutionErrorKind::Malformed);

        let denied = warehouse
            .execute(request("DELETE FROM Account", 10))
            .await
            .expect_err("writes fail");
        assert_eq!(denied.kind(), ExecutionErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn cancel_reports_unknown_jobs() {
        let (_dir, warehouse) = seeded_warehouse().await;
        assert!(!warehouse.cancel(&QueryJobId::generate()).await);
    }

    #[tokio::test]
    async fn cancel_interrupts_a_running_statement() {
        let (dir, seeded) = seeded_warehouse().await;
        seeded.pool().close().await;
        let url = format!("sqlite://{}", dir.path().join("warehouse.db").display());
        let pool = connect_read_only(&url, 1, 3).await.expect("single-connection pool");
        let warehouse = Arc::new(SqliteWarehouse::new(pool));

        let slow = request(SLOW_COUNT, 10);
        let job_id = slow.job_id.clone();
        let running = tokio::spawn({
            let warehouse = warehouse.clone();
            async move { warehouse.execute(slow).await }
        });
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!running.is_finished(), "statement should still be counting");

        assert!(warehouse.cancel(&job_id).await);
        let outcome = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("cancelled job settles")
            .expect("task joins");
        assert!(matches!(outcome, Err(WarehouseError::Cancelled)));
        assert!(!warehouse.cancel(&job_id).await);

        // The only connection is free again and carries no stale interrupt.
        let rows = tokio::time::timeout(
            Duration::from_secs(5),
            warehouse.execute(request("SELECT COUNT(*) AS accounts FROM Account", 10)),
        )
        .await
        .expect("connection released")
        .expect("follow-up query runs");
        assert_eq!(rows.rows, vec![vec![Scalar::Integer(28)]]);
    }
}
