use std::sync::Arc;
use std::time::Duration;

use crmsight_core::domain::result::ResultSet;
use crmsight_core::domain::sql::SqlCandidate;
use crmsight_core::errors::{ExecutionErrorKind, PipelineError};
use crmsight_core::warehouse::{QueryJobId, QueryRequest, Warehouse};

use crate::guardrails::{ExecutionGuardrails, GuardrailDecision};

/// How long a cancelled job may take to unwind after its deadline.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

pub struct QueryExecutor {
    warehouse: Arc<dyn Warehouse>,
    guardrails: ExecutionGuardrails,
}

impl QueryExecutor {
    pub fn new(warehouse: Arc<dyn Warehouse>, guardrails: ExecutionGuardrails) -> Self {
        Self { warehouse, guardrails }
    }

    pub fn guardrails(&self) -> &ExecutionGuardrails {
        &self.guardrails
    }

    /// Runs a schema-valid candidate under the row cap and timeout. A timed
    /// out job is cancelled on the backend while it is still in flight, and
    /// the error is returned once it has unwound or the grace period ends.
    pub async fn execute(&self, candidate: &SqlCandidate) -> Result<ResultSet, PipelineError> {
        if let GuardrailDecision::Deny { reason_code, detail } = self.guardrails.evaluate(candidate) {
            tracing::warn!(event_name = "execution.denied", reason_code, detail = %detail, "guardrail denied execution");
            return Err(PipelineError::UnsafeStatementRejected { reason: detail });
        }

        let job_id = QueryJobId::generate();
        let request = QueryRequest {
            job_id: job_id.clone(),
            sql: candidate.sql.clone(),
            max_rows: self.guardrails.max_rows,
        };
        let started = std::time::Instant::now();
        let mut execution = self.warehouse.execute(request);
        let finished = tokio::select! {
            outcome = &mut execution => Some(outcome),
            _ = tokio::time::sleep(self.guardrails.timeout) => None,
        };

        let rows = match finished {
            Some(Ok(rows)) => rows,
            Some(Err(error)) => {
                tracing::warn!(event_name = "execution.failed", job_id = %job_id, error = %error, "warehouse query failed");
                return Err(PipelineError::ExecutionError {
                    kind: error.kind(),
                    detail: error.to_string(),
                });
            }
            None => {
                let cancelled = self.warehouse.cancel(&job_id).await;
                let settled = tokio::time::timeout(CANCEL_GRACE, &mut execution).await.is_ok();
                tracing::warn!(
                    event_name = "execution.timeout",
                    job_id = %job_id,
                    timeout_ms = self.guardrails.timeout.as_millis() as u64,
                    cancelled,
                    settled,
                    "warehouse query timed out"
                );
                return Err(PipelineError::ExecutionError {
                    kind: ExecutionErrorKind::Timeout,
                    detail: format!("query {job_id} exceeded {:?}", self.guardrails.timeout),
                });
            }
        };

        let result = ResultSet::from_raw(rows.columns, rows.rows, rows.truncated);
        check_projection(candidate, &result)?;
        tracing::info!(
            event_name = "execution.completed",
            job_id = %job_id,
            rows = result.row_count,
            truncated = result.truncated,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "warehouse query completed"
        );
        Ok(result)
    }
}

fn check_projection(candidate: &SqlCandidate, result: &ResultSet) -> Result<(), PipelineError> {
    if candidate.projection.is_empty() {
        return Ok(());
    }
    let returned = result.column_names();
    let matches = returned.len() == candidate.projection.len()
        && returned
            .iter()
            .zip(&candidate.projection)
            .all(|(returned, declared)| returned.eq_ignore_ascii_case(declared));
    if matches {
        return Ok(());
    }
    Err(PipelineError::ExecutionError {
        kind: ExecutionErrorKind::Malformed,
        detail: format!(
            "result columns [{}] do not match the declared projection [{}]",
            returned.join(", "),
            candidate.projection.join(", ")
        ),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use crmsight_core::domain::result::{RawColumn, Scalar};
    use crmsight_core::domain::sql::SqlCandidate;
    use crmsight_core::errors::{ExecutionErrorKind, PipelineError};
    use crmsight_core::warehouse::{QueryJobId, QueryRequest, Warehouse, WarehouseError, WarehouseRows};

    use super::QueryExecutor;
    use crate::guardrails::ExecutionGuardrails;
    use crate::test_support::revenue_by_country;

    struct CannedWarehouse {
        columns: Vec<&'static str>,
        delay: Duration,
        failure: Option<WarehouseError>,
        cancelled: AtomicBool,
        cancel_signal: Notify,
    }

    impl CannedWarehouse {
        fn returning(columns: Vec<&'static str>) -> Self {
            Self {
                columns,
                delay: Duration::ZERO,
                failure: None,
                cancelled: AtomicBool::new(false),
                cancel_signal: Notify::new(),
            }
        }
    }

    #[async_trait]
    impl Warehouse for CannedWarehouse {
        async fn execute(&self, request: QueryRequest) -> Result<WarehouseRows, WarehouseError> {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = self.cancel_signal.notified() => return Err(WarehouseError::Cancelled),
            }
            if let Some(failure) = &self.failure {
                return Err(failure.clone());
            }
            let rows: Vec<Vec<Scalar>> = vec![
                vec![Scalar::Text("Germany".to_owned()), Scalar::Float(1200.0)],
                vec![Scalar::Text("Japan".to_owned()), Scalar::Float(800.0)],
            ];
            let truncated = rows.len() > request.max_rows;
            Ok(WarehouseRows {
                columns: self
                    .columns
                    .iter()
                    .map(|name| RawColumn { name: (*name).to_owned(), declared_type: None })
                    .collect(),
                rows: rows.into_iter().take(request.max_rows).collect(),
                truncated,
            })
        }

        async fn cancel(&self, _job_id: &QueryJobId) -> bool {
            self.cancelled.store(true, Ordering::SeqCst);
            self.cancel_signal.notify_one();
            true
        }
    }

    fn validated() -> SqlCandidate {
        let mut candidate = SqlCandidate::new(
            "SELECT a.BillingCountry AS country, SUM(o.Amount) AS revenue FROM Opportunity o JOIN Account a ON a.Id = o.AccountId GROUP BY a.BillingCountry",
            revenue_by_country(),
        );
        candidate.mark_syntax_valid(vec!["country".to_owned(), "revenue".to_owned()]);
        candidate.mark_schema_valid();
        candidate
    }

    #[tokio::test]
    async fn returns_typed_rows_under_the_row_cap() {
        let warehouse = Arc::new(CannedWarehouse::returning(vec!["country", "revenue"]));
        let executor = QueryExecutor::new(warehouse, ExecutionGuardrails::new(1, Duration::from_secs(5)));

        let result = executor.execute(&validated()).await.expect("result");
        assert_eq!(result.row_count, 1);
        assert!(result.truncated);
        assert_eq!(result.column_names(), vec!["country", "revenue"]);
    }

    #[tokio::test]
    async fn unvalidated_candidate_never_reaches_the_warehouse() {
        let warehouse = Arc::new(CannedWarehouse {
            failure: Some(WarehouseError::Unavailable("must not be called".to_owned())),
            ..CannedWarehouse::returning(vec!["country", "revenue"])
        });
        let executor = QueryExecutor::new(warehouse, ExecutionGuardrails::default());
        let candidate = SqlCandidate::new("SELECT 1 AS one", revenue_by_country());

        let error = executor.execute(&candidate).await.expect_err("denied");
        assert_eq!(error.reason_code(), "unsafe_statement_rejected");
    }

    #[tokio::test]
    async fn slow_query_times_out_and_is_cancelled() {
        let warehouse = Arc::new(CannedWarehouse {
            delay: Duration::from_secs(5),
            ..CannedWarehouse::returning(vec!["country", "revenue"])
        });
        let executor =
            QueryExecutor::new(warehouse.clone(), ExecutionGuardrails::new(100, Duration::from_millis(20)));

        let started = std::time::Instant::now();
        let error = executor.execute(&validated()).await.expect_err("timeout");
        assert!(matches!(error, PipelineError::ExecutionError { kind: ExecutionErrorKind::Timeout, .. }));
        assert!(warehouse.cancelled.load(Ordering::SeqCst));
        assert!(started.elapsed() < Duration::from_secs(2), "cancelled job should unwind promptly");
    }

    #[tokio::test]
    async fn warehouse_errors_keep_their_kind() {
        let warehouse = Arc::new(CannedWarehouse {
            failure: Some(WarehouseError::PermissionDenied("role lacks SELECT".to_owned())),
            ..CannedWarehouse::returning(vec!["country", "revenue"])
        });
        let executor = QueryExecutor::new(warehouse, ExecutionGuardrails::default());

        let error = executor.execute(&validated()).await.expect_err("denied");
        assert_eq!(error.reason_code(), "execution_permission_denied");
        assert!(!error.user_message().contains("role lacks SELECT"));
    }

    #[tokio::test]
    async fn mismatched_projection_is_malformed() {
        let warehouse = Arc::new(CannedWarehouse::returning(vec!["country", "amount"]));
        let executor = QueryExecutor::new(warehouse, ExecutionGuardrails::default());

        let error = executor.execute(&validated()).await.expect_err("mismatch");
        assert_eq!(error.reason_code(), "execution_malformed");
    }
}
