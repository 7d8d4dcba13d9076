//! Warehouse boundary: read-only statement execution with a row cap.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::result::{RawColumn, Scalar};
use crate::errors::ExecutionErrorKind;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryJobId(pub String);

impl QueryJobId {
    pub fn generate() -> Self {
        Self(format!("job-{}", Uuid::new_v4().simple()))
    }
}

impl fmt::Display for QueryJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryRequest {
    pub job_id: QueryJobId,
    pub sql: String,
    /// Rows beyond this count are dropped and reported via `truncated`.
    pub max_rows: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WarehouseRows {
    pub columns: Vec<RawColumn>,
    pub rows: Vec<Vec<Scalar>>,
    pub truncated: bool,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WarehouseError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("malformed query: {0}")]
    Malformed(String),
    #[error("warehouse unavailable: {0}")]
    Unavailable(String),
    #[error("query cancelled")]
    Cancelled,
}

impl WarehouseError {
    pub fn kind(&self) -> ExecutionErrorKind {
        match self {
            Self::PermissionDenied(_) => ExecutionErrorKind::PermissionDenied,
            Self::Malformed(_) => ExecutionErrorKind::Malformed,
            Self::Unavailable(_) => ExecutionErrorKind::Unavailable,
            Self::Cancelled => ExecutionErrorKind::Timeout,
        }
    }
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn execute(&self, request: QueryRequest) -> Result<WarehouseRows, WarehouseError>;

    /// Asks the backend to stop a running job. Returns whether a job was cancelled.
    async fn cancel(&self, _job_id: &QueryJobId) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::{QueryJobId, WarehouseError};
    use crate::errors::ExecutionErrorKind;

    #[test]
    fn warehouse_errors_map_to_execution_categories() {
        assert_eq!(
            WarehouseError::PermissionDenied("readonly".to_owned()).kind(),
            ExecutionErrorKind::PermissionDenied
        );
        assert_eq!(WarehouseError::Malformed("near FROM".to_owned()).kind(), ExecutionErrorKind::Malformed);
        assert_eq!(WarehouseError::Cancelled.kind(), ExecutionErrorKind::Timeout);
    }

    #[test]
    fn job_ids_are_unique() {
        assert_ne!(QueryJobId::generate(), QueryJobId::generate());
    }
}
