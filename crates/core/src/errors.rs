use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::flows::FlowTransitionError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    Timeout,
    PermissionDenied,
    Malformed,
    Unavailable,
}

impl ExecutionErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::PermissionDenied => "permission_denied",
            Self::Malformed => "malformed",
            Self::Unavailable => "unavailable",
        }
    }
}

/// Typed outcomes of a pipeline stage that end a turn early.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("no schema entity matched the question (unmatched: {unmatched_terms:?})")]
    IntentUnresolvable { unmatched_terms: Vec<String> },
    #[error("clarification needed: {prompt}")]
    ClarificationNeeded { prompt: String, candidates: Vec<String> },
    #[error("unsafe statement rejected: {reason}")]
    UnsafeStatementRejected { reason: String },
    #[error("sql still invalid after repair: {violations:?}")]
    SqlUnresolvable { violations: Vec<String> },
    #[error("query execution failed ({}): {detail}", .kind.as_str())]
    ExecutionError { kind: ExecutionErrorKind, detail: String },
    #[error("inference service unavailable: {detail}")]
    InferenceUnavailable { detail: String },
}

impl PipelineError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::IntentUnresolvable { .. } => "intent_unresolvable",
            Self::ClarificationNeeded { .. } => "clarification_needed",
            Self::UnsafeStatementRejected { .. } => "unsafe_statement_rejected",
            Self::SqlUnresolvable { .. } => "sql_unresolvable",
            Self::ExecutionError { kind: ExecutionErrorKind::Timeout, .. } => "execution_timeout",
            Self::ExecutionError { kind: ExecutionErrorKind::PermissionDenied, .. } => {
                "execution_permission_denied"
            }
            Self::ExecutionError { kind: ExecutionErrorKind::Malformed, .. } => {
                "execution_malformed"
            }
            Self::ExecutionError { kind: ExecutionErrorKind::Unavailable, .. } => {
                "execution_unavailable"
            }
            Self::InferenceUnavailable { .. } => "inference_unavailable",
        }
    }

    pub fn is_clarification(&self) -> bool {
        matches!(self, Self::ClarificationNeeded { .. })
    }

    /// Message safe to show the person asking; never carries backend detail.
    pub fn user_message(&self) -> String {
        match self {
            Self::IntentUnresolvable { unmatched_terms } if !unmatched_terms.is_empty() => format!(
                "I couldn't connect {} to anything in the CRM data model. Try naming a metric such as revenue, opportunities or leads.",
                quoted_list(unmatched_terms)
            ),
            Self::IntentUnresolvable { .. } => "I couldn't connect the question to anything in the CRM data model. Try naming a metric such as revenue, opportunities or leads.".to_owned(),
            Self::ClarificationNeeded { prompt, .. } => prompt.clone(),
            Self::UnsafeStatementRejected { .. } => {
                "That request would change data, and I can only run read-only queries.".to_owned()
            }
            Self::SqlUnresolvable { .. } => {
                "I couldn't build a valid query for that question. Try rephrasing it with the metric and grouping you need.".to_owned()
            }
            Self::ExecutionError { kind: ExecutionErrorKind::Timeout, .. } => {
                "The query took too long and was cancelled. Try narrowing the time range or adding a filter.".to_owned()
            }
            Self::ExecutionError { kind: ExecutionErrorKind::PermissionDenied, .. } => {
                "The data warehouse refused access to the data this question needs.".to_owned()
            }
            Self::ExecutionError { kind: ExecutionErrorKind::Malformed, .. } => {
                "The data warehouse could not run the generated query.".to_owned()
            }
            Self::ExecutionError { kind: ExecutionErrorKind::Unavailable, .. } => {
                "The data warehouse is temporarily unavailable. Please retry shortly.".to_owned()
            }
            Self::InferenceUnavailable { .. } => {
                "The language model service is temporarily unavailable. Please retry shortly."
                    .to_owned()
            }
        }
    }
}

fn quoted_list(terms: &[String]) -> String {
    terms.iter().map(|term| format!("'{term}'")).collect::<Vec<_>>().join(", ")
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error(transparent)]
    FlowTransition(#[from] FlowTransitionError),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl From<FlowTransitionError> for ApplicationError {
    fn from(value: FlowTransitionError) -> Self {
        Self::Domain(DomainError::FlowTransition(value))
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The question could not be answered as asked. Rephrase it and try again."
            }
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let unassigned = || "unassigned".to_owned();
        match value {
            ApplicationError::Pipeline(
                error @ (PipelineError::ExecutionError {
                    kind: ExecutionErrorKind::Timeout | ExecutionErrorKind::Unavailable,
                    ..
                }
                | PipelineError::InferenceUnavailable { .. }),
            ) => Self::ServiceUnavailable {
                message: error.reason_code().to_owned(),
                correlation_id: unassigned(),
            },
            ApplicationError::Pipeline(error) => {
                Self::BadRequest { message: error.reason_code().to_owned(), correlation_id: unassigned() }
            }
            ApplicationError::Domain(DomainError::FlowTransition(_))
            | ApplicationError::Domain(DomainError::InvariantViolation(_)) => Self::Internal {
                message: "turn state machine violated".to_owned(),
                correlation_id: unassigned(),
            },
            ApplicationError::Persistence(message) | ApplicationError::Integration(message) => {
                Self::ServiceUnavailable { message, correlation_id: unassigned() }
            }
            ApplicationError::Configuration(message) => {
                Self::Internal { message, correlation_id: unassigned() }
            }
        }
    }
}
