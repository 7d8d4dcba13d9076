use std::time::Duration;

use crmsight_core::domain::sql::{SqlCandidate, ValidationStatus};
use crmsight_core::sql::check_read_only;

/// Final gate in front of the warehouse.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuardrailDecision {
    Allow,
    Deny { reason_code: &'static str, detail: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionGuardrails {
    pub max_rows: usize,
    pub timeout: Duration,
}

impl Default for ExecutionGuardrails {
    fn default() -> Self {
        Self { max_rows: 10_000, timeout: Duration::from_secs(30) }
    }
}

impl ExecutionGuardrails {
    pub fn new(max_rows: usize, timeout: Duration) -> Self {
        Self { max_rows: max_rows.max(1), timeout }
    }

    /// Re-checks the read-only gate even for candidates that passed validation.
    pub fn evaluate(&self, candidate: &SqlCandidate) -> GuardrailDecision {
        if candidate.status != ValidationStatus::SchemaValid {
            return GuardrailDecision::Deny {
                reason_code: "candidate_not_validated",
                detail: format!("candidate is {}", candidate.status.as_str()),
            };
        }
        if let Err(unsafe_statement) = check_read_only(&candidate.sql) {
            return GuardrailDecision::Deny {
                reason_code: "unsafe_statement",
                detail: unsafe_statement.to_string(),
            };
        }
        GuardrailDecision::Allow
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crmsight_core::domain::sql::SqlCandidate;

    use super::{ExecutionGuardrails, GuardrailDecision};
    use crate::test_support::revenue_by_country;

    fn validated(sql: &str) -> SqlCandidate {
        let mut candidate = SqlCandidate::new(sql, revenue_by_country());
        candidate.mark_syntax_valid(vec!["country".to_owned(), "revenue".to_owned()]);
        candidate.mark_schema_valid();
        candidate
    }

    #[test]
    fn validated_select_is_allowed() {
        let decision = ExecutionGuardrails::default()
            .evaluate(&validated("SELECT a.BillingCountry AS country, SUM(o.Amount) AS revenue FROM Opportunity o JOIN Account a ON a.Id = o.AccountId GROUP BY 1"));
        assert_eq!(decision, GuardrailDecision::Allow);
    }

    #[test]
    fn unvalidated_candidate_denial() {
        let candidate = SqlCandidate::new("SELECT 1 AS one", revenue_by_country());
        let (reason_code, detail) = match ExecutionGuardrails::default().evaluate(&candidate) {
            GuardrailDecision::Deny { reason_code, detail } => (reason_code, detail),
            GuardrailDecision::Allow => ("", String::new()),
        };
        assert_eq!(reason_code, "candidate_not_validated");
        assert!(detail.contains("unvalidated"));
    }

    #[test]
    fn mutating_statement_denial_even_when_marked_valid() {
        let decision = ExecutionGuardrails::default().evaluate(&validated("DELETE FROM Account"));
        let reason_code = match decision {
            GuardrailDecision::Deny { reason_code, .. } => reason_code,
            GuardrailDecision::Allow => "",
        };
        assert_eq!(reason_code, "unsafe_statement");
    }

    #[test]
    fn row_cap_is_at_least_one() {
        let guardrails = ExecutionGuardrails::new(0, Duration::from_secs(5));
        assert_eq!(guardrails.max_rows, 1);
    }
}
