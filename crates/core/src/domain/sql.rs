use serde::{Deserialize, Serialize};

use crate::domain::intent::AnalyticalIntent;

/// A candidate may be regenerated once after failing validation.
pub const MAX_REPAIR_ATTEMPTS: u8 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Unvalidated,
    SyntaxValid,
    SchemaValid,
    Rejected,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unvalidated => "unvalidated",
            Self::SyntaxValid => "syntax_valid",
            Self::SchemaValid => "schema_valid",
            Self::Rejected => "rejected",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SqlCandidate {
    pub sql: String,
    pub intent: AnalyticalIntent,
    pub status: ValidationStatus,
    pub repair_attempts: u8,
    /// Declared output column names, in select order.
    pub projection: Vec<String>,
}

impl SqlCandidate {
    pub fn new(sql: impl Into<String>, intent: AnalyticalIntent) -> Self {
        Self {
            sql: sql.into(),
            intent,
            status: ValidationStatus::Unvalidated,
            repair_attempts: 0,
            projection: Vec::new(),
        }
    }

    pub fn repaired(sql: impl Into<String>, previous: &SqlCandidate) -> Self {
        Self {
            sql: sql.into(),
            intent: previous.intent.clone(),
            status: ValidationStatus::Unvalidated,
            repair_attempts: previous.repair_attempts.saturating_add(1),
            projection: Vec::new(),
        }
    }

    pub fn mark_syntax_valid(&mut self, projection: Vec<String>) {
        self.projection = projection;
        self.status = ValidationStatus::SyntaxValid;
    }

    pub fn mark_schema_valid(&mut self) {
        if self.status == ValidationStatus::SyntaxValid {
            self.status = ValidationStatus::SchemaValid;
        }
    }

    pub fn reject(&mut self) {
        self.status = ValidationStatus::Rejected;
    }

    pub fn is_executable(&self) -> bool {
        self.status == ValidationStatus::SchemaValid
    }

    pub fn can_repair(&self) -> bool {
        self.repair_attempts < MAX_REPAIR_ATTEMPTS
    }

    /// Markdown body persisted as the query artifact.
    pub fn to_markdown(&self) -> String {
        format!("```sql\n{}\n```\n", self.sql.trim())
    }
}
