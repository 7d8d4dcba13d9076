use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::chart::ChartSpec;
use crate::domain::intent::AnalyticalIntent;
use crate::domain::result::ResultSummary;
use crate::domain::sql::SqlCandidate;

const SUMMARY_TURN_LIMIT: usize = 10;
const SUMMARY_MAX_CHARS: usize = 2_000;
const DIGEST_MAX_CHARS: usize = 240;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn generate() -> Self {
        Self(format!("S-{}", Uuid::new_v4()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TurnId(pub String);

impl TurnId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Completed,
    ClarificationNeeded,
    Failed,
}

impl TurnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::ClarificationNeeded => "clarification_needed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "completed" => Some(Self::Completed),
            "clarification_needed" => Some(Self::ClarificationNeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Content-addressed pointer to a stored artifact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub key: String,
    pub name: String,
    pub media_type: String,
    pub size_bytes: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn_id: TurnId,
    pub session_id: SessionId,
    pub sequence: u32,
    pub question: String,
    pub intent: Option<AnalyticalIntent>,
    pub sql: Option<SqlCandidate>,
    pub result: Option<ResultSummary>,
    pub chart: Option<ChartSpec>,
    pub narrative: Option<String>,
    pub status: TurnStatus,
    pub reason_code: Option<String>,
    /// Text shown to the user: the narrative, a clarification prompt or a failure message.
    pub user_message: String,
    pub artifacts: Vec<ArtifactRef>,
    pub created_at: DateTime<Utc>,
}

impl TurnRecord {
    pub fn is_completed(&self) -> bool {
        self.status == TurnStatus::Completed
    }

    /// One-line description used when the turn is summarized into later context.
    pub fn digest(&self) -> String {
        let outcome = match (&self.status, &self.intent) {
            (TurnStatus::Completed, Some(intent)) => {
                let rows = self.result.as_ref().map(|result| result.row_count).unwrap_or_default();
                format!("answered with {} ({rows} rows)", intent.describe())
            }
            (TurnStatus::Completed, None) => "answered".to_owned(),
            (TurnStatus::ClarificationNeeded, _) => "asked for clarification".to_owned(),
            (TurnStatus::Failed, _) => format!(
                "failed ({})",
                self.reason_code.as_deref().unwrap_or("unknown")
            ),
        };
        truncate_chars(&format!("#{} \"{}\" {outcome}", self.sequence, self.question), DIGEST_MAX_CHARS)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: SessionId,
    pub turns: Vec<TurnRecord>,
    /// Rolling digest of prior turns, refreshed after each turn.
    pub summary: String,
}

impl SessionContext {
    pub fn new(session_id: SessionId) -> Self {
        Self { session_id, turns: Vec::new(), summary: String::new() }
    }

    pub fn next_sequence(&self) -> u32 {
        self.turns.last().map(|turn| turn.sequence + 1).unwrap_or(1)
    }

    pub fn last_completed(&self) -> Option<&TurnRecord> {
        self.turns.iter().rev().find(|turn| turn.is_completed())
    }

    pub fn last_intent(&self) -> Option<&AnalyticalIntent> {
        self.last_completed().and_then(|turn| turn.intent.as_ref())
    }

    /// Splits history into (older, recent) where `recent` holds the last `keep` turns.
    pub fn split_recent(&self, keep: usize) -> (&[TurnRecord], &[TurnRecord]) {
        let boundary = self.turns.len().saturating_sub(keep);
        self.turns.split_at(boundary)
    }

    pub fn append(&mut self, record: TurnRecord) {
        self.turns.push(record);
        self.refresh_summary();
    }

    pub fn refresh_summary(&mut self) {
        let start = self.turns.len().saturating_sub(SUMMARY_TURN_LIMIT);
        let digests: Vec<String> = self.turns[start..].iter().map(TurnRecord::digest).collect();
        self.summary = truncate_chars(&digests.join("\n"), SUMMARY_MAX_CHARS);
    }
}

pub(crate) fn truncate_chars(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_owned();
    }
    let mut truncated: String = value.chars().take(max_chars.saturating_sub(3)).collect();
    truncated.push_str("...");
    truncated
}
