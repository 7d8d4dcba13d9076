use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnState {
    Received,
    ContextBuilt,
    IntentResolved,
    SqlValidated,
    Executed,
    Charted,
    Narrated,
    Completed,
    ClarificationNeeded,
    Failed { reason_code: String },
}

impl TurnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::ContextBuilt => "context_built",
            Self::IntentResolved => "intent_resolved",
            Self::SqlValidated => "sql_validated",
            Self::Executed => "executed",
            Self::Charted => "charted",
            Self::Narrated => "narrated",
            Self::Completed => "completed",
            Self::ClarificationNeeded => "clarification_needed",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::ClarificationNeeded | Self::Failed { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnEvent {
    ContextAssembled,
    IntentGrounded,
    SqlAccepted,
    QueryReturned,
    ChartComposed,
    NarrativeWritten,
    TurnRecorded,
    ClarificationRequested,
    StageFailed { reason_code: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnAction {
    InterpretIntent,
    SynthesizeSql,
    ExecuteQuery,
    ComposeChart,
    SynthesizeInsight,
    PersistTurn,
    EmitClarification,
    EmitFailure,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: TurnState,
    pub to: TurnState,
    pub event: TurnEvent,
    pub actions: Vec<TurnAction>,
}
