use thiserror::Error;

use crate::events::{EventContext, ProgressCategory, ProgressOutcome, ProgressSink};
use crate::flows::states::{TransitionOutcome, TurnAction, TurnEvent, TurnState};

pub trait FlowDefinition {
    fn initial_state(&self) -> TurnState;
    fn transition(
        &self,
        current: &TurnState,
        event: &TurnEvent,
    ) -> Result<TransitionOutcome, FlowTransitionError>;
}

/// Question-to-answer pipeline: one stage per state, terminal exits from any live state.
#[derive(Clone, Debug, Default)]
pub struct AnalyticsTurnFlow;

impl FlowDefinition for AnalyticsTurnFlow {
    fn initial_state(&self) -> TurnState {
        TurnState::Received
    }

    fn transition(
        &self,
        current: &TurnState,
        event: &TurnEvent,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        transition_turn(current, event)
    }
}

#[derive(Clone, Debug, Default)]
pub struct FlowEngine<F> {
    flow: F,
}

pub type TurnFlowEngine = FlowEngine<AnalyticsTurnFlow>;

impl<F> FlowEngine<F>
where
    F: FlowDefinition,
{
    pub fn new(flow: F) -> Self {
        Self { flow }
    }

    pub fn initial_state(&self) -> TurnState {
        self.flow.initial_state()
    }

    pub fn apply(
        &self,
        current: &TurnState,
        event: &TurnEvent,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        self.flow.transition(current, event)
    }

    pub fn apply_with_events<S>(
        &self,
        current: &TurnState,
        event: &TurnEvent,
        sink: &S,
        context: &EventContext,
    ) -> Result<TransitionOutcome, FlowTransitionError>
    where
        S: ProgressSink + ?Sized,
    {
        let result = self.apply(current, event);
        match &result {
            Ok(outcome) => {
                let outcome_kind = match &outcome.to {
                    TurnState::Failed { .. } => ProgressOutcome::Failed,
                    TurnState::ClarificationNeeded => ProgressOutcome::Rejected,
                    _ => ProgressOutcome::Success,
                };
                let mut progress = context
                    .event("turn.transition_applied", ProgressCategory::Flow, outcome_kind)
                    .with_metadata("from", outcome.from.as_str())
                    .with_metadata("to", outcome.to.as_str())
                    .with_metadata("event", format!("{:?}", outcome.event));
                if let TurnState::Failed { reason_code } = &outcome.to {
                    progress = progress.with_metadata("reason_code", reason_code.clone());
                }
                sink.emit(progress);
            }
            Err(error) => {
                sink.emit(
                    context
                        .event(
                            "turn.transition_rejected",
                            ProgressCategory::Flow,
                            ProgressOutcome::Rejected,
                        )
                        .with_metadata("error", error.to_string()),
                );
            }
        }
        result
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FlowTransitionError {
    #[error("turn already finished in state {state:?}; event {event:?} ignored")]
    AlreadyTerminal { state: TurnState, event: TurnEvent },
    #[error("invalid transition from {state:?} using event {event:?}")]
    InvalidTransition { state: TurnState, event: TurnEvent },
}

fn transition_turn(
    current: &TurnState,
    event: &TurnEvent,
) -> Result<TransitionOutcome, FlowTransitionError> {
    use TurnAction::{
        ComposeChart, EmitClarification, EmitFailure, ExecuteQuery, InterpretIntent, PersistTurn,
        SynthesizeInsight, SynthesizeSql,
    };
    use TurnEvent::{
        ChartComposed, ClarificationRequested, ContextAssembled, IntentGrounded,
        NarrativeWritten, QueryReturned, SqlAccepted, StageFailed, TurnRecorded,
    };
    use TurnState::{
        Charted, ClarificationNeeded, Completed, ContextBuilt, Executed, Failed, IntentResolved,
        Narrated, Received, SqlValidated,
    };

    if current.is_terminal() {
        return Err(FlowTransitionError::AlreadyTerminal {
            state: current.clone(),
            event: event.clone(),
        });
    }

    let (to, actions) = match (current, event) {
        (Received, ContextAssembled) => (ContextBuilt, vec![InterpretIntent]),
        (ContextBuilt, IntentGrounded) => (IntentResolved, vec![SynthesizeSql]),
        (IntentResolved, SqlAccepted) => (SqlValidated, vec![ExecuteQuery]),
        (SqlValidated, QueryReturned) => (Executed, vec![ComposeChart]),
        (Executed, ChartComposed) => (Charted, vec![SynthesizeInsight]),
        (Charted, NarrativeWritten) => (Narrated, vec![PersistTurn]),
        (Narrated, TurnRecorded) => (Completed, Vec::new()),
        (_, ClarificationRequested) => (ClarificationNeeded, vec![EmitClarification, PersistTurn]),
        (_, StageFailed { reason_code }) => {
            (Failed { reason_code: reason_code.clone() }, vec![EmitFailure, PersistTurn])
        }
        _ => {
            return Err(FlowTransitionError::InvalidTransition {
                state: current.clone(),
                event: event.clone(),
            });
        }
    };

    Ok(TransitionOutcome { from: current.clone(), to, event: event.clone(), actions })
}
