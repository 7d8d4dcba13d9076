//! Conversational NL2SQL agent over the CRM warehouse.
//!
//! A turn runs as a constrained pipeline:
//! 1. **Interpretation** (`interpreter`) - question → grounded `AnalyticalIntent`
//! 2. **Synthesis** (`synthesizer`) - intent → validated SQL, one repair at most
//! 3. **Execution** (`executor`) - guardrailed, time-bounded warehouse query
//! 4. **Narration** (`narrator`) - computed insight → answer text
//!
//! `runtime::AgentRuntime` drives the stages through the turn state machine
//! and records every turn, whatever state it ends in.
//!
//! The language model only translates. Schema names, dates, SQL safety and
//! every figure in the answer are decided deterministically.

pub mod executor;
pub mod guardrails;
pub mod interpreter;
pub mod llm;
pub mod narrator;
pub mod prompts;
pub mod runtime;
pub mod synthesizer;

#[cfg(test)]
mod test_support;

pub use executor::QueryExecutor;
pub use guardrails::{ExecutionGuardrails, GuardrailDecision};
pub use interpreter::{IntentDraft, IntentExtractor, IntentInterpreter, KeywordIntentExtractor};
pub use llm::{client_from_config, LlmClient, ScriptedLlmClient};
pub use runtime::{
    AgentDeps, AgentRuntime, AgentSettings, ChannelProgressSink, TurnOutcome, TurnRequest,
};
pub use synthesizer::{SqlGenerator, SqlSynthesizer, SynthesisError};
