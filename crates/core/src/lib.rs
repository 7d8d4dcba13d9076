pub mod catalog;
pub mod chart;
pub mod config;
pub mod context;
pub mod domain;
pub mod errors;
pub mod events;
pub mod flows;
pub mod insight;
pub mod sql;
pub mod store;
pub mod timeframe;
pub mod warehouse;

#[cfg(test)]
mod test_support;

pub use catalog::{CatalogError, SchemaCatalog, ValueMatch, DEFAULT_FUZZY_THRESHOLD};
pub use chart::ChartComposer;
pub use context::{ContextBudget, ContextBuilder, PromptContext};
pub use domain::chart::{ChartKind, ChartOutcome, ChartSpec};
pub use domain::intent::{AnalyticalIntent, RowLimit, TimeRange};
pub use domain::result::{ResultSet, ResultSummary, Scalar};
pub use domain::schema::{RelationshipEdge, SchemaEntity};
pub use domain::sql::{SqlCandidate, ValidationStatus};
pub use domain::turn::{SessionContext, SessionId, TurnId, TurnRecord, TurnStatus};
pub use errors::{ApplicationError, DomainError, ExecutionErrorKind, InterfaceError, PipelineError};
pub use events::{EventContext, ProgressEvent, ProgressSink};
pub use flows::{TurnFlowEngine, TurnState};
pub use insight::{Insight, InsightSynthesizer};
pub use sql::{SqlRenderer, SqlValidator, ValidationFailure};
pub use store::{ArtifactStore, SessionStore, StoreError};
pub use timeframe::{resolve_time_phrase, TimeResolution};
pub use warehouse::{QueryJobId, QueryRequest, Warehouse, WarehouseError, WarehouseRows};
