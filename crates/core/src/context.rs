//! Budgeted per-turn context: relevant schema slice plus compressed history.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::catalog::SchemaCatalog;
use crate::domain::schema::SchemaEntity;
use crate::domain::turn::{truncate_chars, SessionContext, TurnRecord};

const SUMMARIZED_TURN_CHARS: usize = 160;
const MAX_LISTED_VALUES: usize = 12;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextBudget {
    pub max_chars: usize,
    pub recent_turns: usize,
    pub max_tables: usize,
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self { max_chars: 24_000, recent_turns: 3, max_tables: 12 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relevance {
    Direct,
    Neighbor,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDigest {
    pub name: String,
    pub label: String,
    pub data_type: String,
    pub description: String,
    pub values: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSlice {
    pub table: String,
    pub label: String,
    pub relevance: Relevance,
    pub notes: Option<String>,
    pub columns: Vec<ColumnDigest>,
    pub relations: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnDigest {
    pub sequence: u32,
    pub text: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedCounts {
    pub summarized_turns: usize,
    pub schema_tables: usize,
    pub recent_turns: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptContext {
    pub question: String,
    pub matched_terms: Vec<String>,
    /// Ordered most relevant first.
    pub schema: Vec<SchemaSlice>,
    pub summarized_turns: Vec<TurnDigest>,
    pub recent_turns: Vec<TurnDigest>,
    pub dropped: DroppedCounts,
}

impl PromptContext {
    pub fn table_names(&self) -> Vec<&str> {
        self.schema.iter().map(|slice| slice.table.as_str()).collect()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.schema.is_empty() {
            out.push_str("## Schema\n");
            for slice in &self.schema {
                let _ = writeln!(out, "### {} ({})", slice.table, slice.label);
                if let Some(notes) = &slice.notes {
                    let _ = writeln!(out, "Notes: {notes}");
                }
                for column in &slice.columns {
                    let _ = write!(out, "- {} [{}] {}", column.name, column.data_type, column.label);
                    if !column.description.is_empty() {
                        let _ = write!(out, ": {}", column.description);
                    }
                    if !column.values.is_empty() {
                        let _ = write!(out, " (values: {})", column.values.join(", "));
                    }
                    out.push('\n');
                }
                for relation in &slice.relations {
                    let _ = writeln!(out, "- join {relation}");
                }
            }
        }
        if !self.summarized_turns.is_empty() {
            out.push_str("## Earlier turns\n");
            for turn in &self.summarized_turns {
                let _ = writeln!(out, "{}", turn.text);
            }
        }
        if !self.recent_turns.is_empty() {
            out.push_str("## Recent turns\n");
            for turn in &self.recent_turns {
                let _ = writeln!(out, "{}", turn.text);
            }
        }
        let _ = writeln!(out, "## Question\n{}", self.question);
        out
    }

    pub fn rendered_len(&self) -> usize {
        self.render().chars().count()
    }
}

pub struct ContextBuilder<'a> {
    catalog: &'a SchemaCatalog,
    budget: ContextBudget,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(catalog: &'a SchemaCatalog, budget: ContextBudget) -> Self {
        Self { catalog, budget }
    }

    pub fn build(&self, question: &str, session: &SessionContext) -> PromptContext {
        let spans = self.catalog.spot_terms(question);
        let matched_terms = spans.iter().map(|span| span.text.clone()).collect();

        let mut direct_hits: BTreeMap<String, usize> = BTreeMap::new();
        for span in &spans {
            for id in &span.entities {
                if let Some(table) = self.catalog.table(id.table_name()) {
                    *direct_hits.entry(table.physical.clone()).or_default() += 1;
                }
            }
        }
        if let Some(intent) = session.last_intent() {
            for table in intent.tables() {
                direct_hits.entry(table).or_default();
            }
        }

        let mut ranked: Vec<(Relevance, usize, String)> = direct_hits
            .iter()
            .map(|(table, hits)| (Relevance::Direct, *hits, table.clone()))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.2.cmp(&b.2)));

        let direct: BTreeSet<&String> = direct_hits.keys().collect();
        let neighbors: BTreeSet<String> = direct
            .iter()
            .flat_map(|table| self.catalog.neighbors(table))
            .filter(|table| !direct.iter().any(|direct| direct.eq_ignore_ascii_case(table)))
            .collect();
        ranked.extend(neighbors.into_iter().map(|table| (Relevance::Neighbor, 0, table)));
        ranked.truncate(self.budget.max_tables);

        let schema = ranked
            .into_iter()
            .filter_map(|(relevance, _, table)| self.slice(&table, relevance))
            .collect();

        let (older, recent) = session.split_recent(self.budget.recent_turns);
        let mut context = PromptContext {
            question: question.to_owned(),
            matched_terms,
            schema,
            summarized_turns: older.iter().map(summarized_digest).collect(),
            recent_turns: recent.iter().map(verbatim_digest).collect(),
            dropped: DroppedCounts::default(),
        };
        self.enforce_budget(&mut context);
        context
    }

    /// Drops oldest summaries, then least relevant tables, then oldest recent turns.
    fn enforce_budget(&self, context: &mut PromptContext) {
        while context.rendered_len() > self.budget.max_chars {
            if !context.summarized_turns.is_empty() {
                context.summarized_turns.remove(0);
                context.dropped.summarized_turns += 1;
            } else if !context.schema.is_empty() {
                context.schema.pop();
                context.dropped.schema_tables += 1;
            } else if !context.recent_turns.is_empty() {
                context.recent_turns.remove(0);
                context.dropped.recent_turns += 1;
            } else {
                break;
            }
        }
        if context.dropped != DroppedCounts::default() {
            tracing::debug!(
                event_name = "context.budget_enforced",
                dropped_summaries = context.dropped.summarized_turns,
                dropped_tables = context.dropped.schema_tables,
                dropped_recent = context.dropped.recent_turns,
                "context trimmed to budget"
            );
        }
    }

    fn slice(&self, table: &str, relevance: Relevance) -> Option<SchemaSlice> {
        let entity = self.catalog.table(table)?;
        let columns = self
            .catalog
            .columns_of(&entity.physical)
            .into_iter()
            .filter(|column| relevance == Relevance::Direct || is_key_column(column))
            .map(column_digest)
            .collect();
        Some(SchemaSlice {
            table: entity.physical.clone(),
            label: entity.name.clone(),
            relevance,
            notes: self.catalog.notes(&entity.physical).map(str::to_owned),
            columns,
            relations: entity.relations.iter().map(|edge| edge.describe()).collect(),
        })
    }
}

fn is_key_column(column: &SchemaEntity) -> bool {
    column.physical.eq_ignore_ascii_case("Id")
        || column.physical.eq_ignore_ascii_case("Name")
        || !column.relations.is_empty()
}

fn column_digest(column: &SchemaEntity) -> ColumnDigest {
    ColumnDigest {
        name: column.physical.clone(),
        label: column.name.clone(),
        data_type: column.data_type.as_str().to_owned(),
        description: column.description.clone(),
        values: column
            .possible_values
            .iter()
            .take(MAX_LISTED_VALUES)
            .map(|value| value.value.clone())
            .collect(),
    }
}

fn summarized_digest(turn: &TurnRecord) -> TurnDigest {
    TurnDigest { sequence: turn.sequence, text: truncate_chars(&turn.digest(), SUMMARIZED_TURN_CHARS) }
}

fn verbatim_digest(turn: &TurnRecord) -> TurnDigest {
    let mut text = format!("#{} Q: {}", turn.sequence, turn.question);
    if let Some(intent) = &turn.intent {
        let _ = write!(text, "\n   intent: {}", intent.describe());
    }
    if let Some(sql) = &turn.sql {
        let _ = write!(text, "\n   sql: {}", sql.sql.split_whitespace().collect::<Vec<_>>().join(" "));
    }
    let _ = write!(text, "\n   A: {}", turn.user_message);
    TurnDigest { sequence: turn.sequence, text }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{ContextBudget, ContextBuilder, Relevance};
    use crate::catalog::SchemaCatalog;
    use crate::domain::turn::{SessionContext, SessionId, TurnId, TurnRecord, TurnStatus};

    const METADATA: &str = r#"{
        "Account": {
            "salesforce_label": "Account",
            "synonyms": ["customer"],
            "columns": {
                "Id": { "field_type": "id" },
                "Name": { "field_type": "string" },
                "Industry": { "field_type": "picklist" },
                "OwnerId": { "field_type": "reference", "reference": { "refers_to": ["SalesRep"] } }
            }
        },
        "Opportunity": {
            "salesforce_label": "Opportunity",
            "columns": {
                "Id": { "field_type": "id" },
                "AccountId": { "field_type": "reference", "reference": { "refers_to": ["Account"] } },
                "Amount": { "field_type": "currency", "synonyms": ["revenue"] },
                "Description": { "field_type": "textarea" }
            }
        },
        "SalesRep": {
            "salesforce_label": "User",
            "columns": { "Id": { "field_type": "id" }, "Name": { "field_type": "string" } }
        },
        "Campaign": {
            "columns": { "Id": { "field_type": "id" } }
        }
    }"#;

    fn catalog() -> SchemaCatalog {
        SchemaCatalog::from_json(METADATA, 0.9).expect("catalog")
    }

    fn session_with_turns(count: u32) -> SessionContext {
        let mut session = SessionContext::new(SessionId("S-1".to_owned()));
        for sequence in 1..=count {
            session.append(TurnRecord {
                turn_id: TurnId::generate(),
                session_id: session.session_id.clone(),
                sequence,
                question: format!("question number {sequence} about revenue {}", "x".repeat(200)),
                intent: None,
                sql: None,
                result: None,
                chart: None,
                narrative: None,
                status: TurnStatus::Completed,
                reason_code: None,
                user_message: "answer".to_owned(),
                artifacts: Vec::new(),
                created_at: Utc::now(),
            });
        }
        session
    }

    #[test]
    fn direct_tables_rank_before_neighbors_and_unrelated_tables_are_excluded() {
        let catalog = catalog();
        let builder = ContextBuilder::new(&catalog, ContextBudget::default());
        let context = builder.build("revenue by customer", &SessionContext::new(SessionId("S".into())));

        let tables = context.table_names();
        assert!(tables.contains(&"Opportunity"));
        assert!(tables.contains(&"Account"));
        assert!(tables.contains(&"SalesRep"));
        assert!(!tables.contains(&"Campaign"));
        let neighbor = context.schema.iter().find(|slice| slice.table == "SalesRep").expect("rep");
        assert_eq!(neighbor.relevance, Relevance::Neighbor);
        assert_eq!(context.schema.last().map(|slice| slice.relevance), Some(Relevance::Neighbor));
    }

    #[test]
    fn neighbor_tables_only_list_key_columns() {
        let catalog = catalog();
        let builder = ContextBuilder::new(&catalog, ContextBudget::default());
        let context = builder.build("revenue", &SessionContext::new(SessionId("S".into())));

        let account = context.schema.iter().find(|slice| slice.table == "Account").expect("account");
        assert_eq!(account.relevance, Relevance::Neighbor);
        assert!(account.columns.iter().all(|column| column.name != "Industry"));
        let opportunity =
            context.schema.iter().find(|slice| slice.table == "Opportunity").expect("opportunity");
        assert!(opportunity.columns.iter().any(|column| column.name == "Description"));
    }

    #[test]
    fn older_turns_are_summarized_and_recent_kept_verbatim() {
        let catalog = catalog();
        let budget = ContextBudget { max_chars: 100_000, recent_turns: 2, max_tables: 12 };
        let context = ContextBuilder::new(&catalog, budget).build("revenue", &session_with_turns(5));

        assert_eq!(context.summarized_turns.len(), 3);
        assert_eq!(context.recent_turns.len(), 2);
        assert!(context.recent_turns[1].text.starts_with("#5 Q:"));
        assert!(context.summarized_turns[0].text.chars().count() <= 160);
    }

    #[test]
    fn budget_drops_summaries_then_schema_and_keeps_the_question() {
        let catalog = catalog();
        let session = session_with_turns(6);
        let roomy = ContextBuilder::new(
            &catalog,
            ContextBudget { max_chars: 100_000, recent_turns: 1, max_tables: 12 },
        )
        .build("revenue by customer", &session);
        let full_len = roomy.rendered_len();

        let tight = ContextBuilder::new(
            &catalog,
            ContextBudget { max_chars: full_len - 100, recent_turns: 1, max_tables: 12 },
        )
        .build("revenue by customer", &session);
        assert!(tight.dropped.summarized_turns >= 1);
        assert_eq!(tight.dropped.schema_tables, 0);
        assert_eq!(tight.schema.len(), roomy.schema.len());

        let starved = ContextBuilder::new(
            &catalog,
            ContextBudget { max_chars: 10, recent_turns: 1, max_tables: 12 },
        )
        .build("revenue by customer", &session);
        assert!(starved.schema.is_empty());
        assert!(starved.summarized_turns.is_empty());
        assert!(starved.recent_turns.is_empty());
        assert!(starved.render().contains("revenue by customer"));
    }

    #[test]
    fn max_tables_caps_the_schema_slice() {
        let catalog = catalog();
        let budget = ContextBudget { max_chars: 100_000, recent_turns: 3, max_tables: 1 };
        let context = ContextBuilder::new(&catalog, budget)
            .build("revenue by customer", &SessionContext::new(SessionId("S".into())));
        assert_eq!(context.schema.len(), 1);
        assert_eq!(context.schema[0].relevance, Relevance::Direct);
    }
}
