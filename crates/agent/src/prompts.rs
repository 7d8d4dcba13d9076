//! Prompt templates for the model-backed stages.

use chrono::NaiveDate;
use tera::{Context, Tera};

use crmsight_core::context::PromptContext;
use crmsight_core::domain::intent::AnalyticalIntent;
use crmsight_core::insight::Insight;

const INTENT_TEMPLATE: &str = r#"You are a CRM business analyst. Break the question below into the business terms it uses.
Today is {{ today }}.

{{ context }}
{% if previous %}
The previous answered question was interpreted as: {{ previous }}
{% endif %}
Return ONLY a JSON object with this shape:
{
  "metrics": [{ "term": "<business term being measured>", "aggregation": "sum|count|count_distinct|avg|min|max" }],
  "dimensions": [{ "term": "<business term to group by>", "grain": "day|week|month|quarter|year (dates only, optional)" }],
  "filters": [{ "term": "<column term, optional>", "value": "<literal value as written>" }],
  "subjects": ["<records being counted or ranked, e.g. leads>"],
  "limit": <number or null>,
  "per_group": "<dimension term the limit applies within, or null>",
  "ascending": false,
  "trend": "<grain if the question asks for a trend over time, else null>",
  "follow_up": <true when the question only refines the previous one>,
  "clarification": "<question to ask back when the request is ambiguous, else null>"
}
Use only terms that appear in the schema above. Do not resolve dates; they are handled separately.
"#;

const SQL_TEMPLATE: &str = r#"You are a senior data engineer writing SQLite SQL over a CRM data warehouse.

{{ context }}

Analytical plan: {{ plan }}
Output columns, in order: {{ projection }}
{% if time_range %}Restrict {{ time_column }} to dates >= '{{ time_start }}' and < '{{ time_end }}'.
{% endif %}
Rules:
- A single read-only SELECT statement; no DDL or DML.
- Use only the tables, columns and joins listed in the schema.
- Qualify every column with a table alias and alias every output column.
- For a top-N within each group use ROW_NUMBER() OVER (PARTITION BY ...).

Return ONLY a JSON object: { "sql_code": "<the query>" }
"#;

const REPAIR_TEMPLATE: &str = r#"The SQLite query below failed validation against the CRM warehouse schema.

{{ context }}

```sql
{{ sql }}
```

Fix these problems without dropping entities the question needs:
{{ violations }}

Return ONLY a JSON object: { "sql_code": "<the corrected query>" }
"#;

const NARRATIVE_TEMPLATE: &str = r#"Rewrite the findings below as a short answer for a business user.
State only the facts listed; do not add numbers or claims.

Question: {{ question }}
Result: {{ headline }}
Answer: {{ answer }}
{% for observation in observations %}- {{ observation }}
{% endfor %}{% if recommendation %}Suggested next step: {{ recommendation }}
{% endif %}
Reply with plain text only.
"#;

pub struct PromptLibrary {
    tera: Tera,
}

impl PromptLibrary {
    pub fn new() -> Result<Self, tera::Error> {
        let mut tera = Tera::default();
        tera.add_raw_templates(vec![
            ("intent.txt", INTENT_TEMPLATE),
            ("sql.txt", SQL_TEMPLATE),
            ("repair.txt", REPAIR_TEMPLATE),
            ("narrative.txt", NARRATIVE_TEMPLATE),
        ])?;
        Ok(Self { tera })
    }

    pub fn intent(
        &self,
        context: &PromptContext,
        today: NaiveDate,
        previous: Option<&AnalyticalIntent>,
    ) -> Result<String, tera::Error> {
        let mut values = Context::new();
        values.insert("today", &today.format("%Y-%m-%d").to_string());
        values.insert("context", &context.render());
        values.insert("previous", &previous.map(AnalyticalIntent::describe));
        self.tera.render("intent.txt", &values)
    }

    pub fn sql(
        &self,
        context: &PromptContext,
        intent: &AnalyticalIntent,
    ) -> Result<String, tera::Error> {
        let mut values = Context::new();
        values.insert("context", &context.render());
        values.insert("plan", &intent.describe());
        values.insert("projection", &intent.projection().join(", "));
        match &intent.time_filter {
            Some(filter) => {
                values.insert("time_range", &true);
                values.insert("time_column", &filter.column.to_string());
                values.insert("time_start", &filter.range.start.format("%Y-%m-%d").to_string());
                values.insert("time_end", &filter.range.end.format("%Y-%m-%d").to_string());
            }
            None => values.insert("time_range", &false),
        }
        self.tera.render("sql.txt", &values)
    }

    pub fn repair(
        &self,
        context: &PromptContext,
        sql: &str,
        violations: &str,
    ) -> Result<String, tera::Error> {
        let mut values = Context::new();
        values.insert("context", &context.render());
        values.insert("sql", sql.trim());
        values.insert("violations", violations);
        self.tera.render("repair.txt", &values)
    }

    pub fn narrative(
        &self,
        question: &str,
        headline: &str,
        insight: &Insight,
    ) -> Result<String, tera::Error> {
        let mut values = Context::new();
        values.insert("question", question);
        values.insert("headline", headline);
        values.insert("answer", &insight.answer);
        let observations: Vec<&str> =
            insight.observations.iter().map(|observation| observation.text.as_str()).collect();
        values.insert("observations", &observations);
        values.insert("recommendation", &insight.recommendation);
        self.tera.render("narrative.txt", &values)
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use crmsight_core::context::{ContextBudget, ContextBuilder};
    use crmsight_core::domain::turn::{SessionContext, SessionId};
    use crmsight_core::insight::{Insight, Observation, ObservationKind};

    use super::PromptLibrary;
    use crate::test_support::{catalog, revenue_by_country};

    #[test]
    fn intent_prompt_carries_schema_date_and_question() {
        let catalog = catalog();
        let session = SessionContext::new(SessionId("S-prompt".to_owned()));
        let context = ContextBuilder::new(&catalog, ContextBudget::default())
            .build("revenue by country", &session);
        let today = NaiveDate::from_ymd_opt(2025, 6, 15).expect("date");

        let prompt = PromptLibrary::new().expect("templates").intent(&context, today, None).expect("render");
        assert!(prompt.contains("Today is 2025-06-15"));
        assert!(prompt.contains("revenue by country"));
        assert!(prompt.contains("Opportunity"));
        assert!(!prompt.contains("previous answered question"));
    }

    #[test]
    fn sql_prompt_states_the_absolute_window() {
        let catalog = catalog();
        let session = SessionContext::new(SessionId("S-prompt".to_owned()));
        let intent = revenue_by_country();
        let context =
            ContextBuilder::new(&catalog, ContextBudget::default()).build(&intent.question, &session);

        let prompt = PromptLibrary::new().expect("templates").sql(&context, &intent).expect("render");
        assert!(prompt.contains(">= '2024-01-01' and < '2025-01-01'"));
        assert!(prompt.contains("country, revenue"));
        assert!(prompt.contains("sql_code"));
    }

    #[test]
    fn narrative_prompt_lists_only_computed_facts() {
        let insight = Insight {
            answer: "Germany leads with 1,200.".to_owned(),
            observations: vec![Observation {
                kind: ObservationKind::Concentration,
                text: "Germany holds 60% of the total.".to_owned(),
            }],
            recommendation: None,
        };
        let prompt = PromptLibrary::new()
            .expect("templates")
            .narrative("revenue by country", "2 ROWS", &insight)
            .expect("render");
        assert!(prompt.contains("- Germany holds 60% of the total."));
        assert!(!prompt.contains("Suggested next step"));
    }
}
