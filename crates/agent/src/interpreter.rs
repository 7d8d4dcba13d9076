//! Intent interpretation.
//!
//! An extractor drafts the business terms of a question (metrics, groupings,
//! filter literals, ranking). The grounder then maps every term onto the
//! schema catalog and resolves time phrases against a fixed "today", so the
//! resulting [`AnalyticalIntent`] never depends on model output for schema
//! names or dates.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crmsight_core::catalog::{normalize_term, question_words, singularize, SchemaCatalog};
use crmsight_core::context::PromptContext;
use crmsight_core::domain::intent::{
    Aggregation, AnalyticalIntent, ColumnRef, Dimension, Filter, FilterOp, FilterValue, Metric,
    RowLimit, SortDirection, SortOrder, TimeFilter, TimeGrain,
};
use crmsight_core::domain::schema::{DataType, SchemaEntity};
use crmsight_core::domain::turn::SessionContext;
use crmsight_core::errors::PipelineError;
use crmsight_core::timeframe::{resolve_time_phrase, TimeResolution};

use crate::llm::{parse_structured, LlmClient};
use crate::prompts::PromptLibrary;

/// Measures a bare ranking ("top 5 customers") is ordered by.
const DEFAULT_MEASURE_TERMS: &[&str] = &["revenue", "amount"];
const GROUPING_CUES: &[&str] = &["by", "per", "every", "each", "across"];
const RANK_DESC: &[&str] = &["top", "best", "largest", "biggest", "highest"];
const RANK_ASC: &[&str] = &["bottom", "worst", "smallest", "lowest"];
const FOLLOW_UP_OPENERS: &[&str] =
    &["and", "what about", "how about", "now", "same", "also", "instead", "only"];
const VALUE_PREPOSITIONS: &[&str] = &["in", "from", "for"];
const MAX_VALUE_WORDS: usize = 3;
const FILLER: &[&str] = &[
    "a", "about", "all", "also", "an", "and", "any", "are", "as", "at", "be", "breakdown", "by",
    "can", "compare", "did", "do", "does", "each", "every", "for", "from", "give", "has", "have",
    "how", "i", "in", "is", "it", "like", "list", "many", "me", "much", "now", "number", "of",
    "on", "or", "our", "over", "per", "please", "same", "show", "than", "that", "the", "their",
    "them", "then", "this", "time", "to", "top", "trend", "trends", "us", "was", "we", "were",
    "what", "when", "where", "which", "who", "why", "with", "would", "you",
];
const RESERVED_ALIASES: &[&str] = &[
    "and", "as", "by", "case", "desc", "else", "end", "from", "group", "in", "index", "is", "join",
    "limit", "not", "on", "or", "order", "select", "table", "then", "values", "when", "where",
];

/// Business terms of a question before they are tied to schema entities.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentDraft {
    #[serde(default)]
    pub metrics: Vec<MetricDraft>,
    #[serde(default)]
    pub dimensions: Vec<DimensionDraft>,
    #[serde(default)]
    pub filters: Vec<FilterDraft>,
    /// Record types the question is about without measuring them.
    #[serde(default)]
    pub subjects: Vec<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    /// Dimension term a limit applies within ("in every country").
    #[serde(default)]
    pub per_group: Option<String>,
    #[serde(default)]
    pub ascending: bool,
    /// Grain of a requested trend over time.
    #[serde(default)]
    pub trend: Option<String>,
    #[serde(default)]
    pub follow_up: bool,
    #[serde(default)]
    pub clarification: Option<String>,
    /// Content words that matched nothing; reported when grounding fails.
    #[serde(default)]
    pub unmatched: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricDraft {
    pub term: String,
    #[serde(default)]
    pub aggregation: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionDraft {
    pub term: String,
    #[serde(default)]
    pub grain: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterDraft {
    #[serde(default)]
    pub term: Option<String>,
    pub value: String,
}

#[async_trait]
pub trait IntentExtractor: Send + Sync {
    async fn extract(
        &self,
        question: &str,
        context: &PromptContext,
        previous: Option<&AnalyticalIntent>,
        today: NaiveDate,
    ) -> Result<IntentDraft, PipelineError>;
}

/// Rule-based drafting over catalog term spotting; needs no inference service.
pub struct KeywordIntentExtractor {
    catalog: Arc<SchemaCatalog>,
}

impl KeywordIntentExtractor {
    pub fn new(catalog: Arc<SchemaCatalog>) -> Self {
        Self { catalog }
    }

    pub fn draft(&self, question: &str, today: NaiveDate) -> IntentDraft {
        let words = question_words(question);
        let original = original_words(question);
        let mut covered = time_phrase_indices(question, &words, today);
        let time_words = covered.clone();
        let mut draft = IntentDraft {
            follow_up: FOLLOW_UP_OPENERS.iter().any(|opener| starts_with_words(&words, opener)),
            ..IntentDraft::default()
        };

        let rank = words.iter().enumerate().find_map(|(index, word)| {
            let ascending = RANK_ASC.contains(&word.as_str());
            if !ascending && !RANK_DESC.contains(&word.as_str()) {
                return None;
            }
            let limit = words.get(index + 1)?.parse::<u32>().ok()?;
            Some((index, limit, ascending))
        });
        if let Some((index, limit, ascending)) = rank {
            draft.limit = Some(limit);
            draft.ascending = ascending;
            covered.extend([index, index + 1]);
        }

        for (index, word) in words.iter().enumerate() {
            if let Some(grain) = trend_grain(word) {
                draft.trend = Some(grain.as_str().to_owned());
                covered.insert(index);
            } else if GROUPING_CUES.contains(&word.as_str()) {
                if let Some(grain) = words.get(index + 1).and_then(|next| grain_word(next)) {
                    draft.trend = Some(grain.as_str().to_owned());
                    covered.extend([index, index + 1]);
                }
            }
        }

        let spans = self.catalog.spot_terms(question);
        let mut mentioned_tables = BTreeSet::new();
        let mut ranked_term = None;
        for span in &spans {
            if (span.start..span.end).any(|index| time_words.contains(&index)) {
                continue;
            }
            covered.extend(span.start..span.end);
            let entities: Vec<&SchemaEntity> =
                span.entities.iter().filter_map(|id| self.catalog.entity(id)).collect();
            mentioned_tables.extend(entities.iter().map(|entity| entity.table.clone()));

            let previous = |back: usize| {
                span.start.checked_sub(back).and_then(|index| words.get(index)).map(String::as_str)
            };
            let grouped = previous(1).is_some_and(|word| GROUPING_CUES.contains(&word))
                || (previous(2) == Some("for") && previous(1) == Some("each"));
            let ranked = rank.is_some_and(|(index, _, _)| span.start == index + 2);
            let counted = (previous(2) == Some("how") && previous(1) == Some("many"))
                || (matches!(previous(2), Some("number" | "count")) && previous(1) == Some("of"))
                || previous(1) == Some("count");
            let term = span.text.clone();

            match term_kind(&entities) {
                TermKind::Table if ranked || grouped => {
                    if ranked {
                        ranked_term = Some(term.clone());
                    }
                    draft.dimensions.push(DimensionDraft { term, grain: None });
                }
                TermKind::Table if counted => draft
                    .metrics
                    .push(MetricDraft { term, aggregation: Some("count".to_owned()) }),
                TermKind::Table => draft.subjects.push(term),
                TermKind::Measure | TermKind::Flag => {
                    let aggregation = if counted {
                        Some("count".to_owned())
                    } else {
                        previous(1).and_then(Aggregation::parse).map(|agg| agg.as_str().to_owned())
                    };
                    draft.metrics.push(MetricDraft { term, aggregation });
                }
                TermKind::Temporal => draft.dimensions.push(DimensionDraft {
                    term,
                    grain: Some(draft.trend.clone().unwrap_or_else(|| "month".to_owned())),
                }),
                TermKind::Category => {
                    if ranked {
                        ranked_term = Some(term.clone());
                    }
                    draft.dimensions.push(DimensionDraft { term, grain: None });
                }
            }
        }

        if let Some(ranked) = &ranked_term {
            draft.per_group = draft
                .dimensions
                .iter()
                .find(|dimension| &dimension.term != ranked)
                .map(|dimension| dimension.term.clone());
        }

        self.draft_values(&original, &mut covered, &mentioned_tables, &mut draft);

        draft.unmatched = words
            .iter()
            .enumerate()
            .filter(|(index, word)| {
                !covered.contains(index)
                    && word.chars().count() > 2
                    && !word.chars().all(|c| c.is_ascii_digit())
                    && !FILLER.contains(&word.as_str())
            })
            .map(|(_, word)| word.clone())
            .collect();
        draft
    }

    /// Literal filter values: known column values first, then capitalized
    /// words after "in"/"from" that match nothing and need clarifying.
    fn draft_values(
        &self,
        original: &[String],
        covered: &mut BTreeSet<usize>,
        mentioned_tables: &BTreeSet<String>,
        draft: &mut IntentDraft,
    ) {
        for width in (1..=MAX_VALUE_WORDS).rev() {
            for start in 0..original.len().saturating_sub(width - 1) {
                if (start..start + width).any(|index| covered.contains(&index)) {
                    continue;
                }
                let candidate = original[start..start + width].join(" ");
                let shouted = candidate.chars().any(char::is_alphabetic)
                    && candidate == candidate.to_uppercase();
                if width == 1 && candidate.chars().count() <= 2 && !shouted {
                    continue;
                }
                let matches = self.catalog.resolve_value(&candidate);
                if matches.is_empty() {
                    continue;
                }
                let lowercase = candidate == candidate.to_lowercase();
                if lowercase
                    && !matches
                        .iter()
                        .any(|found| mentioned_tables.contains(found.column.table_name()))
                {
                    continue;
                }
                covered.extend(start..start + width);
                draft.filters.push(FilterDraft { term: None, value: candidate });
            }
        }

        let lowered: Vec<String> = original.iter().map(|word| word.to_lowercase()).collect();
        for (index, word) in lowered.iter().enumerate() {
            if !VALUE_PREPOSITIONS.contains(&word.as_str()) {
                continue;
            }
            let unknown: Vec<usize> = (index + 1..original.len())
                .take_while(|next| {
                    !covered.contains(next)
                        && original[*next].chars().next().is_some_and(char::is_uppercase)
                })
                .collect();
            if unknown.is_empty() {
                continue;
            }
            let value = unknown.iter().map(|next| original[*next].as_str()).collect::<Vec<_>>().join(" ");
            covered.extend(unknown.iter().copied());
            draft.filters.push(FilterDraft { term: None, value });
        }
    }
}

#[async_trait]
impl IntentExtractor for KeywordIntentExtractor {
    async fn extract(
        &self,
        question: &str,
        _context: &PromptContext,
        _previous: Option<&AnalyticalIntent>,
        today: NaiveDate,
    ) -> Result<IntentDraft, PipelineError> {
        Ok(self.draft(question, today))
    }
}

/// Asks the language model for the draft as structured JSON.
pub struct LlmIntentExtractor {
    client: Arc<dyn LlmClient>,
    prompts: Arc<PromptLibrary>,
}

impl LlmIntentExtractor {
    pub fn new(client: Arc<dyn LlmClient>, prompts: Arc<PromptLibrary>) -> Self {
        Self { client, prompts }
    }
}

#[async_trait]
impl IntentExtractor for LlmIntentExtractor {
    async fn extract(
        &self,
        _question: &str,
        context: &PromptContext,
        previous: Option<&AnalyticalIntent>,
        today: NaiveDate,
    ) -> Result<IntentDraft, PipelineError> {
        let prompt = self.prompts.intent(context, today, previous).map_err(|error| {
            PipelineError::InferenceUnavailable { detail: format!("intent prompt: {error}") }
        })?;
        let reply = self
            .client
            .complete(&prompt)
            .await
            .map_err(|error| PipelineError::InferenceUnavailable { detail: error.to_string() })?;
        parse_structured(&reply).map_err(|error| PipelineError::InferenceUnavailable {
            detail: format!("unusable intent reply: {error}"),
        })
    }
}

pub struct IntentInterpreter {
    catalog: Arc<SchemaCatalog>,
    extractor: Arc<dyn IntentExtractor>,
}

impl IntentInterpreter {
    pub fn new(catalog: Arc<SchemaCatalog>, extractor: Arc<dyn IntentExtractor>) -> Self {
        Self { catalog, extractor }
    }

    pub async fn interpret(
        &self,
        question: &str,
        context: &PromptContext,
        session: &SessionContext,
        today: NaiveDate,
    ) -> Result<AnalyticalIntent, PipelineError> {
        let previous = session.last_intent();
        let draft = self.extractor.extract(question, context, previous, today).await?;
        tracing::debug!(
            event_name = "intent.drafted",
            metrics = draft.metrics.len(),
            dimensions = draft.dimensions.len(),
            filters = draft.filters.len(),
            follow_up = draft.follow_up,
            "intent draft extracted"
        );
        IntentGrounder::new(&self.catalog, today).ground(question, &draft, previous)
    }
}

/// Tables already tied to the intent, used to break ties between candidates.
#[derive(Default)]
struct Scope {
    anchor: Option<String>,
    tables: BTreeSet<String>,
}

pub struct IntentGrounder<'a> {
    catalog: &'a SchemaCatalog,
    today: NaiveDate,
}

impl<'a> IntentGrounder<'a> {
    pub fn new(catalog: &'a SchemaCatalog, today: NaiveDate) -> Self {
        Self { catalog, today }
    }

    pub fn ground(
        &self,
        question: &str,
        draft: &IntentDraft,
        previous: Option<&AnalyticalIntent>,
    ) -> Result<AnalyticalIntent, PipelineError> {
        if let Some(prompt) = draft.clarification.as_deref().filter(|prompt| !prompt.trim().is_empty())
        {
            return Err(PipelineError::ClarificationNeeded {
                prompt: prompt.trim().to_owned(),
                candidates: Vec::new(),
            });
        }

        let follows = draft.follow_up || (draft.metrics.is_empty() && draft.subjects.is_empty());
        let previous = previous.filter(|_| follows);

        let mut scope = Scope::default();
        if let Some(previous) = previous {
            scope.tables.extend(previous.tables());
        }
        for subject in &draft.subjects {
            let candidates: Vec<&SchemaEntity> =
                self.catalog.lookup(subject).into_iter().filter(|entity| entity.is_table()).collect();
            if let Ok(table) = self.choose(subject, candidates, &scope) {
                scope.tables.insert(table.table.clone());
            }
        }

        let mut metrics = Vec::new();
        for metric in &draft.metrics {
            let grounded = self.ground_metric(metric, &scope)?;
            scope.tables.insert(grounded.column.table.clone());
            metrics.push(grounded);
        }

        let anchor = match metrics.first() {
            Some(metric) => metric.column.table.clone(),
            None => {
                let (anchor, inferred) = self.infer_measure(draft, &scope, previous)?;
                metrics = inferred;
                anchor
            }
        };
        scope.anchor = Some(anchor.clone());
        scope.tables.insert(anchor.clone());

        let mut dimensions: Vec<(String, Dimension)> = Vec::new();
        for dimension in &draft.dimensions {
            let grounded = self.ground_dimension(dimension, &scope)?;
            scope.tables.insert(grounded.column.table.clone());
            if !dimensions.iter().any(|(_, existing)| existing.column == grounded.column) {
                dimensions.push((dimension.term.clone(), grounded));
            }
        }
        if dimensions.is_empty() {
            if let Some(previous) = previous {
                dimensions.extend(
                    previous.dimensions.iter().map(|dimension| (dimension.alias.clone(), dimension.clone())),
                );
            }
        }
        if let Some(grain) = draft.trend.as_deref().and_then(parse_grain) {
            self.apply_trend(&anchor, grain, &mut dimensions)?;
        }

        let mut filters = previous.map(|previous| previous.filters.clone()).unwrap_or_default();
        for filter in &draft.filters {
            let grounded = self.ground_filter(filter, &scope)?;
            filters.retain(|existing| existing.column != grounded.column);
            filters.push(grounded);
        }

        let time_filter = self.ground_time(question, &anchor, previous)?;

        let limit = match (draft.limit, &draft.per_group) {
            (Some(limit), Some(term)) => {
                let position = dimensions.iter().position(|(source, dimension)| {
                    source.eq_ignore_ascii_case(term) || dimension.alias == alias_for_term(term)
                });
                match position {
                    Some(position) => {
                        let partition = dimensions.remove(position);
                        let alias = partition.1.alias.clone();
                        dimensions.insert(0, partition);
                        Some(RowLimit::PerGroup { partition: alias, limit })
                    }
                    None => Some(RowLimit::Total { limit }),
                }
            }
            (Some(limit), None) => Some(RowLimit::Total { limit }),
            (None, _) if draft.dimensions.is_empty() => {
                previous.and_then(|previous| previous.limit.clone())
            }
            (None, _) => None,
        };

        let sort = match (&limit, metrics.first()) {
            (Some(_), Some(metric)) => Some(SortOrder {
                key: metric.alias.clone(),
                direction: if draft.ascending { SortDirection::Asc } else { SortDirection::Desc },
            }),
            _ if draft.trend.is_some() => None,
            _ => previous.and_then(|previous| previous.sort.clone()),
        };

        let mut dimensions: Vec<Dimension> =
            dimensions.into_iter().map(|(_, dimension)| dimension).collect();
        dedupe_aliases(&mut dimensions, &mut metrics);

        Ok(AnalyticalIntent {
            question: question.to_owned(),
            anchor_table: anchor,
            metrics,
            dimensions,
            filters,
            time_filter,
            sort,
            limit,
        })
    }

    /// Metrics for a question that names none: the previous turn's, a
    /// revenue ranking, or a record count of the subject.
    fn infer_measure(
        &self,
        draft: &IntentDraft,
        scope: &Scope,
        previous: Option<&AnalyticalIntent>,
    ) -> Result<(String, Vec<Metric>), PipelineError> {
        if let Some(previous) = previous {
            return Ok((previous.anchor_table.clone(), previous.metrics.clone()));
        }
        if draft.limit.is_some() {
            let measure = DEFAULT_MEASURE_TERMS.iter().find_map(|term| {
                self.catalog
                    .lookup(term)
                    .into_iter()
                    .find(|entity| entity.is_column() && entity.data_type.is_numeric())
                    .map(|entity| (*term, entity))
            });
            if let Some((term, entity)) = measure {
                let metric = Metric {
                    aggregation: Aggregation::Sum,
                    column: ColumnRef::new(&entity.table, &entity.physical),
                    alias: alias_for_term(term),
                };
                return Ok((entity.table.clone(), vec![metric]));
            }
        }

        let counted = match scope.tables.iter().next() {
            Some(table) => Some(table.clone()),
            None => match draft.dimensions.first() {
                Some(dimension) => Some(self.ground_dimension(dimension, scope)?.column.table),
                None => None,
            },
        };
        let Some(table) = counted else {
            return Err(PipelineError::IntentUnresolvable { unmatched_terms: draft.unmatched.clone() });
        };
        Ok((table.clone(), vec![self.count_metric(&table)?]))
    }

    fn count_metric(&self, table: &str) -> Result<Metric, PipelineError> {
        let key = self.catalog.primary_key(table).ok_or_else(|| {
            PipelineError::IntentUnresolvable { unmatched_terms: vec![table.to_owned()] }
        })?;
        Ok(Metric {
            aggregation: Aggregation::Count,
            column: ColumnRef::new(table, &key.physical),
            alias: format!("{}_count", alias_for_term(&normalize_term(table))),
        })
    }

    fn ground_metric(&self, draft: &MetricDraft, scope: &Scope) -> Result<Metric, PipelineError> {
        let candidates: Vec<&SchemaEntity> = self
            .catalog
            .lookup(&draft.term)
            .into_iter()
            .filter(|entity| {
                entity.is_table()
                    || entity.data_type.is_numeric()
                    || entity.data_type == DataType::Boolean
            })
            .collect();
        let entity = self.choose(&draft.term, candidates, scope)?;
        if entity.is_table() {
            return self.count_metric(&entity.table);
        }

        let requested = draft.aggregation.as_deref().and_then(Aggregation::parse);
        let base = alias_for_term(&draft.term);
        let (aggregation, alias) = match (entity.data_type, requested) {
            (DataType::Boolean, None | Some(Aggregation::Avg)) => {
                (Aggregation::Avg, format!("{base}_rate"))
            }
            (DataType::Boolean, Some(_)) => (Aggregation::Sum, format!("{base}_count")),
            (_, None | Some(Aggregation::Sum)) => (Aggregation::Sum, base),
            (_, Some(Aggregation::Count)) => (Aggregation::Count, format!("{base}_count")),
            (_, Some(aggregation)) => (aggregation, format!("{}_{base}", aggregation.as_str())),
        };
        Ok(Metric { aggregation, column: ColumnRef::new(&entity.table, &entity.physical), alias })
    }

    fn ground_dimension(
        &self,
        draft: &DimensionDraft,
        scope: &Scope,
    ) -> Result<Dimension, PipelineError> {
        let candidates: Vec<&SchemaEntity> = self
            .catalog
            .lookup(&draft.term)
            .into_iter()
            .filter(|entity| entity.is_table() || entity.data_type != DataType::Identifier)
            .collect();
        let entity = self.choose(&draft.term, candidates, scope)?;
        let alias = alias_for_term(&draft.term);
        if entity.is_table() {
            let label = self.catalog.label_column(&entity.table).ok_or_else(|| {
                PipelineError::IntentUnresolvable { unmatched_terms: vec![draft.term.clone()] }
            })?;
            return Ok(Dimension {
                column: ColumnRef::new(&entity.table, &label.physical),
                alias,
                grain: None,
            });
        }
        if entity.data_type.is_temporal() {
            let grain =
                draft.grain.as_deref().and_then(parse_grain).unwrap_or(TimeGrain::Month);
            return Ok(temporal_dimension(entity, grain));
        }
        Ok(Dimension { column: ColumnRef::new(&entity.table, &entity.physical), alias, grain: None })
    }

    fn apply_trend(
        &self,
        anchor: &str,
        grain: TimeGrain,
        dimensions: &mut Vec<(String, Dimension)>,
    ) -> Result<(), PipelineError> {
        let existing = dimensions.iter_mut().find(|(_, dimension)| {
            dimension.grain.is_some()
                || self
                    .catalog
                    .column(&dimension.column.table, &dimension.column.column)
                    .is_some_and(|column| column.data_type.is_temporal())
        });
        if let Some((_, dimension)) = existing {
            if let Some(column) = self.catalog.column(&dimension.column.table, &dimension.column.column)
            {
                *dimension = temporal_dimension(column, grain);
            }
            return Ok(());
        }
        let column = self.catalog.temporal_column(anchor).ok_or_else(|| {
            PipelineError::ClarificationNeeded {
                prompt: format!("{anchor} records carry no date, so I can't show a trend over time. Which measure should I track instead?"),
                candidates: Vec::new(),
            }
        })?;
        dimensions.insert(0, (grain.as_str().to_owned(), temporal_dimension(column, grain)));
        Ok(())
    }

    fn ground_filter(&self, draft: &FilterDraft, scope: &Scope) -> Result<Filter, PipelineError> {
        let value = draft.value.trim();
        if let Some(term) = draft.term.as_deref().filter(|term| !term.trim().is_empty()) {
            let candidates: Vec<&SchemaEntity> =
                self.catalog.lookup(term).into_iter().filter(|entity| entity.is_column()).collect();
            let column = self.choose(term, candidates, scope)?;
            if column.possible_values.is_empty() {
                return Ok(Filter {
                    column: ColumnRef::new(&column.table, &column.physical),
                    op: FilterOp::Eq,
                    value: FilterValue::Text(value.to_owned()),
                });
            }
            let matched = self
                .catalog
                .resolve_value(value)
                .into_iter()
                .find(|found| found.column == column.id)
                .ok_or_else(|| unknown_value(value, Some(column)))?;
            return Ok(value_filter(column, matched.spellings, matched.value));
        }

        let matches = self.catalog.resolve_value(value);
        if matches.is_empty() {
            return Err(unknown_value(value, self.geography_column(scope)));
        }
        let candidates: Vec<&SchemaEntity> =
            matches.iter().filter_map(|found| self.catalog.entity(&found.column)).collect();
        let column = self.choose(value, candidates, scope)?;
        let matched = matches
            .into_iter()
            .find(|found| found.column == column.id)
            .ok_or_else(|| unknown_value(value, Some(column)))?;
        Ok(value_filter(column, matched.spellings, matched.value))
    }

    /// Country-like column on the anchor (or a table in play) for suggestions.
    fn geography_column(&self, scope: &Scope) -> Option<&'a SchemaEntity> {
        let tables = scope.anchor.iter().chain(scope.tables.iter());
        for table in tables {
            let found = self.catalog.columns_of(table).into_iter().find(|column| {
                !column.possible_values.is_empty()
                    && column.physical.to_ascii_lowercase().contains("country")
            });
            if found.is_some() {
                return found;
            }
        }
        None
    }

    fn ground_time(
        &self,
        question: &str,
        anchor: &str,
        previous: Option<&AnalyticalIntent>,
    ) -> Result<Option<TimeFilter>, PipelineError> {
        let previous_range = previous.and_then(AnalyticalIntent::time_range);
        let resolution = resolve_time_phrase(question, self.today, previous_range);
        let (phrase, range) = match resolution {
            TimeResolution::Resolved { phrase, range } => (phrase, range),
            TimeResolution::Unanchored { phrase } => {
                return Err(PipelineError::ClarificationNeeded {
                    prompt: format!(
                        "Which period do you mean by \"{phrase}\"? Try something like \"last quarter\" or \"in 2024\"."
                    ),
                    candidates: Vec::new(),
                })
            }
            TimeResolution::Absent => match previous.and_then(|previous| previous.time_filter.clone()) {
                Some(inherited) => (inherited.phrase, inherited.range),
                None => return Ok(None),
            },
        };
        let column = self.catalog.temporal_column(anchor).ok_or_else(|| {
            PipelineError::ClarificationNeeded {
                prompt: format!("{anchor} records carry no date to filter on \"{phrase}\". Should I drop the time range?"),
                candidates: Vec::new(),
            }
        })?;
        Ok(Some(TimeFilter { column: ColumnRef::new(&column.table, &column.physical), range, phrase }))
    }

    /// Picks the candidate closest to the intent: the anchor table, then
    /// tables already in play, then the table the anchor reaches in the fewest joins.
    fn choose<'e>(
        &self,
        term: &str,
        candidates: Vec<&'e SchemaEntity>,
        scope: &Scope,
    ) -> Result<&'e SchemaEntity, PipelineError> {
        if candidates.is_empty() {
            return Err(PipelineError::IntentUnresolvable { unmatched_terms: vec![term.to_owned()] });
        }
        let ranked: Vec<(usize, &SchemaEntity)> = candidates
            .iter()
            .filter_map(|entity| self.rank(&entity.table, scope).map(|rank| (rank, *entity)))
            .collect();
        let Some(best) = ranked.iter().map(|(rank, _)| *rank).min() else {
            let anchor = scope.anchor.as_deref().unwrap_or("the question");
            return Err(PipelineError::ClarificationNeeded {
                prompt: format!(
                    "\"{term}\" refers to {}, which I can't relate to {anchor}. Could you rephrase?",
                    describe_entities(&candidates)
                ),
                candidates: candidates.iter().map(|entity| entity.qualified()).collect(),
            });
        };
        let top: Vec<&SchemaEntity> =
            ranked.into_iter().filter(|(rank, _)| *rank == best).map(|(_, entity)| entity).collect();
        match top.as_slice() {
            [only] => Ok(*only),
            _ => Err(PipelineError::ClarificationNeeded {
                prompt: format!(
                    "\"{term}\" could mean {}. Which one did you mean?",
                    describe_entities(&top)
                ),
                candidates: top.iter().map(|entity| entity.qualified()).collect(),
            }),
        }
    }

    /// 0 for the anchor, 1 for tables in play, otherwise one more than the
    /// number of joins from the anchor. `None` when no join reaches it.
    fn rank(&self, table: &str, scope: &Scope) -> Option<usize> {
        match scope.anchor.as_deref() {
            Some(anchor) if anchor.eq_ignore_ascii_case(table) => Some(0),
            _ if scope.tables.iter().any(|known| known.eq_ignore_ascii_case(table)) => Some(1),
            None => Some(2),
            Some(anchor) => self.catalog.join_path(anchor, table).ok().map(|path| 1 + path.len()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TermKind {
    Table,
    Measure,
    Flag,
    Temporal,
    Category,
}

fn term_kind(entities: &[&SchemaEntity]) -> TermKind {
    if entities.iter().any(|entity| entity.is_table()) {
        return TermKind::Table;
    }
    match entities.first().map(|entity| entity.data_type) {
        Some(data_type) if data_type.is_numeric() => TermKind::Measure,
        Some(DataType::Boolean) => TermKind::Flag,
        Some(data_type) if data_type.is_temporal() => TermKind::Temporal,
        _ => TermKind::Category,
    }
}

fn temporal_dimension(column: &SchemaEntity, grain: TimeGrain) -> Dimension {
    let stem = column.physical.strip_suffix("Date").filter(|stem| !stem.is_empty());
    let base = alias_for_term(&normalize_term(stem.unwrap_or(&column.physical)));
    Dimension {
        column: ColumnRef::new(&column.table, &column.physical),
        alias: format!("{base}_{}", grain.as_str()),
        grain: Some(grain),
    }
}

fn value_filter(column: &SchemaEntity, spellings: Vec<String>, value: String) -> Filter {
    let column_ref = ColumnRef::new(&column.table, &column.physical);
    if spellings.len() > 1 {
        Filter { column: column_ref, op: FilterOp::In, value: FilterValue::List(spellings) }
    } else {
        Filter { column: column_ref, op: FilterOp::Eq, value: FilterValue::Text(value) }
    }
}

fn unknown_value(value: &str, column: Option<&SchemaEntity>) -> PipelineError {
    match column {
        Some(column) => {
            let known: Vec<String> =
                column.possible_values.iter().map(|possible| possible.value.clone()).collect();
            PipelineError::ClarificationNeeded {
                prompt: format!(
                    "I couldn't find \"{value}\" among the known values of {}: {}. Which one did you mean?",
                    column.name,
                    known.join(", ")
                ),
                candidates: known,
            }
        }
        None => PipelineError::ClarificationNeeded {
            prompt: format!("I couldn't find \"{value}\" anywhere in the CRM data. Could you name it differently?"),
            candidates: Vec::new(),
        },
    }
}

fn describe_entities(entities: &[&SchemaEntity]) -> String {
    entities
        .iter()
        .map(|entity| {
            if entity.is_table() {
                entity.name.clone()
            } else {
                format!("{} {}", entity.table, entity.name)
            }
        })
        .collect::<Vec<_>>()
        .join(" or ")
}

/// Snake-case output alias for a business term, singular last word.
pub fn alias_for_term(term: &str) -> String {
    let mut parts: Vec<String> =
        normalize_term(term).split_whitespace().map(str::to_owned).collect();
    if let Some(last) = parts.last_mut() {
        *last = singularize(last);
    }
    let mut alias = parts.join("_");
    if alias.is_empty() {
        alias = "value".to_owned();
    }
    if alias.starts_with(|c: char| c.is_ascii_digit()) {
        alias = format!("n_{alias}");
    }
    if RESERVED_ALIASES.contains(&alias.as_str()) {
        alias.push_str("_value");
    }
    alias
}

fn dedupe_aliases(dimensions: &mut [Dimension], metrics: &mut [Metric]) {
    let mut seen = BTreeSet::new();
    let aliases = dimensions
        .iter_mut()
        .map(|dimension| &mut dimension.alias)
        .chain(metrics.iter_mut().map(|metric| &mut metric.alias));
    for alias in aliases {
        let base = alias.clone();
        let mut suffix = 2;
        while !seen.insert(alias.clone()) {
            *alias = format!("{base}_{suffix}");
            suffix += 1;
        }
    }
}

fn parse_grain(value: &str) -> Option<TimeGrain> {
    match value.trim().to_ascii_lowercase().as_str() {
        "day" | "daily" => Some(TimeGrain::Day),
        "week" | "weekly" => Some(TimeGrain::Week),
        "month" | "monthly" => Some(TimeGrain::Month),
        "quarter" | "quarterly" => Some(TimeGrain::Quarter),
        "year" | "yearly" => Some(TimeGrain::Year),
        _ => None,
    }
}

fn grain_word(word: &str) -> Option<TimeGrain> {
    matches!(word, "day" | "week" | "month" | "quarter" | "year").then(|| parse_grain(word)).flatten()
}

fn trend_grain(word: &str) -> Option<TimeGrain> {
    match word {
        "trend" | "trends" | "trending" | "monthly" => Some(TimeGrain::Month),
        "daily" => Some(TimeGrain::Day),
        "weekly" => Some(TimeGrain::Week),
        "quarterly" => Some(TimeGrain::Quarter),
        "yearly" => Some(TimeGrain::Year),
        _ => None,
    }
}

/// Question words with their original casing, aligned with [`question_words`].
fn original_words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .map(|word| word.trim_matches('\'').to_owned())
        .filter(|word| !word.is_empty())
        .collect()
}

fn starts_with_words(words: &[String], phrase: &str) -> bool {
    let expected: Vec<&str> = phrase.split_whitespace().collect();
    words.len() >= expected.len() && words.iter().zip(&expected).all(|(word, want)| word == want)
}

/// Word positions covered by the question's time phrase.
fn time_phrase_indices(question: &str, words: &[String], today: NaiveDate) -> BTreeSet<usize> {
    let resolution = resolve_time_phrase(question, today, None);
    let Some(phrase) = resolution.phrase() else {
        return BTreeSet::new();
    };
    let phrase_words = question_words(phrase);
    if phrase_words.is_empty() || phrase_words.len() > words.len() {
        return BTreeSet::new();
    }
    (0..=words.len() - phrase_words.len())
        .find(|start| words[*start..*start + phrase_words.len()] == phrase_words[..])
        .map(|start| (start..start + phrase_words.len()).collect())
        .unwrap_or_default()
}
