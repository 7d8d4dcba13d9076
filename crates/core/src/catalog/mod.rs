pub mod geography;
pub mod graph;
pub mod metadata;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use strsim::jaro_winkler;
use thiserror::Error;

use crate::domain::schema::{
    DataType, EntityId, EntityKind, PossibleValue, RelationshipEdge, RelationshipKind,
    SchemaEntity,
};

pub use graph::{JoinPathError, RelationshipGraph, MAX_JOIN_HOPS};
pub use metadata::MetadataDocument;

pub const DEFAULT_FUZZY_THRESHOLD: f64 = 0.90;
const MAX_SPAN_WORDS: usize = 4;
const MIN_FUZZY_WORD_LEN: usize = 5;

/// Words never spotted as schema terms on their own.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "by", "did", "do", "does", "each", "every", "for", "from",
    "give", "has", "have", "how", "i", "in", "is", "it", "list", "many", "me", "much", "of", "on",
    "or", "our", "over", "per", "show", "than", "that", "the", "their", "them", "then", "this",
    "to", "top", "us", "was", "we", "were", "what", "when", "where", "which", "who", "with",
];

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read metadata file {path}: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("failed to parse metadata document: {source}")]
    Parse { source: serde_json::Error },
    #[error("metadata document lists no tables")]
    Empty,
}

/// A run of question words that names catalog entities.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TermSpan {
    pub start: usize,
    pub end: usize,
    pub text: String,
    pub entities: Vec<EntityId>,
}

/// A column whose known values contain a question term.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValueMatch {
    pub column: EntityId,
    pub value: String,
    /// Every spelling the filter should accept, canonical value included.
    pub spellings: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct SchemaCatalog {
    entities: BTreeMap<EntityId, SchemaEntity>,
    tables: BTreeMap<String, EntityId>,
    columns: BTreeMap<String, BTreeMap<String, EntityId>>,
    terms: BTreeMap<String, BTreeSet<EntityId>>,
    notes: BTreeMap<String, String>,
    graph: RelationshipGraph,
    fuzzy_threshold: f64,
}

impl SchemaCatalog {
    pub fn load(path: &Path, fuzzy_threshold: f64) -> Result<Self, CatalogError> {
        Ok(Self::from_document(&MetadataDocument::load(path)?, fuzzy_threshold))
    }

    pub fn from_json(raw: &str, fuzzy_threshold: f64) -> Result<Self, CatalogError> {
        Ok(Self::from_document(&MetadataDocument::from_json(raw)?, fuzzy_threshold))
    }

    pub fn from_document(document: &MetadataDocument, fuzzy_threshold: f64) -> Self {
        let known_tables: BTreeMap<String, String> = document
            .tables
            .keys()
            .map(|table| (table.to_ascii_lowercase(), table.clone()))
            .collect();

        let mut catalog = Self {
            entities: BTreeMap::new(),
            tables: BTreeMap::new(),
            columns: BTreeMap::new(),
            terms: BTreeMap::new(),
            notes: BTreeMap::new(),
            graph: RelationshipGraph::default(),
            fuzzy_threshold,
        };
        let mut edges = Vec::new();

        for (table_name, table) in &document.tables {
            let table_id = EntityId::table(table_name);
            let mut synonyms: BTreeSet<String> =
                table.synonyms.iter().map(|synonym| normalize_term(synonym)).collect();
            synonyms.extend(
                [table.salesforce_name.as_str(), table.salesforce_label.as_str()]
                    .into_iter()
                    .filter(|value| !value.is_empty())
                    .map(normalize_term),
            );

            let mut table_edges = Vec::new();
            for (column_name, column) in &table.columns {
                let column_id = EntityId::column(table_name, column_name);
                let declared_edges =
                    column_edges(table_name, column_name, column, &known_tables, document);
                table_edges.extend(declared_edges.iter().cloned());
                edges.extend(declared_edges.iter().cloned());

                let mut column_synonyms: BTreeSet<String> =
                    column.synonyms.iter().map(|synonym| normalize_term(synonym)).collect();
                column_synonyms.extend(
                    [column.field_name.as_str(), column.field_label.as_str()]
                        .into_iter()
                        .filter(|value| !value.is_empty())
                        .map(normalize_term),
                );
                let entity = SchemaEntity {
                    id: column_id.clone(),
                    kind: EntityKind::Column,
                    name: if column.field_label.is_empty() {
                        column_name.clone()
                    } else {
                        column.field_label.clone()
                    },
                    physical: column_name.clone(),
                    table: table_name.clone(),
                    data_type: DataType::parse(&column.field_type),
                    nullable: column.is_nullable,
                    description: column.sfdc_description.clone(),
                    synonyms: column_synonyms,
                    relations: declared_edges,
                    possible_values: column
                        .possible_values
                        .iter()
                        .map(|value| PossibleValue {
                            value: value.value.clone(),
                            label: value.value_label.clone(),
                        })
                        .collect(),
                };
                catalog.index_entity(&entity);
                catalog
                    .columns
                    .entry(table_name.to_ascii_lowercase())
                    .or_default()
                    .insert(column_name.to_ascii_lowercase(), column_id.clone());
                catalog.entities.insert(column_id, entity);
            }

            let entity = SchemaEntity {
                id: table_id.clone(),
                kind: EntityKind::Table,
                name: if table.salesforce_label.is_empty() {
                    table_name.clone()
                } else {
                    table.salesforce_label.clone()
                },
                physical: table_name.clone(),
                table: table_name.clone(),
                data_type: DataType::Unknown,
                nullable: false,
                description: table.important_notes_and_rules.clone(),
                synonyms,
                relations: table_edges,
                possible_values: Vec::new(),
            };
            if !table.important_notes_and_rules.trim().is_empty() {
                catalog
                    .notes
                    .insert(table_name.clone(), table.important_notes_and_rules.trim().to_owned());
            }
            catalog.index_entity(&entity);
            catalog.tables.insert(table_name.to_ascii_lowercase(), table_id.clone());
            catalog.entities.insert(table_id, entity);
        }

        catalog.graph =
            RelationshipGraph::build(document.tables.keys().map(String::as_str), edges.iter());
        tracing::debug!(
            event_name = "catalog.loaded",
            tables = catalog.tables.len(),
            terms = catalog.terms.len(),
            "schema catalog indexed"
        );
        catalog
    }

    fn index_entity(&mut self, entity: &SchemaEntity) {
        let mut keys = BTreeSet::new();
        keys.insert(normalize_term(&entity.physical));
        keys.insert(normalize_term(&entity.name));
        keys.extend(entity.synonyms.iter().cloned());
        for key in keys.into_iter().filter(|key| !key.is_empty()) {
            for variant in term_variants(&key) {
                self.terms.entry(variant).or_default().insert(entity.id.clone());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn entity(&self, id: &EntityId) -> Option<&SchemaEntity> {
        self.entities.get(id)
    }

    pub fn table(&self, name: &str) -> Option<&SchemaEntity> {
        self.tables.get(&name.to_ascii_lowercase()).and_then(|id| self.entities.get(id))
    }

    pub fn column(&self, table: &str, column: &str) -> Option<&SchemaEntity> {
        self.columns
            .get(&table.to_ascii_lowercase())
            .and_then(|columns| columns.get(&column.to_ascii_lowercase()))
            .and_then(|id| self.entities.get(id))
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables
            .values()
            .filter_map(|id| self.entities.get(id))
            .map(|entity| entity.physical.as_str())
            .collect()
    }

    pub fn columns_of(&self, table: &str) -> Vec<&SchemaEntity> {
        self.columns
            .get(&table.to_ascii_lowercase())
            .map(|columns| columns.values().filter_map(|id| self.entities.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn notes(&self, table: &str) -> Option<&str> {
        self.table(table).and_then(|entity| self.notes.get(&entity.physical)).map(String::as_str)
    }

    pub fn neighbors(&self, table: &str) -> BTreeSet<String> {
        self.graph.neighbors(table)
    }

    pub fn join_path(&self, from: &str, to: &str) -> Result<Vec<RelationshipEdge>, JoinPathError> {
        self.graph.join_path(from, to)
    }

    pub fn relationship(
        &self,
        left: (&str, &str),
        right: (&str, &str),
    ) -> Option<RelationshipKind> {
        self.graph.edge_kind(left, right)
    }

    pub fn primary_key(&self, table: &str) -> Option<&SchemaEntity> {
        self.column(table, "Id").or_else(|| self.columns_of(table).into_iter().next())
    }

    /// Human-readable column used when a table itself is grouped on.
    pub fn label_column(&self, table: &str) -> Option<&SchemaEntity> {
        self.column(table, "Name").or_else(|| {
            self.columns_of(table)
                .into_iter()
                .find(|column| column.data_type == DataType::Text)
        })
    }

    /// Default date column for time filters and trends.
    pub fn temporal_column(&self, table: &str) -> Option<&SchemaEntity> {
        ["CloseDate", "CreatedDate"]
            .into_iter()
            .find_map(|name| self.column(table, name))
            .filter(|column| column.data_type.is_temporal())
            .or_else(|| {
                self.columns_of(table).into_iter().find(|column| column.data_type.is_temporal())
            })
    }

    /// Entities named by `term`: exact or synonym hit first, Jaro-Winkler fallback.
    pub fn lookup(&self, term: &str) -> Vec<&SchemaEntity> {
        let key = normalize_term(term);
        if key.is_empty() {
            return Vec::new();
        }
        if let Some(ids) = self.exact_ids(&key) {
            return ids.iter().filter_map(|id| self.entities.get(id)).collect();
        }
        self.fuzzy_ids(&key).iter().filter_map(|id| self.entities.get(id)).collect()
    }

    pub fn resolve_entities(&self, terms: &[&str]) -> Vec<&SchemaEntity> {
        let mut seen = BTreeSet::new();
        let mut resolved = Vec::new();
        for term in terms {
            for entity in self.lookup(term) {
                if seen.insert(entity.id.clone()) {
                    resolved.push(entity);
                }
            }
        }
        resolved.sort_by(|a, b| a.id.cmp(&b.id));
        resolved
    }

    fn exact_ids(&self, key: &str) -> Option<&BTreeSet<EntityId>> {
        self.terms.get(key).or_else(|| self.terms.get(&singularize_phrase(key)))
    }

    fn fuzzy_ids(&self, key: &str) -> BTreeSet<EntityId> {
        let mut best = self.fuzzy_threshold;
        let mut matches = BTreeSet::new();
        for (candidate, ids) in &self.terms {
            let score = jaro_winkler(key, candidate);
            if score > best + f64::EPSILON {
                best = score;
                matches = ids.clone();
            } else if (score - best).abs() <= f64::EPSILON {
                matches.extend(ids.iter().cloned());
            }
        }
        matches
    }

    /// Greedy longest-match spotting of schema terms in free text.
    pub fn spot_terms(&self, text: &str) -> Vec<TermSpan> {
        let words = question_words(text);
        let mut spans = Vec::new();
        let mut index = 0;
        while index < words.len() {
            let mut matched = None;
            let longest = MAX_SPAN_WORDS.min(words.len() - index);
            for width in (1..=longest).rev() {
                let phrase = words[index..index + width].join(" ");
                if width == 1 && STOPWORDS.contains(&phrase.as_str()) {
                    break;
                }
                if let Some(ids) = self.exact_ids(&phrase) {
                    matched = Some((width, phrase, ids.iter().cloned().collect::<Vec<_>>()));
                    break;
                }
                if width == 1 && phrase.chars().count() >= MIN_FUZZY_WORD_LEN {
                    let ids = self.fuzzy_ids(&phrase);
                    if !ids.is_empty() {
                        matched = Some((1, phrase, ids.into_iter().collect()));
                    }
                }
            }
            match matched {
                Some((width, text, entities)) => {
                    spans.push(TermSpan { start: index, end: index + width, text, entities });
                    index += width;
                }
                None => index += 1,
            }
        }
        spans
    }

    /// Columns whose declared values contain `term`, geography spellings included.
    pub fn resolve_value(&self, term: &str) -> Vec<ValueMatch> {
        let term = term.trim();
        if term.is_empty() {
            return Vec::new();
        }
        let country_group = geography::aliases(term);
        let mut matches = Vec::new();
        for entity in self.entities.values().filter(|entity| !entity.possible_values.is_empty()) {
            let direct = entity.possible_values.iter().find(|possible| {
                possible.value.eq_ignore_ascii_case(term)
                    || (!possible.label.is_empty() && possible.label.eq_ignore_ascii_case(term))
            });
            if let Some(possible) = direct {
                let mut spellings = vec![possible.value.clone()];
                if let Some(group) = country_group {
                    spellings.extend(group.iter().map(|alias| (*alias).to_owned()));
                }
                matches.push(ValueMatch {
                    column: entity.id.clone(),
                    value: possible.value.clone(),
                    spellings: dedup_spellings(spellings),
                });
                continue;
            }
            if let Some(group) = country_group {
                let stored: Vec<String> = entity
                    .possible_values
                    .iter()
                    .filter(|possible| geography::same_country(term, &possible.value))
                    .map(|possible| possible.value.clone())
                    .collect();
                if let Some(first) = stored.first() {
                    let mut spellings = stored.clone();
                    spellings.extend(group.iter().map(|alias| (*alias).to_owned()));
                    matches.push(ValueMatch {
                        column: entity.id.clone(),
                        value: first.clone(),
                        spellings: dedup_spellings(spellings),
                    });
                }
            }
        }
        matches
    }
}

fn column_edges(
    table_name: &str,
    column_name: &str,
    column: &metadata::ColumnMetadata,
    known_tables: &BTreeMap<String, String>,
    document: &MetadataDocument,
) -> Vec<RelationshipEdge> {
    let target_key = |table: &str| -> Option<String> {
        let physical = known_tables.get(&table.to_ascii_lowercase())?;
        let columns = &document.tables.get(physical)?.columns;
        columns.keys().find(|name| name.eq_ignore_ascii_case("Id")).cloned()
    };

    let declared: Vec<&String> = column
        .reference
        .as_ref()
        .map(|reference| reference.refers_to.iter().collect())
        .unwrap_or_default();
    if !declared.is_empty() {
        return declared
            .into_iter()
            .filter_map(|target| {
                let physical = known_tables.get(&target.to_ascii_lowercase())?;
                Some(RelationshipEdge {
                    from_table: table_name.to_owned(),
                    from_column: column_name.to_owned(),
                    to_table: physical.clone(),
                    to_column: target_key(physical)?,
                    kind: RelationshipKind::ForeignKey,
                })
            })
            .collect();
    }

    let Some(prefix) = column_name.strip_suffix("Id").filter(|prefix| !prefix.is_empty()) else {
        return Vec::new();
    };
    let Some(physical) = known_tables.get(&prefix.to_ascii_lowercase()) else {
        return Vec::new();
    };
    if physical.eq_ignore_ascii_case(table_name) {
        return Vec::new();
    }
    target_key(physical)
        .map(|to_column| {
            vec![RelationshipEdge {
                from_table: table_name.to_owned(),
                from_column: column_name.to_owned(),
                to_table: physical.clone(),
                to_column,
                kind: RelationshipKind::Inferred,
            }]
        })
        .unwrap_or_default()
}

fn dedup_spellings(spellings: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    spellings
        .into_iter()
        .filter(|spelling| seen.insert(spelling.to_ascii_lowercase()))
        .collect()
}

/// Lower-cased words of free text; punctuation separates words.
pub fn question_words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .map(|word| word.trim_matches('\'').to_lowercase())
        .filter(|word| !word.is_empty())
        .collect()
}

/// Lower-case, camel-case split, punctuation-free form of a schema name or synonym.
pub fn normalize_term(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    let mut spaced = String::with_capacity(value.len() + 8);
    for (index, ch) in chars.iter().enumerate() {
        if ch.is_uppercase() && index > 0 {
            let previous = chars[index - 1];
            let next_is_lower = chars.get(index + 1).is_some_and(|next| next.is_lowercase());
            if previous.is_lowercase()
                || previous.is_ascii_digit()
                || (previous.is_uppercase() && next_is_lower)
            {
                spaced.push(' ');
            }
        }
        if ch.is_alphanumeric() {
            spaced.extend(ch.to_lowercase());
        } else {
            spaced.push(' ');
        }
    }
    spaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn singularize(word: &str) -> String {
    if word.len() > 4 && word.ends_with("ies") {
        return format!("{}y", &word[..word.len() - 3]);
    }
    let sibilant = ["sses", "shes", "ches"].iter().any(|suffix| word.ends_with(suffix));
    if word.len() > 3 && sibilant {
        return word[..word.len() - 2].to_owned();
    }
    if word.len() > 3 && word.ends_with('s') && !word.ends_with("ss") && !word.ends_with("us") {
        return word[..word.len() - 1].to_owned();
    }
    word.to_owned()
}

fn singularize_phrase(phrase: &str) -> String {
    match phrase.rsplit_once(' ') {
        Some((head, last)) => format!("{head} {}", singularize(last)),
        None => singularize(phrase),
    }
}

fn term_variants(key: &str) -> BTreeSet<String> {
    let mut variants = BTreeSet::from([key.to_owned(), singularize_phrase(key)]);
    if !key.ends_with('s') {
        variants.insert(format!("{key}s"));
    }
    variants
}
