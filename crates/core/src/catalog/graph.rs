use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::domain::schema::{RelationshipEdge, RelationshipKind};

pub const MAX_JOIN_HOPS: usize = 4;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum JoinPathError {
    #[error("table `{0}` is not in the catalog")]
    UnknownTable(String),
    #[error("no relationship path connects `{from}` and `{to}`")]
    NotConnected { from: String, to: String },
}

/// Undirected view over relationship edges, keyed by lower-cased table name.
#[derive(Clone, Debug, Default)]
pub struct RelationshipGraph {
    adjacency: BTreeMap<String, Vec<RelationshipEdge>>,
}

/// Ranking among paths of equal length: fewer inferred edges, then the
/// lexically smallest edge sequence.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct PathCost {
    inferred: usize,
    key: Vec<RelationshipEdge>,
}

impl PathCost {
    fn extended(&self, edge: &RelationshipEdge) -> Self {
        let mut key = self.key.clone();
        key.push(edge.clone());
        Self { inferred: self.inferred + usize::from(edge.kind == RelationshipKind::Inferred), key }
    }
}

impl RelationshipGraph {
    pub fn build<'a>(
        tables: impl IntoIterator<Item = &'a str>,
        edges: impl IntoIterator<Item = &'a RelationshipEdge>,
    ) -> Self {
        let mut adjacency: BTreeMap<String, Vec<RelationshipEdge>> =
            tables.into_iter().map(|table| (table.to_ascii_lowercase(), Vec::new())).collect();
        for edge in edges {
            adjacency.entry(edge.from_table.to_ascii_lowercase()).or_default().push(edge.clone());
            if !edge.from_table.eq_ignore_ascii_case(&edge.to_table) {
                adjacency
                    .entry(edge.to_table.to_ascii_lowercase())
                    .or_default()
                    .push(edge.reversed());
            }
        }
        for edges in adjacency.values_mut() {
            edges.sort();
            edges.dedup();
        }
        Self { adjacency }
    }

    pub fn neighbors(&self, table: &str) -> BTreeSet<String> {
        self.adjacency
            .get(&table.to_ascii_lowercase())
            .map(|edges| edges.iter().map(|edge| edge.to_table.clone()).collect())
            .unwrap_or_default()
    }

    /// Kind of the strongest edge joining the two column pairs, if any.
    pub fn edge_kind(&self, left: (&str, &str), right: (&str, &str)) -> Option<RelationshipKind> {
        self.adjacency
            .get(&left.0.to_ascii_lowercase())?
            .iter()
            .filter(|edge| edge.matches(left, right))
            .map(|edge| edge.kind)
            .min()
    }

    /// Shortest path by hop count, searched one layer at a time up to
    /// `MAX_JOIN_HOPS`. Among equally short paths, declared foreign keys beat
    /// inferred edges, then the lexically smallest edge sequence wins.
    pub fn join_path(&self, from: &str, to: &str) -> Result<Vec<RelationshipEdge>, JoinPathError> {
        let start = from.to_ascii_lowercase();
        let goal = to.to_ascii_lowercase();
        for table in [&start, &goal] {
            if !self.adjacency.contains_key(table) {
                return Err(JoinPathError::UnknownTable(table.clone()));
            }
        }
        if start == goal {
            return Ok(Vec::new());
        }

        let mut reached = BTreeSet::from([start.clone()]);
        let mut frontier = BTreeMap::from([(start, PathCost { inferred: 0, key: Vec::new() })]);
        for _ in 0..MAX_JOIN_HOPS {
            let mut next_layer: BTreeMap<String, PathCost> = BTreeMap::new();
            for (table, cost) in &frontier {
                let Some(edges) = self.adjacency.get(table) else {
                    continue;
                };
                for edge in edges {
                    let next = edge.to_table.to_ascii_lowercase();
                    if reached.contains(&next) {
                        continue;
                    }
                    let candidate = cost.extended(edge);
                    match next_layer.get(&next) {
                        Some(current) if *current <= candidate => {}
                        _ => {
                            next_layer.insert(next, candidate);
                        }
                    }
                }
            }

            if let Some(found) = next_layer.remove(&goal) {
                return Ok(found.key);
            }
            if next_layer.is_empty() {
                break;
            }
            reached.extend(next_layer.keys().cloned());
            frontier = next_layer;
        }

        Err(JoinPathError::NotConnected { from: from.to_owned(), to: to.to_owned() })
    }
}
