use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identity of a catalog entry: `Table` or `Table.Column`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn table(table: &str) -> Self {
        Self(table.to_owned())
    }

    pub fn column(table: &str, column: &str) -> Self {
        Self(format!("{table}.{column}"))
    }

    pub fn table_name(&self) -> &str {
        match self.0.split_once('.') {
            Some((table, _)) => table,
            None => &self.0,
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Table,
    Column,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Text,
    Integer,
    Float,
    Boolean,
    Date,
    Timestamp,
    Identifier,
    Unknown,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::Timestamp => "timestamp",
            Self::Identifier => "identifier",
            Self::Unknown => "unknown",
        }
    }

    /// Maps warehouse and CRM field type names onto the catalog's coarse types.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "string" | "text" | "varchar" | "picklist" | "textarea" | "email" | "phone"
            | "url" => Self::Text,
            "int" | "int64" | "integer" | "bigint" => Self::Integer,
            "float" | "float64" | "double" | "real" | "numeric" | "decimal" | "currency"
            | "percent" | "bignumeric" => Self::Float,
            "bool" | "boolean" => Self::Boolean,
            "date" => Self::Date,
            "datetime" | "timestamp" => Self::Timestamp,
            "id" | "reference" => Self::Identifier,
            _ => Self::Unknown,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Integer | Self::Float)
    }

    pub fn is_temporal(&self) -> bool {
        matches!(self, Self::Date | Self::Timestamp)
    }

    pub fn is_categorical(&self) -> bool {
        matches!(self, Self::Text | Self::Unknown)
    }
}

/// Declared foreign keys sort ahead of inferred edges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    ForeignKey,
    Inferred,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationshipEdge {
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
    pub kind: RelationshipKind,
}

impl RelationshipEdge {
    pub fn reversed(&self) -> Self {
        Self {
            from_table: self.to_table.clone(),
            from_column: self.to_column.clone(),
            to_table: self.from_table.clone(),
            to_column: self.from_column.clone(),
            kind: self.kind,
        }
    }

    /// True when the edge joins the two column pairs, in either direction.
    pub fn matches(&self, left: (&str, &str), right: (&str, &str)) -> bool {
        let forward = self.from_table.eq_ignore_ascii_case(left.0)
            && self.from_column.eq_ignore_ascii_case(left.1)
            && self.to_table.eq_ignore_ascii_case(right.0)
            && self.to_column.eq_ignore_ascii_case(right.1);
        let backward = self.from_table.eq_ignore_ascii_case(right.0)
            && self.from_column.eq_ignore_ascii_case(right.1)
            && self.to_table.eq_ignore_ascii_case(left.0)
            && self.to_column.eq_ignore_ascii_case(left.1);
        forward || backward
    }

    pub fn describe(&self) -> String {
        format!(
            "{}.{} -> {}.{}",
            self.from_table, self.from_column, self.to_table, self.to_column
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PossibleValue {
    pub value: String,
    pub label: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaEntity {
    pub id: EntityId,
    pub kind: EntityKind,
    /// Business-facing label.
    pub name: String,
    /// Physical identifier in the warehouse.
    pub physical: String,
    pub table: String,
    pub data_type: DataType,
    pub nullable: bool,
    pub description: String,
    pub synonyms: BTreeSet<String>,
    pub relations: Vec<RelationshipEdge>,
    pub possible_values: Vec<PossibleValue>,
}

impl SchemaEntity {
    pub fn is_table(&self) -> bool {
        self.kind == EntityKind::Table
    }

    pub fn is_column(&self) -> bool {
        self.kind == EntityKind::Column
    }

    pub fn qualified(&self) -> String {
        match self.kind {
            EntityKind::Table => self.physical.clone(),
            EntityKind::Column => format!("{}.{}", self.table, self.physical),
        }
    }
}
