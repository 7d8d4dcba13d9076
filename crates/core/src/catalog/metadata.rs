use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::catalog::CatalogError;

/// Warehouse metadata document keyed by physical table name.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataDocument {
    pub tables: BTreeMap<String, TableMetadata>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TableMetadata {
    #[serde(default)]
    pub salesforce_name: String,
    #[serde(default)]
    pub salesforce_label: String,
    #[serde(default)]
    pub important_notes_and_rules: String,
    #[serde(default)]
    pub synonyms: Vec<String>,
    #[serde(default)]
    pub columns: BTreeMap<String, ColumnMetadata>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    #[serde(default)]
    pub field_name: String,
    #[serde(default)]
    pub field_type: String,
    #[serde(default)]
    pub field_label: String,
    #[serde(default)]
    pub sfdc_description: String,
    #[serde(default = "default_nullable")]
    pub is_nullable: bool,
    #[serde(default)]
    pub synonyms: Vec<String>,
    #[serde(default)]
    pub reference: Option<ReferenceMetadata>,
    #[serde(default)]
    pub possible_values: Vec<PossibleValueMetadata>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceMetadata {
    #[serde(default)]
    pub refers_to: Vec<String>,
    #[serde(default)]
    pub reference_type_column: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PossibleValueMetadata {
    pub value: String,
    #[serde(default)]
    pub value_label: String,
}

fn default_nullable() -> bool {
    true
}

impl MetadataDocument {
    pub fn from_json(raw: &str) -> Result<Self, CatalogError> {
        let document: Self =
            serde_json::from_str(raw).map_err(|source| CatalogError::Parse { source })?;
        if document.tables.is_empty() {
            return Err(CatalogError::Empty);
        }
        Ok(document)
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let raw = fs::read_to_string(path)
            .map_err(|source| CatalogError::ReadFile { path: path.to_path_buf(), source })?;
        Self::from_json(&raw)
    }
}
