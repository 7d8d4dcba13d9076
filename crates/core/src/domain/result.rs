use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Numeric,
    Temporal,
    Categorical,
    Boolean,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Numeric => "numeric",
            Self::Temporal => "temporal",
            Self::Categorical => "categorical",
            Self::Boolean => "boolean",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub column_type: ColumnType,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(value) => Some(*value as f64),
            Self::Float(value) => Some(*value),
            Self::Bool(value) => Some(if *value { 1.0 } else { 0.0 }),
            Self::Text(value) => value.trim().parse().ok(),
            Self::Null => None,
        }
    }

    fn sort_key(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Float(value) => format!("{value:.9}"),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

/// Column as reported by the warehouse before type inference.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawColumn {
    pub name: String,
    pub declared_type: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<ColumnSchema>,
    /// Row values aligned with `columns`.
    pub rows: Vec<Vec<Scalar>>,
    pub row_count: usize,
    pub truncated: bool,
}

impl ResultSet {
    pub fn from_raw(columns: Vec<RawColumn>, rows: Vec<Vec<Scalar>>, truncated: bool) -> Self {
        let columns = columns
            .into_iter()
            .enumerate()
            .map(|(index, column)| ColumnSchema {
                column_type: infer_column_type(column.declared_type.as_deref(), &rows, index),
                name: column.name,
            })
            .collect();
        let row_count = rows.len();
        Self { columns, rows, row_count, truncated }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|column| column.name.as_str()).collect()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name.eq_ignore_ascii_case(name))
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&Scalar> {
        let index = self.column_index(column)?;
        self.rows.get(row).and_then(|values| values.get(index))
    }

    pub fn columns_of(&self, column_type: ColumnType) -> Vec<&ColumnSchema> {
        self.columns.iter().filter(|column| column.column_type == column_type).collect()
    }

    pub fn numeric_values(&self, column: &str) -> Vec<f64> {
        let Some(index) = self.column_index(column) else {
            return Vec::new();
        };
        self.rows.iter().filter_map(|row| row.get(index).and_then(Scalar::as_f64)).collect()
    }

    /// Same columns and same rows, ignoring row order.
    pub fn equivalent_unordered(&self, other: &ResultSet) -> bool {
        if self.columns != other.columns || self.rows.len() != other.rows.len() {
            return false;
        }
        let mut left = self.sorted_row_keys();
        let mut right = other.sorted_row_keys();
        left.sort();
        right.sort();
        left == right
    }

    fn sorted_row_keys(&self) -> Vec<Vec<String>> {
        self.rows.iter().map(|row| row.iter().map(Scalar::sort_key).collect()).collect()
    }

    pub fn summary(&self, preview_rows: usize) -> ResultSummary {
        ResultSummary {
            columns: self.columns.clone(),
            row_count: self.row_count,
            truncated: self.truncated,
            preview: self.rows.iter().take(preview_rows).cloned().collect(),
        }
    }

    pub fn to_csv(&self) -> Result<String, csv::Error> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(self.columns.iter().map(|column| column.name.as_str()))?;
        for row in &self.rows {
            writer.write_record(row.iter().map(ToString::to_string))?;
        }
        let bytes = writer.into_inner().map_err(|error| error.into_error())?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Compact view of a result kept with the turn record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub columns: Vec<ColumnSchema>,
    pub row_count: usize,
    pub truncated: bool,
    pub preview: Vec<Vec<Scalar>>,
}

impl ResultSummary {
    pub fn headline(&self) -> String {
        if self.row_count > self.preview.len() {
            format!("FIRST {} OF {} ROWS", self.preview.len(), self.row_count)
        } else {
            format!("{} ROWS", self.row_count)
        }
    }
}

fn infer_column_type(declared: Option<&str>, rows: &[Vec<Scalar>], index: usize) -> ColumnType {
    let declared = declared.map(|value| value.to_ascii_lowercase()).unwrap_or_default();
    if declared.contains("date") || declared.contains("time") {
        return ColumnType::Temporal;
    }
    if declared.contains("bool") {
        return ColumnType::Boolean;
    }

    let values: Vec<&Scalar> =
        rows.iter().filter_map(|row| row.get(index)).filter(|value| !value.is_null()).collect();
    if values.is_empty() {
        return match declared.as_str() {
            "integer" | "int" | "int64" | "real" | "float" | "numeric" => ColumnType::Numeric,
            _ => ColumnType::Categorical,
        };
    }
    if values.iter().all(|value| matches!(value, Scalar::Bool(_))) {
        return ColumnType::Boolean;
    }
    if values.iter().all(|value| matches!(value, Scalar::Integer(_) | Scalar::Float(_))) {
        return ColumnType::Numeric;
    }
    if values.iter().all(|value| matches!(value, Scalar::Text(text) if looks_temporal(text))) {
        return ColumnType::Temporal;
    }
    ColumnType::Categorical
}

/// `YYYY`, `YYYY-MM`, `YYYY-MM-DD` and longer timestamps, or `YYYY-Qn`.
fn looks_temporal(text: &str) -> bool {
    let bytes = text.as_bytes();
    if bytes.len() < 7 || !bytes[..4].iter().all(u8::is_ascii_digit) || bytes[4] != b'-' {
        return false;
    }
    match bytes[5] {
        b'Q' | b'q' => bytes.len() == 7 && (b'1'..=b'4').contains(&bytes[6]),
        _ => bytes[5..7].iter().all(u8::is_ascii_digit),
    }
}

pub fn compare_scalars(left: &Scalar, right: &Scalar) -> Ordering {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        _ => left.to_string().cmp(&right.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::{ColumnType, RawColumn, ResultSet, Scalar};

    fn raw(name: &str, declared: Option<&str>) -> RawColumn {
        RawColumn { name: name.to_owned(), declared_type: declared.map(str::to_owned) }
    }

    fn sample() -> ResultSet {
        ResultSet::from_raw(
            vec![raw("month", None), raw("country", Some("TEXT")), raw("revenue", None)],
            vec![
                vec![
                    Scalar::Text("2024-01".to_owned()),
                    Scalar::Text("Germany".to_owned()),
                    Scalar::Float(1200.5),
                ],
                vec![
                    Scalar::Text("2024-02".to_owned()),
                    Scalar::Text("United States".to_owned()),
                    Scalar::Integer(900),
                ],
            ],
            false,
        )
    }

    #[test]
    fn infers_column_types_from_values() {
        let result = sample();
        assert_eq!(result.columns[0].column_type, ColumnType::Temporal);
        assert_eq!(result.columns[1].column_type, ColumnType::Categorical);
        assert_eq!(result.columns[2].column_type, ColumnType::Numeric);
        assert_eq!(result.row_count, 2);
    }

    #[test]
    fn values_are_addressable_by_column_name() {
        let result = sample();
        assert_eq!(result.value(1, "COUNTRY"), Some(&Scalar::Text("United States".to_owned())));
        assert_eq!(result.numeric_values("revenue"), vec![1200.5, 900.0]);
        assert!(result.value(5, "country").is_none());
    }

    #[test]
    fn unordered_equivalence_ignores_row_order() {
        let left = sample();
        let mut right = sample();
        right.rows.reverse();
        assert!(left.equivalent_unordered(&right));

        right.rows[0][2] = Scalar::Integer(901);
        assert!(!left.equivalent_unordered(&right));
    }

    #[test]
    fn summary_keeps_a_bounded_preview() {
        let summary = sample().summary(1);
        assert_eq!(summary.preview.len(), 1);
        assert_eq!(summary.row_count, 2);
        assert_eq!(summary.headline(), "FIRST 1 OF 2 ROWS");
    }

    #[test]
    fn csv_quotes_values_containing_commas() {
        let result = ResultSet::from_raw(
            vec![raw("name", None), raw("amount", None)],
            vec![vec![Scalar::Text("Acme, Inc".to_owned()), Scalar::Integer(5)]],
            false,
        );
        let csv = result.to_csv().expect("csv");
        assert_eq!(csv, "name,amount\n\"Acme, Inc\",5\n");
    }
}
