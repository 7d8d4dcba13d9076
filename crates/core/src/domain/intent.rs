use std::collections::BTreeSet;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
}

impl ColumnRef {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self { table: table.into(), column: column.into() }
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Sum,
    Count,
    CountDistinct,
    Avg,
    Min,
    Max,
}

impl Aggregation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Count => "count",
            Self::CountDistinct => "count_distinct",
            Self::Avg => "avg",
            Self::Min => "min",
            Self::Max => "max",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sum" | "total" => Some(Self::Sum),
            "count" | "number" => Some(Self::Count),
            "count_distinct" | "distinct" => Some(Self::CountDistinct),
            "avg" | "average" | "mean" => Some(Self::Avg),
            "min" | "minimum" | "lowest" => Some(Self::Min),
            "max" | "maximum" | "highest" => Some(Self::Max),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metric {
    pub aggregation: Aggregation,
    pub column: ColumnRef,
    pub alias: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeGrain {
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl TimeGrain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Quarter => "quarter",
            Self::Year => "year",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    pub column: ColumnRef,
    pub alias: String,
    #[serde(default)]
    pub grain: Option<TimeGrain>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    NotEq,
    In,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl FilterOp {
    pub fn sql(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::NotEq => "<>",
            Self::In => "IN",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum FilterValue {
    Text(String),
    Number(f64),
    Bool(bool),
    List(Vec<String>),
}

impl fmt::Display for FilterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(value) => f.write_str(value),
            Self::Number(value) => write!(f, "{value}"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::List(values) => f.write_str(&values.join(", ")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column: ColumnRef,
    pub op: FilterOp,
    pub value: FilterValue,
}

/// Absolute date window, start inclusive and end exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl TimeRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date < self.end
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeFilter {
    pub column: ColumnRef,
    pub range: TimeRange,
    pub phrase: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortOrder {
    /// Output alias the rows are ordered by.
    pub key: String,
    pub direction: SortDirection,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope")]
pub enum RowLimit {
    Total { limit: u32 },
    PerGroup { partition: String, limit: u32 },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalyticalIntent {
    pub question: String,
    /// Fact table every other table is joined from.
    pub anchor_table: String,
    pub metrics: Vec<Metric>,
    pub dimensions: Vec<Dimension>,
    pub filters: Vec<Filter>,
    pub time_filter: Option<TimeFilter>,
    pub sort: Option<SortOrder>,
    pub limit: Option<RowLimit>,
}

impl AnalyticalIntent {
    pub fn tables(&self) -> BTreeSet<String> {
        let mut tables = BTreeSet::new();
        tables.insert(self.anchor_table.clone());
        tables.extend(self.metrics.iter().map(|metric| metric.column.table.clone()));
        tables.extend(self.dimensions.iter().map(|dimension| dimension.column.table.clone()));
        tables.extend(self.filters.iter().map(|filter| filter.column.table.clone()));
        if let Some(time_filter) = &self.time_filter {
            tables.insert(time_filter.column.table.clone());
        }
        tables
    }

    /// Output column names in select order: dimensions first, then metrics.
    pub fn projection(&self) -> Vec<String> {
        self.dimensions
            .iter()
            .map(|dimension| dimension.alias.clone())
            .chain(self.metrics.iter().map(|metric| metric.alias.clone()))
            .collect()
    }

    pub fn time_range(&self) -> Option<TimeRange> {
        self.time_filter.as_ref().map(|filter| filter.range)
    }

    pub fn describe(&self) -> String {
        let metrics = self
            .metrics
            .iter()
            .map(|metric| format!("{}({})", metric.aggregation.as_str(), metric.column))
            .collect::<Vec<_>>()
            .join(", ");
        let mut summary = format!("{metrics} from {}", self.anchor_table);
        if !self.dimensions.is_empty() {
            let dimensions =
                self.dimensions.iter().map(|d| d.alias.as_str()).collect::<Vec<_>>().join(", ");
            summary.push_str(&format!(" by {dimensions}"));
        }
        for filter in &self.filters {
            summary.push_str(&format!(" where {} {} {}", filter.column, filter.op.sql(), filter.value));
        }
        if let Some(time_filter) = &self.time_filter {
            summary.push_str(&format!(" during {}", time_filter.range));
        }
        match &self.limit {
            Some(RowLimit::Total { limit }) => summary.push_str(&format!(" limited to {limit}")),
            Some(RowLimit::PerGroup { partition, limit }) => {
                summary.push_str(&format!(" top {limit} per {partition}"))
            }
            None => {}
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::{
        Aggregation, AnalyticalIntent, ColumnRef, Dimension, Metric, RowLimit, TimeFilter,
        TimeRange,
    };

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn intent() -> AnalyticalIntent {
        AnalyticalIntent {
            question: "top 5 customers by revenue in every country".to_owned(),
            anchor_table: "Opportunity".to_owned(),
            metrics: vec![Metric {
                aggregation: Aggregation::Sum,
                column: ColumnRef::new("Opportunity", "Amount"),
                alias: "revenue".to_owned(),
            }],
            dimensions: vec![
                Dimension {
                    column: ColumnRef::new("Account", "BillingCountry"),
                    alias: "country".to_owned(),
                    grain: None,
                },
                Dimension {
                    column: ColumnRef::new("Account", "Name"),
                    alias: "customer".to_owned(),
                    grain: None,
                },
            ],
            filters: Vec::new(),
            time_filter: Some(TimeFilter {
                column: ColumnRef::new("Opportunity", "CloseDate"),
                range: TimeRange::new(date(2024, 1, 1), date(2025, 1, 1)).expect("range"),
                phrase: "in 2024".to_owned(),
            }),
            sort: None,
            limit: Some(RowLimit::PerGroup { partition: "country".to_owned(), limit: 5 }),
        }
    }

    #[test]
    fn projection_lists_dimensions_before_metrics() {
        assert_eq!(intent().projection(), vec!["country", "customer", "revenue"]);
    }

    #[test]
    fn tables_cover_every_referenced_column() {
        let tables = intent().tables();
        assert!(tables.contains("Opportunity"));
        assert!(tables.contains("Account"));
        assert_eq!(tables.len(), 2);
    }

    #[test]
    fn time_range_is_half_open() {
        let range = TimeRange::new(date(2024, 1, 1), date(2024, 2, 1)).expect("range");
        assert!(range.contains(date(2024, 1, 1)));
        assert!(range.contains(date(2024, 1, 31)));
        assert!(!range.contains(date(2024, 2, 1)));
        assert!(TimeRange::new(date(2024, 2, 1), date(2024, 2, 1)).is_none());
    }

    #[test]
    fn describe_mentions_per_group_limit() {
        let description = intent().describe();
        assert!(description.contains("sum(Opportunity.Amount)"));
        assert!(description.contains("top 5 per country"));
    }
}
