//! Deterministic SQLite rendering of an analytical intent.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::catalog::{JoinPathError, SchemaCatalog};
use crate::domain::intent::{
    Aggregation, AnalyticalIntent, ColumnRef, Dimension, Filter, FilterOp, FilterValue, Metric,
    RowLimit, SortDirection, TimeGrain,
};

pub const GROUP_RANK_ALIAS: &str = "group_rank";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("table `{0}` is not in the catalog")]
    UnknownTable(String),
    #[error("column `{0}` is not in the catalog")]
    UnknownColumn(String),
    #[error(transparent)]
    JoinPath(#[from] JoinPathError),
    #[error("per-group limit partitions on `{0}`, which is not a dimension")]
    UnknownPartition(String),
    #[error("intent selects nothing")]
    EmptyProjection,
}

pub struct SqlRenderer<'a> {
    catalog: &'a SchemaCatalog,
}

struct JoinPlan {
    aliases: BTreeMap<String, String>,
    from: String,
    joins: Vec<String>,
}

impl<'a> SqlRenderer<'a> {
    pub fn new(catalog: &'a SchemaCatalog) -> Self {
        Self { catalog }
    }

    pub fn render(&self, intent: &AnalyticalIntent) -> Result<String, RenderError> {
        if intent.metrics.is_empty() && intent.dimensions.is_empty() {
            return Err(RenderError::EmptyProjection);
        }
        let plan = self.plan_joins(intent)?;

        let dimensions = intent
            .dimensions
            .iter()
            .map(|dimension| Ok((dimension, self.dimension_expr(&plan, dimension)?)))
            .collect::<Result<Vec<_>, RenderError>>()?;
        let metrics = intent
            .metrics
            .iter()
            .map(|metric| Ok((metric, self.metric_expr(&plan, metric)?)))
            .collect::<Result<Vec<_>, RenderError>>()?;

        let mut select_items: Vec<String> = dimensions
            .iter()
            .map(|(dimension, expr)| format!("{expr} AS {}", dimension.alias))
            .chain(metrics.iter().map(|(metric, expr)| format!("{expr} AS {}", metric.alias)))
            .collect();

        let mut conditions = intent
            .filters
            .iter()
            .map(|filter| self.filter_condition(&plan, filter))
            .collect::<Result<Vec<_>, RenderError>>()?;
        if let Some(time_filter) = &intent.time_filter {
            let column = self.column_expr(&plan, &time_filter.column)?;
            conditions.push(format!(
                "{column} >= '{}' AND {column} < '{}'",
                time_filter.range.start.format("%Y-%m-%d"),
                time_filter.range.end.format("%Y-%m-%d"),
            ));
        }

        let partition = match &intent.limit {
            Some(RowLimit::PerGroup { partition, limit }) => {
                let (_, partition_expr) = dimensions
                    .iter()
                    .find(|(dimension, _)| dimension.alias.eq_ignore_ascii_case(partition))
                    .ok_or_else(|| RenderError::UnknownPartition(partition.clone()))?;
                let (ranking_metric, ranking_expr) = self.ranking_metric(intent, &metrics);
                select_items.push(format!(
                    "ROW_NUMBER() OVER (PARTITION BY {partition_expr} ORDER BY {ranking_expr} DESC) AS {GROUP_RANK_ALIAS}"
                ));
                Some((partition.clone(), ranking_metric, *limit))
            }
            _ => None,
        };

        let mut lines = Vec::new();
        let distinct = if metrics.is_empty() { "DISTINCT " } else { "" };
        lines.push(format!("SELECT {distinct}{}", select_items.join(",\n  ")));
        lines.push(format!("FROM {}", plan.from));
        lines.extend(plan.joins.iter().cloned());
        if !conditions.is_empty() {
            lines.push(format!("WHERE {}", conditions.join("\n  AND ")));
        }
        if !metrics.is_empty() && !dimensions.is_empty() {
            let group_by =
                dimensions.iter().map(|(_, expr)| expr.as_str()).collect::<Vec<_>>().join(", ");
            lines.push(format!("GROUP BY {group_by}"));
        }

        let Some((partition, ranking_metric, limit)) = partition else {
            if let Some(order_by) = self.order_by(intent) {
                lines.push(format!("ORDER BY {order_by}"));
            }
            if let Some(RowLimit::Total { limit }) = &intent.limit {
                lines.push(format!("LIMIT {limit}"));
            }
            return Ok(lines.join("\n"));
        };

        let inner = lines.join("\n").replace('\n', "\n  ");
        let outer_columns = intent.projection().join(", ");
        let mut order_by = vec![format!("{partition} ASC")];
        if let Some(metric) = ranking_metric {
            order_by.push(format!("{metric} DESC"));
        }
        Ok(format!(
            "SELECT {outer_columns}\nFROM (\n  {inner}\n) ranked\nWHERE {GROUP_RANK_ALIAS} <= {limit}\nORDER BY {}",
            order_by.join(", ")
        ))
    }

    fn plan_joins(&self, intent: &AnalyticalIntent) -> Result<JoinPlan, RenderError> {
        let anchor = self
            .catalog
            .table(&intent.anchor_table)
            .ok_or_else(|| RenderError::UnknownTable(intent.anchor_table.clone()))?
            .physical
            .clone();

        let mut aliases = BTreeMap::new();
        let anchor_alias = unique_alias(&anchor, &aliases);
        aliases.insert(anchor.to_ascii_lowercase(), anchor_alias.clone());
        let mut joins = Vec::new();

        for table in intent.tables() {
            let physical = self
                .catalog
                .table(&table)
                .ok_or_else(|| RenderError::UnknownTable(table.clone()))?
                .physical
                .clone();
            if aliases.contains_key(&physical.to_ascii_lowercase()) {
                continue;
            }
            for edge in self.catalog.join_path(&anchor, &physical)? {
                let target = edge.to_table.to_ascii_lowercase();
                if aliases.contains_key(&target) {
                    continue;
                }
                let source_alias = aliases
                    .get(&edge.from_table.to_ascii_lowercase())
                    .cloned()
                    .ok_or_else(|| RenderError::UnknownTable(edge.from_table.clone()))?;
                let target_alias = unique_alias(&edge.to_table, &aliases);
                joins.push(format!(
                    "JOIN {} {target_alias} ON {source_alias}.{} = {target_alias}.{}",
                    edge.to_table, edge.from_column, edge.to_column
                ));
                aliases.insert(target, target_alias);
            }
        }

        Ok(JoinPlan { aliases, from: format!("{anchor} {anchor_alias}"), joins })
    }

    fn column_expr(&self, plan: &JoinPlan, column: &ColumnRef) -> Result<String, RenderError> {
        let entity = self
            .catalog
            .column(&column.table, &column.column)
            .ok_or_else(|| RenderError::UnknownColumn(column.to_string()))?;
        let table = entity.id.table_name();
        let alias = plan
            .aliases
            .get(&table.to_ascii_lowercase())
            .ok_or_else(|| RenderError::UnknownTable(table.to_owned()))?;
        Ok(format!("{alias}.{}", entity.physical))
    }

    fn dimension_expr(&self, plan: &JoinPlan, dimension: &Dimension) -> Result<String, RenderError> {
        let column = self.column_expr(plan, &dimension.column)?;
        Ok(match dimension.grain {
            None => column,
            Some(TimeGrain::Day) => format!("date({column})"),
            Some(TimeGrain::Week) => format!("strftime('%Y-W%W', {column})"),
            Some(TimeGrain::Month) => format!("strftime('%Y-%m', {column})"),
            Some(TimeGrain::Quarter) => format!(
                "strftime('%Y', {column}) || '-Q' || ((CAST(strftime('%m', {column}) AS INTEGER) + 2) / 3)"
            ),
            Some(TimeGrain::Year) => format!("strftime('%Y', {column})"),
        })
    }

    fn metric_expr(&self, plan: &JoinPlan, metric: &Metric) -> Result<String, RenderError> {
        let column = self.column_expr(plan, &metric.column)?;
        Ok(match metric.aggregation {
            Aggregation::Sum => format!("SUM({column})"),
            Aggregation::Count => format!("COUNT({column})"),
            Aggregation::CountDistinct => format!("COUNT(DISTINCT {column})"),
            Aggregation::Avg => format!("AVG({column})"),
            Aggregation::Min => format!("MIN({column})"),
            Aggregation::Max => format!("MAX({column})"),
        })
    }

    fn filter_condition(&self, plan: &JoinPlan, filter: &Filter) -> Result<String, RenderError> {
        let column = self.column_expr(plan, &filter.column)?;
        Ok(match (&filter.value, filter.op) {
            (FilterValue::List(values), FilterOp::NotEq) => {
                format!("{column} NOT IN ({})", quoted_list(values))
            }
            (FilterValue::List(values), _) => format!("{column} IN ({})", quoted_list(values)),
            (FilterValue::Text(value), FilterOp::In) => format!("{column} IN ({})", quote(value)),
            (FilterValue::Text(value), op) => format!("{column} {} {}", op.sql(), quote(value)),
            (FilterValue::Number(value), op) => format!("{column} {} {value}", op.sql()),
            (FilterValue::Bool(value), _) => {
                format!("{column} = {}", if *value { "TRUE" } else { "FALSE" })
            }
        })
    }

    /// Metric used to rank rows inside each partition: the sort key when it
    /// names a metric, otherwise the first metric.
    fn ranking_metric(
        &self,
        intent: &AnalyticalIntent,
        metrics: &[(&Metric, String)],
    ) -> (Option<String>, String) {
        let sorted = intent.sort.as_ref().and_then(|sort| {
            metrics.iter().find(|(metric, _)| metric.alias.eq_ignore_ascii_case(&sort.key))
        });
        match sorted.or_else(|| metrics.first()) {
            Some((metric, expr)) => (Some(metric.alias.clone()), expr.clone()),
            None => (None, "1".to_owned()),
        }
    }

    fn order_by(&self, intent: &AnalyticalIntent) -> Option<String> {
        if let Some(sort) = &intent.sort {
            return Some(format!("{} {}", sort.key, sort.direction.sql()));
        }
        let temporal = intent.dimensions.iter().find(|dimension| {
            dimension.grain.is_some()
                || self
                    .catalog
                    .column(&dimension.column.table, &dimension.column.column)
                    .is_some_and(|column| column.data_type.is_temporal())
        });
        if let Some(dimension) = temporal {
            return Some(format!("{} {}", dimension.alias, SortDirection::Asc.sql()));
        }
        intent
            .metrics
            .first()
            .map(|metric| format!("{} {}", metric.alias, SortDirection::Desc.sql()))
    }
}

/// Lower-cased initials of the camel-case words, numbered on collision.
fn unique_alias(table: &str, taken: &BTreeMap<String, String>) -> String {
    let initials: String = table
        .chars()
        .enumerate()
        .filter(|(index, ch)| *index == 0 || ch.is_ascii_uppercase())
        .map(|(_, ch)| ch.to_ascii_lowercase())
        .collect();
    let base = if initials.is_empty() { "t".to_owned() } else { initials };
    let in_use = |candidate: &str| taken.values().any(|alias| alias == candidate);
    if !in_use(&base) {
        return base;
    }
    let mut suffix = 2;
    loop {
        let candidate = format!("{base}{suffix}");
        if !in_use(&candidate) {
            return candidate;
        }
        suffix += 1;
    }
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn quoted_list(values: &[String]) -> String {
    values.iter().map(|value| quote(value)).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::{RenderError, SqlRenderer};
    use crate::domain::intent::{
        Aggregation, AnalyticalIntent, ColumnRef, Dimension, Filter, FilterOp, FilterValue,
        Metric, RowLimit, TimeFilter, TimeGrain, TimeRange,
    };
    use crate::sql::validator::SqlValidator;
    use crate::test_support::crm_catalog;

    fn revenue() -> Metric {
        Metric {
            aggregation: Aggregation::Sum,
            column: ColumnRef::new("Opportunity", "Amount"),
            alias: "revenue".to_owned(),
        }
    }

    fn dimension(table: &str, column: &str, alias: &str) -> Dimension {
        Dimension { column: ColumnRef::new(table, column), alias: alias.to_owned(), grain: None }
    }

    fn base_intent() -> AnalyticalIntent {
        AnalyticalIntent {
            question: "revenue by country".to_owned(),
            anchor_table: "Opportunity".to_owned(),
            metrics: vec![revenue()],
            dimensions: vec![dimension("Account", "BillingCountry", "country")],
            filters: Vec::new(),
            time_filter: None,
            sort: None,
            limit: None,
        }
    }

    #[test]
    fn renders_join_group_and_default_sort() {
        let catalog = crm_catalog();
        let sql = SqlRenderer::new(&catalog).render(&base_intent()).expect("render");
        assert_eq!(
            sql,
            "SELECT a.BillingCountry AS country,\n  SUM(o.Amount) AS revenue\n\
             FROM Opportunity o\n\
             JOIN Account a ON o.AccountId = a.Id\n\
             GROUP BY a.BillingCountry\n\
             ORDER BY revenue DESC"
        );
        assert!(SqlValidator::new(&catalog).validate(&sql).is_ok());
    }

    #[test]
    fn time_range_renders_both_half_open_bounds() {
        let catalog = crm_catalog();
        let mut intent = base_intent();
        intent.time_filter = Some(TimeFilter {
            column: ColumnRef::new("Opportunity", "CloseDate"),
            range: TimeRange::new(
                NaiveDate::from_ymd_opt(2025, 7, 1).expect("date"),
                NaiveDate::from_ymd_opt(2025, 10, 1).expect("date"),
            )
            .expect("range"),
            phrase: "last quarter".to_owned(),
        });
        let sql = SqlRenderer::new(&catalog).render(&intent).expect("render");
        assert!(sql.contains("WHERE o.CloseDate >= '2025-07-01' AND o.CloseDate < '2025-10-01'"));
    }

    #[test]
    fn per_group_limit_wraps_in_row_number() {
        let catalog = crm_catalog();
        let mut intent = base_intent();
        intent.dimensions.push(dimension("Account", "Name", "customer"));
        intent.limit = Some(RowLimit::PerGroup { partition: "country".to_owned(), limit: 5 });
        let sql = SqlRenderer::new(&catalog).render(&intent).expect("render");

        assert!(sql.starts_with("SELECT country, customer, revenue\nFROM (\n  SELECT "));
        assert!(sql.contains(
            "ROW_NUMBER() OVER (PARTITION BY a.BillingCountry ORDER BY SUM(o.Amount) DESC) AS group_rank"
        ));
        assert!(sql.contains(") ranked\nWHERE group_rank <= 5\nORDER BY country ASC, revenue DESC"));
        let validated = SqlValidator::new(&catalog).validate(&sql).expect("valid");
        assert_eq!(validated.projection, intent.projection());
    }

    #[test]
    fn list_filters_and_trend_grain() {
        let catalog = crm_catalog();
        let intent = AnalyticalIntent {
            question: "lead conversion trends in the US".to_owned(),
            anchor_table: "Lead".to_owned(),
            metrics: vec![Metric {
                aggregation: Aggregation::Avg,
                column: ColumnRef::new("Lead", "IsConverted"),
                alias: "conversion_rate".to_owned(),
            }],
            dimensions: vec![Dimension {
                column: ColumnRef::new("Lead", "CreatedDate"),
                alias: "created_month".to_owned(),
                grain: Some(TimeGrain::Month),
            }],
            filters: vec![Filter {
                column: ColumnRef::new("Lead", "Country"),
                op: FilterOp::In,
                value: FilterValue::List(vec!["United States".to_owned(), "US".to_owned()]),
            }],
            time_filter: None,
            sort: None,
            limit: None,
        };
        let sql = SqlRenderer::new(&catalog).render(&intent).expect("render");
        assert!(sql.contains("strftime('%Y-%m', l.CreatedDate) AS created_month"));
        assert!(sql.contains("WHERE l.Country IN ('United States', 'US')"));
        assert!(sql.ends_with("ORDER BY created_month ASC"));
        assert!(SqlValidator::new(&catalog).validate(&sql).is_ok());
    }

    #[test]
    fn multi_hop_join_and_total_limit() {
        let catalog = crm_catalog();
        let mut intent = base_intent();
        intent.dimensions = vec![dimension("SalesRep", "Region", "region")];
        intent.filters.push(Filter {
            column: ColumnRef::new("Account", "Name"),
            op: FilterOp::Eq,
            value: FilterValue::Text("O'Brien Ltd".to_owned()),
        });
        intent.limit = Some(RowLimit::Total { limit: 3 });
        let sql = SqlRenderer::new(&catalog).render(&intent).expect("render");
        assert!(sql.contains("JOIN Account a ON o.AccountId = a.Id"));
        assert!(sql.contains("JOIN SalesRep sr ON o.OwnerId = sr.Id"));
        assert!(sql.contains("a.Name = 'O''Brien Ltd'"));
        assert!(sql.ends_with("LIMIT 3"));
        assert!(SqlValidator::new(&catalog).validate(&sql).is_ok());
    }

    #[test]
    fn unknown_columns_and_partitions_fail() {
        let catalog = crm_catalog();
        let mut intent = base_intent();
        intent.metrics[0].column = ColumnRef::new("Opportunity", "Discount");
        assert_eq!(
            SqlRenderer::new(&catalog).render(&intent),
            Err(RenderError::UnknownColumn("Opportunity.Discount".to_owned()))
        );

        let mut intent = base_intent();
        intent.limit = Some(RowLimit::PerGroup { partition: "industry".to_owned(), limit: 2 });
        assert_eq!(
            SqlRenderer::new(&catalog).render(&intent),
            Err(RenderError::UnknownPartition("industry".to_owned()))
        );
    }
}
