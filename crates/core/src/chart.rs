//! Shape-driven chart selection.

use crate::domain::chart::{ChartKind, ChartOutcome, ChartSpec, Channel, Encoding, FieldType, Mark};
use crate::domain::intent::AnalyticalIntent;
use crate::domain::result::{ColumnType, ResultSet};

const DEFAULT_TITLE: &str = "Query results";

#[derive(Clone, Copy, Debug, Default)]
pub struct ChartComposer;

impl ChartComposer {
    pub fn new() -> Self {
        Self
    }

    /// Picks a chart from the result's column types alone. Every encoded
    /// field is a column of `result`; an empty result never gets a chart.
    pub fn compose(&self, result: &ResultSet, intent: Option<&AnalyticalIntent>) -> ChartOutcome {
        if result.is_empty() {
            return ChartOutcome::NoData;
        }

        let numeric = names(result, &[ColumnType::Numeric]);
        let temporal = names(result, &[ColumnType::Temporal]);
        let categorical = names(result, &[ColumnType::Categorical, ColumnType::Boolean]);
        if numeric.is_empty() {
            return ChartOutcome::Table;
        }

        let title = intent
            .map(|intent| intent.question.trim())
            .filter(|question| !question.is_empty())
            .unwrap_or(DEFAULT_TITLE)
            .to_owned();

        let (kind, mark, encodings) = match (temporal.first(), categorical.as_slice(), numeric.as_slice()) {
            (None, [], [value]) if result.row_count == 1 => (
                ChartKind::Kpi,
                Mark::Text,
                vec![Encoding::new(Channel::Text, *value, FieldType::Quantitative)],
            ),
            (Some(time), _, [value]) => {
                let mut encodings = vec![
                    Encoding::new(Channel::X, *time, FieldType::Temporal),
                    measure(value),
                ];
                if let Some(series) = categorical.first() {
                    encodings.push(Encoding::new(Channel::Color, *series, FieldType::Nominal));
                }
                (ChartKind::Line, Mark::Line, encodings)
            }
            (Some(time), _, values) => {
                let mut encodings = vec![Encoding::new(Channel::X, *time, FieldType::Temporal)];
                encodings.extend(values.iter().map(|value| measure(value)));
                (ChartKind::MultiSeriesLine, Mark::Line, encodings)
            }
            (None, [group, series, ..], [value]) => (
                ChartKind::GroupedBar,
                Mark::Bar,
                vec![
                    Encoding::new(Channel::X, *group, FieldType::Nominal),
                    measure(value),
                    Encoding::new(Channel::Color, *series, FieldType::Nominal),
                ],
            ),
            (None, [category, ..], [value]) => (
                ChartKind::Bar,
                Mark::Bar,
                vec![Encoding::new(Channel::X, *category, FieldType::Nominal), measure(value)],
            ),
            (None, [category, ..], values) => {
                let mut encodings = vec![Encoding::new(Channel::X, *category, FieldType::Nominal)];
                encodings.extend(values.iter().map(|value| measure(value)));
                (ChartKind::GroupedBar, Mark::Bar, encodings)
            }
            (None, [], [x, y, ..]) => (
                ChartKind::Scatter,
                Mark::Point,
                vec![
                    Encoding::new(Channel::X, *x, FieldType::Quantitative),
                    Encoding::new(Channel::Y, *y, FieldType::Quantitative),
                ],
            ),
            _ => return ChartOutcome::Table,
        };

        let selection = match kind {
            ChartKind::Kpi | ChartKind::Scatter => None,
            _ => categorical.first().map(|field| (*field).to_owned()),
        };
        tracing::debug!(
            event_name = "chart.composed",
            kind = kind.as_str(),
            rows = result.row_count,
            "chart selected from result shape"
        );
        ChartOutcome::Chart(ChartSpec { kind, mark, title, encodings, selection })
    }
}

fn measure(field: &str) -> Encoding {
    Encoding::new(Channel::Y, field, FieldType::Quantitative)
}

fn names<'r>(result: &'r ResultSet, types: &[ColumnType]) -> Vec<&'r str> {
    result
        .columns
        .iter()
        .filter(|column| types.contains(&column.column_type))
        .map(|column| column.name.as_str())
        .collect()
}
