//! Deterministic narrative facts computed from a result set.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::chart::{ChartKind, ChartOutcome};
use crate::domain::intent::{AnalyticalIntent, RowLimit};
use crate::domain::result::{ColumnType, ResultSet, Scalar};

pub const MAX_OBSERVATIONS: usize = 3;
const FLAT_TREND_PCT: f64 = 5.0;
const OUTLIER_Z: f64 = 2.0;
const MIN_OUTLIER_ROWS: usize = 5;
const CONCENTRATION_TOP_N: usize = 3;
const HIGH_CONCENTRATION: f64 = 0.6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationKind {
    Concentration,
    Trend,
    Outlier,
    GroupLeaders,
    Truncation,
}

impl ObservationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Concentration => "concentration",
            Self::Trend => "trend",
            Self::Outlier => "outlier",
            Self::GroupLeaders => "group_leaders",
            Self::Truncation => "truncation",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub kind: ObservationKind,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub answer: String,
    pub observations: Vec<Observation>,
    pub recommendation: Option<String>,
}

impl Insight {
    pub fn narrative(&self) -> String {
        let mut text = self.answer.clone();
        if !self.observations.is_empty() {
            text.push_str("\n\n");
            let bullets: Vec<String> =
                self.observations.iter().map(|observation| format!("- {}", observation.text)).collect();
            text.push_str(&bullets.join("\n"));
        }
        if let Some(recommendation) = &self.recommendation {
            text.push_str(&format!("\n\nRecommended next step: {recommendation}"));
        }
        text
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TrendDirection {
    Up,
    Down,
    Flat,
}

/// Columns the narrative talks about.
struct Focus<'r> {
    measure: &'r str,
    measure_index: usize,
    label_index: Option<usize>,
    label_type: Option<ColumnType>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct InsightSynthesizer;

impl InsightSynthesizer {
    pub fn new() -> Self {
        Self
    }

    pub fn synthesize(
        &self,
        result: &ResultSet,
        chart: &ChartOutcome,
        intent: Option<&AnalyticalIntent>,
    ) -> Insight {
        if result.is_empty() || matches!(chart, ChartOutcome::NoData) {
            return Insight {
                answer: "No rows matched the question.".to_owned(),
                observations: Vec::new(),
                recommendation: Some("Broaden the time range or relax the filters.".to_owned()),
            };
        }
        let Some(focus) = pick_focus(result, intent) else {
            return Insight {
                answer: format!("The query returned {} row(s).", result.row_count),
                observations: truncation(result).into_iter().collect(),
                recommendation: None,
            };
        };

        let measure_label = humanize(focus.measure);
        let mut observations = Vec::new();
        let mut recommendation = None;

        let per_group = intent.and_then(|intent| match &intent.limit {
            Some(RowLimit::PerGroup { partition, .. }) => result.column_index(partition),
            _ => None,
        });
        let is_kpi = chart.spec().is_some_and(|spec| spec.kind == ChartKind::Kpi);

        let answer = if is_kpi || (result.row_count == 1 && focus.label_index.is_none()) {
            let value = result.rows[0].get(focus.measure_index).and_then(Scalar::as_f64);
            match value {
                Some(value) => format!("{} is {}.", capitalize(&measure_label), format_number(value)),
                None => format!("{} has no value.", capitalize(&measure_label)),
            }
        } else if let (Some(partition_index), Some(label_index)) = (per_group, focus.label_index) {
            let leaders = group_leaders(result, partition_index, label_index, focus.measure_index);
            let partition_label = humanize(&result.columns[partition_index].name);
            let listed: Vec<String> = leaders
                .iter()
                .map(|(group, leader, value)| format!("{group}: {leader} ({})", format_number(*value)))
                .collect();
            let strongest = leaders
                .iter()
                .max_by(|left, right| left.2.partial_cmp(&right.2).unwrap_or(std::cmp::Ordering::Equal));
            if let Some((group, leader, value)) = strongest {
                observations.push(Observation {
                    kind: ObservationKind::GroupLeaders,
                    text: format!(
                        "Across {} {partition_label} groups the largest leader is {leader} in {group} at {}.",
                        leaders.len(),
                        format_number(*value)
                    ),
                });
            }
            format!(
                "Top {} by {measure_label} in each {partition_label}: {}.",
                humanize(&result.columns[label_index].name),
                listed.join("; ")
            )
        } else if focus.label_type == Some(ColumnType::Temporal) {
            let series = labelled_values(result, &focus);
            let (answer, direction, trend_text) = describe_trend(&series, &measure_label);
            if let Some(text) = trend_text {
                observations.push(Observation { kind: ObservationKind::Trend, text });
            }
            if direction == Some(TrendDirection::Down) {
                recommendation =
                    Some(format!("Review what drove the decline in {measure_label}."));
            }
            answer
        } else {
            let series = labelled_values(result, &focus);
            let total: f64 = series.iter().map(|(_, value)| value).sum();
            let leader = series
                .iter()
                .max_by(|left, right| left.1.partial_cmp(&right.1).unwrap_or(std::cmp::Ordering::Equal));
            match leader {
                Some((label, value)) => {
                    let share = (total > 0.0 && series.iter().all(|(_, v)| *v >= 0.0))
                        .then(|| format!(" ({} of the total)", format_pct(value / total)))
                        .unwrap_or_default();
                    format!("{label} leads with {} {measure_label}{share}.", format_number(*value))
                }
                None => format!("The query returned {} row(s).", result.row_count),
            }
        };

        if per_group.is_none() && focus.label_type != Some(ColumnType::Temporal) {
            if let Some((observation, share)) = concentration(result, &focus, &measure_label) {
                if share >= HIGH_CONCENTRATION && recommendation.is_none() {
                    recommendation = Some(format!(
                        "Check exposure to the top {CONCENTRATION_TOP_N} entries, which carry most of the {measure_label}."
                    ));
                }
                observations.push(observation);
            }
        }
        if let Some(observation) = outlier(result, &focus) {
            observations.push(observation);
        }

        let truncated = truncation(result);
        let keep = MAX_OBSERVATIONS - usize::from(truncated.is_some());
        observations.truncate(keep);
        observations.extend(truncated);

        Insight { answer, observations, recommendation }
    }
}

fn pick_focus<'r>(result: &'r ResultSet, intent: Option<&AnalyticalIntent>) -> Option<Focus<'r>> {
    let preferred = intent
        .and_then(|intent| intent.metrics.first())
        .and_then(|metric| result.column_index(&metric.alias))
        .filter(|index| result.columns[*index].column_type == ColumnType::Numeric);
    let measure_index = preferred.or_else(|| {
        result.columns.iter().position(|column| column.column_type == ColumnType::Numeric)
    })?;

    // Innermost dimension: the item being ranked rather than its group.
    let label_index = result
        .columns
        .iter()
        .enumerate()
        .filter(|(_, column)| {
            matches!(column.column_type, ColumnType::Categorical | ColumnType::Temporal)
        })
        .map(|(index, _)| index)
        .last();
    Some(Focus {
        measure: result.columns[measure_index].name.as_str(),
        measure_index,
        label_type: label_index.map(|index| result.columns[index].column_type),
        label_index,
    })
}

fn labelled_values(result: &ResultSet, focus: &Focus<'_>) -> Vec<(String, f64)> {
    let Some(label_index) = focus.label_index else {
        return Vec::new();
    };
    result
        .rows
        .iter()
        .filter_map(|row| {
            let value = row.get(focus.measure_index)?.as_f64()?;
            Some((row.get(label_index)?.to_string(), value))
        })
        .collect()
}

fn group_leaders(
    result: &ResultSet,
    partition_index: usize,
    label_index: usize,
    measure_index: usize,
) -> Vec<(String, String, f64)> {
    let mut order = Vec::new();
    let mut best: BTreeMap<String, (String, f64)> = BTreeMap::new();
    for row in &result.rows {
        let (Some(group), Some(label), Some(value)) = (
            row.get(partition_index),
            row.get(label_index),
            row.get(measure_index).and_then(Scalar::as_f64),
        ) else {
            continue;
        };
        let group = group.to_string();
        match best.get(&group) {
            Some((_, current)) if *current >= value => continue,
            Some(_) => {}
            None => order.push(group.clone()),
        }
        best.insert(group, (label.to_string(), value));
    }
    order
        .into_iter()
        .filter_map(|group| {
            let (leader, value) = best.remove(&group)?;
            Some((group, leader, value))
        })
        .collect()
}

fn describe_trend(
    series: &[(String, f64)],
    measure_label: &str,
) -> (String, Option<TrendDirection>, Option<String>) {
    let (Some((first_label, first)), Some((last_label, last))) = (series.first(), series.last()) else {
        return (format!("No {measure_label} values were returned."), None, None);
    };
    if series.len() == 1 {
        return (
            format!("{} was {} in {first_label}.", capitalize(measure_label), format_number(*first)),
            None,
            None,
        );
    }
    let answer = format!(
        "{} went from {} in {first_label} to {} in {last_label}.",
        capitalize(measure_label),
        format_number(*first),
        format_number(*last)
    );
    if *first == 0.0 {
        return (answer, None, None);
    }
    let change_pct = (last - first) / first.abs() * 100.0;
    let direction = if change_pct.abs() < FLAT_TREND_PCT {
        TrendDirection::Flat
    } else if change_pct > 0.0 {
        TrendDirection::Up
    } else {
        TrendDirection::Down
    };
    let text = match direction {
        TrendDirection::Flat => format!(
            "{} stayed roughly flat across {} periods ({change_pct:+.1}%).",
            capitalize(measure_label),
            series.len()
        ),
        TrendDirection::Up => format!(
            "{} trended up {change_pct:.1}% between {first_label} and {last_label}.",
            capitalize(measure_label)
        ),
        TrendDirection::Down => format!(
            "{} trended down {:.1}% between {first_label} and {last_label}.",
            capitalize(measure_label),
            change_pct.abs()
        ),
    };
    (answer, Some(direction), Some(text))
}

fn concentration(
    result: &ResultSet,
    focus: &Focus<'_>,
    measure_label: &str,
) -> Option<(Observation, f64)> {
    let mut values: Vec<f64> = labelled_values(result, focus).into_iter().map(|(_, v)| v).collect();
    if values.len() <= CONCENTRATION_TOP_N || values.iter().any(|value| *value < 0.0) {
        return None;
    }
    let total: f64 = values.iter().sum();
    if total <= 0.0 {
        return None;
    }
    values.sort_by(|left, right| right.partial_cmp(left).unwrap_or(std::cmp::Ordering::Equal));
    let share = values.iter().take(CONCENTRATION_TOP_N).sum::<f64>() / total;
    let label = focus
        .label_index
        .map(|index| humanize(&result.columns[index].name))
        .unwrap_or_else(|| "rows".to_owned());
    Some((
        Observation {
            kind: ObservationKind::Concentration,
            text: format!(
                "The top {CONCENTRATION_TOP_N} {label} values account for {} of {measure_label} across {} rows.",
                format_pct(share),
                values.len()
            ),
        },
        share,
    ))
}

fn outlier(result: &ResultSet, focus: &Focus<'_>) -> Option<Observation> {
    let series = labelled_values(result, focus);
    if series.len() < MIN_OUTLIER_ROWS {
        return None;
    }
    let count = series.len() as f64;
    let mean = series.iter().map(|(_, value)| value).sum::<f64>() / count;
    let variance = series.iter().map(|(_, value)| (value - mean).powi(2)).sum::<f64>() / count;
    let deviation = variance.sqrt();
    if deviation == 0.0 {
        return None;
    }
    series
        .iter()
        .map(|(label, value)| (label, value, (value - mean) / deviation))
        .filter(|(_, _, z)| z.abs() >= OUTLIER_Z)
        .max_by(|left, right| left.2.abs().partial_cmp(&right.2.abs()).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(label, value, z)| Observation {
            kind: ObservationKind::Outlier,
            text: format!(
                "{label} stands out at {} ({:.1} standard deviations {} the mean).",
                format_number(*value),
                z.abs(),
                if z > 0.0 { "above" } else { "below" }
            ),
        })
}

fn truncation(result: &ResultSet) -> Option<Observation> {
    result.truncated.then(|| Observation {
        kind: ObservationKind::Truncation,
        text: format!(
            "Only the first {} rows were returned, so totals may be incomplete.",
            result.row_count
        ),
    })
}

fn humanize(name: &str) -> String {
    name.replace('_', " ").trim().to_owned()
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub fn format_pct(ratio: f64) -> String {
    format!("{:.1}%", ratio * 100.0)
}

/// Thousands-separated; two decimals unless the value is whole.
pub fn format_number(value: f64) -> String {
    let rounded = (value * 100.0).round() / 100.0;
    let negative = rounded < 0.0;
    let absolute = rounded.abs();
    let whole = absolute.trunc() as u64;
    let digits = whole.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (index, ch) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    let fraction = absolute - absolute.trunc();
    let mut text = if fraction.abs() < 0.005 {
        grouped
    } else {
        format!("{grouped}.{:02}", (fraction * 100.0).round() as u64)
    };
    if negative {
        text.insert(0, '-');
    }
    text
}
