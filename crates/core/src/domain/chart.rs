use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::domain::result::{ResultSet, Scalar};

pub const VEGA_LITE_SCHEMA: &str = "https://vega.github.io/schema/vega-lite/v4.json";
const MIN_WIDTH: u32 = 1152;
const MIN_HEIGHT: u32 = 648;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartKind {
    Bar,
    GroupedBar,
    Line,
    MultiSeriesLine,
    Scatter,
    Kpi,
}

impl ChartKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bar => "bar",
            Self::GroupedBar => "grouped_bar",
            Self::Line => "line",
            Self::MultiSeriesLine => "multi_series_line",
            Self::Scatter => "scatter",
            Self::Kpi => "kpi",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mark {
    Bar,
    Line,
    Point,
    Text,
}

impl Mark {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bar => "bar",
            Self::Line => "line",
            Self::Point => "point",
            Self::Text => "text",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    X,
    Y,
    Color,
    Text,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::X => "x",
            Self::Y => "y",
            Self::Color => "color",
            Self::Text => "text",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Quantitative,
    Temporal,
    Nominal,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quantitative => "quantitative",
            Self::Temporal => "temporal",
            Self::Nominal => "nominal",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Encoding {
    pub channel: Channel,
    pub field: String,
    pub field_type: FieldType,
}

impl Encoding {
    pub fn new(channel: Channel, field: impl Into<String>, field_type: FieldType) -> Self {
        Self { channel, field: field.into(), field_type }
    }

    fn to_json(&self) -> Value {
        let mut encoding = json!({
            "field": self.field,
            "type": self.field_type.as_str(),
            "title": self.field,
        });
        if self.channel == Channel::X && self.field_type == FieldType::Nominal {
            encoding["sort"] = json!("-y");
        }
        encoding
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartSpec {
    pub kind: ChartKind,
    pub mark: Mark,
    pub title: String,
    /// Several `Y` encodings render as one layer per measure.
    pub encodings: Vec<Encoding>,
    /// Field offered as an interactive drop-down filter.
    pub selection: Option<String>,
}

impl ChartSpec {
    pub fn fields(&self) -> BTreeSet<&str> {
        self.encodings
            .iter()
            .map(|encoding| encoding.field.as_str())
            .chain(self.selection.as_deref())
            .collect()
    }

    pub fn encoding(&self, channel: Channel) -> Option<&Encoding> {
        self.encodings.iter().find(|encoding| encoding.channel == channel)
    }

    pub fn to_vega_lite(&self, data: Option<&ResultSet>) -> Value {
        let mut spec = Map::new();
        spec.insert("$schema".to_owned(), json!(VEGA_LITE_SCHEMA));
        spec.insert("title".to_owned(), json!(self.title));
        spec.insert("width".to_owned(), json!(MIN_WIDTH));
        spec.insert("height".to_owned(), json!(MIN_HEIGHT));
        if let Some(result) = data {
            spec.insert("data".to_owned(), json!({ "values": data_values(result) }));
        }

        let mark = json!({ "type": self.mark.as_str(), "tooltip": true });
        let y_encodings: Vec<&Encoding> =
            self.encodings.iter().filter(|encoding| encoding.channel == Channel::Y).collect();
        let shared: Map<String, Value> = self
            .encodings
            .iter()
            .filter(|encoding| encoding.channel != Channel::Y)
            .map(|encoding| (encoding.channel.as_str().to_owned(), encoding.to_json()))
            .collect();

        if y_encodings.len() > 1 {
            let layers: Vec<Value> = y_encodings
                .iter()
                .map(|y| {
                    let mut encoding = shared.clone();
                    encoding.insert("y".to_owned(), y.to_json());
                    json!({ "mark": mark, "encoding": encoding })
                })
                .collect();
            spec.insert("layer".to_owned(), Value::Array(layers));
        } else {
            let mut encoding = shared;
            if let Some(y) = y_encodings.first() {
                encoding.insert("y".to_owned(), y.to_json());
            }
            spec.insert("mark".to_owned(), mark);
            spec.insert("encoding".to_owned(), Value::Object(encoding));
        }

        if let Some(field) = &self.selection {
            let name = format!("{field}__selection");
            let mut options = vec![Value::Null];
            let mut labels = vec![json!("[All]")];
            if let Some(result) = data {
                for value in distinct_values(result, field) {
                    labels.push(json!(value));
                    options.push(Value::String(value));
                }
            }
            let mut selection = Map::new();
            selection.insert(
                name.clone(),
                json!({
                    "type": "single",
                    "fields": [field],
                    "bind": { "input": "select", "options": options, "labels": labels, "name": field },
                }),
            );
            spec.insert("selection".to_owned(), Value::Object(selection));
            spec.insert("transform".to_owned(), json!([{ "filter": { "selection": name } }]));
        }

        Value::Object(spec)
    }
}

/// Terminal decision of the chart stage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "spec")]
pub enum ChartOutcome {
    Chart(ChartSpec),
    Table,
    NoData,
}

impl ChartOutcome {
    pub fn spec(&self) -> Option<&ChartSpec> {
        match self {
            Self::Chart(spec) => Some(spec),
            Self::Table | Self::NoData => None,
        }
    }
}

fn data_values(result: &ResultSet) -> Vec<Value> {
    result
        .rows
        .iter()
        .map(|row| {
            let record: Map<String, Value> = result
                .columns
                .iter()
                .zip(row)
                .map(|(column, value)| (column.name.clone(), scalar_json(value)))
                .collect();
            Value::Object(record)
        })
        .collect()
}

fn scalar_json(value: &Scalar) -> Value {
    match value {
        Scalar::Null => Value::Null,
        Scalar::Bool(value) => json!(value),
        Scalar::Integer(value) => json!(value),
        Scalar::Float(value) => json!(value),
        Scalar::Text(value) => json!(value),
    }
}

fn distinct_values(result: &ResultSet, field: &str) -> BTreeSet<String> {
    let Some(index) = result.column_index(field) else {
        return BTreeSet::new();
    };
    result
        .rows
        .iter()
        .filter_map(|row| row.get(index))
        .filter(|value| !value.is_null())
        .map(ToString::to_string)
        .collect()
}
