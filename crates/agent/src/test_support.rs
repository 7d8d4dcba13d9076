use chrono::NaiveDate;

use crmsight_core::catalog::{SchemaCatalog, DEFAULT_FUZZY_THRESHOLD};
use crmsight_core::domain::intent::{
    Aggregation, AnalyticalIntent, ColumnRef, Dimension, Metric, TimeFilter, TimeRange,
};
use crmsight_db::DemoWarehouseDataset;

pub(crate) fn catalog() -> SchemaCatalog {
    SchemaCatalog::from_json(DemoWarehouseDataset::METADATA_JSON, DEFAULT_FUZZY_THRESHOLD)
        .expect("demo metadata loads")
}

pub(crate) fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 6, 15).expect("valid date")
}

pub(crate) fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid date")
}

pub(crate) fn revenue_by_country() -> AnalyticalIntent {
    AnalyticalIntent {
        question: "revenue by country in 2024".to_owned(),
        anchor_table: "Opportunity".to_owned(),
        metrics: vec![Metric {
            aggregation: Aggregation::Sum,
            column: ColumnRef::new("Opportunity", "Amount"),
            alias: "revenue".to_owned(),
        }],
        dimensions: vec![Dimension {
            column: ColumnRef::new("Account", "BillingCountry"),
            alias: "country".to_owned(),
            grain: None,
        }],
        filters: Vec::new(),
        time_filter: Some(TimeFilter {
            column: ColumnRef::new("Opportunity", "CloseDate"),
            range: TimeRange::new(date(2024, 1, 1), date(2025, 1, 1)).expect("range"),
            phrase: "2024".to_owned(),
        }),
        sort: None,
        limit: None,
    }
}
