use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};

use crmsight_core::catalog::{SchemaCatalog, DEFAULT_FUZZY_THRESHOLD};

type SeedContractTestResult<T = ()> = Result<T, String>;

macro_rules! require {
    ($cond:expr) => {
        if !$cond {
            return Err(format!("assertion failed: `{}`", stringify!($cond)));
        }
    };
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            return Err(format!($($arg)*));
        }
    };
}

macro_rules! require_eq {
    ($left:expr, $right:expr) => {
        if $left != $right {
            return Err(format!(
                "assertion failed: `left == right` (`{:?}` != `{:?}`)",
                $left,
                $right
            ));
        }
    };
    ($left:expr, $right:expr, $($arg:tt)*) => {
        if $left != $right {
            return Err(format!($($arg)*));
        }
    };
}

const FIXTURE_SQL: &str = include_str!("../../../config/fixtures/crm_warehouse.sql");
const METADATA_JSON: &str = include_str!("../../../config/crm_metadata.json");

#[derive(Debug, Deserialize)]
struct TableContract {
    salesforce_name: String,
    #[serde(default)]
    synonyms: Vec<String>,
    columns: BTreeMap<String, ColumnContract>,
}

#[derive(Debug, Deserialize)]
struct ColumnContract {
    field_type: String,
    #[serde(default)]
    reference: Option<ReferenceContract>,
    #[serde(default)]
    possible_values: Vec<PossibleValueContract>,
}

#[derive(Debug, Deserialize)]
struct ReferenceContract {
    refers_to: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PossibleValueContract {
    value: String,
}

fn metadata() -> SeedContractTestResult<BTreeMap<String, TableContract>> {
    serde_json::from_str(METADATA_JSON).map_err(|error| format!("metadata JSON must parse: {error}"))
}

/// Body of `CREATE TABLE IF NOT EXISTS <table> (...)` in the fixture.
fn create_table_body(table: &str) -> SeedContractTestResult<&'static str> {
    let header = format!("CREATE TABLE IF NOT EXISTS {table} (");
    let start = FIXTURE_SQL
        .find(&header)
        .ok_or_else(|| format!("fixture should create table {table}"))?
        + header.len();
    let end = FIXTURE_SQL[start..]
        .find(");")
        .ok_or_else(|| format!("create statement for {table} should be terminated"))?;
    Ok(&FIXTURE_SQL[start..start + end])
}

#[test]
fn metadata_tables_and_columns_exist_in_the_warehouse_fixture() -> SeedContractTestResult {
    let tables = metadata()?;
    require_eq!(tables.len(), 5, "metadata should describe five warehouse tables");

    for (table, contract) in &tables {
        require!(!contract.salesforce_name.is_empty(), "{table} should name its CRM object");
        let body = create_table_body(table)?;
        for column in contract.columns.keys() {
            require!(
                body.lines().any(|line| line.trim_start().starts_with(&format!("{column} "))),
                "fixture table {table} should declare column {column}"
            );
        }
        require!(
            FIXTURE_SQL.contains(&format!("INSERT OR REPLACE INTO {table} (")),
            "fixture should seed rows into {table}"
        );
    }
    Ok(())
}

#[test]
fn references_point_at_known_tables() -> SeedContractTestResult {
    let tables = metadata()?;
    let known: HashSet<&str> = tables.keys().map(String::as_str).collect();

    for (table, contract) in &tables {
        for (column, spec) in &contract.columns {
            let Some(reference) = &spec.reference else {
                continue;
            };
            require_eq!(spec.field_type, "reference", "{table}.{column} should be a reference");
            for target in &reference.refers_to {
                require!(
                    known.contains(target.as_str()),
                    "{table}.{column} refers to unknown table {target}"
                );
            }
        }
    }
    Ok(())
}

#[test]
fn reserved_crm_object_names_are_renamed() -> SeedContractTestResult {
    let tables = metadata()?;
    for reserved in ["User", "Case"] {
        require!(
            !tables.contains_key(reserved),
            "physical table {reserved} collides with a SQL keyword"
        );
        require!(
            tables.values().any(|table| table.salesforce_name == reserved),
            "CRM object {reserved} should still be described"
        );
    }
    Ok(())
}

#[test]
fn seeded_countries_are_declared_possible_values() -> SeedContractTestResult {
    let tables = metadata()?;
    let account = tables.get("Account").ok_or("Account should be described")?;
    let country = account.columns.get("BillingCountry").ok_or("BillingCountry should exist")?;
    let declared: HashSet<&str> =
        country.possible_values.iter().map(|value| value.value.as_str()).collect();

    for seeded in ["United States", "Germany", "Japan", "United Kingdom"] {
        require!(FIXTURE_SQL.contains(&format!("'{seeded}'")), "fixture should seed {seeded}");
        require!(declared.contains(seeded), "{seeded} should be a declared possible value");
    }
    require!(
        account.synonyms.iter().any(|synonym| synonym == "customer"),
        "accounts should answer to `customer`"
    );
    Ok(())
}

#[test]
fn catalog_builds_join_paths_over_the_demo_metadata() -> SeedContractTestResult {
    let catalog = SchemaCatalog::from_json(METADATA_JSON, DEFAULT_FUZZY_THRESHOLD)
        .map_err(|error| format!("catalog should load: {error}"))?;
    require_eq!(catalog.len(), 5);

    let path = catalog
        .join_path("Opportunity", "Account")
        .map_err(|error| format!("opportunities should reach accounts: {error}"))?;
    require_eq!(path.len(), 1);
    require_eq!(path[0].from_column, "AccountId");

    let inferred = catalog
        .join_path("SupportCase", "Account")
        .map_err(|error| format!("cases should reach accounts: {error}"))?;
    require_eq!(inferred.len(), 1);
    Ok(())
}
