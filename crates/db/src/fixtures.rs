use sqlx::Executor;

use crate::connection::DbPool;
use crate::repositories::RepositoryError;

/// Expected row counts of the demo warehouse, per table.
const SEED_TABLES: &[SeedTableContract] = &[
    SeedTableContract { table: "SalesRep", crm_object: "User", expected_rows: 6 },
    SeedTableContract { table: "Account", crm_object: "Account", expected_rows: 28 },
    SeedTableContract { table: "Opportunity", crm_object: "Opportunity", expected_rows: 84 },
    SeedTableContract { table: "Lead", crm_object: "Lead", expected_rows: 96 },
    SeedTableContract { table: "SupportCase", crm_object: "Case", expected_rows: 40 },
];

/// Demo CRM warehouse with matching metadata.
///
/// Four billing countries with seven accounts each, opportunities closing
/// across 2024 and 2025, and monthly leads so that top-N-per-group, trend and
/// geography questions have something to answer.
pub struct DemoWarehouseDataset;

impl DemoWarehouseDataset {
    pub const SQL: &str = include_str!("../../../config/fixtures/crm_warehouse.sql");

    /// Metadata document describing the tables in [`Self::SQL`].
    pub const METADATA_JSON: &str = include_str!("../../../config/crm_metadata.json");

    pub async fn load(pool: &DbPool) -> Result<SeedResult, RepositoryError> {
        let mut tx = pool.begin().await?;

        tx.execute(sqlx::query(Self::SQL)).await?;
        tx.commit().await?;

        let tables_seeded = SEED_TABLES
            .iter()
            .map(|table| TableSeedInfo {
                table: table.table,
                crm_object: table.crm_object,
                rows: table.expected_rows,
            })
            .collect::<Vec<_>>();

        tracing::info!(
            event_name = "warehouse.seeded",
            tables = tables_seeded.len(),
            "demo CRM warehouse loaded"
        );
        Ok(SeedResult { tables_seeded })
    }

    pub async fn verify(pool: &DbPool) -> Result<VerificationResult, RepositoryError> {
        let mut checks = Vec::new();

        for table in SEED_TABLES {
            let exists: i64 = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            )
            .bind(table.table)
            .fetch_one(pool)
            .await?;
            if exists != 1 {
                checks.push((table.table, false));
                continue;
            }

            let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(1) FROM \"{}\"", table.table))
                .fetch_one(pool)
                .await?;
            checks.push((table.table, count == table.expected_rows));
        }

        let orphaned: i64 = sqlx::query_scalar(
            "SELECT COUNT(1) FROM Opportunity o LEFT JOIN Account a ON o.AccountId = a.Id WHERE a.Id IS NULL",
        )
        .fetch_one(pool)
        .await
        .unwrap_or(-1);
        checks.push(("opportunity-accounts", orphaned == 0));

        let all_present = checks.iter().all(|(_, ok)| *ok);
        Ok(VerificationResult { all_present, checks })
    }

    pub async fn clean(pool: &DbPool) -> Result<(), RepositoryError> {
        let mut tx = pool.begin().await?;
        for table in SEED_TABLES.iter().rev() {
            sqlx::query(&format!("DROP TABLE IF EXISTS \"{}\"", table.table))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct SeedTableContract {
    table: &'static str,
    crm_object: &'static str,
    expected_rows: i64,
}

#[derive(Debug)]
pub struct SeedResult {
    pub tables_seeded: Vec<TableSeedInfo>,
}

#[derive(Debug)]
pub struct TableSeedInfo {
    pub table: &'static str,
    pub crm_object: &'static str,
    pub rows: i64,
}

#[derive(Debug)]
pub struct VerificationResult {
    pub all_present: bool,
    pub checks: Vec<(&'static str, bool)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect_warehouse_writer;

    #[test]
    fn sql_fixture_is_valid() {
        assert!(!DemoWarehouseDataset::SQL.is_empty());
        assert!(DemoWarehouseDataset::METADATA_JSON.trim_start().starts_with('{'));
    }

    #[tokio::test]
    async fn verify_seed_contract_and_idempotency() {
        let pool = connect_warehouse_writer("sqlite::memory:", 5).await.expect("connect");

        let first = DemoWarehouseDataset::load(&pool).await.expect("load seed fixtures");
        let first_verification =
            DemoWarehouseDataset::verify(&pool).await.expect("verify seed fixtures");
        assert!(first_verification.all_present, "{:?}", first_verification.checks);
        assert_eq!(first.tables_seeded.len(), 5);

        DemoWarehouseDataset::load(&pool).await.expect("reload seed fixtures");
        let second_verification =
            DemoWarehouseDataset::verify(&pool).await.expect("re-verify seed fixtures");
        assert!(second_verification.all_present);
        assert_eq!(first_verification.checks, second_verification.checks);
    }

    #[tokio::test]
    async fn clean_removes_every_seeded_table() {
        let pool = connect_warehouse_writer("sqlite::memory:", 5).await.expect("connect");
        DemoWarehouseDataset::load(&pool).await.expect("load");
        DemoWarehouseDataset::clean(&pool).await.expect("clean");

        let verification = DemoWarehouseDataset::verify(&pool).await.expect("verify");
        assert!(!verification.all_present);
    }

    #[tokio::test]
    async fn every_country_has_more_accounts_than_a_top_five() {
        let pool = connect_warehouse_writer("sqlite::memory:", 5).await.expect("connect");
        DemoWarehouseDataset::load(&pool).await.expect("load");

        let smallest: i64 = sqlx::query_scalar(
            "SELECT MIN(n) FROM (SELECT COUNT(*) AS n FROM Account GROUP BY BillingCountry)",
        )
        .fetch_one(&pool)
        .await
        .expect("count accounts");
        assert!(smallest > 5);
    }
}
