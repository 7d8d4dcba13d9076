use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

pub type DbPool = sqlx::SqlitePool;

pub async fn connect(database_url: &str) -> Result<DbPool, sqlx::Error> {
    connect_with_settings(database_url, 5, 30).await
}

pub async fn connect_with_settings(
    database_url: &str,
    max_connections: u32,
    timeout_secs: u64,
) -> Result<DbPool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(timeout_secs.max(1)))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                sqlx::query("PRAGMA busy_timeout = 5000").execute(&mut *conn).await?;
                Ok(())
            })
        })
        .connect_with(options)
        .await
}

/// Writable warehouse pool used only for seeding. Rollback journaling keeps the
/// file openable by [`connect_read_only`] once the writer closes.
pub async fn connect_warehouse_writer(
    database_url: &str,
    timeout_secs: u64,
) -> Result<DbPool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    SqlitePoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(timeout_secs.max(1)))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("PRAGMA journal_mode = DELETE").execute(&mut *conn).await?;
                sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                Ok(())
            })
        })
        .connect_with(options)
        .await
}

/// Pool for the analytics warehouse. The file is opened read-only and every
/// connection additionally runs with `query_only`, so writes fail at the engine.
pub async fn connect_read_only(
    database_url: &str,
    max_connections: u32,
    timeout_secs: u64,
) -> Result<DbPool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?.read_only(true);
    SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(timeout_secs.max(1)))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("PRAGMA query_only = ON").execute(&mut *conn).await?;
                sqlx::query("PRAGMA busy_timeout = 5000").execute(&mut *conn).await?;
                Ok(())
            })
        })
        .connect_with(options)
        .await
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::{connect_read_only, connect_warehouse_writer};

    #[tokio::test]
    async fn read_only_pool_rejects_writes() {
        let dir = TempDir::new().expect("temp dir");
        let url = format!("sqlite://{}", dir.path().join("warehouse.db").display());

        let writable = connect_warehouse_writer(&url, 5).await.expect("writable pool");
        sqlx::query("CREATE TABLE Account (Id TEXT PRIMARY KEY, Name TEXT)")
            .execute(&writable)
            .await
            .expect("create table");
        sqlx::query("INSERT INTO Account (Id, Name) VALUES ('001', 'Acme')")
            .execute(&writable)
            .await
            .expect("insert row");
        writable.close().await;

        let pool = connect_read_only(&url, 1, 5).await.expect("read-only pool");
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM Account")
            .fetch_one(&pool)
            .await
            .expect("read works");
        assert_eq!(count, 1);

        let write = sqlx::query("DELETE FROM Account").execute(&pool).await;
        assert!(write.is_err(), "writes must fail on the read-only pool");
        pool.close().await;
    }
}
