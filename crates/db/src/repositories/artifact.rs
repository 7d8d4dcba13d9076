use async_trait::async_trait;
use chrono::Utc;

use crmsight_core::domain::turn::ArtifactRef;
use crmsight_core::store::{artifact_ref, ArtifactStore, StoreError};

use super::RepositoryError;
use crate::DbPool;

/// Content-addressed blobs; writing the same bytes twice keeps one row.
pub struct SqlArtifactStore {
    pool: DbPool,
}

impl SqlArtifactStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn insert(&self, reference: &ArtifactRef, bytes: &[u8]) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO artifacts (content_key, name, media_type, size_bytes, body, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(content_key) DO NOTHING
            "#,
        )
        .bind(&reference.key)
        .bind(&reference.name)
        .bind(&reference.media_type)
        .bind(i64::try_from(reference.size_bytes).unwrap_or(i64::MAX))
        .bind(bytes)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>, RepositoryError> {
        let body: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT body FROM artifacts WHERE content_key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(body)
    }
}

#[async_trait]
impl ArtifactStore for SqlArtifactStore {
    async fn put(
        &self,
        name: &str,
        media_type: &str,
        bytes: Vec<u8>,
    ) -> Result<ArtifactRef, StoreError> {
        let reference = artifact_ref(name, media_type, &bytes);
        self.insert(&reference, &bytes).await?;
        Ok(reference)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.fetch(key).await?)
    }
}

#[cfg(test)]
mod tests {
    use crmsight_core::store::{content_key, ArtifactStore};

    use super::SqlArtifactStore;
    use crate::{connect_with_settings, migrations};

    #[tokio::test]
    async fn put_is_content_addressed_and_idempotent() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("run migrations");
        let store = SqlArtifactStore::new(pool.clone());

        let body = b"country,revenue\nGermany,10\n".to_vec();
        let first = store.put("result.csv", "text/csv", body.clone()).await.expect("put");
        let second = store.put("copy.csv", "text/csv", body.clone()).await.expect("put again");

        assert_eq!(first.key, content_key(&body));
        assert_eq!(first.key, second.key);
        assert_eq!(store.get(&first.key).await.expect("get"), Some(body));
        assert_eq!(store.get("missing").await.expect("get missing"), None);

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM artifacts")
            .fetch_one(&pool)
            .await
            .expect("count");
        assert_eq!(rows, 1);
    }
}
