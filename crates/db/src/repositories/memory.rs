use std::collections::HashMap;

use tokio::sync::RwLock;

use crmsight_core::domain::turn::{ArtifactRef, SessionContext, SessionId, TurnRecord};
use crmsight_core::store::{artifact_ref, ArtifactStore, SessionStore, StoreError};

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, SessionContext>>,
}

#[async_trait::async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, session_id: &SessionId) -> Result<Option<SessionContext>, StoreError> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(&session_id.0).cloned())
    }

    async fn append_turn(
        &self,
        session_id: &SessionId,
        record: &TurnRecord,
        summary: &str,
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(session_id.0.clone())
            .or_insert_with(|| SessionContext::new(session_id.clone()));
        if session.turns.iter().any(|turn| turn.sequence == record.sequence) {
            return Err(StoreError::DuplicateTurn {
                session_id: session_id.0.clone(),
                sequence: record.sequence,
            });
        }
        session.turns.push(record.clone());
        session.turns.sort_by_key(|turn| turn.sequence);
        session.summary = summary.to_owned();
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryArtifactStore {
    artifacts: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryArtifactStore {
    pub async fn len(&self) -> usize {
        self.artifacts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.artifacts.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn put(
        &self,
        name: &str,
        media_type: &str,
        bytes: Vec<u8>,
    ) -> Result<ArtifactRef, StoreError> {
        let reference = artifact_ref(name, media_type, &bytes);
        let mut artifacts = self.artifacts.write().await;
        artifacts.entry(reference.key.clone()).or_insert(bytes);
        Ok(reference)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let artifacts = self.artifacts.read().await;
        Ok(artifacts.get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crmsight_core::domain::turn::{SessionId, TurnId, TurnRecord, TurnStatus};
    use crmsight_core::store::{ArtifactStore, SessionStore, StoreError};

    use crate::repositories::{InMemoryArtifactStore, InMemorySessionStore};

    fn record(sequence: u32) -> TurnRecord {
        TurnRecord {
            turn_id: TurnId::generate(),
            session_id: SessionId("S-mem".to_owned()),
            sequence,
            question: "Revenue by country".to_owned(),
            intent: None,
            sql: None,
            result: None,
            chart: None,
            narrative: None,
            status: TurnStatus::Completed,
            reason_code: None,
            user_message: String::new(),
            artifacts: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn in_memory_session_store_round_trip() {
        let store = InMemorySessionStore::default();
        let session_id = SessionId("S-mem".to_owned());
        assert!(store.load(&session_id).await.expect("load").is_none());

        store.append_turn(&session_id, &record(1), "#1 revenue").await.expect("append");
        let loaded = store.load(&session_id).await.expect("load").expect("exists");
        assert_eq!(loaded.turns.len(), 1);
        assert_eq!(loaded.summary, "#1 revenue");

        let duplicate = store.append_turn(&session_id, &record(1), "").await;
        assert!(matches!(duplicate, Err(StoreError::DuplicateTurn { .. })));
    }

    #[tokio::test]
    async fn in_memory_artifact_store_deduplicates_by_content() {
        let store = InMemoryArtifactStore::default();
        let first = store.put("a.md", "text/markdown", b"SELECT 1".to_vec()).await.expect("put");
        let second = store.put("b.md", "text/markdown", b"SELECT 1".to_vec()).await.expect("put");

        assert_eq!(first.key, second.key);
        assert_eq!(store.len().await, 1);
        assert_eq!(store.get(&first.key).await.expect("get"), Some(b"SELECT 1".to_vec()));
    }
}
