//! Persistence seams for session history and large turn artifacts.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::turn::{ArtifactRef, SessionContext, SessionId, TurnRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("turn {sequence} already exists for session `{session_id}`")]
    DuplicateTurn { session_id: String, sequence: u32 },
}

/// Append-only turn history keyed by session id.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Returns `None` for a session that has never been written.
    async fn load(&self, session_id: &SessionId) -> Result<Option<SessionContext>, StoreError>;

    /// Appends `record` and replaces the rolling summary.
    async fn append_turn(
        &self,
        session_id: &SessionId,
        record: &TurnRecord,
        summary: &str,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put(
        &self,
        name: &str,
        media_type: &str,
        bytes: Vec<u8>,
    ) -> Result<ArtifactRef, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
}

/// blake3 hex digest; identical content always maps to the same key.
pub fn content_key(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

pub fn artifact_ref(name: &str, media_type: &str, bytes: &[u8]) -> ArtifactRef {
    ArtifactRef {
        key: content_key(bytes),
        name: name.to_owned(),
        media_type: media_type.to_owned(),
        size_bytes: bytes.len() as u64,
    }
}
