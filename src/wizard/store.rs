// Run storage capability
// A per-session durable key/value slot surviving across requests; the
// in-memory backend serializes runs exactly as a real session store would

use super::run::WizardRun;
use crate::storage::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Trait for storing wizard runs keyed by session id.
/// Concurrent writers race as last-write-wins; a run has one owner.
#[async_trait]
pub trait RunStorage: Send + Sync {
    async fn load(&self, session_id: &str) -> Result<Option<WizardRun>, StoreError>;

    async fn save(&self, session_id: &str, run: &WizardRun) -> Result<(), StoreError>;

    async fn delete(&self, session_id: &str) -> Result<(), StoreError>;
}

/// In-memory run storage.
/// Stores serialized runs so the serialization boundary is exercised the
/// same way a cookie- or redis-backed session store would.
pub struct MemoryRunStorage {
    runs: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryRunStorage {
    pub fn new() -> Self {
        Self {
            runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for MemoryRunStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunStorage for MemoryRunStorage {
    async fn load(&self, session_id: &str) -> Result<Option<WizardRun>, StoreError> {
        let runs = self.runs.read().await;

        match runs.get(session_id) {
            Some(serialized) => {
                let run = serde_json::from_str(serialized)
                    .map_err(|e| StoreError::InvalidData(format!("Corrupt run state: {}", e)))?;
                Ok(Some(run))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, session_id: &str, run: &WizardRun) -> Result<(), StoreError> {
        let serialized = serde_json::to_string(run)
            .map_err(|e| StoreError::InvalidData(format!("Unserializable run state: {}", e)))?;

        let mut runs = self.runs.write().await;
        runs.insert(session_id.to_string(), serialized);
        debug!("Saved run {} for session {}", run.id, session_id);
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        let mut runs = self.runs.write().await;
        runs.remove(session_id);
        debug!("Deleted run for session {}", session_id);
        Ok(())
    }
}
