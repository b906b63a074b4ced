//! In-memory checkpointer - the reference [`Checkpointer`] implementation.
//!
//! Useful for tests and single-process runs. Checkpoints live in a map keyed
//! by execution id and are lost when the process exits; for durable storage
//! implement [`Checkpointer`] against a real backend.

use crate::error::{CheckpointError, Result};
use crate::traits::{CheckpointMeta, Checkpointer, SavedCheckpoint};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Stores checkpoints in process memory.
#[derive(Default)]
pub struct MemoryCheckpointer {
    // execution_id -> checkpoints in save order
    store: RwLock<HashMap<String, Vec<SavedCheckpoint>>>,
}

impl MemoryCheckpointer {
    /// Create an empty in-memory checkpointer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of checkpoints held for an execution.
    pub async fn count(&self, execution_id: &str) -> usize {
        self.store
            .read()
            .await
            .get(execution_id)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Checkpointer for MemoryCheckpointer {
    async fn save(
        &self,
        execution_id: &str,
        step: u64,
        state: serde_json::Value,
    ) -> Result<CheckpointMeta> {
        let meta = CheckpointMeta {
            id: uuid::Uuid::new_v4().to_string(),
            execution_id: execution_id.to_string(),
            step,
            created_at: Utc::now(),
        };

        let mut store = self.store.write().await;
        store
            .entry(execution_id.to_string())
            .or_default()
            .push(SavedCheckpoint {
                meta: meta.clone(),
                state,
            });
        Ok(meta)
    }

    async fn load(
        &self,
        execution_id: &str,
        checkpoint_id: Option<&str>,
    ) -> Result<Option<SavedCheckpoint>> {
        let store = self.store.read().await;
        let Some(checkpoints) = store.get(execution_id) else {
            return match checkpoint_id {
                Some(id) => Err(CheckpointError::NotFound(id.to_string())),
                None => Ok(None),
            };
        };

        match checkpoint_id {
            Some(id) => checkpoints
                .iter()
                .find(|c| c.meta.id == id)
                .cloned()
                .map(Some)
                .ok_or_else(|| CheckpointError::NotFound(id.to_string())),
            None => Ok(checkpoints.last().cloned()),
        }
    }

    async fn list(&self, execution_id: &str) -> Result<Vec<CheckpointMeta>> {
        let store = self.store.read().await;
        Ok(store
            .get(execution_id)
            .map(|cs| cs.iter().map(|c| c.meta.clone()).collect())
            .unwrap_or_default())
    }
}
