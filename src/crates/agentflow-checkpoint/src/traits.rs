//! Extensible checkpoint storage trait for custom backend implementations
//!
//! This module defines the [`Checkpointer`] trait - the abstraction the
//! agentflow runtime uses to persist execution snapshots. The runtime hands a
//! checkpointer an **opaque, acyclic, plain-JSON** value (the serialized
//! `ExecutionState`); the backend never needs to understand its shape, only
//! store and return it byte-faithfully.
//!
//! Because snapshots are plain data, a checkpoint written by one process can
//! be restored by another: the runtime rebuilds all live wiring (agent
//! client, tool handlers, subscribers) itself, so nothing in the snapshot
//! refers to live objects.
//!
//! # Implementing a backend
//!
//! ```rust,ignore
//! use agentflow_checkpoint::{Checkpointer, CheckpointMeta, SavedCheckpoint, Result};
//! use async_trait::async_trait;
//!
//! struct PostgresCheckpointer { /* pool */ }
//!
//! #[async_trait]
//! impl Checkpointer for PostgresCheckpointer {
//!     async fn save(
//!         &self,
//!         execution_id: &str,
//!         step: u64,
//!         state: serde_json::Value,
//!     ) -> Result<CheckpointMeta> {
//!         // INSERT INTO checkpoints (execution_id, step, payload) VALUES (...)
//!         todo!()
//!     }
//!
//!     async fn load(
//!         &self,
//!         execution_id: &str,
//!         checkpoint_id: Option<&str>,
//!     ) -> Result<Option<SavedCheckpoint>> {
//!         // SELECT payload FROM checkpoints WHERE ... ORDER BY step DESC LIMIT 1
//!         todo!()
//!     }
//!
//!     async fn list(&self, execution_id: &str) -> Result<Vec<CheckpointMeta>> {
//!         todo!()
//!     }
//! }
//! ```

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifying metadata for one stored checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// Unique id of this checkpoint (assigned by the backend on save)
    pub id: String,
    /// The execution this checkpoint belongs to
    pub execution_id: String,
    /// The driver step count at the time of the save
    pub step: u64,
    /// When the checkpoint was written
    pub created_at: DateTime<Utc>,
}

/// A checkpoint as returned by [`Checkpointer::load`]: metadata plus the
/// opaque execution snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedCheckpoint {
    /// Metadata identifying the checkpoint
    pub meta: CheckpointMeta,
    /// The serialized execution state, exactly as it was saved
    pub state: serde_json::Value,
}

/// Storage backend for execution snapshots.
///
/// Implementations must preserve the payload exactly; the runtime relies on
/// a loaded snapshot deserializing back into the same `ExecutionState` that
/// was saved. Checkpoints within one `execution_id` are ordered by `step`;
/// `load` with no explicit id returns the most recent one.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Persist a snapshot for `execution_id` taken at driver step `step`.
    ///
    /// Returns the metadata (including the backend-assigned checkpoint id)
    /// so callers can refer back to this exact snapshot later.
    async fn save(
        &self,
        execution_id: &str,
        step: u64,
        state: serde_json::Value,
    ) -> Result<CheckpointMeta>;

    /// Load a snapshot for `execution_id`.
    ///
    /// With `checkpoint_id = None` the latest checkpoint is returned.
    /// `Ok(None)` means no checkpoint exists for this execution; a missing
    /// *explicit* id is an error ([`CheckpointError::NotFound`]).
    ///
    /// [`CheckpointError::NotFound`]: crate::CheckpointError::NotFound
    async fn load(
        &self,
        execution_id: &str,
        checkpoint_id: Option<&str>,
    ) -> Result<Option<SavedCheckpoint>>;

    /// List checkpoint metadata for `execution_id`, oldest first.
    async fn list(&self, execution_id: &str) -> Result<Vec<CheckpointMeta>>;
}
