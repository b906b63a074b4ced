//! # agentflow-checkpoint - State Persistence for Workflow Executions
//!
//! **Trait-based checkpoint abstractions** for persisting and restoring
//! agentflow execution state. A checkpoint is the runtime's `ExecutionState`
//! serialized to acyclic, plain JSON - no live object graphs, so a snapshot
//! saved by one process can be resumed by another.
//!
//! ## What this crate provides
//!
//! - [`Checkpointer`] - the storage-backend trait (save / load / list)
//! - [`MemoryCheckpointer`] - in-process reference implementation
//! - [`SnapshotSerializer`] - byte-level serialization seam for backends,
//!   with [`JsonSerializer`] and [`BincodeSerializer`] implementations
//!
//! ## What a checkpoint enables
//!
//! - **Pause/resume across processes** - an agent conversation can stop at a
//!   turn boundary, be checkpointed, and continue days later elsewhere
//! - **Deterministic replay** - a snapshot plus recorded agent responses
//!   reproduces the exact same execution
//! - **Inspection** - failed paths keep their full transition history in the
//!   stored state
//!
//! ## Example
//!
//! ```rust,ignore
//! use agentflow_checkpoint::{Checkpointer, MemoryCheckpointer};
//!
//! let cp = MemoryCheckpointer::new();
//!
//! // The runtime serializes ExecutionState to a serde_json::Value.
//! let snapshot = serde_json::to_value(&state)?;
//! cp.save(&state.metadata.execution_id, state.metadata.step_count, snapshot).await?;
//!
//! // Later, possibly in another process:
//! let saved = cp.load(&execution_id, None).await?.expect("checkpoint exists");
//! let state: ExecutionState = serde_json::from_value(saved.state)?;
//! ```

pub mod error;
pub mod memory;
pub mod serializer;
pub mod traits;

pub use error::{CheckpointError, Result};
pub use memory::MemoryCheckpointer;
pub use serializer::{BincodeSerializer, JsonSerializer, SnapshotSerializer};
pub use traits::{CheckpointMeta, Checkpointer, SavedCheckpoint};
