//! Execution state - the single shared resource of the runtime.
//!
//! [`ExecutionState`] is a versioned, acyclic, plain-data value: the graph
//! snapshot, every execution path, the committed context values, barrier
//! bookkeeping, limits, and (between turns) one serialized agent
//! conversation. The driver never mutates a state it was given; each tick
//! clones the value, edits the clone, and returns it. `Arc`-shared
//! substructures make that cheap - an untouched path in the new state is
//! pointer-identical to the old one, which the immutability tests rely on.
//!
//! Nothing in here refers to live objects (no callbacks, no channels, no
//! clients), so a state serializes to plain JSON and can be checkpointed and
//! resumed across process boundaries.

use crate::context;
use crate::error::{FlowError, Result};
use crate::graph::GraphSnapshot;
use crate::turn::TurnState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Version stamp written into every state for forward-compatible
/// checkpoint decoding.
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Lifecycle of one execution path.
///
/// A path only moves between `Active` and `Waiting` until it reaches a
/// terminal status; terminal statuses never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathStatus {
    /// Advancing through the graph
    Active,
    /// Parked at a barrier
    Waiting,
    /// Reached an end node, handed off work, or merged at a barrier
    Completed,
    /// Downgraded by a per-path error; see [`Path::failure`]
    Failed,
    /// Cancelled by the caller
    Cancelled,
}

impl PathStatus {
    /// Completed, failed, or cancelled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PathStatus::Completed | PathStatus::Failed | PathStatus::Cancelled
        )
    }

    /// Active or waiting.
    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }
}

/// Why a transition (or spawn) happened; recorded into path history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    /// Initial placement at a start node
    Start,
    /// `@auto` or a true simple condition
    Automatic,
    /// The agent invoked a transition tool
    Agent,
    /// `@parallel` fork
    Parallel,
    /// Released from a barrier
    BarrierRelease,
    /// `@map` fan-out spawn
    MapFanOut,
    /// `@async` spawn (automatic or agent-invoked)
    AsyncSpawn,
}

/// One entry of a path's transition history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// Where the work came from: the node the path left, or the origin
    /// path for spawns (empty for initial placement)
    pub from: String,
    /// Node the path arrived at
    pub to: String,
    /// Global driver step count when this happened
    pub step: u64,
    /// What caused it
    pub reason: TransitionReason,
}

/// Fan-out bookkeeping stamped onto paths spawned by `@map`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapContext {
    /// The path whose evaluation spawned this one
    pub source_path: String,
    /// The qualified field the array came from (`Items.pending`)
    pub source_expression: String,
    /// This path's array element
    pub item: Value,
    /// This path's array index
    pub index: usize,
    /// Group id, when the `@map` declared one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

/// One independent execution thread through the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Path {
    /// Sequential id (`path_0`, `path_1`, ...); sequential so replays are
    /// deterministic
    pub id: String,

    /// Node the path currently sits at
    pub current_node: String,

    /// Lifecycle status
    pub status: PathStatus,

    /// Transition history, oldest first
    pub history: Vec<TransitionRecord>,

    /// Units of work this path has consumed
    pub step_count: u64,

    /// Per-node visit counts
    pub node_visits: BTreeMap<String, u32>,

    /// Agent rounds completed at the current node; reset on every
    /// transition. Guards the agent-before-transition invariant.
    pub agent_rounds: u32,

    /// Present on paths spawned by `@map`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_context: Option<MapContext>,

    /// Failure reason once status is `Failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl Path {
    /// Create a path at `node` with a spawn record.
    pub fn spawned(
        id: impl Into<String>,
        node: impl Into<String>,
        from: impl Into<String>,
        step: u64,
        reason: TransitionReason,
    ) -> Self {
        let node = node.into();
        let mut node_visits = BTreeMap::new();
        node_visits.insert(node.clone(), 1);
        Self {
            id: id.into(),
            current_node: node.clone(),
            status: PathStatus::Active,
            history: vec![TransitionRecord {
                from: from.into(),
                to: node,
                step,
                reason,
            }],
            step_count: 0,
            node_visits,
            agent_rounds: 0,
            map_context: None,
            failure: None,
        }
    }

    /// Move the path to `node`, recording the transition.
    pub fn enter(&mut self, node: impl Into<String>, step: u64, reason: TransitionReason) {
        let node = node.into();
        self.history.push(TransitionRecord {
            from: self.current_node.clone(),
            to: node.clone(),
            step,
            reason,
        });
        *self.node_visits.entry(node.clone()).or_insert(0) += 1;
        self.current_node = node;
        self.agent_rounds = 0;
    }

    /// Visit count for a node.
    pub fn visits(&self, node: &str) -> u32 {
        self.node_visits.get(node).copied().unwrap_or(0)
    }

    /// Downgrade to `Failed` with a reason. Terminal statuses stick.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = PathStatus::Failed;
        self.failure = Some(reason.into());
    }

    /// Set a non-failure status. Terminal statuses stick.
    pub fn set_status(&mut self, status: PathStatus) {
        if !self.status.is_terminal() {
            self.status = status;
        }
    }
}

/// Whether a released barrier merges its arrivals or lets each continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarrierMode {
    /// All arrivals complete; one merged path continues
    #[default]
    Merge,
    /// Every arrival continues independently
    All,
}

/// Bookkeeping for one named barrier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BarrierState {
    /// Path ids that must arrive before release
    pub required_paths: BTreeSet<String>,

    /// Fan-out groups that must fully arrive before release
    pub required_groups: BTreeSet<String>,

    /// Arrivals so far: path id → node the path continues at after release
    pub waiting: BTreeMap<String, String>,

    /// Group membership declared at arrival via `@barrier(name, group)`,
    /// complementing membership implied by map fan-out groups
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub group_arrivals: BTreeMap<String, BTreeSet<String>>,

    /// Release behavior
    pub mode: BarrierMode,

    /// Set on release; a barrier releases exactly once
    pub released: bool,
}

/// Execution budgets. Exceeding a per-path budget fails that path only.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    /// Max units of work per path
    pub max_steps: u64,

    /// Max agent turns per node visit (overridable per node)
    pub max_turns: u32,

    /// Max total paths per execution
    pub max_paths: usize,

    /// Wall-clock budget for `execute`. `None` keeps the driver off the
    /// clock entirely, which is what makes replays bit-identical.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_steps: 200,
            max_turns: 8,
            max_paths: 64,
            timeout_ms: None,
        }
    }
}

/// Run-level counters and identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    /// Stable id for this execution (checkpoint key)
    pub execution_id: String,

    /// Driver ticks so far; monotonic
    pub step_count: u64,

    /// When the state was built
    pub started_at: DateTime<Utc>,

    /// Elapsed wall-clock ms; only advanced when a timeout is configured
    pub elapsed_ms: u64,

    /// Paths downgraded to `Failed` so far; monotonic
    pub error_count: u64,
}

/// The complete, immutable execution state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    /// Checkpoint decoding version
    pub schema_version: u32,

    /// The workflow definition this execution runs
    pub snapshot: Arc<GraphSnapshot>,

    /// All paths ever created, in creation order (never removed)
    pub paths: Vec<Arc<Path>>,

    /// Committed context values: context name → field → value. The sole
    /// source of truth for runtime variables.
    pub context_state: BTreeMap<String, BTreeMap<String, Value>>,

    /// Barrier bookkeeping by name
    pub barriers: BTreeMap<String, BarrierState>,

    /// Execution budgets
    pub limits: Limits,

    /// Run-level counters
    pub metadata: ExecutionMetadata,

    /// The in-flight agent conversation, when stepping turn-by-turn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_state: Option<TurnState>,
}

impl ExecutionState {
    /// Start building a state for a snapshot.
    pub fn builder(snapshot: GraphSnapshot) -> ExecutionStateBuilder {
        ExecutionStateBuilder::new(snapshot)
    }

    /// Look up a path by id.
    pub fn path(&self, id: &str) -> Option<&Path> {
        self.paths.iter().find(|p| p.id == id).map(Arc::as_ref)
    }

    fn path_index(&self, id: &str) -> Result<usize> {
        self.paths
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| FlowError::structural(format!("unknown path '{}'", id)))
    }

    /// Apply an edit to one path, replacing its `Arc`. Sibling paths keep
    /// their shared allocations.
    pub fn update_path(&mut self, id: &str, edit: impl FnOnce(&mut Path)) -> Result<()> {
        let idx = self.path_index(id)?;
        let mut path = (*self.paths[idx]).clone();
        edit(&mut path);
        self.paths[idx] = Arc::new(path);
        Ok(())
    }

    /// Append a freshly spawned path, enforcing the path budget.
    pub fn append_path(&mut self, path: Path) -> Result<()> {
        if self.paths.len() >= self.limits.max_paths {
            return Err(FlowError::limit("paths", self.limits.max_paths as u64));
        }
        self.paths.push(Arc::new(path));
        Ok(())
    }

    /// Next sequential path id. Paths are never removed, so the length is a
    /// stable counter.
    pub fn next_path_id(&self) -> String {
        format!("path_{}", self.paths.len())
    }

    /// Ids of active paths, in creation order.
    pub fn active_path_ids(&self) -> Vec<String> {
        self.paths
            .iter()
            .filter(|p| p.status == PathStatus::Active)
            .map(|p| p.id.clone())
            .collect()
    }

    /// Ids of failed paths with their reasons.
    pub fn failed_paths(&self) -> Vec<(String, String)> {
        self.paths
            .iter()
            .filter(|p| p.status == PathStatus::Failed)
            .map(|p| {
                (
                    p.id.clone(),
                    p.failure.clone().unwrap_or_else(|| "unknown".to_string()),
                )
            })
            .collect()
    }

    /// Whether a barrier's requirements are fully covered right now.
    ///
    /// Direct requirements: every required path id has arrived. Group
    /// requirements: the group has at least one arrival and no live member
    /// still on its way.
    pub fn barrier_ready(&self, name: &str) -> bool {
        let Some(barrier) = self.barriers.get(name) else {
            return false;
        };
        if barrier.released {
            return false;
        }
        if barrier.required_paths.is_empty() && barrier.required_groups.is_empty() {
            return false;
        }

        let direct_ok = barrier
            .required_paths
            .iter()
            .all(|p| barrier.waiting.contains_key(p));

        let groups_ok = barrier.required_groups.iter().all(|group| {
            // Members come from map fan-out group stamps and from arrivals
            // that declared the group on their barrier edge.
            let map_members: Vec<&Arc<Path>> = self
                .paths
                .iter()
                .filter(|p| {
                    p.map_context
                        .as_ref()
                        .map(|m| m.group.as_deref() == Some(group.as_str()))
                        .unwrap_or(false)
                })
                .collect();
            let declared = barrier.group_arrivals.get(group);
            let any_arrived = map_members
                .iter()
                .any(|m| barrier.waiting.contains_key(&m.id))
                || declared.map(|d| !d.is_empty()).unwrap_or(false);
            let none_pending = map_members
                .iter()
                .all(|m| barrier.waiting.contains_key(&m.id) || m.status.is_terminal());
            any_arrived && none_pending
        });

        direct_ok && groups_ok
    }

    /// Barriers whose requirements are covered, by name.
    pub fn releasable_barriers(&self) -> Vec<String> {
        self.barriers
            .keys()
            .filter(|name| self.barrier_ready(name))
            .cloned()
            .collect()
    }

    /// True when nothing can advance anymore: no active path, no pending
    /// conversation, no barrier that could release.
    pub fn is_complete(&self) -> bool {
        self.active_path_ids().is_empty()
            && self.turn_state.is_none()
            && self.releasable_barriers().is_empty()
    }

    /// Serialize for checkpointing.
    pub fn to_checkpoint(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Restore from a checkpoint payload.
    pub fn from_checkpoint(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

/// Builds the initial [`ExecutionState`] for a snapshot: validates the
/// graph, initializes context values, places one active path per start
/// node, and configures barriers.
pub struct ExecutionStateBuilder {
    snapshot: GraphSnapshot,
    limits: Limits,
    execution_id: Option<String>,
    barriers: BTreeMap<String, BarrierState>,
}

impl ExecutionStateBuilder {
    /// Create a builder.
    pub fn new(snapshot: GraphSnapshot) -> Self {
        Self {
            snapshot,
            limits: Limits::default(),
            execution_id: None,
            barriers: BTreeMap::new(),
        }
    }

    /// Override the default limits.
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Pin the execution id (useful for deterministic replays and
    /// checkpoint keys). Defaults to a fresh UUID.
    pub fn with_execution_id(mut self, id: impl Into<String>) -> Self {
        self.execution_id = Some(id.into());
        self
    }

    /// Declare a barrier's requirements programmatically. Also derivable
    /// from graph attributes; see [`ExecutionStateBuilder::build`].
    pub fn with_barrier(
        mut self,
        name: impl Into<String>,
        required_paths: Vec<String>,
        required_groups: Vec<String>,
        mode: BarrierMode,
    ) -> Self {
        self.barriers.insert(
            name.into(),
            BarrierState {
                required_paths: required_paths.into_iter().collect(),
                required_groups: required_groups.into_iter().collect(),
                waiting: BTreeMap::new(),
                group_arrivals: BTreeMap::new(),
                mode,
                released: false,
            },
        );
        self
    }

    /// Validate and build the initial state.
    ///
    /// Barrier requirements come from two places, builder declarations
    /// winning over graph-derived ones. For every `@barrier(name)` edge the
    /// target node's attributes are consulted: `required_paths` (array or
    /// comma-separated string), `required_groups`, and `barrier_mode`
    /// (`"merge"` or `"all"`).
    pub fn build(self) -> Result<ExecutionState> {
        self.snapshot.validate()?;

        let context_state = context::initial_context_state(&self.snapshot);

        let mut barriers = self.barriers;
        for edge in self.snapshot.edges() {
            let Some((name, _group)) = edge.barrier() else {
                continue;
            };
            if barriers.contains_key(name) {
                continue;
            }
            let mut barrier = BarrierState::default();
            if let Some(target) = self.snapshot.node(&edge.target) {
                barrier.required_paths = string_set(target.attr("required_paths"));
                barrier.required_groups = string_set(target.attr("required_groups"));
                if target.attr_str("barrier_mode") == Some("all") {
                    barrier.mode = BarrierMode::All;
                }
            }
            barriers.insert(name.to_string(), barrier);
        }

        let mut paths = Vec::new();
        for (i, start) in self.snapshot.start_nodes().into_iter().enumerate() {
            paths.push(Arc::new(Path::spawned(
                format!("path_{}", i),
                &start.name,
                "",
                0,
                TransitionReason::Start,
            )));
        }

        Ok(ExecutionState {
            schema_version: STATE_SCHEMA_VERSION,
            snapshot: Arc::new(self.snapshot),
            paths,
            context_state,
            barriers,
            limits: self.limits,
            metadata: ExecutionMetadata {
                execution_id: self
                    .execution_id
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                step_count: 0,
                started_at: Utc::now(),
                elapsed_ms: 0,
                error_count: 0,
            },
            turn_state: None,
        })
    }
}

fn string_set(value: Option<&Value>) -> BTreeSet<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect(),
        _ => BTreeSet::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Edge, EdgeAnnotation, Node, NodeKind};
    use serde_json::json;

    fn two_start_snapshot() -> GraphSnapshot {
        GraphSnapshot::new(
            vec![
                Node::new("a", NodeKind::Start),
                Node::new("b", NodeKind::Start),
                Node::new("join", NodeKind::Task)
                    .with_attribute("required_paths", json!(["path_0", "path_1"])),
                Node::new("done", NodeKind::End),
            ],
            vec![
                Edge::new("a", "join").with_annotation(EdgeAnnotation::Barrier {
                    name: "sync".into(),
                    group: None,
                }),
                Edge::new("b", "join").with_annotation(EdgeAnnotation::Barrier {
                    name: "sync".into(),
                    group: None,
                }),
                Edge::new("join", "done"),
            ],
        )
    }

    #[test]
    fn test_build_places_one_path_per_start() {
        let state = ExecutionState::builder(two_start_snapshot()).build().unwrap();
        assert_eq!(state.paths.len(), 2);
        assert_eq!(state.paths[0].id, "path_0");
        assert_eq!(state.paths[0].current_node, "a");
        assert_eq!(state.paths[1].current_node, "b");
        assert_eq!(state.schema_version, STATE_SCHEMA_VERSION);
    }

    #[test]
    fn test_build_derives_barrier_from_attributes() {
        let state = ExecutionState::builder(two_start_snapshot()).build().unwrap();
        let barrier = state.barriers.get("sync").unwrap();
        assert_eq!(barrier.required_paths.len(), 2);
        assert!(barrier.required_paths.contains("path_0"));
        assert_eq!(barrier.mode, BarrierMode::Merge);
    }

    #[test]
    fn test_update_path_preserves_sibling_arcs() {
        let state = ExecutionState::builder(two_start_snapshot()).build().unwrap();
        let mut next = state.clone();
        next.update_path("path_0", |p| p.step_count += 1).unwrap();

        assert_eq!(state.paths[0].step_count, 0);
        assert!(Arc::ptr_eq(&state.paths[1], &next.paths[1]));
        assert!(!Arc::ptr_eq(&state.paths[0], &next.paths[0]));
    }

    #[test]
    fn test_append_path_enforces_budget() {
        let mut state = ExecutionState::builder(two_start_snapshot())
            .with_limits(Limits {
                max_paths: 2,
                ..Limits::default()
            })
            .build()
            .unwrap();
        let p = Path::spawned("path_2", "a", "", 0, TransitionReason::Start);
        assert!(matches!(
            state.append_path(p),
            Err(FlowError::LimitExceeded { .. })
        ));
    }

    #[test]
    fn test_barrier_ready_requires_full_coverage() {
        let mut state = ExecutionState::builder(two_start_snapshot()).build().unwrap();
        assert!(!state.barrier_ready("sync"));

        state
            .barriers
            .get_mut("sync")
            .unwrap()
            .waiting
            .insert("path_0".into(), "join".into());
        assert!(!state.barrier_ready("sync"));

        state
            .barriers
            .get_mut("sync")
            .unwrap()
            .waiting
            .insert("path_1".into(), "join".into());
        assert!(state.barrier_ready("sync"));

        state.barriers.get_mut("sync").unwrap().released = true;
        assert!(!state.barrier_ready("sync"));
    }

    #[test]
    fn test_terminal_status_sticks() {
        let mut p = Path::spawned("path_0", "a", "", 0, TransitionReason::Start);
        p.fail("boom");
        p.set_status(PathStatus::Active);
        assert_eq!(p.status, PathStatus::Failed);
        p.fail("again");
        assert_eq!(p.failure.as_deref(), Some("boom"));
    }

    #[test]
    fn test_enter_resets_agent_rounds_and_counts_visits() {
        let mut p = Path::spawned("path_0", "a", "", 0, TransitionReason::Start);
        p.agent_rounds = 2;
        p.enter("b", 1, TransitionReason::Automatic);
        assert_eq!(p.agent_rounds, 0);
        assert_eq!(p.visits("b"), 1);
        assert_eq!(p.history.len(), 2);
        assert_eq!(p.history[1].reason, TransitionReason::Automatic);
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let state = ExecutionState::builder(two_start_snapshot())
            .with_execution_id("exec-test")
            .build()
            .unwrap();
        let payload = state.to_checkpoint().unwrap();
        let restored = ExecutionState::from_checkpoint(payload).unwrap();

        assert_eq!(restored.metadata.execution_id, "exec-test");
        assert_eq!(restored.paths.len(), state.paths.len());
        assert_eq!(restored.snapshot.nodes().len(), state.snapshot.nodes().len());
    }
}
