//! Integration tests for complete workflow executions.
//!
//! These drive the full runtime - evaluator, effect builder/executor, turn
//! executor, state builder - through realistic graphs with a scripted
//! agent, and verify the runtime's observable guarantees: barrier
//! correctness, fan-out counts, prompt precedence, write atomicity,
//! immutability, and determinism.

use agentflow_core::{
    AgentResponse, BarrierMode, Edge, EdgeAnnotation, ExecutionState, FlowRuntime, GraphSnapshot,
    Limits, Node, NodeKind, PathStatus, ScriptedAgent, ToolCall,
};
use serde_json::json;
use std::sync::Arc;

fn runtime_with(responses: Vec<AgentResponse>) -> (FlowRuntime, Arc<ScriptedAgent>) {
    let agent = Arc::new(ScriptedAgent::new(responses));
    let runtime = FlowRuntime::builder(agent.clone()).build();
    (runtime, agent)
}

/// Scenario A: two start nodes converge on a barrier; after both arrive,
/// exactly one merged path continues past the barrier target.
#[tokio::test]
async fn test_two_starts_converge_on_barrier() {
    let snapshot = GraphSnapshot::new(
        vec![
            Node::new("a", NodeKind::Start),
            Node::new("b", NodeKind::Start),
            Node::new("join", NodeKind::Task),
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
            Edge::new("join", "done").with_annotation(EdgeAnnotation::Auto),
        ],
    );
    let state = ExecutionState::builder(snapshot)
        .with_barrier(
            "sync",
            vec!["path_0".into(), "path_1".into()],
            vec![],
            BarrierMode::Merge,
        )
        .build()
        .unwrap();

    let (runtime, _) = runtime_with(vec![]);
    let report = runtime.execute(&state).await.unwrap();

    assert!(report.complete);
    assert!(report.errors.is_empty());

    let final_state = &report.state;
    // Both originals completed at the barrier; exactly one merged path
    // continued through join to done.
    assert_eq!(final_state.paths.len(), 3);
    assert_eq!(final_state.path("path_0").unwrap().status, PathStatus::Completed);
    assert_eq!(final_state.path("path_1").unwrap().status, PathStatus::Completed);
    let merged = final_state.path("path_2").unwrap();
    assert_eq!(merged.status, PathStatus::Completed);
    assert_eq!(merged.current_node, "done");
    assert!(final_state.barriers["sync"].released);
}

/// Barrier correctness: release happens exactly when the second required
/// path arrives - never earlier, never twice.
#[tokio::test]
async fn test_barrier_releases_exactly_once() {
    let snapshot = GraphSnapshot::new(
        vec![
            Node::new("a", NodeKind::Start),
            Node::new("b", NodeKind::Start),
            Node::new("Flags", NodeKind::Context).with_attribute("go", json!(false)),
            Node::new("join", NodeKind::Task),
        ],
        vec![
            Edge::new("Flags", "b"),
            Edge::new("a", "join").with_annotation(EdgeAnnotation::Barrier {
                name: "sync".into(),
                group: None,
            }),
            // b only reaches the barrier once Flags.go flips.
            Edge::new("b", "join")
                .with_condition("Flags.go == true")
                .with_annotation(EdgeAnnotation::Barrier {
                    name: "sync".into(),
                    group: None,
                }),
        ],
    );
    let state = ExecutionState::builder(snapshot)
        .with_barrier(
            "sync",
            vec!["path_0".into(), "path_1".into()],
            vec![],
            BarrierMode::Merge,
        )
        .build()
        .unwrap();

    let (runtime, _) = runtime_with(vec![]);

    // Tick 1: only path_0 arrives; no release.
    let report = runtime.step(&state).await.unwrap();
    let mid = report.state;
    assert_eq!(mid.path("path_0").unwrap().status, PathStatus::Waiting);
    assert_eq!(mid.path("path_1").unwrap().status, PathStatus::Active);
    assert!(!mid.barriers["sync"].released);
    assert_eq!(mid.paths.len(), 2, "released early");

    // Flip the gate; tick 2 lets path_1 arrive and releases the barrier.
    let mut gated = mid.clone();
    gated
        .context_state
        .get_mut("Flags")
        .unwrap()
        .insert("go".into(), json!(true));
    let report = runtime.step(&gated).await.unwrap();
    let released = report.state;
    assert!(released.barriers["sync"].released);
    assert_eq!(released.paths.len(), 3);

    // Further ticks never release it again.
    let report = runtime.step(&released).await.unwrap();
    assert_eq!(report.state.paths.len(), 3, "released twice");
}

/// Scenario B: an agent round writes Counter.value 0→1; a read in the next
/// round observes the committed value.
#[tokio::test]
async fn test_write_then_read_context() {
    let snapshot = GraphSnapshot::new(
        vec![
            Node::new("begin", NodeKind::Start),
            Node::new("increment", NodeKind::Task)
                .with_attribute("prompt", json!("Increment the counter.")),
            Node::new("Counter", NodeKind::Context).with_attribute("value", json!(0)),
            Node::new("done", NodeKind::End),
        ],
        vec![
            Edge::new("begin", "increment").with_annotation(EdgeAnnotation::Auto),
            Edge::new("Counter", "increment"),
            Edge::new("increment", "Counter"),
            Edge::new("increment", "done"),
        ],
    );
    let state = ExecutionState::builder(snapshot).build().unwrap();

    let (runtime, agent) = runtime_with(vec![
        AgentResponse::with_calls(
            "writing",
            vec![ToolCall::new(
                "c1",
                "write_Counter",
                json!({"key": "value", "value": 1}),
            )],
        ),
        AgentResponse::with_calls(
            "reading back",
            vec![ToolCall::new("c2", "read_Counter", json!({}))],
        ),
        AgentResponse::with_calls(
            "done",
            vec![ToolCall::new("c3", "transition_to_done", json!({}))],
        ),
    ]);

    let report = runtime.execute(&state).await.unwrap();
    assert!(report.complete);
    assert_eq!(report.state.context_state["Counter"]["value"], json!(1));

    // The third round-trip saw the read result {value: 1} as a tool message.
    let invocations = agent.invocations();
    assert_eq!(invocations.len(), 3);
    let last_messages = &invocations[2].messages;
    let read_result = last_messages
        .iter()
        .rev()
        .find(|m| m.tool_call_id.as_deref() == Some("c2"))
        .expect("tool message for read");
    assert!(read_result.content.contains("\"value\":1"));
}

/// Scenario C: an `@async` edge on a prompted task does not spawn until the
/// agent explicitly invokes the spawn tool.
#[tokio::test]
async fn test_async_spawn_requires_agent_on_prompted_task() {
    let snapshot = GraphSnapshot::new(
        vec![
            Node::new("begin", NodeKind::Start),
            Node::new("work", NodeKind::Task).with_attribute("prompt", json!("Decide.")),
            Node::new("bg", NodeKind::Task),
            Node::new("done", NodeKind::End),
        ],
        vec![
            Edge::new("begin", "work").with_annotation(EdgeAnnotation::Auto),
            Edge::new("work", "bg").with_annotation(EdgeAnnotation::Async),
            Edge::new("work", "done"),
        ],
    );
    let state = ExecutionState::builder(snapshot).build().unwrap();

    let (runtime, _) = runtime_with(vec![
        AgentResponse::text("thinking, not spawning"),
        AgentResponse::with_calls(
            "spawning now",
            vec![ToolCall::new("c1", "spawn_async_to_bg", json!({"reason": "background work"}))],
        ),
        AgentResponse::with_calls(
            "moving on",
            vec![ToolCall::new("c2", "transition_to_done", json!({}))],
        ),
    ]);

    // Tick 1 moves onto `work`; tick 2 runs the first (non-spawning) round.
    let report = runtime.step(&state).await.unwrap();
    let report = runtime.step(&report.state).await.unwrap();
    let after_first_round = report.state;
    assert_eq!(
        after_first_round.paths.len(),
        1,
        "@async must not auto-spawn on a prompted task"
    );

    // Tick 3: the agent spawns explicitly, then transitions.
    let report = runtime.step(&after_first_round).await.unwrap();
    let after_spawn = report.state;
    assert_eq!(after_spawn.paths.len(), 2);
    assert_eq!(after_spawn.path("path_1").unwrap().current_node, "bg");
}

/// Scenario D: exceeding max_steps fails one path while its sibling is
/// unaffected.
#[tokio::test]
async fn test_step_limit_fails_only_one_path() {
    let snapshot = GraphSnapshot::new(
        vec![
            Node::new("a", NodeKind::Start),
            Node::new("spin", NodeKind::Task),
            Node::new("b", NodeKind::Start),
            Node::new("done", NodeKind::End),
        ],
        vec![
            Edge::new("a", "spin").with_annotation(EdgeAnnotation::Auto),
            // Tight loop: spins until the step budget runs out.
            Edge::new("spin", "spin").with_annotation(EdgeAnnotation::Auto),
            Edge::new("b", "done").with_annotation(EdgeAnnotation::Auto),
        ],
    );
    let state = ExecutionState::builder(snapshot)
        .with_limits(Limits {
            max_steps: 5,
            ..Limits::default()
        })
        .build()
        .unwrap();

    let (runtime, _) = runtime_with(vec![]);
    let report = runtime.execute(&state).await.unwrap();

    let spinner = report.state.path("path_0").unwrap();
    assert_eq!(spinner.status, PathStatus::Failed);
    assert!(spinner.failure.as_ref().unwrap().contains("steps"));

    let sibling = report.state.path("path_1").unwrap();
    assert_eq!(sibling.status, PathStatus::Completed);
    assert_eq!(sibling.current_node, "done");

    assert_eq!(report.state.metadata.error_count, 1);
    assert_eq!(report.state.failed_paths().len(), 1);
}

/// Prompt precedence: a task with a prompt and a trivially-true condition
/// edge invokes the agent at least once before transitioning.
#[tokio::test]
async fn test_prompt_precedes_trivially_true_condition() {
    let snapshot = GraphSnapshot::new(
        vec![
            Node::new("begin", NodeKind::Start),
            Node::new("decide", NodeKind::Task).with_attribute("prompt", json!("Look around.")),
            Node::new("done", NodeKind::End),
        ],
        vec![
            Edge::new("begin", "decide").with_annotation(EdgeAnnotation::Auto),
            Edge::new("decide", "done").with_condition("1 == 1"),
        ],
    );
    let state = ExecutionState::builder(snapshot).build().unwrap();

    let (runtime, agent) = runtime_with(vec![AgentResponse::text("looked")]);
    let report = runtime.execute(&state).await.unwrap();

    assert!(report.complete);
    assert_eq!(agent.invocation_count(), 1, "agent must run exactly once");
    assert_eq!(report.state.path("path_0").unwrap().current_node, "done");
}

/// Map fan-out: an array of length 3 spawns exactly 3 paths with indices
/// 0..2, each seeing its own item in the evaluation overlay.
#[tokio::test]
async fn test_map_fan_out_spawns_one_path_per_element() {
    let snapshot = GraphSnapshot::new(
        vec![
            Node::new("begin", NodeKind::Start),
            Node::new("Items", NodeKind::Context).with_attribute("all", json!(["a", "b", "c"])),
            Node::new("worker", NodeKind::Task),
            Node::new("done", NodeKind::End),
        ],
        vec![
            Edge::new("begin", "Items"),
            Edge::new("begin", "worker").with_annotation(EdgeAnnotation::Map {
                source: "Items.all".into(),
                group: Some("workers".into()),
            }),
            Edge::new("worker", "done").with_annotation(EdgeAnnotation::Auto),
        ],
    );
    let state = ExecutionState::builder(snapshot).build().unwrap();

    let (runtime, _) = runtime_with(vec![]);
    let report = runtime.step(&state).await.unwrap();

    let fanned = report.state;
    assert_eq!(fanned.paths.len(), 4);
    assert_eq!(fanned.path("path_0").unwrap().status, PathStatus::Completed);
    for (i, expected) in ["a", "b", "c"].iter().enumerate() {
        let path = fanned.path(&format!("path_{}", i + 1)).unwrap();
        let map_ctx = path.map_context.as_ref().unwrap();
        assert_eq!(map_ctx.index, i);
        assert_eq!(map_ctx.item, json!(expected));
        assert_eq!(map_ctx.group.as_deref(), Some("workers"));
    }
}

/// Map fan-out over an empty array spawns zero paths and is not an error.
#[tokio::test]
async fn test_map_fan_out_empty_array() {
    let snapshot = GraphSnapshot::new(
        vec![
            Node::new("begin", NodeKind::Start),
            Node::new("Items", NodeKind::Context).with_attribute("all", json!([])),
            Node::new("worker", NodeKind::Task),
        ],
        vec![
            Edge::new("begin", "Items"),
            Edge::new("begin", "worker").with_annotation(EdgeAnnotation::Map {
                source: "Items.all".into(),
                group: None,
            }),
        ],
    );
    let state = ExecutionState::builder(snapshot).build().unwrap();

    let (runtime, _) = runtime_with(vec![]);
    let report = runtime.step(&state).await.unwrap();

    assert!(report.errors.is_empty());
    assert_eq!(report.state.paths.len(), 1);
    assert_eq!(
        report.state.path("path_0").unwrap().status,
        PathStatus::Completed
    );
}

/// Map fan-out groups can satisfy a barrier's required_groups.
#[tokio::test]
async fn test_map_group_satisfies_barrier() {
    let snapshot = GraphSnapshot::new(
        vec![
            Node::new("begin", NodeKind::Start),
            Node::new("Items", NodeKind::Context).with_attribute("all", json!([1, 2])),
            Node::new("worker", NodeKind::Task),
            Node::new("gather", NodeKind::Task),
            Node::new("done", NodeKind::End),
        ],
        vec![
            Edge::new("begin", "Items"),
            Edge::new("begin", "worker").with_annotation(EdgeAnnotation::Map {
                source: "Items.all".into(),
                group: Some("workers".into()),
            }),
            Edge::new("worker", "gather").with_annotation(EdgeAnnotation::Barrier {
                name: "gathered".into(),
                group: None,
            }),
            Edge::new("gather", "done").with_annotation(EdgeAnnotation::Auto),
        ],
    );
    let state = ExecutionState::builder(snapshot)
        .with_barrier("gathered", vec![], vec!["workers".into()], BarrierMode::Merge)
        .build()
        .unwrap();

    let (runtime, _) = runtime_with(vec![]);
    let report = runtime.execute(&state).await.unwrap();

    assert!(report.complete);
    assert!(report.errors.is_empty());
    assert!(report.state.barriers["gathered"].released);
    // One merged path made it to done.
    let at_done: Vec<_> = report
        .state
        .paths
        .iter()
        .filter(|p| p.current_node == "done")
        .collect();
    assert_eq!(at_done.len(), 1);
}

/// `@parallel` forks spawn at evaluation time; the fork sources complete.
#[tokio::test]
async fn test_parallel_fork() {
    let snapshot = GraphSnapshot::new(
        vec![
            Node::new("begin", NodeKind::Start),
            Node::new("left", NodeKind::Task),
            Node::new("right", NodeKind::Task),
        ],
        vec![
            Edge::new("begin", "left").with_annotation(EdgeAnnotation::Parallel),
            Edge::new("begin", "right").with_annotation(EdgeAnnotation::Parallel),
        ],
    );
    let state = ExecutionState::builder(snapshot).build().unwrap();

    let (runtime, _) = runtime_with(vec![]);
    let report = runtime.step(&state).await.unwrap();

    assert_eq!(report.state.paths.len(), 3);
    assert_eq!(
        report.state.path("path_0").unwrap().status,
        PathStatus::Completed
    );
    assert_eq!(report.state.path("path_1").unwrap().current_node, "left");
    assert_eq!(report.state.path("path_2").unwrap().current_node, "right");
}

/// Immutability: `step` never mutates its input; untouched substructures
/// are pointer-identical in the result.
#[tokio::test]
async fn test_step_leaves_input_state_untouched() {
    let snapshot = GraphSnapshot::new(
        vec![
            Node::new("a", NodeKind::Start),
            Node::new("next", NodeKind::Task),
            Node::new("b", NodeKind::Start),
            Node::new("idle", NodeKind::Task).with_attribute("prompt", json!("wait")),
        ],
        vec![
            Edge::new("a", "next").with_annotation(EdgeAnnotation::Auto),
            Edge::new("b", "idle"),
        ],
    );
    let state = ExecutionState::builder(snapshot).build().unwrap();
    let before = serde_json::to_string(&state).unwrap();

    let (runtime, _) = runtime_with(vec![]);
    let report = runtime.step(&state).await.unwrap();

    // Input value is bit-identical to what it was.
    assert_eq!(serde_json::to_string(&state).unwrap(), before);

    // The untouched snapshot is shared, not copied.
    assert!(Arc::ptr_eq(&state.snapshot, &report.state.snapshot));
    // path_0 moved (fresh Arc); the stalled path_1 advanced only its
    // counters, but the original Arcs in the input are still intact.
    assert_eq!(state.path("path_0").unwrap().current_node, "a");
    assert_eq!(report.state.path("path_0").unwrap().current_node, "next");
}

/// Determinism: identical starting state plus identical scripted responses
/// produce bit-identical resulting states.
#[tokio::test]
async fn test_scripted_runs_are_deterministic() {
    let snapshot = GraphSnapshot::new(
        vec![
            Node::new("begin", NodeKind::Start),
            Node::new("decide", NodeKind::Task).with_attribute("prompt", json!("Go.")),
            Node::new("Counter", NodeKind::Context).with_attribute("value", json!(0)),
            Node::new("done", NodeKind::End),
        ],
        vec![
            Edge::new("begin", "decide").with_annotation(EdgeAnnotation::Auto),
            Edge::new("Counter", "decide"),
            Edge::new("decide", "Counter"),
            Edge::new("decide", "done"),
        ],
    );
    let state = ExecutionState::builder(snapshot)
        .with_execution_id("exec-deterministic")
        .build()
        .unwrap();

    let script = || {
        vec![
            AgentResponse::with_calls(
                "bump",
                vec![ToolCall::new(
                    "c1",
                    "write_Counter",
                    json!({"key": "value", "value": 7}),
                )],
            ),
            AgentResponse::with_calls(
                "leave",
                vec![ToolCall::new("c2", "transition_to_done", json!({}))],
            ),
        ]
    };

    let (runtime_a, _) = runtime_with(script());
    let (runtime_b, _) = runtime_with(script());
    let result_a = runtime_a.execute(&state).await.unwrap();
    let result_b = runtime_b.execute(&state).await.unwrap();

    assert_eq!(
        serde_json::to_string(&result_a.state).unwrap(),
        serde_json::to_string(&result_b.state).unwrap()
    );
}

/// The visualization projection reflects positions, visit counts, and
/// currently offered transitions.
#[tokio::test]
async fn test_visualization_projection() {
    let snapshot = GraphSnapshot::new(
        vec![
            Node::new("begin", NodeKind::Start),
            Node::new("decide", NodeKind::Task).with_attribute("prompt", json!("Pick.")),
            Node::new("x", NodeKind::Task),
            Node::new("y", NodeKind::Task),
        ],
        vec![
            Edge::new("begin", "decide").with_annotation(EdgeAnnotation::Auto),
            Edge::new("decide", "x"),
            Edge::new("decide", "y"),
        ],
    );
    let state = ExecutionState::builder(snapshot).build().unwrap();

    // Advance to the decision node without consuming the script.
    let (runtime, _) = runtime_with(vec![AgentResponse::text("hmm")]);
    let report = runtime.step(&state).await.unwrap();

    let viz = runtime.get_visualization_state(&report.state).unwrap();
    assert_eq!(viz.paths[0].current_node, "decide");
    assert_eq!(viz.node_visits["decide"], 1);
    let targets: Vec<&str> = viz
        .offered_transitions
        .iter()
        .map(|t| t.target.as_str())
        .collect();
    assert_eq!(targets, vec!["x", "y"]);
}

/// Cancellation is immediate and removes the path from barrier bookkeeping.
#[tokio::test]
async fn test_cancel_waiting_path() {
    let snapshot = GraphSnapshot::new(
        vec![
            Node::new("a", NodeKind::Start),
            Node::new("b", NodeKind::Start),
            Node::new("Flags", NodeKind::Context).with_attribute("go", json!(false)),
            Node::new("join", NodeKind::Task),
        ],
        vec![
            Edge::new("Flags", "b"),
            Edge::new("a", "join").with_annotation(EdgeAnnotation::Barrier {
                name: "sync".into(),
                group: None,
            }),
            // Gated: path_1 never arrives in this test.
            Edge::new("b", "join")
                .with_condition("Flags.go == true")
                .with_annotation(EdgeAnnotation::Barrier {
                    name: "sync".into(),
                    group: None,
                }),
        ],
    );
    let state = ExecutionState::builder(snapshot)
        .with_barrier(
            "sync",
            vec!["path_0".into(), "path_1".into()],
            vec![],
            BarrierMode::Merge,
        )
        .build()
        .unwrap();

    let (runtime, _) = runtime_with(vec![]);
    let report = runtime.step(&state).await.unwrap();
    let waiting = report.state;
    assert_eq!(waiting.path("path_0").unwrap().status, PathStatus::Waiting);

    let cancelled = runtime.cancel_path(&waiting, "path_0").unwrap();
    assert_eq!(
        cancelled.path("path_0").unwrap().status,
        PathStatus::Cancelled
    );
    assert!(!cancelled.barriers["sync"].waiting.contains_key("path_0"));
}

/// Meta tools mutate the live definition; the update callback fires and
/// subsequent steps see the new snapshot.
#[tokio::test]
async fn test_meta_tool_updates_definition() {
    use std::sync::Mutex;

    let snapshot = GraphSnapshot::new(
        vec![
            Node::new("begin", NodeKind::Start)
                .with_attribute("prompt", json!("Extend the workflow."))
                .with_attribute("meta", json!(true)),
            Node::new("done", NodeKind::End),
        ],
        vec![Edge::new("begin", "done")],
    );
    let state = ExecutionState::builder(snapshot).build().unwrap();

    let seen: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_cb = seen.clone();

    let agent = Arc::new(ScriptedAgent::new(vec![
        AgentResponse::with_calls(
            "adding",
            vec![ToolCall::new(
                "c1",
                "add_node",
                json!({"name": "audit", "kind": "task", "attributes": {"prompt": "check"}}),
            )],
        ),
        AgentResponse::with_calls(
            "leaving",
            vec![ToolCall::new("c2", "transition_to_done", json!({}))],
        ),
    ]));
    let runtime = FlowRuntime::builder(agent)
        .on_definition_update(Arc::new(move |snapshot| {
            seen_cb.lock().unwrap().push(snapshot.nodes().len());
        }))
        .build();

    let report = runtime.execute(&state).await.unwrap();
    assert!(report.complete);
    assert!(report.state.snapshot.node("audit").is_some());
    // Input state still references the original definition.
    assert!(state.snapshot.node("audit").is_none());
    assert_eq!(seen.lock().unwrap().as_slice(), &[3]);
}

/// `await_first_result` on an async spawn returns the spawned path's first
/// output inside the tool result.
#[tokio::test]
async fn test_async_spawn_await_first_result() {
    let snapshot = GraphSnapshot::new(
        vec![
            Node::new("begin", NodeKind::Start),
            Node::new("work", NodeKind::Task).with_attribute("prompt", json!("Delegate.")),
            Node::new("bg", NodeKind::Task),
            Node::new("bg_done", NodeKind::End),
            Node::new("done", NodeKind::End),
        ],
        vec![
            Edge::new("begin", "work").with_annotation(EdgeAnnotation::Auto),
            Edge::new("work", "bg").with_annotation(EdgeAnnotation::Async),
            Edge::new("work", "done"),
            Edge::new("bg", "bg_done").with_annotation(EdgeAnnotation::Auto),
        ],
    );
    let state = ExecutionState::builder(snapshot).build().unwrap();

    let (runtime, agent) = runtime_with(vec![
        AgentResponse::with_calls(
            "spawning",
            vec![ToolCall::new(
                "c1",
                "spawn_async_to_bg",
                json!({"reason": "offload", "await_first_result": true}),
            )],
        ),
        AgentResponse::with_calls(
            "finishing",
            vec![ToolCall::new("c2", "transition_to_done", json!({}))],
        ),
    ]);

    let report = runtime.execute(&state).await.unwrap();
    assert!(report.complete);

    // The second round-trip carries the spawn result with first_result.
    let invocations = agent.invocations();
    let spawn_result = invocations[1]
        .messages
        .iter()
        .find(|m| m.tool_call_id.as_deref() == Some("c1"))
        .expect("spawn tool message");
    assert!(spawn_result.content.contains("first_result"));
    assert!(spawn_result.content.contains("transitioned"));
}

/// Generated-code nodes run their handler instead of the agent and fall
/// back to the agent when no handler is registered.
#[tokio::test]
async fn test_codegen_path_and_fallback() {
    use agentflow_core::CodeTaskHandler;
    use async_trait::async_trait;

    struct Bump;

    #[async_trait]
    impl CodeTaskHandler for Bump {
        async fn run(&self, input: serde_json::Value) -> agentflow_core::Result<serde_json::Value> {
            let n = input["Counter"]["value"].as_i64().unwrap_or(0);
            Ok(json!({"Counter": {"value": n + 1}}))
        }
    }

    let build = || {
        let snapshot = GraphSnapshot::new(
            vec![
                Node::new("begin", NodeKind::Start),
                Node::new("bump", NodeKind::Task)
                    .with_attribute("prompt", json!("Bump the counter."))
                    .with_attribute("codegen", json!(true)),
                Node::new("Counter", NodeKind::Context).with_attribute("value", json!(0)),
                Node::new("done", NodeKind::End),
            ],
            vec![
                Edge::new("begin", "bump").with_annotation(EdgeAnnotation::Auto),
                Edge::new("Counter", "bump"),
                Edge::new("bump", "Counter"),
                Edge::new("bump", "done").with_condition("Counter.value == 1"),
            ],
        );
        ExecutionState::builder(snapshot).build().unwrap()
    };

    // With a handler: no agent involvement at all.
    let agent = Arc::new(ScriptedAgent::new(vec![]));
    let runtime = FlowRuntime::builder(agent.clone())
        .with_code_handler("bump", Arc::new(Bump))
        .build();
    let report = runtime.execute(&build()).await.unwrap();
    assert!(report.complete);
    assert_eq!(report.state.context_state["Counter"]["value"], json!(1));
    assert_eq!(agent.invocation_count(), 0);

    // Without a handler: the agent path takes over.
    let (runtime, agent) = runtime_with(vec![
        AgentResponse::with_calls(
            "doing it by hand",
            vec![ToolCall::new(
                "c1",
                "write_Counter",
                json!({"key": "value", "value": 1}),
            )],
        ),
        AgentResponse::text("all set"),
    ]);
    let report = runtime.execute(&build()).await.unwrap();
    assert!(report.complete);
    assert_eq!(report.state.context_state["Counter"]["value"], json!(1));
    assert_eq!(agent.invocation_count(), 2);
}

/// Agent failures downgrade the owning path; siblings continue.
#[tokio::test]
async fn test_agent_failure_downgrades_one_path() {
    let snapshot = GraphSnapshot::new(
        vec![
            Node::new("a", NodeKind::Start),
            Node::new("ask", NodeKind::Task).with_attribute("prompt", json!("?")),
            Node::new("b", NodeKind::Start),
            Node::new("done", NodeKind::End),
        ],
        vec![
            Edge::new("a", "ask").with_annotation(EdgeAnnotation::Auto),
            Edge::new("ask", "done"),
            Edge::new("b", "done").with_annotation(EdgeAnnotation::Auto),
        ],
    );
    let state = ExecutionState::builder(snapshot).build().unwrap();

    // Empty script: the first invocation errors.
    let (runtime, _) = runtime_with(vec![]);
    let report = runtime.execute(&state).await.unwrap();

    assert_eq!(report.state.path("path_0").unwrap().status, PathStatus::Failed);
    assert!(report
        .state
        .path("path_0")
        .unwrap()
        .failure
        .as_ref()
        .unwrap()
        .contains("Agent invocation failed"));
    assert_eq!(
        report.state.path("path_1").unwrap().status,
        PathStatus::Completed
    );
    // The failed path's history stays inspectable.
    assert_eq!(report.state.path("path_0").unwrap().history.len(), 2);
}

/// The state-change subscription observes every tick, both as a plain
/// receiver and as a stream.
#[tokio::test]
async fn test_state_change_subscription() {
    use futures::StreamExt;

    let snapshot = GraphSnapshot::new(
        vec![
            Node::new("begin", NodeKind::Start),
            Node::new("done", NodeKind::End),
        ],
        vec![Edge::new("begin", "done").with_annotation(EdgeAnnotation::Auto)],
    );
    let state = ExecutionState::builder(snapshot).build().unwrap();

    let (runtime, _) = runtime_with(vec![]);
    let mut events = runtime.subscribe();
    let mut stream = runtime.subscribe_stream();

    let report = runtime.step(&state).await.unwrap();
    let observed = events.try_recv().expect("state event");
    assert_eq!(observed.metadata.step_count, report.state.metadata.step_count);

    let streamed = stream.next().await.expect("stream event").unwrap();
    assert_eq!(streamed.metadata.step_count, report.state.metadata.step_count);
}
