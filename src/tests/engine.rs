//! Execution-engine behavior: level barriers, sibling errors,
//! cancellation and transfer batching.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::driver::DeviceId;
use crate::exec::{ExecBindings, ExecutionEngine};
use crate::r#async::CancelToken;
use crate::sched::{
    build_plan, AccessPattern, ComputeGraph, OpDesc, SchedulingPolicy,
};
use crate::standard::{DeviceError, Stream};
use crate::Error;

use super::{host_accel, host_context};

fn bindings_for(streams: Vec<(u32, Stream)>) -> ExecBindings {
    let map: HashMap<DeviceId, Stream> =
        streams.into_iter().map(|(id, s)| (DeviceId(id), s)).collect();
    ExecBindings::new(map)
}

fn chain(journal: &Arc<Mutex<Vec<&'static str>>>) -> ComputeGraph {
    let mut graph = ComputeGraph::new();
    let a = graph.add_node(OpDesc::VectorOp { len: 16 });
    let b = graph.add_node(OpDesc::VectorOp { len: 16 });
    let c = graph.add_node(OpDesc::VectorOp { len: 16 });
    graph.add_edge(a, b, 64, AccessPattern::Sequential);
    graph.add_edge(b, c, 64, AccessPattern::Sequential);
    for (node, tag) in [(a, "a"), (b, "b"), (c, "c")] {
        let journal = Arc::clone(journal);
        graph.action(node, move || {
            journal.lock().unwrap().push(tag);
            Ok(())
        });
    }
    graph
}

#[test]
fn levels_execute_in_order() {
    let context = host_context();
    let accel = host_accel(&context);
    let journal = Arc::new(Mutex::new(Vec::new()));
    let graph = chain(&journal);

    let plan = build_plan(
        graph,
        &[crate::sched::DeviceProfile::host_cpu(DeviceId(0))],
        SchedulingPolicy::LoadBalanced,
    )
    .unwrap();
    let bindings = bindings_for(vec![(0, accel.create_stream())]);

    let report = ExecutionEngine::new()
        .execute(&plan, &bindings, &CancelToken::new())
        .unwrap();
    assert_eq!(report.levels_run, 3);
    assert_eq!(report.nodes_run, 3);
    assert_eq!(*journal.lock().unwrap(), vec!["a", "b", "c"]);
}

// Siblings already dispatched in a level run to completion; the first
// error surfaces, later ones are discarded.
#[test]
fn sibling_errors_wait_out_the_level() {
    let context = host_context();
    let accel = host_accel(&context);
    let ran = Arc::new(Mutex::new(Vec::new()));

    let mut graph = ComputeGraph::new();
    for tag in ["x", "y", "z"] {
        let node = graph.add_node(OpDesc::VectorOp { len: 16 });
        let ran = Arc::clone(&ran);
        let fail = tag != "z";
        graph.action(node, move || {
            ran.lock().unwrap().push(tag);
            if fail {
                Err(DeviceError::Timeout { waited_ms: 0 }.into())
            } else {
                Ok(())
            }
        });
    }

    let plan = build_plan(
        graph,
        &[crate::sched::DeviceProfile::host_cpu(DeviceId(0))],
        SchedulingPolicy::LoadBalanced,
    )
    .unwrap();
    // One level of three nodes.
    assert_eq!(plan.levels.len(), 1);

    let bindings = bindings_for(vec![(0, accel.create_stream())]);
    let outcome = ExecutionEngine::new().execute(&plan, &bindings, &CancelToken::new());
    assert!(matches!(outcome, Err(Error::Device(_))));
    assert_eq!(ran.lock().unwrap().len(), 3, "siblings were not cancelled");
}

// Cancellation observed between levels: the current level finishes,
// nothing later starts.
#[test]
fn cancellation_aborts_between_levels() {
    let context = host_context();
    let accel = host_accel(&context);
    let token = CancelToken::new();
    let ran = Arc::new(Mutex::new(Vec::new()));

    let mut graph = ComputeGraph::new();
    let first = graph.add_node(OpDesc::VectorOp { len: 16 });
    let second = graph.add_node(OpDesc::VectorOp { len: 16 });
    graph.add_edge(first, second, 64, AccessPattern::Sequential);
    {
        let ran = Arc::clone(&ran);
        let token = token.clone();
        graph.action(first, move || {
            ran.lock().unwrap().push("first");
            token.cancel();
            Ok(())
        });
    }
    {
        let ran = Arc::clone(&ran);
        graph.action(second, move || {
            ran.lock().unwrap().push("second");
            Ok(())
        });
    }

    let plan = build_plan(
        graph,
        &[crate::sched::DeviceProfile::host_cpu(DeviceId(0))],
        SchedulingPolicy::LoadBalanced,
    )
    .unwrap();
    let bindings = bindings_for(vec![(0, accel.create_stream())]);

    let outcome = ExecutionEngine::new().execute(&plan, &bindings, &token);
    assert!(matches!(outcome, Err(Error::Cancelled)));
    assert_eq!(*ran.lock().unwrap(), vec!["first"]);
}

// Transfers issue before any node, grouped by descending priority.
#[test]
fn transfers_batch_by_priority_before_nodes() {
    let context = host_context();
    let accel = host_accel(&context);
    let journal: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let mut graph = ComputeGraph::new();
    let a = graph.add_node(OpDesc::VectorOp { len: 16 });
    let b = graph.add_node(OpDesc::VectorOp { len: 16 });
    let c = graph.add_node(OpDesc::VectorOp { len: 16 });
    graph.add_edge(a, c, 64, AccessPattern::Random);
    graph.add_edge(b, c, 64, AccessPattern::Broadcast);
    graph.prefer(a, DeviceId(0));
    graph.prefer(b, DeviceId(0));
    graph.prefer(c, DeviceId(1));
    for (node, tag) in [(a, "node-a"), (b, "node-b"), (c, "node-c")] {
        let journal = Arc::clone(&journal);
        graph.action(node, move || {
            journal.lock().unwrap().push(tag.to_owned());
            Ok(())
        });
    }

    let plan = build_plan(
        graph,
        &[
            crate::sched::DeviceProfile::host_cpu(DeviceId(0)),
            crate::sched::DeviceProfile::host_cpu(DeviceId(1)),
        ],
        SchedulingPolicy::RespectHints,
    )
    .unwrap();

    let transfer_journal = Arc::clone(&journal);
    let bindings = bindings_for(vec![
        (0, accel.create_stream()),
        (1, accel.create_stream()),
    ])
    .with_transfer(move |t| {
        transfer_journal
            .lock()
            .unwrap()
            .push(format!("transfer-p{}", t.priority));
        Ok(())
    });

    let report = ExecutionEngine::new()
        .execute(&plan, &bindings, &CancelToken::new())
        .unwrap();
    assert_eq!(report.transfers_run, 2);

    let journal = journal.lock().unwrap();
    let first_node = journal.iter().position(|e| e.starts_with("node")).unwrap();
    let last_transfer = journal
        .iter()
        .rposition(|e| e.starts_with("transfer"))
        .unwrap();
    assert!(last_transfer < first_node, "transfers precede nodes: {:?}", *journal);
    assert_eq!(journal[0], "transfer-p5", "broadcast band first");
    assert_eq!(journal[1], "transfer-p1");
}

#[test]
fn missing_stream_binding_is_inconsistent() {
    let mut graph = ComputeGraph::new();
    graph.add_node(OpDesc::VectorOp { len: 16 });
    let plan = build_plan(
        graph,
        &[crate::sched::DeviceProfile::host_cpu(DeviceId(7))],
        SchedulingPolicy::LoadBalanced,
    )
    .unwrap();
    let bindings = bindings_for(vec![]);
    let outcome = ExecutionEngine::new().execute(&plan, &bindings, &CancelToken::new());
    assert!(matches!(outcome, Err(Error::Scheduling(_))));
}

// Plan execution leaves the streams reusable.
#[test]
fn streams_survive_plan_failure() {
    let context = host_context();
    let accel = host_accel(&context);
    let mut graph = ComputeGraph::new();
    let node = graph.add_node(OpDesc::VectorOp { len: 16 });
    graph.action(node, || Err(DeviceError::Timeout { waited_ms: 0 }.into()));

    let plan = build_plan(
        graph,
        &[crate::sched::DeviceProfile::host_cpu(DeviceId(0))],
        SchedulingPolicy::LoadBalanced,
    )
    .unwrap();
    let stream = accel.create_stream();
    let bindings = bindings_for(vec![(0, stream.clone())]);
    assert!(ExecutionEngine::new()
        .execute(&plan, &bindings, &CancelToken::new())
        .is_err());

    // Timeout is not a hard failure; the stream keeps accepting work.
    let marker = stream.enqueue_marker().unwrap();
    marker.wait_for().unwrap();
    std::thread::sleep(Duration::from_millis(5));
}
