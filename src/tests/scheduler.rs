//! Scheduler behavior: workload analysis, policies, plan soundness,
//! cycle detection and the transfer plan.

use crate::driver::DeviceId;
use crate::sched::{
    analyze, build_plan, AccessPattern, ComputeGraph, DeviceProfile, OpClassSet, OpDesc,
    SchedulingError, SchedulingPolicy, WorkloadClass,
};
use crate::Error;

fn gpu_tensor(id: u32) -> DeviceProfile {
    DeviceProfile {
        id: DeviceId(id),
        peak_gflops: 20_000.0,
        bandwidth_gbps: 900.0,
        tensor_tflops: Some(100.0),
        ai_tops: Some(200.0),
        matrix_gflops: Some(40_000.0),
        simd_gflops: 15_000.0,
        avg_latency_us: 20.0,
        perf_per_watt: 50.0,
        ops: OpClassSet::all(),
        host: false,
    }
}

fn cpu(id: u32) -> DeviceProfile {
    DeviceProfile {
        id: DeviceId(id),
        peak_gflops: 500.0,
        bandwidth_gbps: 50.0,
        tensor_tflops: None,
        ai_tops: None,
        matrix_gflops: Some(250.0),
        simd_gflops: 1_000.0,
        avg_latency_us: 1.0,
        perf_per_watt: 5.0,
        ops: OpClassSet::all(),
        host: true,
    }
}

/// Diamond: a → {b, c} → d.
fn diamond() -> ComputeGraph {
    let mut graph = ComputeGraph::new();
    let a = graph.add_node(OpDesc::MatMul { m: 256, n: 256, k: 256 });
    let b = graph.add_node(OpDesc::VectorOp { len: 1 << 16 });
    let c = graph.add_node(OpDesc::VectorOp { len: 1 << 16 });
    let d = graph.add_node(OpDesc::MemoryOp { bytes: 1 << 20 });
    graph.add_edge(a, b, 1 << 18, AccessPattern::Sequential);
    graph.add_edge(a, c, 1 << 18, AccessPattern::Broadcast);
    graph.add_edge(b, d, 1 << 18, AccessPattern::Reduction);
    graph.add_edge(c, d, 1 << 18, AccessPattern::Random);
    graph
}

// Plan levels respect the partial order and every cross-device edge
// has a matching transfer.
#[test]
fn plan_is_sound_for_diamond() {
    let devices = [gpu_tensor(0), cpu(1)];
    for policy in [
        SchedulingPolicy::PerformanceOptimized,
        SchedulingPolicy::EnergyEfficient,
        SchedulingPolicy::LoadBalanced,
        SchedulingPolicy::LatencyOptimized,
    ] {
        let plan = build_plan(diamond(), &devices, policy).unwrap();
        plan.validate().unwrap();
        assert_eq!(plan.levels.len(), 3);
        assert_eq!(plan.levels[0], vec![0]);
        assert_eq!(plan.levels[2], vec![3]);
        let mut mid = plan.levels[1].clone();
        mid.sort_unstable();
        assert_eq!(mid, vec![1, 2]);
    }
}

#[test]
fn cyclic_graph_is_rejected() {
    let mut graph = ComputeGraph::new();
    let a = graph.add_node(OpDesc::VectorOp { len: 16 });
    let b = graph.add_node(OpDesc::VectorOp { len: 16 });
    let c = graph.add_node(OpDesc::VectorOp { len: 16 });
    graph.add_edge(a, b, 64, AccessPattern::Sequential);
    graph.add_edge(b, c, 64, AccessPattern::Sequential);
    graph.add_edge(c, a, 64, AccessPattern::Sequential);

    match build_plan(graph, &[cpu(0)], SchedulingPolicy::PerformanceOptimized) {
        Err(Error::Scheduling(SchedulingError::CyclicGraph)) => {}
        other => panic!("expected CyclicGraph, got {:?}", other.map(|_| ())),
    }
}

// A large matmul feeding a vector op: the matmul lands on the tensor
// device; the consumer either stays there or moves with a transfer
// record sized to the edge.
#[test]
fn cross_device_plan_for_matmul_chain() {
    let mut graph = ComputeGraph::new();
    let a = graph.add_node(OpDesc::MatMul {
        m: 1024,
        n: 1024,
        k: 1024,
    });
    let b = graph.add_node(OpDesc::VectorOp { len: 1024 * 1024 });
    let bytes = 4 * 1024 * 1024u64;
    graph.add_edge(a, b, bytes, AccessPattern::Sequential);

    let devices = [gpu_tensor(0), cpu(1)];
    let plan = build_plan(graph, &devices, SchedulingPolicy::PerformanceOptimized).unwrap();

    assert_eq!(plan.assignment[a], DeviceId(0), "matmul on the tensor device");
    if plan.assignment[b] == DeviceId(0) {
        assert!(plan.transfers.is_empty(), "same device needs no transfer");
    } else {
        assert_eq!(plan.transfers.len(), 1);
        assert_eq!(plan.transfers[0].bytes, bytes);
        assert_eq!(plan.transfers[0].edge, (a, b));
    }
}

#[test]
fn transfer_priorities_order_by_pattern() {
    let devices = [gpu_tensor(0), cpu(1)];
    // Pin nodes to alternating devices so every edge crosses.
    let mut graph = diamond();
    graph.prefer(0, DeviceId(0));
    graph.prefer(1, DeviceId(1));
    graph.prefer(2, DeviceId(0));
    graph.prefer(3, DeviceId(1));

    let plan = build_plan(graph, &devices, SchedulingPolicy::RespectHints).unwrap();
    // Crossing edges: a→b (Sequential) and c→d (Random); a→c and b→d
    // stay on-device.
    assert_eq!(plan.transfers.len(), 2);
    let priorities: Vec<u8> = plan.transfers.iter().map(|t| t.priority).collect();
    let mut sorted = priorities.clone();
    sorted.sort_unstable_by(|x, y| y.cmp(x));
    assert_eq!(priorities, sorted, "descending priority order");
    assert_eq!(
        plan.transfers[0].priority,
        AccessPattern::Sequential.priority()
    );
    assert_eq!(
        plan.transfers[1].priority,
        AccessPattern::Random.priority()
    );
}

#[test]
fn respect_hints_uses_preferences_verbatim() {
    let devices = [gpu_tensor(0), cpu(1)];
    let mut graph = diamond();
    for node in 0..4 {
        graph.prefer(node, DeviceId(1));
    }
    let plan = build_plan(graph, &devices, SchedulingPolicy::RespectHints).unwrap();
    assert!(plan.assignment.iter().all(|&d| d == DeviceId(1)));
    assert!(plan.transfers.is_empty());
}

#[test]
fn energy_policy_prefers_perf_per_watt() {
    let mut efficient_cpu = cpu(1);
    efficient_cpu.perf_per_watt = 500.0;
    let devices = [gpu_tensor(0), efficient_cpu];
    let plan = build_plan(diamond(), &devices, SchedulingPolicy::EnergyEfficient).unwrap();
    assert!(plan.assignment.iter().all(|&d| d == DeviceId(1)));
}

#[test]
fn no_eligible_device_is_reported() {
    let mut limited = cpu(0);
    limited.ops = OpClassSet::VECTOR;
    limited.host = false;
    let mut graph = ComputeGraph::new();
    graph.add_node(OpDesc::Conv2d {
        n: 1,
        c: 3,
        h: 8,
        w: 8,
        k: 4,
        r: 3,
        s: 3,
        stride: (1, 1),
        pad: (0, 0),
    });
    match build_plan(graph, &[limited], SchedulingPolicy::LatencyOptimized) {
        Err(Error::Scheduling(SchedulingError::NoEligibleDevice { node: 0, .. })) => {}
        other => panic!("expected NoEligibleDevice, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn workload_analysis_classifies() {
    // Pure matmul stack: compute bound.
    let mut compute = ComputeGraph::new();
    for _ in 0..3 {
        compute.add_node(OpDesc::MatMul {
            m: 512,
            n: 512,
            k: 512,
        });
    }
    let profile = analyze(&compute);
    assert_eq!(profile.class, WorkloadClass::ComputeBound);
    assert_eq!(profile.parallelism, 1.0);

    // Pure memory traffic: memory bound, fully serial.
    let mut memory = ComputeGraph::new();
    let a = memory.add_node(OpDesc::MemoryOp { bytes: 1 << 24 });
    let b = memory.add_node(OpDesc::MemoryOp { bytes: 1 << 24 });
    memory.add_edge(a, b, 1 << 24, AccessPattern::Sequential);
    let profile = analyze(&memory);
    assert_eq!(profile.class, WorkloadClass::MemoryBound);
    assert!(profile.parallelism <= 0.5 + f64::EPSILON);
}

#[test]
fn estimates_order_alternatives_only() {
    let devices = [gpu_tensor(0), cpu(1)];
    let plan = build_plan(diamond(), &devices, SchedulingPolicy::LoadBalanced).unwrap();
    let est = plan.estimated_seconds(&devices);
    assert!(est.is_finite() && est >= 0.0);
}
