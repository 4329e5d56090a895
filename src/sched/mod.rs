//! The cross-device scheduler.
//!
//! Takes a [`ComputeGraph`] and a set of device performance profiles,
//! analyzes the workload, assigns every node to a device under a
//! selectable policy, and produces an [`ExecutionPlan`]: layered
//! parallel execution levels plus a prioritized memory-transfer plan.
//! Estimates order alternatives; they are never a correctness
//! constraint.

mod graph;
mod plan;
mod policy;

pub use self::graph::{
    AccessPattern, ComputeGraph, Edge, Node, NodeAction, NodeId, OpClass, OpClassSet, OpDesc,
    TENSOR_MATMUL_THRESHOLD,
};
pub use self::plan::{build_plan, ExecutionPlan, Transfer};
pub use self::policy::SchedulingPolicy;

use crate::driver::DeviceId;

/// An error produced by the scheduler before execution begins.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchedulingError {
    #[error("no eligible device for node {node} ({class:?})")]
    NoEligibleDevice { node: NodeId, class: OpClass },
    #[error("compute graph contains a cycle")]
    CyclicGraph,
    #[error("inconsistent execution plan: {detail}")]
    InconsistentPlan { detail: String },
}

/// Performance profile of one schedulable device.
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    pub id: DeviceId,
    /// General-purpose peak, GFLOPS.
    pub peak_gflops: f64,
    pub bandwidth_gbps: f64,
    /// Tensor-core throughput when present, TFLOPS.
    pub tensor_tflops: Option<f64>,
    /// AI-accelerator (NPU) throughput when present, TOPS.
    pub ai_tops: Option<f64>,
    /// Matrix-extension throughput when present, GFLOPS.
    pub matrix_gflops: Option<f64>,
    /// SIMD vector throughput, GFLOPS.
    pub simd_gflops: f64,
    pub avg_latency_us: f64,
    pub perf_per_watt: f64,
    /// Operation classes this device can execute.
    pub ops: OpClassSet,
    /// Marks the host CPU, the fallback target of several policies.
    pub host: bool,
}

impl DeviceProfile {
    /// A permissive host-CPU profile.
    pub fn host_cpu(id: DeviceId) -> DeviceProfile {
        DeviceProfile {
            id,
            peak_gflops: 200.0,
            bandwidth_gbps: 50.0,
            tensor_tflops: None,
            ai_tops: None,
            matrix_gflops: Some(100.0),
            simd_gflops: 1000.0,
            avg_latency_us: 1.0,
            perf_per_watt: 5.0,
            ops: OpClassSet::all(),
            host: true,
        }
    }

    pub fn eligible(&self, class: OpClass) -> bool {
        self.ops.contains(class.flag())
    }

    /// Estimated execution time of `op` on this device, seconds.
    pub fn est_time(&self, op: &OpDesc) -> f64 {
        let class = op.class();
        let gflops = match class {
            OpClass::TensorMatMul => self
                .tensor_tflops
                .map(|t| t * 1000.0)
                .unwrap_or(self.peak_gflops),
            OpClass::MatMul => self.matrix_gflops.unwrap_or(self.peak_gflops),
            OpClass::Conv => self
                .ai_tops
                .map(|t| t * 1000.0)
                .or_else(|| self.matrix_gflops)
                .unwrap_or(self.peak_gflops),
            OpClass::Vector => self.simd_gflops,
            OpClass::Memory => {
                // Bandwidth-bound.
                return op.mem_ops() as f64 / (self.bandwidth_gbps * 1e9).max(1.0);
            }
        };
        op.flops().max(1) as f64 / (gflops * 1e9).max(1.0)
    }

    /// Estimated transfer time for `bytes` into or out of this device.
    pub fn est_transfer(&self, bytes: u64) -> f64 {
        bytes as f64 / (self.bandwidth_gbps * 1e9).max(1.0)
    }
}

/// Broad classification of a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadClass {
    ComputeBound,
    MemoryBound,
    Mixed,
}

/// Aggregate analysis of one compute graph.
#[derive(Debug, Clone)]
pub struct WorkloadProfile {
    pub total_flops: u64,
    pub total_mem_ops: u64,
    pub class: WorkloadClass,
    /// FLOPs per memory operation.
    pub compute_intensity: f64,
    /// Max simultaneously-ready nodes over total nodes, 0..=1.
    pub parallelism: f64,
}

/// Analyzes `graph`: totals, boundedness classification, compute
/// intensity and available parallelism.
pub fn analyze(graph: &ComputeGraph) -> WorkloadProfile {
    let total_flops: u64 = graph.nodes.iter().map(|n| n.op.flops()).sum();
    let total_mem_ops: u64 = graph.nodes.iter().map(|n| n.op.mem_ops()).sum();
    let compute_intensity = total_flops as f64 / total_mem_ops.max(1) as f64;
    let class = if compute_intensity > 10.0 {
        WorkloadClass::ComputeBound
    } else if compute_intensity < 1.0 {
        WorkloadClass::MemoryBound
    } else {
        WorkloadClass::Mixed
    };
    let parallelism = match plan::level_schedule(graph) {
        Ok(levels) => {
            let widest = levels.iter().map(Vec::len).max().unwrap_or(0);
            widest as f64 / graph.node_count().max(1) as f64
        }
        Err(_) => 0.0,
    };
    log::debug!(
        "workload: {} flops, {} mem-ops, intensity {:.2}, parallelism {:.2} ({:?})",
        total_flops,
        total_mem_ops,
        compute_intensity,
        parallelism,
        class
    );
    WorkloadProfile {
        total_flops,
        total_mem_ops,
        class,
        compute_intensity,
        parallelism,
    }
}
