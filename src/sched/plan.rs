//! Execution-plan construction: layered levels and the transfer plan.

use std::collections::VecDeque;

use crate::driver::DeviceId;
use crate::error::Result as UclResult;

use super::graph::{ComputeGraph, NodeId};
use super::policy::{self, SchedulingPolicy};
use super::{DeviceProfile, SchedulingError};

/// One planned memory transfer covering a cross-device dependency edge.
#[derive(Debug, Clone, Copy)]
pub struct Transfer {
    pub src_device: DeviceId,
    pub dst_device: DeviceId,
    pub bytes: u64,
    /// Higher priorities issue first; equal priorities may overlap.
    pub priority: u8,
    /// The covered edge, `(producer, consumer)`.
    pub edge: (NodeId, NodeId),
}

/// The scheduler's output: the graph, a node → device assignment,
/// parallel execution levels and a prioritized transfer plan.
///
/// Within one level all nodes may dispatch concurrently; between levels
/// there is a global barrier. Every cross-device dependency edge is
/// covered by exactly one transfer.
#[derive(Debug)]
pub struct ExecutionPlan {
    pub graph: ComputeGraph,
    pub assignment: Vec<DeviceId>,
    pub levels: Vec<Vec<NodeId>>,
    pub transfers: Vec<Transfer>,
}

impl ExecutionPlan {
    /// Devices actually used by the assignment, deduplicated.
    pub fn devices_used(&self) -> Vec<DeviceId> {
        let mut used: Vec<DeviceId> = self.assignment.clone();
        used.sort();
        used.dedup();
        used
    }

    /// Estimated wall time of the plan on `devices`: the longest
    /// per-level node estimate summed across levels, plus transfers.
    /// Used only to compare alternatives.
    pub fn estimated_seconds(&self, devices: &[DeviceProfile]) -> f64 {
        let by_id = |id: DeviceId| devices.iter().find(|d| d.id == id);
        let mut total = 0.0f64;
        for level in &self.levels {
            let slowest = level
                .iter()
                .map(|&n| {
                    let node = &self.graph.nodes[n];
                    node.est_time.unwrap_or_else(|| {
                        by_id(self.assignment[n])
                            .map(|d| d.est_time(&node.op))
                            .unwrap_or(0.0)
                    })
                })
                .fold(0.0f64, f64::max);
            total += slowest;
        }
        for transfer in &self.transfers {
            if let Some(dst) = by_id(transfer.dst_device) {
                total += dst.est_transfer(transfer.bytes);
            }
        }
        total
    }

    /// Checks the structural invariants: levels respect the partial
    /// order and every cross-device edge has exactly one transfer.
    pub fn validate(&self) -> UclResult<()> {
        let mut level_of = vec![usize::MAX; self.graph.node_count()];
        for (li, level) in self.levels.iter().enumerate() {
            for &node in level {
                level_of[node] = li;
            }
        }
        for edge in self.graph.edges() {
            if level_of[edge.src] >= level_of[edge.dst] {
                return Err(SchedulingError::InconsistentPlan {
                    detail: format!(
                        "edge {} -> {} does not cross levels forward",
                        edge.src, edge.dst
                    ),
                }
                .into());
            }
            let covering = self
                .transfers
                .iter()
                .filter(|t| t.edge == (edge.src, edge.dst))
                .count();
            let cross = self.assignment[edge.src] != self.assignment[edge.dst];
            if cross && covering != 1 {
                return Err(SchedulingError::InconsistentPlan {
                    detail: format!(
                        "cross-device edge {} -> {} covered by {} transfer(s)",
                        edge.src, edge.dst, covering
                    ),
                }
                .into());
            }
            if !cross && covering != 0 {
                return Err(SchedulingError::InconsistentPlan {
                    detail: format!(
                        "same-device edge {} -> {} has a transfer",
                        edge.src, edge.dst
                    ),
                }
                .into());
            }
        }
        Ok(())
    }
}

/// Layered topological ordering: a node's level is one past the maximum
/// of its predecessors'. Fails with `CyclicGraph` when the graph has a
/// cycle.
pub(crate) fn level_schedule(graph: &ComputeGraph) -> Result<Vec<Vec<NodeId>>, SchedulingError> {
    let n = graph.node_count();
    let mut indegree = vec![0usize; n];
    let mut succs: Vec<Vec<NodeId>> = vec![Vec::new(); n];
    for edge in graph.edges() {
        indegree[edge.dst] += 1;
        succs[edge.src].push(edge.dst);
    }

    let mut level = vec![0usize; n];
    let mut queue: VecDeque<NodeId> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut visited = 0usize;
    while let Some(node) = queue.pop_front() {
        visited += 1;
        for &succ in &succs[node] {
            level[succ] = level[succ].max(level[node] + 1);
            indegree[succ] -= 1;
            if indegree[succ] == 0 {
                queue.push_back(succ);
            }
        }
    }
    if visited != n {
        return Err(SchedulingError::CyclicGraph);
    }

    let depth = level.iter().copied().max().map(|d| d + 1).unwrap_or(0);
    let mut levels = vec![Vec::new(); depth];
    for (node, &l) in level.iter().enumerate() {
        levels[l].push(node);
    }
    Ok(levels)
}

/// Builds the full execution plan for `graph` over `devices` under
/// `policy`.
pub fn build_plan(
    graph: ComputeGraph,
    devices: &[DeviceProfile],
    policy: SchedulingPolicy,
) -> UclResult<ExecutionPlan> {
    let levels = level_schedule(&graph)?;
    let assignment = policy::assign(&graph, devices, policy)?;

    let mut transfers: Vec<Transfer> = graph
        .edges()
        .iter()
        .filter(|e| assignment[e.src] != assignment[e.dst])
        .map(|e| Transfer {
            src_device: assignment[e.src],
            dst_device: assignment[e.dst],
            bytes: e.bytes,
            priority: e.pattern.priority(),
            edge: (e.src, e.dst),
        })
        .collect();
    // Higher priority issues first; the sort is stable so edge order
    // breaks ties.
    transfers.sort_by(|a, b| b.priority.cmp(&a.priority));

    let plan = ExecutionPlan {
        graph,
        assignment,
        levels,
        transfers,
    };
    plan.validate()?;
    log::debug!(
        "plan: {} node(s) over {} device(s), {} level(s), {} transfer(s)",
        plan.graph.node_count(),
        plan.devices_used().len(),
        plan.levels.len(),
        plan.transfers.len()
    );
    Ok(plan)
}
