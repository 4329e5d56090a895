//! Device-assignment policies.

use crate::driver::DeviceId;
use crate::error::Result as UclResult;

use super::graph::{ComputeGraph, NodeId, OpClass};
use super::plan::level_schedule;
use super::{DeviceProfile, SchedulingError};

/// Selectable node → device assignment strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingPolicy {
    /// Highest relevant performance figure per op class, with a
    /// locality adjustment against transfer cost.
    PerformanceOptimized,
    /// Best performance-per-watt among eligible devices; host fallback.
    EnergyEfficient,
    /// Lowest accumulated estimated time, in topological order.
    LoadBalanced,
    /// Lowest average launch latency among eligible devices.
    LatencyOptimized,
    /// The node's preferred device, as given.
    RespectHints,
}

impl SchedulingPolicy {
    /// Parses the `UCL_SCHED_POLICY` environment value.
    pub fn from_name(name: &str) -> Option<SchedulingPolicy> {
        match name.to_ascii_lowercase().as_str() {
            "performance" | "perf" => Some(SchedulingPolicy::PerformanceOptimized),
            "energy" => Some(SchedulingPolicy::EnergyEfficient),
            "load" | "balanced" => Some(SchedulingPolicy::LoadBalanced),
            "latency" => Some(SchedulingPolicy::LatencyOptimized),
            "hints" => Some(SchedulingPolicy::RespectHints),
            _ => None,
        }
    }
}

fn eligible<'d>(
    devices: &'d [DeviceProfile],
    class: OpClass,
) -> impl Iterator<Item = &'d DeviceProfile> {
    devices.iter().filter(move |d| d.eligible(class))
}

fn host_fallback(devices: &[DeviceProfile]) -> Option<&DeviceProfile> {
    devices.iter().find(|d| d.host)
}

fn no_device(node: NodeId, class: OpClass) -> crate::error::Error {
    SchedulingError::NoEligibleDevice { node, class }.into()
}

/// Assigns every node of `graph` to a device under `policy`.
pub fn assign(
    graph: &ComputeGraph,
    devices: &[DeviceProfile],
    policy: SchedulingPolicy,
) -> UclResult<Vec<DeviceId>> {
    match policy {
        SchedulingPolicy::PerformanceOptimized => assign_performance(graph, devices),
        SchedulingPolicy::EnergyEfficient => assign_by_metric(graph, devices, true, |d| {
            d.perf_per_watt
        }),
        SchedulingPolicy::LoadBalanced => assign_load_balanced(graph, devices),
        SchedulingPolicy::LatencyOptimized => assign_by_metric(graph, devices, false, |d| {
            -d.avg_latency_us
        }),
        SchedulingPolicy::RespectHints => assign_hints(graph, devices),
    }
}

/// Picks the device with the highest relevant performance figure for
/// each node's class, then reconsiders against predecessor locality:
/// staying on the producer's device wins when it beats the pick plus
/// the transfer it would need.
fn assign_performance(
    graph: &ComputeGraph,
    devices: &[DeviceProfile],
) -> UclResult<Vec<DeviceId>> {
    let mut assignment = Vec::with_capacity(graph.node_count());
    for (id, node) in graph.nodes.iter().enumerate() {
        let class = node.op.class();
        let best = eligible(devices, class)
            .max_by(|a, b| {
                metric_for(a, class)
                    .partial_cmp(&metric_for(b, class))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .ok_or_else(|| no_device(id, class))?;
        assignment.push(best.id);
    }

    // Locality pass in topological order.
    let levels = level_schedule(graph)?;
    let by_id = |id: DeviceId| devices.iter().find(|d| d.id == id).unwrap();
    for level in &levels {
        for &node in level {
            let class = graph.nodes[node].op.class();
            let chosen = by_id(assignment[node]);
            let incoming: Vec<_> = graph
                .edges
                .iter()
                .filter(|e| e.dst == node && assignment[e.src] != chosen.id)
                .collect();
            if incoming.is_empty() {
                continue;
            }
            let transfer_bytes: u64 = incoming.iter().map(|e| e.bytes).sum();
            let producer = by_id(assignment[incoming[0].src]);
            if !producer.eligible(class) {
                continue;
            }
            let cost_move =
                chosen.est_time(&graph.nodes[node].op) + chosen.est_transfer(transfer_bytes);
            let cost_stay = producer.est_time(&graph.nodes[node].op);
            if cost_stay <= cost_move {
                log::trace!(
                    "node {}: staying on {} (saves transfer of {} bytes)",
                    node,
                    producer.id,
                    transfer_bytes
                );
                assignment[node] = producer.id;
            }
        }
    }
    Ok(assignment)
}

/// The performance figure relevant to `class` on `device`.
fn metric_for(device: &DeviceProfile, class: OpClass) -> f64 {
    match class {
        OpClass::TensorMatMul => device
            .tensor_tflops
            .map(|t| t * 1000.0)
            .unwrap_or(device.peak_gflops),
        OpClass::MatMul => device.matrix_gflops.unwrap_or(device.peak_gflops),
        OpClass::Conv => device
            .ai_tops
            .map(|t| t * 1000.0)
            .or(device.matrix_gflops)
            .unwrap_or(device.peak_gflops),
        OpClass::Vector => device.simd_gflops,
        OpClass::Memory => device.bandwidth_gbps,
    }
}

/// Shared shape of the energy and latency policies: maximize a scalar
/// metric over eligible devices; optionally fall back to the host when
/// nothing is eligible.
fn assign_by_metric(
    graph: &ComputeGraph,
    devices: &[DeviceProfile],
    host_fallback_allowed: bool,
    metric: impl Fn(&DeviceProfile) -> f64,
) -> UclResult<Vec<DeviceId>> {
    let mut assignment = Vec::with_capacity(graph.node_count());
    for (id, node) in graph.nodes.iter().enumerate() {
        let class = node.op.class();
        let best = eligible(devices, class).max_by(|a, b| {
            metric(a)
                .partial_cmp(&metric(b))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let device = match (best, host_fallback_allowed) {
            (Some(d), _) => d,
            (None, true) => host_fallback(devices).ok_or_else(|| no_device(id, class))?,
            (None, false) => return Err(no_device(id, class)),
        };
        assignment.push(device.id);
    }
    Ok(assignment)
}

/// Topological-order assignment to the eligible device with the lowest
/// accumulated estimated time.
fn assign_load_balanced(
    graph: &ComputeGraph,
    devices: &[DeviceProfile],
) -> UclResult<Vec<DeviceId>> {
    let levels = level_schedule(graph)?;
    let mut accumulated: Vec<f64> = vec![0.0; devices.len()];
    let mut assignment = vec![DeviceId(0); graph.node_count()];

    for level in &levels {
        for &node in level {
            let class = graph.nodes[node].op.class();
            let candidate = devices
                .iter()
                .enumerate()
                .filter(|(_, d)| d.eligible(class))
                .min_by(|(ia, _), (ib, _)| {
                    accumulated[*ia]
                        .partial_cmp(&accumulated[*ib])
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
            let (idx, device) = match candidate {
                Some(found) => found,
                None => {
                    let host = host_fallback(devices).ok_or_else(|| no_device(node, class))?;
                    let idx = devices.iter().position(|d| d.id == host.id).unwrap();
                    (idx, host)
                }
            };
            let est = graph.nodes[node]
                .est_time
                .unwrap_or_else(|| device.est_time(&graph.nodes[node].op));
            accumulated[idx] += est;
            assignment[node] = device.id;
        }
    }
    Ok(assignment)
}

/// Uses preferred devices verbatim; nodes without a hint fall back to
/// the performance pick.
fn assign_hints(graph: &ComputeGraph, devices: &[DeviceProfile]) -> UclResult<Vec<DeviceId>> {
    let base = assign_performance(graph, devices)?;
    let mut assignment = Vec::with_capacity(graph.node_count());
    for (id, node) in graph.nodes.iter().enumerate() {
        match node.preferred {
            Some(preferred) => {
                if !devices.iter().any(|d| d.id == preferred) {
                    return Err(no_device(id, node.op.class()));
                }
                assignment.push(preferred);
            }
            None => assignment.push(base[id]),
        }
    }
    Ok(assignment)
}
