//! The compute graph: operation nodes and dependency edges.

use std::sync::Arc;

use crate::driver::DeviceId;
use crate::error::Result as UclResult;

/// Node index within its graph.
pub type NodeId = usize;

/// Work a node performs when dispatched, supplied by the caller.
pub type NodeAction = Arc<dyn Fn() -> UclResult<()> + Send + Sync>;

bitflags::bitflags! {
    /// Operation classes a device can execute.
    pub struct OpClassSet: u32 {
        const TENSOR_MATMUL = 1 << 0;
        const MATMUL        = 1 << 1;
        const CONV          = 1 << 2;
        const VECTOR        = 1 << 3;
        const MEMORY        = 1 << 4;
    }
}

/// Classification of one node's operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    /// Matrix multiply large enough for tensor units.
    TensorMatMul,
    /// Matrix multiply suited to matrix-extension units.
    MatMul,
    Conv,
    Vector,
    Memory,
}

impl OpClass {
    pub fn flag(self) -> OpClassSet {
        match self {
            OpClass::TensorMatMul => OpClassSet::TENSOR_MATMUL,
            OpClass::MatMul => OpClassSet::MATMUL,
            OpClass::Conv => OpClassSet::CONV,
            OpClass::Vector => OpClassSet::VECTOR,
            OpClass::Memory => OpClassSet::MEMORY,
        }
    }
}

/// Element count above which a matrix multiply prefers tensor units.
pub const TENSOR_MATMUL_THRESHOLD: u64 = 1 << 20;

/// Descriptor of one node's operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpDesc {
    MatMul {
        m: usize,
        n: usize,
        k: usize,
    },
    Conv2d {
        /// Input shape, NCHW.
        n: usize,
        c: usize,
        h: usize,
        w: usize,
        /// Filter shape, KCRS (C shared with the input).
        k: usize,
        r: usize,
        s: usize,
        stride: (usize, usize),
        pad: (usize, usize),
    },
    VectorOp {
        len: usize,
    },
    MemoryOp {
        bytes: u64,
    },
}

impl OpDesc {
    /// Output spatial size of a convolution.
    pub fn conv_out_hw(&self) -> Option<(usize, usize)> {
        match *self {
            OpDesc::Conv2d {
                h,
                w,
                r,
                s,
                stride,
                pad,
                ..
            } => {
                let oh = (h + 2 * pad.0 - r) / stride.0 + 1;
                let ow = (w + 2 * pad.1 - s) / stride.1 + 1;
                Some((oh, ow))
            }
            _ => None,
        }
    }

    /// Estimated floating-point operations.
    pub fn flops(&self) -> u64 {
        match *self {
            OpDesc::MatMul { m, n, k } => 2 * (m * n * k) as u64,
            OpDesc::Conv2d { n, c, k, r, s, .. } => {
                let (oh, ow) = self.conv_out_hw().unwrap();
                2 * (n * k * c * r * s * oh * ow) as u64
            }
            OpDesc::VectorOp { len } => len as u64,
            OpDesc::MemoryOp { .. } => 0,
        }
    }

    /// Estimated memory operations (element touches).
    pub fn mem_ops(&self) -> u64 {
        match *self {
            OpDesc::MatMul { m, n, k } => (m * k + k * n + m * n) as u64,
            OpDesc::Conv2d {
                n, c, h, w, k, r, s, ..
            } => {
                let (oh, ow) = self.conv_out_hw().unwrap();
                (n * c * h * w + k * c * r * s + n * k * oh * ow) as u64
            }
            OpDesc::VectorOp { len } => 2 * len as u64,
            OpDesc::MemoryOp { bytes } => bytes,
        }
    }

    pub fn class(&self) -> OpClass {
        match *self {
            OpDesc::MatMul { m, n, k } => {
                if (m * n * k) as u64 > TENSOR_MATMUL_THRESHOLD {
                    OpClass::TensorMatMul
                } else {
                    OpClass::MatMul
                }
            }
            OpDesc::Conv2d { .. } => OpClass::Conv,
            OpDesc::VectorOp { .. } => OpClass::Vector,
            OpDesc::MemoryOp { .. } => OpClass::Memory,
        }
    }
}

/// Access pattern of the bytes carried by a dependency edge. Determines
/// transfer priority: broadcasts are issued first, unknown traffic
/// last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessPattern {
    Sequential,
    Random,
    Strided,
    Broadcast,
    Reduction,
    Unknown,
}

impl AccessPattern {
    pub fn priority(self) -> u8 {
        match self {
            AccessPattern::Broadcast => 5,
            AccessPattern::Reduction => 4,
            AccessPattern::Sequential => 3,
            AccessPattern::Strided => 2,
            AccessPattern::Random => 1,
            AccessPattern::Unknown => 0,
        }
    }
}

/// One compute node.
pub struct Node {
    pub op: OpDesc,
    /// Honored verbatim by the `RespectHints` policy.
    pub preferred: Option<DeviceId>,
    /// Caller-estimated execution time in seconds, overriding the
    /// model.
    pub est_time: Option<f64>,
    /// Work performed when the execution engine dispatches this node.
    pub action: Option<NodeAction>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("op", &self.op)
            .field("preferred", &self.preferred)
            .field("est_time", &self.est_time)
            .field("has_action", &self.action.is_some())
            .finish()
    }
}

/// One dependency edge with its payload size and access pattern.
#[derive(Debug, Clone, Copy)]
pub struct Edge {
    pub src: NodeId,
    pub dst: NodeId,
    pub bytes: u64,
    pub pattern: AccessPattern,
}

/// A directed acyclic graph of compute operations.
///
/// Cycles are representable here; the scheduler rejects them when
/// building a plan.
#[derive(Debug, Default)]
pub struct ComputeGraph {
    pub(crate) nodes: Vec<Node>,
    pub(crate) edges: Vec<Edge>,
}

impl ComputeGraph {
    pub fn new() -> ComputeGraph {
        ComputeGraph::default()
    }

    /// Adds a node, returning its id.
    pub fn add_node(&mut self, op: OpDesc) -> NodeId {
        self.nodes.push(Node {
            op,
            preferred: None,
            est_time: None,
            action: None,
        });
        self.nodes.len() - 1
    }

    /// Sets the preferred device hint of `node`.
    pub fn prefer(&mut self, node: NodeId, device: DeviceId) {
        self.nodes[node].preferred = Some(device);
    }

    /// Overrides the estimated execution time of `node`, seconds.
    pub fn estimate(&mut self, node: NodeId, seconds: f64) {
        self.nodes[node].est_time = Some(seconds);
    }

    /// Attaches the work `node` performs when dispatched.
    pub fn action(
        &mut self,
        node: NodeId,
        action: impl Fn() -> UclResult<()> + Send + Sync + 'static,
    ) {
        self.nodes[node].action = Some(Arc::new(action));
    }

    /// Adds a dependency edge `src → dst` carrying `bytes`.
    pub fn add_edge(&mut self, src: NodeId, dst: NodeId, bytes: u64, pattern: AccessPattern) {
        assert!(
            src < self.nodes.len() && dst < self.nodes.len(),
            "edge references a node out of range"
        );
        self.edges.push(Edge {
            src,
            dst,
            bytes,
            pattern,
        });
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }
}
