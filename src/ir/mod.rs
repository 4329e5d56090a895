//! The device-independent kernel intermediate representation.
//!
//! A [`Module`] owns interned types, functions and entry points. Functions
//! hold basic blocks of SSA values: every value has a type, an opcode
//! discriminator and ordered operand references, and is defined before any
//! use in dominator order (checked by [`verify`]). Modules are constructed
//! through [`ModuleBuilder`], closed, and only then handed to the pass
//! pipeline; a closed module is immutable from the outside and safely
//! shareable.
//!
//! Generic kernels are monomorphized at construction: the IR is always
//! concrete-typed and the pipeline never sees a type parameter.

mod builder;
pub mod verify;

pub use self::builder::{FunctionBuilder, ModuleBuilder};
pub use self::types::{AddrSpace, ScalarKind, TypeId, TypeKind, TypeTable};

pub mod types;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a value within its function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub(crate) u32);

impl ValueId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Identifier of a basic block within its function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub(crate) u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// Identifier of a function within its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncId(pub(crate) u32);

impl FuncId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A compile-time constant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstVal {
    Int(i64),
    Uint(u64),
    Float(f64),
    Bool(bool),
}

impl ConstVal {
    /// The raw bit pattern, used by interpreters and hashing.
    pub fn bits(self) -> u64 {
        match self {
            ConstVal::Int(v) => v as u64,
            ConstVal::Uint(v) => v,
            ConstVal::Float(v) => v.to_bits(),
            ConstVal::Bool(v) => v as u64,
        }
    }
}

/// Binary arithmetic and bitwise operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Min,
    Max,
}

/// Comparison predicates. Signedness comes from the operand type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Read-modify-write atomic operations on a pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtomicRmwOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Min,
    Max,
    Exchange,
}

/// Warp-level (lane-exchange) primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WarpOp {
    /// `(val, lane)`, value held by the named lane.
    ShuffleIdx,
    /// `(val, delta)`, value held by `lane - delta`.
    ShuffleUp,
    /// `(val, delta)`, value held by `lane + delta`.
    ShuffleDown,
    /// `(val, mask)`, value held by `lane ^ mask`.
    ShuffleXor,
    /// `(pred)`, true iff every active lane's predicate is true.
    VoteAll,
    /// `(pred)`, true iff any active lane's predicate is true.
    VoteAny,
    /// `(pred)`, bitmask of lanes with a true predicate.
    Ballot,
}

/// A launch-grid axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Axis::X => "x",
            Axis::Y => "y",
            Axis::Z => "z",
        }
    }
}

/// Device intrinsics addressing the launch geometry and group
/// synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intrinsic {
    /// Flattened-per-axis global thread index.
    GlobalId(Axis),
    /// Thread index within its group.
    LocalId(Axis),
    /// Group index within the grid.
    GroupId(Axis),
    /// Threads per group.
    GroupDim(Axis),
    /// Groups per grid.
    GridDim(Axis),
    /// Lane index within the warp.
    LaneId,
    /// Hardware warp width.
    WarpSize,
    /// Group-wide execution barrier.
    Barrier,
    /// Base pointer of the dynamic shared-memory window.
    SharedBase,
}

/// Precision tier of a tensor (matrix-multiply-accumulate) operation,
/// ordered from least to most precise.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum TensorPrecision {
    Fp16,
    Bf16,
    Tf32,
    Fp32,
}

impl TensorPrecision {
    pub fn name(self) -> &'static str {
        match self {
            TensorPrecision::Fp16 => "fp16",
            TensorPrecision::Bf16 => "bf16",
            TensorPrecision::Tf32 => "tf32",
            TensorPrecision::Fp32 => "fp32",
        }
    }
}

/// Fragment shape of a tensor op. Only the validated shape set is
/// accepted by lowering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorShape {
    pub m: u8,
    pub n: u8,
    pub k: u8,
}

impl TensorShape {
    /// Shapes with defined fragment layouts across all supported tiers.
    pub const VALID: [TensorShape; 4] = [
        TensorShape { m: 16, n: 16, k: 16 },
        TensorShape { m: 16, n: 16, k: 8 },
        TensorShape { m: 32, n: 8, k: 16 },
        TensorShape { m: 8, n: 32, k: 16 },
    ];

    pub fn is_valid(self) -> bool {
        TensorShape::VALID.contains(&self)
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}x{}", self.m, self.n, self.k)
    }
}

/// The opcode discriminator of a value.
///
/// Operand arity and types per opcode are enforced by the verifier; see
/// [`verify::operand_count`].
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// The `n`th entry-point or function parameter, made explicit by the
    /// parameter-materialization pass.
    Param(u32),
    Const(ConstVal),
    /// `(a, b)`.
    Bin(BinOp),
    /// `(a, b)` producing `bool`.
    Cmp(CmpOp),
    /// `(cond, then, else)`.
    Select,
    /// `(src)`; semantics derive from operand/result scalar kinds.
    Cast,
    /// Stack allocation; result is a `local` pointer to the pointee type.
    Alloca,
    /// `(ptr)`.
    Load,
    /// `(ptr, val)`.
    Store,
    /// `(ptr, index)`, element-scaled pointer arithmetic.
    PtrOffset,
    /// `(ptr)`, address of struct field `n`.
    FieldPtr(u32),
    /// Direct call; operands are the arguments.
    Call(FuncId),
    Intr(Intrinsic),
    /// `(ptr, val)` returning the previous value.
    AtomicRmw(AtomicRmwOp),
    /// `(ptr, cmp, new)` returning the previous value.
    AtomicCas,
    Warp(WarpOp),
    /// `(d_ptr, a_ptr, b_ptr, c_ptr)`, `d = a × b + c` on one fragment.
    TensorMma {
        shape: TensorShape,
        precision: TensorPrecision,
    },
    /// Unconditional terminator.
    Br(BlockId),
    /// `(cond)` terminator.
    CondBr(BlockId, BlockId),
    /// Zero or one operand terminator.
    Ret,
    /// Incoming blocks parallel the operand list.
    Phi(Vec<BlockId>),
}

impl Op {
    pub fn is_terminator(&self) -> bool {
        matches!(*self, Op::Br(_) | Op::CondBr(..) | Op::Ret)
    }

    /// True for opcodes whose execution is observable regardless of
    /// whether the result is used.
    pub fn has_side_effect(&self) -> bool {
        matches!(
            *self,
            Op::Store
                | Op::AtomicRmw(_)
                | Op::AtomicCas
                | Op::TensorMma { .. }
                | Op::Intr(Intrinsic::Barrier)
                | Op::Call(_)
                | Op::Br(_)
                | Op::CondBr(..)
                | Op::Ret
        )
    }

    /// True for warp primitives, which exchange data across lanes and
    /// therefore pin the value to its lane position.
    pub fn is_cross_lane(&self) -> bool {
        matches!(*self, Op::Warp(_) | Op::Intr(Intrinsic::Barrier))
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match *self {
            Op::Param(n) => {
                out.push(0);
                out.extend_from_slice(&n.to_le_bytes());
            }
            Op::Const(c) => {
                out.push(1);
                out.extend_from_slice(&c.bits().to_le_bytes());
            }
            Op::Bin(op) => {
                out.push(2);
                out.push(op as u8);
            }
            Op::Cmp(op) => {
                out.push(3);
                out.push(op as u8);
            }
            Op::Select => out.push(4),
            Op::Cast => out.push(5),
            Op::Alloca => out.push(6),
            Op::Load => out.push(7),
            Op::Store => out.push(8),
            Op::PtrOffset => out.push(9),
            Op::FieldPtr(n) => {
                out.push(10);
                out.extend_from_slice(&n.to_le_bytes());
            }
            Op::Call(f) => {
                out.push(11);
                out.extend_from_slice(&f.0.to_le_bytes());
            }
            Op::Intr(i) => {
                out.push(12);
                out.push(intr_tag(i));
            }
            Op::AtomicRmw(op) => {
                out.push(13);
                out.push(op as u8);
            }
            Op::AtomicCas => out.push(14),
            Op::Warp(op) => {
                out.push(15);
                out.push(op as u8);
            }
            Op::TensorMma { shape, precision } => {
                out.push(16);
                out.extend_from_slice(&[shape.m, shape.n, shape.k, precision as u8]);
            }
            Op::Br(b) => {
                out.push(17);
                out.extend_from_slice(&b.0.to_le_bytes());
            }
            Op::CondBr(t, f) => {
                out.push(18);
                out.extend_from_slice(&t.0.to_le_bytes());
                out.extend_from_slice(&f.0.to_le_bytes());
            }
            Op::Ret => out.push(19),
            Op::Phi(ref blocks) => {
                out.push(20);
                out.extend_from_slice(&(blocks.len() as u32).to_le_bytes());
                for b in blocks {
                    out.extend_from_slice(&b.0.to_le_bytes());
                }
            }
        }
    }
}

fn intr_tag(i: Intrinsic) -> u8 {
    match i {
        Intrinsic::GlobalId(a) => a.index() as u8,
        Intrinsic::LocalId(a) => 3 + a.index() as u8,
        Intrinsic::GroupId(a) => 6 + a.index() as u8,
        Intrinsic::GroupDim(a) => 9 + a.index() as u8,
        Intrinsic::GridDim(a) => 12 + a.index() as u8,
        Intrinsic::LaneId => 15,
        Intrinsic::WarpSize => 16,
        Intrinsic::Barrier => 17,
        Intrinsic::SharedBase => 18,
    }
}

/// Source provenance of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugLoc {
    pub line: u32,
    pub col: u32,
}

/// One SSA value: type, opcode and ordered operands.
#[derive(Debug, Clone)]
pub struct ValueData {
    pub ty: TypeId,
    pub op: Op,
    pub operands: Vec<ValueId>,
    pub dbg: Option<DebugLoc>,
}

/// A basic block: an ordered value list whose last element is the
/// terminator.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub insts: Vec<ValueId>,
}

/// A function: parameter types, a value arena and basic blocks. Block 0
/// is the entry block.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub params: Vec<TypeId>,
    pub ret: TypeId,
    pub blocks: Vec<Block>,
    pub(crate) vals: Vec<ValueData>,
}

impl Function {
    pub fn value(&self, id: ValueId) -> &ValueData {
        &self.vals[id.index()]
    }

    pub(crate) fn value_mut(&mut self, id: ValueId) -> &mut ValueData {
        &mut self.vals[id.index()]
    }

    pub fn value_count(&self) -> usize {
        self.vals.len()
    }

    pub fn entry_block(&self) -> BlockId {
        BlockId(0)
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> {
        (0..self.blocks.len() as u32).map(BlockId)
    }

    /// The terminator of `block`, if the block is non-empty.
    pub fn terminator(&self, block: BlockId) -> Option<ValueId> {
        self.blocks[block.index()]
            .insts
            .last()
            .copied()
            .filter(|&id| self.value(id).op.is_terminator())
    }

    /// Control-flow successors of `block`.
    pub fn successors(&self, block: BlockId) -> Vec<BlockId> {
        match self.terminator(block).map(|id| &self.value(id).op) {
            Some(&Op::Br(t)) => vec![t],
            Some(&Op::CondBr(t, f)) => vec![t, f],
            _ => Vec::new(),
        }
    }

    /// Predecessor lists for every block.
    pub fn predecessors(&self) -> Vec<Vec<BlockId>> {
        let mut preds = vec![Vec::new(); self.blocks.len()];
        for b in self.block_ids() {
            for succ in self.successors(b) {
                preds[succ.index()].push(b);
            }
        }
        preds
    }

    /// Blocks in reverse postorder from the entry.
    pub fn rpo(&self) -> Vec<BlockId> {
        let mut visited = vec![false; self.blocks.len()];
        let mut post = Vec::with_capacity(self.blocks.len());
        // Iterative DFS; the explicit stack carries a child cursor.
        let mut stack: Vec<(BlockId, usize)> = vec![(self.entry_block(), 0)];
        visited[0] = true;
        while let Some(top) = stack.last_mut() {
            let (block, cursor) = *top;
            let succs = self.successors(block);
            if cursor < succs.len() {
                top.1 += 1;
                let next = succs[cursor];
                if !visited[next.index()] {
                    visited[next.index()] = true;
                    stack.push((next, 0));
                }
            } else {
                post.push(block);
                stack.pop();
            }
        }
        post.reverse();
        post
    }

    /// Number of uses of each value across the function.
    pub fn use_counts(&self) -> Vec<u32> {
        let mut counts = vec![0u32; self.vals.len()];
        for block in &self.blocks {
            for &id in &block.insts {
                for &opnd in &self.value(id).operands {
                    counts[opnd.index()] += 1;
                }
            }
        }
        counts
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.name.len() as u32).to_le_bytes());
        out.extend_from_slice(self.name.as_bytes());
        out.extend_from_slice(&(self.params.len() as u32).to_le_bytes());
        for p in &self.params {
            out.extend_from_slice(&p.0.to_le_bytes());
        }
        out.extend_from_slice(&self.ret.0.to_le_bytes());
        out.extend_from_slice(&(self.blocks.len() as u32).to_le_bytes());
        for block in &self.blocks {
            out.extend_from_slice(&(block.insts.len() as u32).to_le_bytes());
            for &id in &block.insts {
                let val = self.value(id);
                out.extend_from_slice(&id.0.to_le_bytes());
                out.extend_from_slice(&val.ty.0.to_le_bytes());
                val.op.encode(out);
                out.extend_from_slice(&(val.operands.len() as u32).to_le_bytes());
                for opnd in &val.operands {
                    out.extend_from_slice(&opnd.0.to_le_bytes());
                }
            }
        }
    }
}

/// Host-visible classification of one entry-point parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamKind {
    /// A device buffer of the given element kind, passed by global
    /// pointer.
    Buffer(ScalarKind),
    /// An immediate scalar, marshaled by value.
    Scalar(ScalarKind),
}

/// Size and alignment of one entry-point parameter as declared by the
/// frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamLayout {
    pub kind: ParamKind,
    pub size: u32,
    pub align: u32,
}

impl ParamLayout {
    pub fn buffer(elem: ScalarKind) -> ParamLayout {
        ParamLayout {
            kind: ParamKind::Buffer(elem),
            size: 8,
            align: 8,
        }
    }

    pub fn scalar(kind: ScalarKind) -> ParamLayout {
        ParamLayout {
            kind: ParamKind::Scalar(kind),
            size: kind.size() as u32,
            align: kind.align() as u32,
        }
    }
}

/// Optional platform-optimization hints attached by the frontend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryAttrs {
    /// Requested tensor-op precision; lowering picks the smallest
    /// supported tier at or above it.
    pub tensor_precision: Option<TensorPrecision>,
    /// Marks call sites within this entry hot for the inliner.
    pub hot: bool,
}

/// A kernel function visible from the host, with its launch signature.
#[derive(Debug, Clone)]
pub struct EntryPoint {
    pub func: FuncId,
    pub name: String,
    /// Launch-index dimensionality, 1–3.
    pub dims: u8,
    pub params: Vec<ParamLayout>,
    /// Statically known shared-memory requirement in bytes.
    pub shared_bytes: u32,
    /// Whether the runtime may pick the group size itself.
    pub implicit_group: bool,
    pub attrs: EntryAttrs,
}

/// The IR container: types, functions, globals and entry points.
///
/// A module is mutable while being built, then closed exactly once.
/// Closing is the hand-off point to the compilation pipeline; a closed
/// module never changes again and its content hash is stable.
#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub types: TypeTable,
    pub(crate) funcs: Vec<Function>,
    pub(crate) entries: Vec<EntryPoint>,
    closed: bool,
}

impl Module {
    pub(crate) fn new(name: &str) -> Module {
        Module {
            name: name.to_owned(),
            types: TypeTable::new(),
            funcs: Vec::new(),
            entries: Vec::new(),
            closed: false,
        }
    }

    pub fn func(&self, id: FuncId) -> &Function {
        &self.funcs[id.index()]
    }

    pub(crate) fn func_mut(&mut self, id: FuncId) -> &mut Function {
        debug_assert!(
            !self.closed,
            "attempted to mutate closed module '{}'",
            self.name
        );
        &mut self.funcs[id.index()]
    }

    pub fn func_ids(&self) -> impl Iterator<Item = FuncId> {
        (0..self.funcs.len() as u32).map(FuncId)
    }

    pub fn funcs(&self) -> &[Function] {
        &self.funcs
    }

    pub fn entry_points(&self) -> &[EntryPoint] {
        &self.entries
    }

    pub fn entry_point(&self, name: &str) -> Option<&EntryPoint> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Freezes the module. No further edits are possible through the
    /// public surface; passes operate on a private clone.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Unfreezes a pipeline-private clone so passes may transform it.
    /// Never exposed: the original stays closed and shareable.
    pub(crate) fn reopen(&mut self) {
        self.closed = false;
    }

    /// Deterministic byte encoding of the full module content, used as
    /// the basis of the cache fingerprint.
    pub fn encode_for_hash(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4096);
        out.extend_from_slice(&(self.name.len() as u32).to_le_bytes());
        out.extend_from_slice(self.name.as_bytes());
        self.types.encode(&mut out);
        out.extend_from_slice(&(self.funcs.len() as u32).to_le_bytes());
        for func in &self.funcs {
            func.encode(&mut out);
        }
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for entry in &self.entries {
            out.extend_from_slice(&entry.func.0.to_le_bytes());
            out.extend_from_slice(entry.name.as_bytes());
            out.push(entry.dims);
            out.push(entry.implicit_group as u8);
            out.extend_from_slice(&entry.shared_bytes.to_le_bytes());
            for p in &entry.params {
                out.extend_from_slice(&p.size.to_le_bytes());
                out.extend_from_slice(&p.align.to_le_bytes());
            }
        }
        out
    }
}
