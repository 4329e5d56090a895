//! The CPU backend.
//!
//! Lowers each entry point to a host-executable image in process memory:
//! a compact register-machine program plus its argument-marshaling table.
//! Launches partition the grid across a bounded worker pool sized to the
//! logical CPU count. Groups whose kernels use barriers or warp
//! primitives run under a phased executor that suspends and resumes
//! threads around each synchronization point; straight-line element-wise
//! kernels take a fast path batched into SIMD-width lanes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::{
    Artifact, ArtifactBody, Backend, BackendKind, CompilationError, DeviceFeatures, EntryMeta,
    Fingerprint, TargetCaps,
};
use crate::ir::{
    AtomicRmwOp, Axis, BinOp, BlockId, CmpOp, Function, Intrinsic, Module, Op, ParamKind,
    ScalarKind, TensorPrecision, TensorShape, TypeKind, ValueId, WarpOp,
};
use crate::pass::{self, Pass};

//=============================================================================
//=============================== HOST IMAGE ==================================
//=============================================================================

/// Virtual-address segment tags (top 16 bits).
const SEG_SHIFT: u32 = 48;
const SEG_MASK: u64 = 0xffff << SEG_SHIFT;
const OFF_MASK: u64 = !SEG_MASK;
const SEG_SHARED: u64 = 0xfffe << SEG_SHIFT;
const SEG_LOCAL: u64 = 0xfffd << SEG_SHIFT;

fn seg_param(index: u32) -> u64 {
    ((index as u64) + 1) << SEG_SHIFT
}

/// Register index within a thread's register file.
pub type Reg = u32;

/// Geometry and identity reads available to kernel code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrSel {
    GlobalId(u8),
    LocalId(u8),
    GroupId(u8),
    GroupDim(u8),
    GridDim(u8),
    LaneId,
    WarpSize,
}

/// One host-machine instruction.
#[derive(Debug, Clone)]
pub enum HostInst {
    Const {
        dst: Reg,
        bits: u64,
    },
    Mov {
        dst: Reg,
        src: Reg,
    },
    Bin {
        op: BinOp,
        kind: ScalarKind,
        dst: Reg,
        a: Reg,
        b: Reg,
    },
    Cmp {
        op: CmpOp,
        kind: ScalarKind,
        dst: Reg,
        a: Reg,
        b: Reg,
    },
    Select {
        dst: Reg,
        cond: Reg,
        a: Reg,
        b: Reg,
    },
    Cast {
        from: ScalarKind,
        to: ScalarKind,
        dst: Reg,
        src: Reg,
    },
    /// Base address of buffer parameter `index`.
    ParamPtr {
        dst: Reg,
        index: u32,
    },
    /// Immediate value of scalar parameter `index`.
    ParamVal {
        dst: Reg,
        index: u32,
    },
    Intr {
        sel: IntrSel,
        dst: Reg,
    },
    Load {
        kind: ScalarKind,
        dst: Reg,
        addr: Reg,
    },
    Store {
        kind: ScalarKind,
        addr: Reg,
        src: Reg,
    },
    AtomicRmw {
        op: AtomicRmwOp,
        kind: ScalarKind,
        dst: Reg,
        addr: Reg,
        src: Reg,
    },
    AtomicCas {
        kind: ScalarKind,
        dst: Reg,
        addr: Reg,
        cmp: Reg,
        new: Reg,
    },
    /// Scalar multiply-add over one fragment; registers hold the four
    /// fragment base addresses.
    Mma {
        shape: TensorShape,
        precision: TensorPrecision,
        d: Reg,
        a: Reg,
        b: Reg,
        c: Reg,
    },
    Barrier,
    Shuffle {
        mode: WarpOp,
        dst: Reg,
        val: Reg,
        lane: Reg,
    },
    Vote {
        mode: WarpOp,
        dst: Reg,
        pred: Reg,
    },
    Jump {
        target: u32,
    },
    Branch {
        cond: Reg,
        then: u32,
        els: u32,
    },
    Ret,
}

/// One lowered entry point.
#[derive(Debug, Clone)]
pub struct HostEntry {
    pub name: String,
    pub code: Vec<HostInst>,
    pub nregs: u32,
    pub params: Vec<crate::ir::ParamLayout>,
    pub shared_bytes: u32,
    /// Per-thread stack-allocation arena size.
    pub local_bytes: u32,
    pub simd_width: u32,
    /// Whether the phased (barrier-correct) executor is required.
    pub uses_group_sync: bool,
}

/// A host-native executable image in process memory.
#[derive(Debug, Clone)]
pub struct HostImage {
    pub entries: Vec<HostEntry>,
}

impl HostImage {
    pub fn size_bytes(&self) -> usize {
        self.entries
            .iter()
            .map(|e| e.code.len() * std::mem::size_of::<HostInst>() + e.name.len())
            .sum()
    }
}

//=============================================================================
//================================ LOWERING ===================================
//=============================================================================

pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> CpuBackend {
        CpuBackend
    }
}

impl Default for CpuBackend {
    fn default() -> CpuBackend {
        CpuBackend::new()
    }
}

impl Backend for CpuBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cpu
    }

    fn query_caps(&self) -> TargetCaps {
        TargetCaps::host()
    }

    fn lower(&self, module: &Module, caps: &TargetCaps) -> Result<Artifact, CompilationError> {
        // The host machine has no cross-function ABI worth keeping;
        // flatten every remaining call into its entry point.
        let mut flat = module.clone();
        flat.reopen();
        let inliner = pass::Inline {
            threshold: usize::MAX,
            fuel: 4096,
        };
        inliner.run(&mut flat, caps)?;

        let mut entries = Vec::with_capacity(flat.entry_points().len());
        for entry in flat.entry_points() {
            let func = flat.func(entry.func);
            let lowered = lower_entry(&flat, func, entry, caps)?;
            entries.push(lowered);
        }

        let metas = entries
            .iter()
            .map(|e: &HostEntry| EntryMeta {
                name: e.name.clone(),
                params: e.params.clone(),
                shared_bytes: e.shared_bytes,
                simd_width: e.simd_width,
            })
            .collect();

        Ok(Artifact {
            backend: BackendKind::Cpu,
            fingerprint: Fingerprint([0; 16]),
            body: ArtifactBody::Host(HostImage { entries }),
            requires: DeviceFeatures::empty(),
            min_compute: (0, 0),
            entries: metas,
        })
    }
}

fn unsupported(func: &Function, op: &Op) -> CompilationError {
    CompilationError::UnsupportedOpcode {
        backend: BackendKind::Cpu,
        op: format!("{:?}", op),
        func: func.name.clone(),
    }
}

fn lower_entry(
    module: &Module,
    func: &Function,
    entry: &crate::ir::EntryPoint,
    caps: &TargetCaps,
) -> Result<HostEntry, CompilationError> {
    let types = &module.types;
    let nvals = func.value_count() as u32;
    let mut code: Vec<HostInst> = Vec::with_capacity(nvals as usize * 2);
    let mut block_offsets = vec![u32::MAX; func.blocks.len()];
    let mut next_reg = nvals;
    let mut local_bytes = 0u32;
    let mut uses_group_sync = false;
    let mut min_lane_width = u32::MAX;

    // Phi moves belong to their edge: a conditional branch must not
    // perform the copies of the arm it does not take, so edges with
    // moves get a trampoline stub.
    let mut edge_moves: std::collections::HashMap<(u32, u32), Vec<(Reg, Reg)>> =
        std::collections::HashMap::new();
    for b in func.block_ids() {
        for &id in &func.blocks[b.index()].insts {
            let val = func.value(id);
            if let Op::Phi(ref incoming) = val.op {
                for (&src_block, &src_val) in incoming.iter().zip(val.operands.iter()) {
                    edge_moves
                        .entry((src_block.0, b.0))
                        .or_default()
                        .push((id.0, src_val.0));
                }
            }
        }
    }

    // Branch fields first hold block ids; stubs store code offsets
    // tagged with this bit so the patch pass can tell them apart.
    const RESOLVED: u32 = 1 << 31;
    let mut stubs: Vec<(usize, bool, BlockId, BlockId)> = Vec::new();

    for b in func.block_ids() {
        block_offsets[b.index()] = code.len() as u32;
        for &id in &func.blocks[b.index()].insts {
            let val = func.value(id);
            let dst = id.0;
            let opnd = |i: usize| val.operands[i].0;
            let kind_of = |v: ValueId| types.scalar_kind(func.value(v).ty);

            match val.op {
                Op::Phi(_) => {} // receives via edge moves
                Op::Const(c) => code.push(HostInst::Const { dst, bits: c.bits() }),
                Op::Param(i) => match entry.params.get(i as usize).map(|p| p.kind) {
                    Some(ParamKind::Buffer(_)) | None => {
                        code.push(HostInst::ParamPtr { dst, index: i })
                    }
                    Some(ParamKind::Scalar(_)) => {
                        code.push(HostInst::ParamVal { dst, index: i })
                    }
                },
                Op::Bin(op) => {
                    let kind = types
                        .scalar_kind(val.ty)
                        .ok_or_else(|| unsupported(func, &val.op))?;
                    code.push(HostInst::Bin {
                        op,
                        kind,
                        dst,
                        a: opnd(0),
                        b: opnd(1),
                    });
                }
                Op::Cmp(op) => {
                    let kind = kind_of(val.operands[0])
                        .ok_or_else(|| unsupported(func, &val.op))?;
                    code.push(HostInst::Cmp {
                        op,
                        kind,
                        dst,
                        a: opnd(0),
                        b: opnd(1),
                    });
                }
                Op::Select => code.push(HostInst::Select {
                    dst,
                    cond: opnd(0),
                    a: opnd(1),
                    b: opnd(2),
                }),
                Op::Cast => {
                    let from = kind_of(val.operands[0])
                        .ok_or_else(|| unsupported(func, &val.op))?;
                    let to = types
                        .scalar_kind(val.ty)
                        .ok_or_else(|| unsupported(func, &val.op))?;
                    code.push(HostInst::Cast {
                        from,
                        to,
                        dst,
                        src: opnd(0),
                    });
                }
                Op::Alloca => {
                    let pointee = types.pointee(val.ty).expect("alloca result is a pointer");
                    let align = types.align_of(pointee).max(1) as u32;
                    let offset = (local_bytes + align - 1) / align * align;
                    local_bytes = offset + types.size_of(pointee) as u32;
                    code.push(HostInst::Const {
                        dst,
                        bits: SEG_LOCAL | offset as u64,
                    });
                }
                Op::Load => {
                    let kind = elem_kind(types, func, val.operands[0])
                        .ok_or_else(|| unsupported(func, &val.op))?;
                    min_lane_width = min_lane_width.min(caps.max_simd_width(kind));
                    code.push(HostInst::Load {
                        kind,
                        dst,
                        addr: opnd(0),
                    });
                }
                Op::Store => {
                    let kind = elem_kind(types, func, val.operands[0])
                        .ok_or_else(|| unsupported(func, &val.op))?;
                    min_lane_width = min_lane_width.min(caps.max_simd_width(kind));
                    code.push(HostInst::Store {
                        kind,
                        addr: opnd(0),
                        src: opnd(1),
                    });
                }
                Op::PtrOffset => {
                    let pointee = types
                        .pointee(func.value(val.operands[0]).ty)
                        .ok_or_else(|| unsupported(func, &val.op))?;
                    let size = types.size_of(pointee);
                    // addr = base + zext(index) * size
                    let idx_kind =
                        kind_of(val.operands[1]).ok_or_else(|| unsupported(func, &val.op))?;
                    let idx64 = next_reg;
                    next_reg += 1;
                    code.push(HostInst::Cast {
                        from: idx_kind,
                        to: ScalarKind::U64,
                        dst: idx64,
                        src: opnd(1),
                    });
                    let size_reg = next_reg;
                    next_reg += 1;
                    code.push(HostInst::Const {
                        dst: size_reg,
                        bits: size,
                    });
                    let scaled = next_reg;
                    next_reg += 1;
                    code.push(HostInst::Bin {
                        op: BinOp::Mul,
                        kind: ScalarKind::U64,
                        dst: scaled,
                        a: idx64,
                        b: size_reg,
                    });
                    code.push(HostInst::Bin {
                        op: BinOp::Add,
                        kind: ScalarKind::U64,
                        dst,
                        a: opnd(0),
                        b: scaled,
                    });
                }
                Op::FieldPtr(n) => {
                    let pointee = types
                        .pointee(func.value(val.operands[0]).ty)
                        .ok_or_else(|| unsupported(func, &val.op))?;
                    let offset = types.field_offset(pointee, n);
                    let off_reg = next_reg;
                    next_reg += 1;
                    code.push(HostInst::Const {
                        dst: off_reg,
                        bits: offset,
                    });
                    code.push(HostInst::Bin {
                        op: BinOp::Add,
                        kind: ScalarKind::U64,
                        dst,
                        a: opnd(0),
                        b: off_reg,
                    });
                }
                Op::Intr(intr) => match intr {
                    Intrinsic::Barrier => {
                        uses_group_sync = true;
                        code.push(HostInst::Barrier);
                    }
                    Intrinsic::SharedBase => code.push(HostInst::Const {
                        dst,
                        bits: SEG_SHARED,
                    }),
                    other => code.push(HostInst::Intr {
                        sel: intr_sel(other),
                        dst,
                    }),
                },
                Op::AtomicRmw(op) => {
                    let kind = elem_kind(types, func, val.operands[0])
                        .ok_or_else(|| unsupported(func, &val.op))?;
                    code.push(HostInst::AtomicRmw {
                        op,
                        kind,
                        dst,
                        addr: opnd(0),
                        src: opnd(1),
                    });
                }
                Op::AtomicCas => {
                    let kind = elem_kind(types, func, val.operands[0])
                        .ok_or_else(|| unsupported(func, &val.op))?;
                    code.push(HostInst::AtomicCas {
                        kind,
                        dst,
                        addr: opnd(0),
                        cmp: opnd(1),
                        new: opnd(2),
                    });
                }
                Op::Warp(mode) => {
                    uses_group_sync = true;
                    match mode {
                        WarpOp::VoteAll | WarpOp::VoteAny | WarpOp::Ballot => {
                            code.push(HostInst::Vote {
                                mode,
                                dst,
                                pred: opnd(0),
                            })
                        }
                        _ => code.push(HostInst::Shuffle {
                            mode,
                            dst,
                            val: opnd(0),
                            lane: opnd(1),
                        }),
                    }
                }
                Op::TensorMma { shape, precision } => {
                    if !shape.is_valid() {
                        return Err(CompilationError::UnsupportedCapability {
                            backend: BackendKind::Cpu,
                            detail: format!("tensor fragment shape {} is not defined", shape),
                        });
                    }
                    code.push(HostInst::Mma {
                        shape,
                        precision,
                        d: opnd(0),
                        a: opnd(1),
                        b: opnd(2),
                        c: opnd(3),
                    });
                }
                Op::Br(target) => {
                    if let Some(moves) = edge_moves.get(&(b.0, target.0)) {
                        emit_phi_moves(&mut code, moves, &mut next_reg);
                    }
                    code.push(HostInst::Jump { target: target.0 });
                }
                Op::CondBr(then, els) => {
                    let inst_idx = code.len();
                    if edge_moves.contains_key(&(b.0, then.0)) {
                        stubs.push((inst_idx, true, b, then));
                    }
                    if edge_moves.contains_key(&(b.0, els.0)) {
                        stubs.push((inst_idx, false, b, els));
                    }
                    code.push(HostInst::Branch {
                        cond: opnd(0),
                        then: then.0,
                        els: els.0,
                    });
                }
                Op::Ret => {
                    code.push(HostInst::Ret);
                }
                Op::Call(_) => return Err(unsupported(func, &val.op)),
            }
        }
    }

    // Trampolines for conditional edges that carry phi moves.
    for (inst_idx, is_then, src, dst) in stubs {
        let stub_pos = code.len() as u32;
        let moves = edge_moves
            .get(&(src.0, dst.0))
            .expect("stub for edge without moves");
        emit_phi_moves(&mut code, moves, &mut next_reg);
        code.push(HostInst::Jump { target: dst.0 });
        match code[inst_idx] {
            HostInst::Branch {
                ref mut then,
                ref mut els,
                ..
            } => {
                if is_then {
                    *then = stub_pos | RESOLVED;
                } else {
                    *els = stub_pos | RESOLVED;
                }
            }
            _ => unreachable!("stub records a branch"),
        }
    }

    // Branch targets were recorded as block ids; patch to offsets.
    let patch = |target: &mut u32| {
        if *target & RESOLVED != 0 {
            *target &= !RESOLVED;
        } else {
            *target = block_offsets[*target as usize];
        }
    };
    for inst in code.iter_mut() {
        match inst {
            HostInst::Jump { target } => patch(target),
            HostInst::Branch { then, els, .. } => {
                patch(then);
                patch(els);
            }
            _ => {}
        }
    }

    // Innermost lanes vectorize only for straight-per-thread kernels with
    // a supported width for every element type touched.
    let simd_width = if uses_group_sync || entry.dims != 1 || min_lane_width == 0 {
        1
    } else if min_lane_width == u32::MAX {
        caps.max_simd_width(ScalarKind::F32)
    } else {
        min_lane_width
    };

    Ok(HostEntry {
        name: entry.name.clone(),
        code,
        nregs: next_reg,
        params: entry.params.clone(),
        shared_bytes: entry.shared_bytes,
        local_bytes,
        simd_width: simd_width.max(1),
        uses_group_sync,
    })
}

fn elem_kind(
    types: &crate::ir::TypeTable,
    func: &Function,
    ptr: ValueId,
) -> Option<ScalarKind> {
    let pointee = types.pointee(func.value(ptr).ty)?;
    match *types.kind(pointee) {
        TypeKind::Scalar(kind) => Some(kind),
        _ => None,
    }
}

fn intr_sel(intr: Intrinsic) -> IntrSel {
    let ax = |a: Axis| a.index() as u8;
    match intr {
        Intrinsic::GlobalId(a) => IntrSel::GlobalId(ax(a)),
        Intrinsic::LocalId(a) => IntrSel::LocalId(ax(a)),
        Intrinsic::GroupId(a) => IntrSel::GroupId(ax(a)),
        Intrinsic::GroupDim(a) => IntrSel::GroupDim(ax(a)),
        Intrinsic::GridDim(a) => IntrSel::GridDim(ax(a)),
        Intrinsic::LaneId => IntrSel::LaneId,
        Intrinsic::WarpSize => IntrSel::WarpSize,
        Intrinsic::Barrier | Intrinsic::SharedBase => {
            unreachable!("handled before selection")
        }
    }
}

/// Parallel copies for phi edges: sources drain into scratch registers
/// first so a swap cannot clobber its own input.
fn emit_phi_moves(code: &mut Vec<HostInst>, moves: &[(Reg, Reg)], next_reg: &mut Reg) {
    if moves.is_empty() {
        return;
    }
    let base = *next_reg;
    for (i, &(_, src)) in moves.iter().enumerate() {
        code.push(HostInst::Mov {
            dst: base + i as Reg,
            src,
        });
    }
    for (i, &(dst, _)) in moves.iter().enumerate() {
        code.push(HostInst::Mov {
            dst,
            src: base + i as Reg,
        });
    }
    *next_reg += moves.len() as Reg;
}

//=============================================================================
//=============================== EXECUTION ===================================
//=============================================================================

/// Device memory as the host driver models it: a plain byte arena with a
/// lock serializing read-modify-write atomics.
///
/// Plain loads and stores go through raw pointers without synchronization;
/// racing kernel accesses observe whatever the hardware would.
pub struct DeviceMem {
    bytes: std::cell::UnsafeCell<Box<[u8]>>,
    rmw: Mutex<()>,
    len: usize,
}

unsafe impl Sync for DeviceMem {}
unsafe impl Send for DeviceMem {}

impl DeviceMem {
    pub fn new(len: usize) -> DeviceMem {
        DeviceMem {
            bytes: std::cell::UnsafeCell::new(vec![0u8; len].into_boxed_slice()),
            rmw: Mutex::new(()),
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies out of the arena. Host-side accessors; bounds-checked.
    pub fn read_into(&self, offset: usize, dst: &mut [u8]) -> Result<(), String> {
        if offset + dst.len() > self.len {
            return Err(format!(
                "read of {} bytes at {} exceeds allocation of {}",
                dst.len(),
                offset,
                self.len
            ));
        }
        unsafe {
            let src = (*self.bytes.get()).as_ptr().add(offset);
            std::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    pub fn write_from(&self, offset: usize, src: &[u8]) -> Result<(), String> {
        if offset + src.len() > self.len {
            return Err(format!(
                "write of {} bytes at {} exceeds allocation of {}",
                src.len(),
                offset,
                self.len
            ));
        }
        unsafe {
            let dst = (*self.bytes.get()).as_mut_ptr().add(offset);
            std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len());
        }
        Ok(())
    }

    fn load_bits(&self, offset: usize, kind: ScalarKind) -> Result<u64, String> {
        let size = kind.size() as usize;
        if offset + size > self.len {
            return Err(format!("load at {} exceeds allocation of {}", offset, self.len));
        }
        let mut buf = [0u8; 8];
        unsafe {
            let src = (*self.bytes.get()).as_ptr().add(offset);
            std::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), size);
        }
        Ok(u64::from_le_bytes(buf))
    }

    fn store_bits(&self, offset: usize, kind: ScalarKind, bits: u64) -> Result<(), String> {
        let size = kind.size() as usize;
        if offset + size > self.len {
            return Err(format!(
                "store at {} exceeds allocation of {}",
                offset, self.len
            ));
        }
        let buf = bits.to_le_bytes();
        unsafe {
            let dst = (*self.bytes.get()).as_mut_ptr().add(offset);
            std::ptr::copy_nonoverlapping(buf.as_ptr(), dst, size);
        }
        Ok(())
    }
}

/// A launch argument resolved to host storage.
pub enum HostArg<'a> {
    Buffer(&'a DeviceMem),
    Scalar(u64),
}

struct GroupCtx<'a> {
    entry: &'a HostEntry,
    args: &'a [HostArg<'a>],
    grid: [u32; 3],
    group: [u32; 3],
    group_id: [u32; 3],
    shared: DeviceMem,
    warp_size: u32,
}

enum StopReason {
    Done,
    Sync(usize),
}

struct ThreadState {
    pc: usize,
    regs: Vec<u64>,
    local: DeviceMem,
    done: bool,
}

/// Executes one entry point over the full grid, fanning groups out
/// across a bounded worker pool.
pub fn execute_entry(
    entry: &HostEntry,
    grid: [u32; 3],
    group: [u32; 3],
    dynamic_smem: u32,
    args: &[HostArg<'_>],
    warp_size: u32,
) -> Result<(), String> {
    let group_count = grid[0] as u64 * grid[1] as u64 * grid[2] as u64;
    if group_count == 0 {
        return Ok(());
    }
    let pool = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .min(group_count as usize)
        .max(1);

    let cursor = AtomicU64::new(0);
    let failure: Mutex<Option<String>> = Mutex::new(None);

    crossbeam::thread::scope(|scope| {
        for _ in 0..pool {
            scope.spawn(|_| loop {
                let linear = cursor.fetch_add(1, Ordering::Relaxed);
                if linear >= group_count {
                    break;
                }
                if failure.lock().unwrap().is_some() {
                    break;
                }
                let gz = (linear / (grid[0] as u64 * grid[1] as u64)) as u32;
                let rem = linear % (grid[0] as u64 * grid[1] as u64);
                let gy = (rem / grid[0] as u64) as u32;
                let gx = (rem % grid[0] as u64) as u32;
                let ctx = GroupCtx {
                    entry,
                    args,
                    grid,
                    group,
                    group_id: [gx, gy, gz],
                    shared: DeviceMem::new(
                        entry.shared_bytes as usize + dynamic_smem as usize,
                    ),
                    warp_size,
                };
                if let Err(err) = run_group(&ctx) {
                    let mut slot = failure.lock().unwrap();
                    if slot.is_none() {
                        *slot = Some(err);
                    }
                    break;
                }
            });
        }
    })
    .map_err(|_| "worker pool panicked".to_owned())?;

    match failure.into_inner().unwrap() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn run_group(ctx: &GroupCtx<'_>) -> Result<(), String> {
    let nthreads = (ctx.group[0] * ctx.group[1] * ctx.group[2]) as usize;
    if nthreads == 0 {
        return Ok(());
    }

    if !ctx.entry.uses_group_sync {
        // Fast path: each thread runs to completion; the flat loop is
        // batched into SIMD-width lanes.
        let width = ctx.entry.simd_width.max(1) as usize;
        let mut t = 0;
        while t < nthreads {
            let hi = (t + width).min(nthreads);
            for lane in t..hi {
                let mut state = thread_state(ctx, lane);
                match run_thread(ctx, &mut state, lane)? {
                    StopReason::Done => {}
                    StopReason::Sync(pc) => {
                        return Err(format!(
                            "synchronization op at pc {} in non-sync kernel '{}'",
                            pc, ctx.entry.name
                        ))
                    }
                }
            }
            t = hi;
        }
        return Ok(());
    }

    // Phased path: run every thread to the next sync point, resolve the
    // exchange, resume.
    let mut states: Vec<ThreadState> = (0..nthreads).map(|t| thread_state(ctx, t)).collect();
    loop {
        let mut sync_pc: Option<usize> = None;
        let mut all_done = true;
        for (t, state) in states.iter_mut().enumerate() {
            if state.done {
                continue;
            }
            match run_thread(ctx, state, t)? {
                StopReason::Done => state.done = true,
                StopReason::Sync(pc) => {
                    all_done = false;
                    match sync_pc {
                        None => sync_pc = Some(pc),
                        Some(prev) if prev == pc => {}
                        Some(prev) => {
                            return Err(format!(
                                "divergent synchronization in '{}' (pc {} vs {})",
                                ctx.entry.name, prev, pc
                            ))
                        }
                    }
                }
            }
        }
        if all_done {
            return Ok(());
        }
        let pc = sync_pc.expect("threads pending without a sync point");
        resolve_sync(ctx, &mut states, pc)?;
    }
}

fn thread_state(ctx: &GroupCtx<'_>, _thread: usize) -> ThreadState {
    ThreadState {
        pc: 0,
        regs: vec![0u64; ctx.entry.nregs as usize],
        local: DeviceMem::new(ctx.entry.local_bytes as usize),
        done: false,
    }
}

fn local_coords(ctx: &GroupCtx<'_>, thread: usize) -> [u32; 3] {
    let t = thread as u32;
    let lx = t % ctx.group[0];
    let ly = (t / ctx.group[0]) % ctx.group[1];
    let lz = t / (ctx.group[0] * ctx.group[1]);
    [lx, ly, lz]
}

/// Runs one thread until completion or a synchronization instruction.
/// The pc is left pointing *at* the sync instruction; `resolve_sync`
/// advances it.
fn run_thread(
    ctx: &GroupCtx<'_>,
    state: &mut ThreadState,
    thread: usize,
) -> Result<StopReason, String> {
    let code = &ctx.entry.code;
    let local = local_coords(ctx, thread);
    loop {
        let inst = code
            .get(state.pc)
            .ok_or_else(|| format!("pc {} out of range in '{}'", state.pc, ctx.entry.name))?;
        match *inst {
            HostInst::Const { dst, bits } => state.regs[dst as usize] = bits,
            HostInst::Mov { dst, src } => state.regs[dst as usize] = state.regs[src as usize],
            HostInst::Bin { op, kind, dst, a, b } => {
                state.regs[dst as usize] =
                    bin_bits(kind, op, state.regs[a as usize], state.regs[b as usize])?;
            }
            HostInst::Cmp { op, kind, dst, a, b } => {
                state.regs[dst as usize] =
                    cmp_bits(kind, op, state.regs[a as usize], state.regs[b as usize]) as u64;
            }
            HostInst::Select { dst, cond, a, b } => {
                state.regs[dst as usize] = if state.regs[cond as usize] != 0 {
                    state.regs[a as usize]
                } else {
                    state.regs[b as usize]
                };
            }
            HostInst::Cast { from, to, dst, src } => {
                state.regs[dst as usize] = cast_bits(from, to, state.regs[src as usize]);
            }
            HostInst::ParamPtr { dst, index } => {
                state.regs[dst as usize] = seg_param(index);
            }
            HostInst::ParamVal { dst, index } => match ctx.args.get(index as usize) {
                Some(&HostArg::Scalar(bits)) => state.regs[dst as usize] = bits,
                _ => return Err(format!("argument {} is not a scalar", index)),
            },
            HostInst::Intr { sel, dst } => {
                let v = match sel {
                    IntrSel::GlobalId(a) => {
                        let a = a as usize;
                        ctx.group_id[a] * ctx.group[a] + local[a]
                    }
                    IntrSel::LocalId(a) => local[a as usize],
                    IntrSel::GroupId(a) => ctx.group_id[a as usize],
                    IntrSel::GroupDim(a) => ctx.group[a as usize],
                    IntrSel::GridDim(a) => ctx.grid[a as usize],
                    IntrSel::LaneId => thread as u32 % ctx.warp_size,
                    IntrSel::WarpSize => ctx.warp_size,
                };
                state.regs[dst as usize] = v as u64;
            }
            HostInst::Load { kind, dst, addr } => {
                let target = state.regs[addr as usize];
                let bits = {
                    let (mem, offset) = resolve(ctx, state, target)?;
                    mem.load_bits(offset, kind)?
                };
                state.regs[dst as usize] = bits;
            }
            HostInst::Store { kind, addr, src } => {
                let target = state.regs[addr as usize];
                let bits = state.regs[src as usize];
                let (mem, offset) = resolve(ctx, state, target)?;
                mem.store_bits(offset, kind, bits)?;
            }
            HostInst::AtomicRmw {
                op,
                kind,
                dst,
                addr,
                src,
            } => {
                let target = state.regs[addr as usize];
                let operand = state.regs[src as usize];
                let old = {
                    let (mem, offset) = resolve(ctx, state, target)?;
                    let _guard = mem.rmw.lock().unwrap();
                    let old = mem.load_bits(offset, kind)?;
                    let new = rmw_bits(kind, op, old, operand)?;
                    mem.store_bits(offset, kind, new)?;
                    old
                };
                state.regs[dst as usize] = old;
            }
            HostInst::AtomicCas {
                kind,
                dst,
                addr,
                cmp,
                new,
            } => {
                let target = state.regs[addr as usize];
                let expect = state.regs[cmp as usize] & kind_mask(kind);
                let replacement = state.regs[new as usize];
                let old = {
                    let (mem, offset) = resolve(ctx, state, target)?;
                    let _guard = mem.rmw.lock().unwrap();
                    let old = mem.load_bits(offset, kind)?;
                    if old == expect {
                        mem.store_bits(offset, kind, replacement)?;
                    }
                    old
                };
                state.regs[dst as usize] = old;
            }
            HostInst::Mma {
                shape,
                precision,
                d,
                a,
                b,
                c,
            } => {
                run_mma(
                    ctx,
                    state,
                    shape,
                    precision,
                    state.regs[d as usize],
                    state.regs[a as usize],
                    state.regs[b as usize],
                    state.regs[c as usize],
                )?;
            }
            HostInst::Barrier | HostInst::Shuffle { .. } | HostInst::Vote { .. } => {
                return Ok(StopReason::Sync(state.pc));
            }
            HostInst::Jump { target } => {
                state.pc = target as usize;
                continue;
            }
            HostInst::Branch { cond, then, els } => {
                state.pc = if state.regs[cond as usize] != 0 {
                    then as usize
                } else {
                    els as usize
                };
                continue;
            }
            HostInst::Ret => return Ok(StopReason::Done),
        }
        state.pc += 1;
    }
}

/// Resolves a tagged virtual address against the argument buffers, the
/// group's shared window, or the thread's local arena.
fn resolve<'a>(
    ctx: &'a GroupCtx<'a>,
    state: &'a ThreadState,
    addr: u64,
) -> Result<(&'a DeviceMem, usize), String> {
    let seg = addr & SEG_MASK;
    let offset = (addr & OFF_MASK) as usize;
    if seg == SEG_SHARED {
        return Ok((&ctx.shared, offset));
    }
    if seg == SEG_LOCAL {
        return Ok((&state.local, offset));
    }
    if seg == 0 {
        return Err("null pointer dereference in kernel".to_owned());
    }
    let index = ((seg >> SEG_SHIFT) - 1) as usize;
    match ctx.args.get(index) {
        Some(&HostArg::Buffer(mem)) => Ok((mem, offset)),
        _ => Err(format!("argument {} is not a buffer", index)),
    }
}

/// Completes the pending synchronization instruction for every live
/// thread and advances each past it.
fn resolve_sync(
    ctx: &GroupCtx<'_>,
    states: &mut [ThreadState],
    pc: usize,
) -> Result<(), String> {
    let inst = ctx.entry.code[pc].clone();
    let warp = ctx.warp_size as usize;
    let live: Vec<usize> = (0..states.len()).filter(|&t| !states[t].done).collect();

    match inst {
        HostInst::Barrier => {}
        HostInst::Shuffle {
            mode,
            dst,
            val,
            lane,
        } => {
            // Values exchanged within each warp-sized window of the
            // flattened group.
            let srcs: Vec<u64> = states.iter().map(|s| s.regs[val as usize]).collect();
            for &t in &live {
                let warp_base = t / warp * warp;
                let warp_end = (warp_base + warp).min(states.len());
                let lanes = warp_end - warp_base;
                let my_lane = t - warp_base;
                let operand = states[t].regs[lane as usize] as usize;
                let src_lane = match mode {
                    WarpOp::ShuffleIdx => operand % lanes,
                    WarpOp::ShuffleUp => my_lane.saturating_sub(operand),
                    WarpOp::ShuffleDown => (my_lane + operand).min(lanes - 1),
                    WarpOp::ShuffleXor => (my_lane ^ operand) % lanes,
                    _ => unreachable!("vote handled separately"),
                };
                states[t].regs[dst as usize] = srcs[warp_base + src_lane];
            }
        }
        HostInst::Vote { mode, dst, pred } => {
            let preds: Vec<bool> = states.iter().map(|s| s.regs[pred as usize] != 0).collect();
            for &t in &live {
                let warp_base = t / warp * warp;
                let warp_end = (warp_base + warp).min(states.len());
                let window = &preds[warp_base..warp_end];
                let v = match mode {
                    WarpOp::VoteAll => window.iter().all(|&p| p) as u64,
                    WarpOp::VoteAny => window.iter().any(|&p| p) as u64,
                    WarpOp::Ballot => window
                        .iter()
                        .enumerate()
                        .fold(0u64, |acc, (i, &p)| acc | ((p as u64) << i)),
                    _ => unreachable!("shuffle handled separately"),
                };
                states[t].regs[dst as usize] = v;
            }
        }
        other => return Err(format!("unexpected sync instruction {:?}", other)),
    }

    for &t in &live {
        states[t].pc = pc + 1;
    }
    Ok(())
}

/// Scalar multiply-add fallback over one fragment, row-major.
fn run_mma(
    ctx: &GroupCtx<'_>,
    state: &ThreadState,
    shape: TensorShape,
    precision: TensorPrecision,
    d: u64,
    a: u64,
    b: u64,
    c: u64,
) -> Result<(), String> {
    let elem = match precision {
        TensorPrecision::Fp16 => ScalarKind::F16,
        TensorPrecision::Bf16 => ScalarKind::BF16,
        TensorPrecision::Tf32 | TensorPrecision::Fp32 => ScalarKind::F32,
    };
    let esize = elem.size() as usize;
    let (m, n, k) = (shape.m as usize, shape.n as usize, shape.k as usize);

    let read = |base: u64, index: usize| -> Result<f64, String> {
        let (mem, offset) = resolve(ctx, state, base)?;
        let bits = mem.load_bits(offset + index * esize, elem)?;
        Ok(bits_to_f64(elem, bits))
    };
    for i in 0..m {
        for j in 0..n {
            let mut acc = read(c, i * n + j)?;
            for kk in 0..k {
                acc += read(a, i * k + kk)? * read(b, kk * n + j)?;
            }
            let (mem, offset) = resolve(ctx, state, d)?;
            mem.store_bits(offset + (i * n + j) * esize, elem, f64_to_bits(elem, acc))?;
        }
    }
    Ok(())
}

//=============================================================================
//============================ SCALAR SEMANTICS ===============================
//=============================================================================

fn kind_mask(kind: ScalarKind) -> u64 {
    match kind.size() {
        1 => 0xff,
        2 => 0xffff,
        4 => 0xffff_ffff,
        _ => u64::MAX,
    }
}

fn sext_bits(kind: ScalarKind, bits: u64) -> i64 {
    let width = kind.size() as u32 * 8;
    let shift = 64 - width;
    ((bits << shift) as i64) >> shift
}

fn bits_to_f64(kind: ScalarKind, bits: u64) -> f64 {
    match kind {
        ScalarKind::F16 => half::f16::from_bits(bits as u16).to_f64(),
        ScalarKind::BF16 => half::bf16::from_bits(bits as u16).to_f64(),
        ScalarKind::F32 => f32::from_bits(bits as u32) as f64,
        ScalarKind::F64 => f64::from_bits(bits),
        _ => bits as f64,
    }
}

fn f64_to_bits(kind: ScalarKind, v: f64) -> u64 {
    match kind {
        ScalarKind::F16 => half::f16::from_f64(v).to_bits() as u64,
        ScalarKind::BF16 => half::bf16::from_f64(v).to_bits() as u64,
        ScalarKind::F32 => (v as f32).to_bits() as u64,
        ScalarKind::F64 => v.to_bits(),
        _ => v as u64,
    }
}

fn bin_bits(kind: ScalarKind, op: BinOp, a: u64, b: u64) -> Result<u64, String> {
    if kind.is_float() {
        let (x, y) = (bits_to_f64(kind, a), bits_to_f64(kind, b));
        let v = match op {
            BinOp::Add => x + y,
            BinOp::Sub => x - y,
            BinOp::Mul => x * y,
            BinOp::Div => x / y,
            BinOp::Rem => x % y,
            BinOp::Min => x.min(y),
            BinOp::Max => x.max(y),
            _ => return Err(format!("bitwise op {:?} on float", op)),
        };
        return Ok(f64_to_bits(kind, v));
    }

    let m = kind_mask(kind);
    let (ua, ub) = (a & m, b & m);
    if matches!(op, BinOp::Div | BinOp::Rem) && ub == 0 {
        // Division by zero yields all-ones, matching common device
        // semantics for unsigned integer division.
        return Ok(m);
    }
    let v = if kind.is_signed() {
        let (sa, sb) = (sext_bits(kind, ua), sext_bits(kind, ub));
        (match op {
            BinOp::Add => sa.wrapping_add(sb),
            BinOp::Sub => sa.wrapping_sub(sb),
            BinOp::Mul => sa.wrapping_mul(sb),
            BinOp::Div => sa.wrapping_div(sb),
            BinOp::Rem => sa.wrapping_rem(sb),
            BinOp::And => sa & sb,
            BinOp::Or => sa | sb,
            BinOp::Xor => sa ^ sb,
            BinOp::Shl => sa.wrapping_shl(ub as u32),
            BinOp::Shr => sa.wrapping_shr(ub as u32),
            BinOp::Min => sa.min(sb),
            BinOp::Max => sa.max(sb),
        }) as u64
    } else {
        match op {
            BinOp::Add => ua.wrapping_add(ub),
            BinOp::Sub => ua.wrapping_sub(ub),
            BinOp::Mul => ua.wrapping_mul(ub),
            BinOp::Div => ua / ub,
            BinOp::Rem => ua % ub,
            BinOp::And => ua & ub,
            BinOp::Or => ua | ub,
            BinOp::Xor => ua ^ ub,
            BinOp::Shl => ua.wrapping_shl(ub as u32),
            BinOp::Shr => ua.wrapping_shr(ub as u32),
            BinOp::Min => ua.min(ub),
            BinOp::Max => ua.max(ub),
        }
    };
    Ok(v & m)
}

fn cmp_bits(kind: ScalarKind, op: CmpOp, a: u64, b: u64) -> bool {
    if kind.is_float() {
        let (x, y) = (bits_to_f64(kind, a), bits_to_f64(kind, b));
        return match op {
            CmpOp::Eq => x == y,
            CmpOp::Ne => x != y,
            CmpOp::Lt => x < y,
            CmpOp::Le => x <= y,
            CmpOp::Gt => x > y,
            CmpOp::Ge => x >= y,
        };
    }
    let m = kind_mask(kind);
    let (ua, ub) = (a & m, b & m);
    if kind.is_signed() {
        let (x, y) = (sext_bits(kind, ua), sext_bits(kind, ub));
        match op {
            CmpOp::Eq => x == y,
            CmpOp::Ne => x != y,
            CmpOp::Lt => x < y,
            CmpOp::Le => x <= y,
            CmpOp::Gt => x > y,
            CmpOp::Ge => x >= y,
        }
    } else {
        match op {
            CmpOp::Eq => ua == ub,
            CmpOp::Ne => ua != ub,
            CmpOp::Lt => ua < ub,
            CmpOp::Le => ua <= ub,
            CmpOp::Gt => ua > ub,
            CmpOp::Ge => ua >= ub,
        }
    }
}

fn cast_bits(from: ScalarKind, to: ScalarKind, bits: u64) -> u64 {
    if to.is_float() {
        let v = if from.is_float() {
            bits_to_f64(from, bits)
        } else if from.is_signed() {
            sext_bits(from, bits & kind_mask(from)) as f64
        } else {
            (bits & kind_mask(from)) as f64
        };
        return f64_to_bits(to, v);
    }
    let v = if from.is_float() {
        let f = bits_to_f64(from, bits);
        if to.is_signed() {
            f as i64 as u64
        } else {
            f as u64
        }
    } else if from.is_signed() {
        sext_bits(from, bits & kind_mask(from)) as u64
    } else {
        bits & kind_mask(from)
    };
    v & kind_mask(to)
}

fn rmw_bits(kind: ScalarKind, op: AtomicRmwOp, old: u64, src: u64) -> Result<u64, String> {
    let bin = match op {
        AtomicRmwOp::Add => BinOp::Add,
        AtomicRmwOp::Sub => BinOp::Sub,
        AtomicRmwOp::And => BinOp::And,
        AtomicRmwOp::Or => BinOp::Or,
        AtomicRmwOp::Xor => BinOp::Xor,
        AtomicRmwOp::Min => BinOp::Min,
        AtomicRmwOp::Max => BinOp::Max,
        AtomicRmwOp::Exchange => return Ok(src & kind_mask(kind)),
    };
    bin_bits(kind, bin, old, src)
}
