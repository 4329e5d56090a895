//! The PTX backend.
//!
//! Emits PTX assembly text keyed to a declared compute capability.
//! Instruction selection dispatches on integer/float width, every load
//! and store carries its address-space decoration, warp primitives map
//! to the `sync` intrinsics, and tensor ops emit WMMA fragments when the
//! entry point requests a precision the capability tier supports -
//! otherwise a scalar multiply-add loop is emitted with a one-time
//! diagnostic.

use std::collections::HashMap;
use std::fmt::Write;

use super::{
    Artifact, ArtifactBody, Backend, BackendKind, CompilationError, DeviceFeatures, EntryMeta,
    Fingerprint, TargetCaps,
};
use crate::ir::{
    AddrSpace, AtomicRmwOp, Axis, BinOp, BlockId, CmpOp, ConstVal, EntryPoint, Function,
    Intrinsic, Module, Op, ParamKind, ScalarKind, TensorPrecision, TypeKind, ValueId, WarpOp,
};
use crate::pass::{self, Pass};

pub struct PtxBackend;

impl PtxBackend {
    pub fn new() -> PtxBackend {
        PtxBackend
    }
}

impl Default for PtxBackend {
    fn default() -> PtxBackend {
        PtxBackend::new()
    }
}

impl Backend for PtxBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Ptx
    }

    fn query_caps(&self) -> TargetCaps {
        TargetCaps::sm(7, 0)
    }

    fn lower(&self, module: &Module, caps: &TargetCaps) -> Result<Artifact, CompilationError> {
        // Kernel-side calls flatten into their entry points; PTX device
        // functions buy nothing for launch-bound kernels.
        let mut flat = module.clone();
        flat.reopen();
        pass::Inline {
            threshold: usize::MAX,
            fuel: 4096,
        }
        .run(&mut flat, caps)?;

        let mut text = String::with_capacity(8192);
        let _ = writeln!(text, "//");
        let _ = writeln!(text, "// Generated by ucl from module '{}'", flat.name);
        let _ = writeln!(text, "//");
        let _ = writeln!(text, ".version 7.0");
        let _ = writeln!(text, ".target sm_{}{}", caps.compute.0, caps.compute.1);
        let _ = writeln!(text, ".address_size 64");

        let mut requires = DeviceFeatures::empty();
        let mut metas = Vec::with_capacity(flat.entry_points().len());
        for entry in flat.entry_points() {
            let func = flat.func(entry.func);
            let mut emitter = EntryEmitter::new(&flat, func, entry, caps);
            let body = emitter.emit()?;
            text.push('\n');
            text.push_str(&body);
            requires |= emitter.requires;
            metas.push(EntryMeta {
                name: entry.name.clone(),
                params: entry.params.clone(),
                shared_bytes: entry.shared_bytes,
                simd_width: 1,
            });
        }

        #[cfg(feature = "emit_debug_print")]
        println!("##### PTX for '{}':\n{}", flat.name, text);

        Ok(Artifact {
            backend: BackendKind::Ptx,
            fingerprint: Fingerprint([0; 16]),
            body: ArtifactBody::PtxText(text),
            requires,
            min_compute: caps.compute,
            entries: metas,
        })
    }
}

/// Register classes mirror PTX conventions: `%p` predicates, `%rs`
/// 16-bit, `%r` 32-bit, `%rd` 64-bit, `%f`/`%fd` floats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RegClass {
    Pred,
    B16,
    B32,
    B64,
    F32,
    F64,
}

impl RegClass {
    fn prefix(self) -> &'static str {
        match self {
            RegClass::Pred => "%p",
            RegClass::B16 => "%rs",
            RegClass::B32 => "%r",
            RegClass::B64 => "%rd",
            RegClass::F32 => "%f",
            RegClass::F64 => "%fd",
        }
    }

    fn decl(self) -> &'static str {
        match self {
            RegClass::Pred => ".pred",
            RegClass::B16 => ".b16",
            RegClass::B32 => ".b32",
            RegClass::B64 => ".b64",
            RegClass::F32 => ".f32",
            RegClass::F64 => ".f64",
        }
    }
}

fn class_of(kind: ScalarKind) -> RegClass {
    match kind {
        ScalarKind::Bool => RegClass::Pred,
        ScalarKind::I8 | ScalarKind::U8 | ScalarKind::I16 | ScalarKind::U16 => RegClass::B16,
        ScalarKind::F16 | ScalarKind::BF16 => RegClass::B16,
        ScalarKind::I32 | ScalarKind::U32 => RegClass::B32,
        ScalarKind::I64 | ScalarKind::U64 => RegClass::B64,
        ScalarKind::F32 => RegClass::F32,
        ScalarKind::F64 => RegClass::F64,
    }
}

/// PTX type suffix for arithmetic on `kind`.
fn ty_suffix(kind: ScalarKind) -> &'static str {
    match kind {
        ScalarKind::I8 => "s8",
        ScalarKind::U8 => "u8",
        ScalarKind::I16 => "s16",
        ScalarKind::U16 => "u16",
        ScalarKind::I32 => "s32",
        ScalarKind::U32 => "u32",
        ScalarKind::I64 => "s64",
        ScalarKind::U64 => "u64",
        ScalarKind::F16 => "f16",
        ScalarKind::BF16 => "bf16",
        ScalarKind::F32 => "f32",
        ScalarKind::F64 => "f64",
        ScalarKind::Bool => "pred",
    }
}

fn space_suffix(space: AddrSpace) -> &'static str {
    match space {
        AddrSpace::Global => ".global",
        AddrSpace::Shared => ".shared",
        AddrSpace::Constant => ".const",
        AddrSpace::Local => ".local",
        AddrSpace::Generic => "",
    }
}

struct EntryEmitter<'a> {
    module: &'a Module,
    func: &'a Function,
    entry: &'a EntryPoint,
    caps: &'a TargetCaps,
    body: String,
    reg_names: HashMap<ValueId, String>,
    reg_counts: HashMap<RegClass, u32>,
    scratch: u32,
    local_bytes: u32,
    uses_dynamic_shared: bool,
    requires: DeviceFeatures,
    mma_fallback_logged: bool,
}

impl<'a> EntryEmitter<'a> {
    fn new(
        module: &'a Module,
        func: &'a Function,
        entry: &'a EntryPoint,
        caps: &'a TargetCaps,
    ) -> EntryEmitter<'a> {
        EntryEmitter {
            module,
            func,
            entry,
            caps,
            body: String::with_capacity(4096),
            reg_names: HashMap::new(),
            reg_counts: HashMap::new(),
            scratch: 0,
            local_bytes: 0,
            uses_dynamic_shared: false,
            requires: DeviceFeatures::empty(),
            mma_fallback_logged: false,
        }
    }

    fn err(&self, detail: String) -> CompilationError {
        CompilationError::LoweringFailed {
            backend: BackendKind::Ptx,
            detail,
        }
    }

    fn alloc(&mut self, class: RegClass) -> String {
        let n = self.reg_counts.entry(class).or_insert(0);
        *n += 1;
        format!("{}{}", class.prefix(), *n)
    }

    /// Register assigned to `id`, allocating on first touch.
    fn reg(&mut self, id: ValueId) -> Result<String, CompilationError> {
        if let Some(name) = self.reg_names.get(&id) {
            return Ok(name.clone());
        }
        let ty = self.func.value(id).ty;
        let class = match *self.module.types.kind(ty) {
            TypeKind::Scalar(kind) => class_of(kind),
            TypeKind::Pointer { .. } => RegClass::B64,
            ref other => return Err(self.err(format!("unregisterable type {:?}", other))),
        };
        let name = self.alloc(class);
        self.reg_names.insert(id, name.clone());
        Ok(name)
    }

    fn scalar_kind(&self, id: ValueId) -> Result<ScalarKind, CompilationError> {
        self.module
            .types
            .scalar_kind(self.func.value(id).ty)
            .ok_or_else(|| {
                CompilationError::LoweringFailed {
                    backend: BackendKind::Ptx,
                    detail: format!("{} is not scalar-typed", id),
                }
            })
    }

    fn label(&self, block: BlockId) -> String {
        format!("$L_{}_{}", self.entry.name, block.0)
    }

    fn line(&mut self, text: &str) {
        self.body.push('\t');
        self.body.push_str(text);
        self.body.push('\n');
    }

    fn emit(&mut self) -> Result<String, CompilationError> {
        // Signature.
        let mut sig = format!(".visible .entry {}(\n", self.entry.name);
        for (i, param) in self.entry.params.iter().enumerate() {
            let decl = match param.kind {
                ParamKind::Buffer(_) => ".param .u64".to_owned(),
                ParamKind::Scalar(kind) => format!(
                    ".param .{}",
                    match kind {
                        ScalarKind::F32 => "f32",
                        ScalarKind::F64 => "f64",
                        k if k.size() == 8 => "u64",
                        _ => "u32",
                    }
                ),
            };
            let sep = if i + 1 == self.entry.params.len() {
                ""
            } else {
                ","
            };
            let _ = writeln!(sig, "\t{} {}_param_{}{}", decl, self.entry.name, i, sep);
        }
        sig.push_str(")\n{\n");

        self.emit_blocks()?;

        // Preamble: register declarations, depots, shared windows.
        let mut pre = String::new();
        for (class, count) in self.collect_reg_decls() {
            let _ = writeln!(pre, "\t.reg {} \t{}<{}>;", class.decl(), class.prefix(), count + 1);
        }
        if self.local_bytes > 0 {
            let _ = writeln!(
                pre,
                "\t.local .align 8 .b8 \t__local_depot[{}];",
                self.local_bytes
            );
        }
        if self.entry.shared_bytes > 0 {
            let _ = writeln!(
                pre,
                "\t.shared .align 8 .b8 \t{}_smem[{}];",
                self.entry.name, self.entry.shared_bytes
            );
        }
        if self.uses_dynamic_shared {
            let _ = writeln!(pre, "\t.extern .shared .align 8 .b8 \tdsmem[];");
        }

        Ok(format!("{}{}\n{}}}\n", sig, pre, self.body))
    }

    fn collect_reg_decls(&self) -> Vec<(RegClass, u32)> {
        let mut decls: Vec<(RegClass, u32)> = self
            .reg_counts
            .iter()
            .map(|(&c, &n)| (c, n))
            .collect();
        decls.sort_by_key(|&(c, _)| c.prefix());
        decls
    }

    fn emit_blocks(&mut self) -> Result<(), CompilationError> {
        // Per-edge phi moves; conditional edges with moves go through a
        // trampoline label.
        let mut edge_moves: HashMap<(u32, u32), Vec<(ValueId, ValueId)>> = HashMap::new();
        for b in self.func.block_ids() {
            for &id in &self.func.blocks[b.index()].insts {
                let val = self.func.value(id);
                if let Op::Phi(ref incoming) = val.op {
                    for (&src, &opnd) in incoming.iter().zip(val.operands.iter()) {
                        edge_moves.entry((src.0, b.0)).or_default().push((id, opnd));
                    }
                }
            }
        }
        let mut stubs: Vec<(BlockId, BlockId)> = Vec::new();

        for b in self.func.block_ids() {
            let label = self.label(b);
            let _ = writeln!(self.body, "{}:", label);
            for &id in &self.func.blocks[b.index()].insts.clone() {
                self.emit_value(b, id, &edge_moves, &mut stubs)?;
            }
        }

        for (src, dst) in stubs {
            let _ = writeln!(self.body, "$T_{}_{}_{}:", self.entry.name, src.0, dst.0);
            let moves = edge_moves.get(&(src.0, dst.0)).cloned().unwrap_or_default();
            self.emit_moves(&moves)?;
            let target = self.label(dst);
            self.line(&format!("bra.uni \t{};", target));
        }
        Ok(())
    }

    fn emit_moves(&mut self, moves: &[(ValueId, ValueId)]) -> Result<(), CompilationError> {
        // Parallel-copy through scratch registers so swaps cannot
        // clobber their own sources.
        let mut temps = Vec::with_capacity(moves.len());
        for &(phi, src) in moves {
            let kind = self.scalar_kind(phi).unwrap_or(ScalarKind::U64);
            let class = class_of(kind);
            let tmp = self.alloc(class);
            let src_reg = self.reg(src)?;
            let mov_ty = mov_suffix(kind);
            self.line(&format!("mov.{} \t{}, {};", mov_ty, tmp, src_reg));
            temps.push((phi, tmp, mov_ty));
        }
        for (phi, tmp, mov_ty) in temps {
            let dst = self.reg(phi)?;
            self.line(&format!("mov.{} \t{}, {};", mov_ty, dst, tmp));
        }
        Ok(())
    }

    fn pointer_space(&self, id: ValueId) -> AddrSpace {
        self.module
            .types
            .pointer_space(self.func.value(id).ty)
            .unwrap_or(AddrSpace::Generic)
    }

    fn emit_value(
        &mut self,
        block: BlockId,
        id: ValueId,
        edge_moves: &HashMap<(u32, u32), Vec<(ValueId, ValueId)>>,
        stubs: &mut Vec<(BlockId, BlockId)>,
    ) -> Result<(), CompilationError> {
        let val = self.func.value(id).clone();
        match val.op {
            Op::Phi(_) => {} // edge moves carry the data

            Op::Param(i) => {
                let dst = self.reg(id)?;
                let layout = self.entry.params.get(i as usize);
                match layout.map(|p| p.kind) {
                    Some(ParamKind::Buffer(_)) | None => {
                        self.line(&format!(
                            "ld.param.u64 \t{}, [{}_param_{}];",
                            dst, self.entry.name, i
                        ));
                        if self.pointer_space(id) == AddrSpace::Global {
                            self.line(&format!("cvta.to.global.u64 \t{}, {};", dst, dst));
                        }
                    }
                    Some(ParamKind::Scalar(kind)) => {
                        self.line(&format!(
                            "ld.param.{} \t{}, [{}_param_{}];",
                            ty_suffix(kind),
                            dst,
                            self.entry.name,
                            i
                        ));
                    }
                }
            }

            Op::Const(c) => {
                let dst = self.reg(id)?;
                let kind = self.scalar_kind(id)?;
                let imm = const_imm(kind, c);
                self.line(&format!("mov.{} \t{}, {};", mov_suffix(kind), dst, imm));
            }

            Op::Bin(op) => {
                let kind = self.scalar_kind(id)?;
                let dst = self.reg(id)?;
                let a = self.reg(val.operands[0])?;
                let b = self.reg(val.operands[1])?;
                let inst = bin_inst(op, kind);
                self.line(&format!("{} \t{}, {}, {};", inst, dst, a, b));
            }

            Op::Cmp(op) => {
                let kind = self.scalar_kind(val.operands[0])?;
                let dst = self.reg(id)?;
                let a = self.reg(val.operands[0])?;
                let b = self.reg(val.operands[1])?;
                self.line(&format!(
                    "setp.{}.{} \t{}, {}, {};",
                    cmp_suffix(op),
                    ty_suffix(kind),
                    dst,
                    a,
                    b
                ));
            }

            Op::Select => {
                let kind = self.scalar_kind(id)?;
                let dst = self.reg(id)?;
                let cond = self.reg(val.operands[0])?;
                let a = self.reg(val.operands[1])?;
                let b = self.reg(val.operands[2])?;
                self.line(&format!(
                    "selp.{} \t{}, {}, {}, {};",
                    selp_suffix(kind),
                    dst,
                    a,
                    b,
                    cond
                ));
            }

            Op::Cast => {
                let from = self.scalar_kind(val.operands[0])?;
                let to = self.scalar_kind(id)?;
                let dst = self.reg(id)?;
                let src = self.reg(val.operands[0])?;
                let rnd = if to.is_float() && (from.is_int() || from.size() > to.size()) {
                    ".rn"
                } else if from.is_float() && to.is_int() {
                    ".rzi"
                } else {
                    ""
                };
                self.line(&format!(
                    "cvt{}.{}.{} \t{}, {};",
                    rnd,
                    ty_suffix(to),
                    ty_suffix(from),
                    dst,
                    src
                ));
            }

            Op::Alloca => {
                let pointee = self
                    .module
                    .types
                    .pointee(val.ty)
                    .expect("alloca result is a pointer");
                let align = self.module.types.align_of(pointee).max(1) as u32;
                let offset = (self.local_bytes + align - 1) / align * align;
                self.local_bytes = offset + self.module.types.size_of(pointee) as u32;
                let dst = self.reg(id)?;
                self.line(&format!("mov.u64 \t{}, __local_depot;", dst));
                if offset > 0 {
                    self.line(&format!("add.u64 \t{}, {}, {};", dst, dst, offset));
                }
            }

            Op::Load => {
                let kind = self.elem_kind(val.operands[0])?;
                let space = self.pointer_space(val.operands[0]);
                let dst = self.reg(id)?;
                let addr = self.reg(val.operands[0])?;
                self.line(&format!(
                    "ld{}.{} \t{}, [{}];",
                    space_suffix(space),
                    ty_suffix(kind),
                    dst,
                    addr
                ));
            }

            Op::Store => {
                let kind = self.elem_kind(val.operands[0])?;
                let space = self.pointer_space(val.operands[0]);
                let addr = self.reg(val.operands[0])?;
                let src = self.reg(val.operands[1])?;
                self.line(&format!(
                    "st{}.{} \t[{}], {};",
                    space_suffix(space),
                    ty_suffix(kind),
                    addr,
                    src
                ));
            }

            Op::PtrOffset => {
                let pointee = self
                    .module
                    .types
                    .pointee(self.func.value(val.operands[0]).ty)
                    .ok_or_else(|| self.err("ptr_offset on non-pointer".into()))?;
                let size = self.module.types.size_of(pointee);
                let dst = self.reg(id)?;
                let base = self.reg(val.operands[0])?;
                let idx = self.reg(val.operands[1])?;
                let idx_kind = self.scalar_kind(val.operands[1])?;
                if idx_kind.size() == 8 {
                    self.line(&format!(
                        "mad.lo.u64 \t{}, {}, {}, {};",
                        dst, idx, size, base
                    ));
                } else {
                    let wide = self.alloc(RegClass::B64);
                    self.line(&format!(
                        "mul.wide.{} \t{}, {}, {};",
                        ty_suffix(idx_kind),
                        wide,
                        idx,
                        size
                    ));
                    self.line(&format!("add.u64 \t{}, {}, {};", dst, base, wide));
                }
            }

            Op::FieldPtr(n) => {
                let pointee = self
                    .module
                    .types
                    .pointee(self.func.value(val.operands[0]).ty)
                    .ok_or_else(|| self.err("field_ptr on non-pointer".into()))?;
                let offset = self.module.types.field_offset(pointee, n);
                let dst = self.reg(id)?;
                let base = self.reg(val.operands[0])?;
                if offset == 0 {
                    self.line(&format!("mov.u64 \t{}, {};", dst, base));
                } else {
                    self.line(&format!("add.u64 \t{}, {}, {};", dst, base, offset));
                }
            }

            Op::Intr(intr) => self.emit_intrinsic(id, intr)?,

            Op::AtomicRmw(op) => {
                let kind = self.elem_kind(val.operands[0])?;
                let space = self.pointer_space(val.operands[0]);
                let dst = self.reg(id)?;
                let addr = self.reg(val.operands[0])?;
                let mut src = self.reg(val.operands[1])?;
                // PTX has no atom.sub; negate and add.
                if op == AtomicRmwOp::Sub {
                    let neg = self.alloc(class_of(kind));
                    if kind.is_float() {
                        self.line(&format!("neg.{} \t{}, {};", ty_suffix(kind), neg, src));
                    } else {
                        self.line(&format!(
                            "sub.{} \t{}, 0, {};",
                            ty_suffix(kind),
                            neg,
                            src
                        ));
                    }
                    src = neg;
                }
                self.line(&format!(
                    "atom{}.{}.{} \t{}, [{}], {};",
                    space_suffix(space),
                    atom_op(op),
                    atom_ty(op, kind),
                    dst,
                    addr,
                    src
                ));
            }

            Op::AtomicCas => {
                let kind = self.elem_kind(val.operands[0])?;
                let space = self.pointer_space(val.operands[0]);
                let dst = self.reg(id)?;
                let addr = self.reg(val.operands[0])?;
                let cmp = self.reg(val.operands[1])?;
                let new = self.reg(val.operands[2])?;
                self.line(&format!(
                    "atom{}.cas.b{} \t{}, [{}], {}, {};",
                    space_suffix(space),
                    kind.bits().max(32),
                    dst,
                    addr,
                    cmp,
                    new
                ));
            }

            Op::Warp(mode) => {
                self.requires |= DeviceFeatures::WARP_SHUFFLE;
                match mode {
                    WarpOp::VoteAll | WarpOp::VoteAny | WarpOp::Ballot => {
                        let dst = self.reg(id)?;
                        let pred = self.reg(val.operands[0])?;
                        let inst = match mode {
                            WarpOp::VoteAll => format!(
                                "vote.sync.all.pred \t{}, {}, 0xffffffff;",
                                dst, pred
                            ),
                            WarpOp::VoteAny => format!(
                                "vote.sync.any.pred \t{}, {}, 0xffffffff;",
                                dst, pred
                            ),
                            _ => format!(
                                "vote.sync.ballot.b32 \t{}, {}, 0xffffffff;",
                                dst, pred
                            ),
                        };
                        self.line(&inst);
                    }
                    _ => {
                        let dst = self.reg(id)?;
                        let src = self.reg(val.operands[0])?;
                        let lane = self.reg(val.operands[1])?;
                        let sel = match mode {
                            WarpOp::ShuffleIdx => "idx",
                            WarpOp::ShuffleUp => "up",
                            WarpOp::ShuffleDown => "down",
                            _ => "bfly",
                        };
                        let clamp = if mode == WarpOp::ShuffleUp { "0x0" } else { "0x1f" };
                        self.line(&format!(
                            "shfl.sync.{}.b32 \t{}, {}, {}, {}, 0xffffffff;",
                            sel, dst, src, lane, clamp
                        ));
                    }
                }
            }

            Op::TensorMma { shape, precision } => {
                self.emit_mma(id, &val.operands, shape, precision)?;
            }

            Op::Br(target) => {
                if let Some(moves) = edge_moves.get(&(block.0, target.0)) {
                    let moves = moves.clone();
                    self.emit_moves(&moves)?;
                }
                let label = self.label(target);
                self.line(&format!("bra.uni \t{};", label));
            }

            Op::CondBr(then, els) => {
                let cond = self.reg(val.operands[0])?;
                let then_label = if edge_moves.contains_key(&(block.0, then.0)) {
                    stubs.push((block, then));
                    format!("$T_{}_{}_{}", self.entry.name, block.0, then.0)
                } else {
                    self.label(then)
                };
                let els_label = if edge_moves.contains_key(&(block.0, els.0)) {
                    stubs.push((block, els));
                    format!("$T_{}_{}_{}", self.entry.name, block.0, els.0)
                } else {
                    self.label(els)
                };
                self.line(&format!("@{} bra \t{};", cond, then_label));
                self.line(&format!("bra.uni \t{};", els_label));
            }

            Op::Ret => self.line("ret;"),

            Op::Call(_) => {
                return Err(CompilationError::UnsupportedOpcode {
                    backend: BackendKind::Ptx,
                    op: "call".to_owned(),
                    func: self.func.name.clone(),
                })
            }
        }
        Ok(())
    }

    fn elem_kind(&self, ptr: ValueId) -> Result<ScalarKind, CompilationError> {
        let pointee = self
            .module
            .types
            .pointee(self.func.value(ptr).ty)
            .ok_or_else(|| self.err("memory access through non-pointer".into()))?;
        self.module.types.scalar_kind(pointee).ok_or_else(|| {
            self.err("memory access of non-scalar element".into())
        })
    }

    fn emit_intrinsic(&mut self, id: ValueId, intr: Intrinsic) -> Result<(), CompilationError> {
        let axis_reg = |a: Axis| a.name();
        match intr {
            Intrinsic::LocalId(a) => {
                let dst = self.reg(id)?;
                self.line(&format!("mov.u32 \t{}, %tid.{};", dst, axis_reg(a)));
            }
            Intrinsic::GroupId(a) => {
                let dst = self.reg(id)?;
                self.line(&format!("mov.u32 \t{}, %ctaid.{};", dst, axis_reg(a)));
            }
            Intrinsic::GroupDim(a) => {
                let dst = self.reg(id)?;
                self.line(&format!("mov.u32 \t{}, %ntid.{};", dst, axis_reg(a)));
            }
            Intrinsic::GridDim(a) => {
                let dst = self.reg(id)?;
                self.line(&format!("mov.u32 \t{}, %nctaid.{};", dst, axis_reg(a)));
            }
            Intrinsic::GlobalId(a) => {
                // ctaid * ntid + tid
                let dst = self.reg(id)?;
                let cta = self.alloc(RegClass::B32);
                let ntid = self.alloc(RegClass::B32);
                let tid = self.alloc(RegClass::B32);
                self.line(&format!("mov.u32 \t{}, %ctaid.{};", cta, axis_reg(a)));
                self.line(&format!("mov.u32 \t{}, %ntid.{};", ntid, axis_reg(a)));
                self.line(&format!("mov.u32 \t{}, %tid.{};", tid, axis_reg(a)));
                self.line(&format!(
                    "mad.lo.u32 \t{}, {}, {}, {};",
                    dst, cta, ntid, tid
                ));
            }
            Intrinsic::LaneId => {
                let dst = self.reg(id)?;
                self.line(&format!("mov.u32 \t{}, %laneid;", dst));
            }
            Intrinsic::WarpSize => {
                let dst = self.reg(id)?;
                self.line(&format!("mov.u32 \t{}, WARP_SZ;", dst));
            }
            Intrinsic::Barrier => self.line("bar.sync \t0;"),
            Intrinsic::SharedBase => {
                self.uses_dynamic_shared = true;
                let dst = self.reg(id)?;
                self.line(&format!("mov.u64 \t{}, dsmem;", dst));
            }
        }
        Ok(())
    }

    /// WMMA fragments when the entry carries the attribute and the tier
    /// supports the precision; a scalar multiply-add loop otherwise.
    fn emit_mma(
        &mut self,
        id: ValueId,
        operands: &[ValueId],
        shape: crate::ir::TensorShape,
        precision: TensorPrecision,
    ) -> Result<(), CompilationError> {
        if !shape.is_valid() {
            return Err(CompilationError::UnsupportedCapability {
                backend: BackendKind::Ptx,
                detail: format!("tensor fragment shape {} is not defined", shape),
            });
        }
        let d = self.reg(operands[0])?;
        let a = self.reg(operands[1])?;
        let b = self.reg(operands[2])?;
        let c = self.reg(operands[3])?;

        let requested = self.entry.attrs.tensor_precision;
        let chosen = requested.and_then(|req| self.caps.pick_tensor_precision(req.max(precision)));
        if let Some(tier) = chosen {
            self.requires |= DeviceFeatures::TENSOR_CORES;
            let elem = match tier {
                TensorPrecision::Fp16 => "f16",
                TensorPrecision::Bf16 => "bf16",
                TensorPrecision::Tf32 => "tf32",
                TensorPrecision::Fp32 => "f32",
            };
            let geom = format!("m{}n{}k{}", shape.m, shape.n, shape.k);
            let frag_a: Vec<String> = (0..8).map(|_| self.alloc(RegClass::F32)).collect();
            let frag_b: Vec<String> = (0..8).map(|_| self.alloc(RegClass::F32)).collect();
            let frag_c: Vec<String> = (0..8).map(|_| self.alloc(RegClass::F32)).collect();
            self.line(&format!(
                "wmma.load.a.sync.aligned.{}.row.{} \t{{{}}}, [{}];",
                geom,
                elem,
                frag_a.join(","),
                a
            ));
            self.line(&format!(
                "wmma.load.b.sync.aligned.{}.col.{} \t{{{}}}, [{}];",
                geom,
                elem,
                frag_b.join(","),
                b
            ));
            self.line(&format!(
                "wmma.load.c.sync.aligned.{}.row.f32 \t{{{}}}, [{}];",
                geom,
                frag_c.join(","),
                c
            ));
            self.line(&format!(
                "wmma.mma.sync.aligned.{}.row.col.f32.f32 \t{{{c}}}, {{{a}}}, {{{b}}}, {{{c}}};",
                geom,
                a = frag_a.join(","),
                b = frag_b.join(","),
                c = frag_c.join(","),
            ));
            self.line(&format!(
                "wmma.store.d.sync.aligned.{}.row.f32 \t[{}], {{{}}};",
                geom,
                d,
                frag_c.join(","),
            ));
            return Ok(());
        }

        if !self.mma_fallback_logged {
            log::warn!(
                "entry '{}': tensor cores unavailable for {} at {:?}; emitting scalar multiply-add",
                self.entry.name,
                shape,
                precision
            );
            self.mma_fallback_logged = true;
        }

        // Scalar fallback: an unrolled row/column walk per fragment,
        // using explicit loop labels.
        let elem = match precision {
            TensorPrecision::Fp16 => ScalarKind::F16,
            TensorPrecision::Bf16 => ScalarKind::BF16,
            _ => ScalarKind::F32,
        };
        let esz = elem.size();
        let sfx = ty_suffix(elem);
        let uid = self.scratch;
        self.scratch += 1;
        let (m, n, k) = (shape.m as u64, shape.n as u64, shape.k as u64);

        let i = self.alloc(RegClass::B64);
        let j = self.alloc(RegClass::B64);
        let kk = self.alloc(RegClass::B64);
        let acc = self.alloc(RegClass::F32);
        let lhs = self.alloc(RegClass::F32);
        let rhs = self.alloc(RegClass::F32);
        let addr = self.alloc(RegClass::B64);
        let pred = self.alloc(RegClass::Pred);
        let ename = self.entry.name.clone();
        let l_i = format!("$MMA_I_{}_{}_{}", ename, id.0, uid);
        let l_j = format!("$MMA_J_{}_{}_{}", ename, id.0, uid);
        let l_k = format!("$MMA_K_{}_{}_{}", ename, id.0, uid);

        self.line(&format!("mov.u64 \t{}, 0;", i));
        let _ = writeln!(self.body, "{}:", l_i);
        self.line(&format!("mov.u64 \t{}, 0;", j));
        let _ = writeln!(self.body, "{}:", l_j);
        // acc = c[i*n + j]
        self.line(&format!("mad.lo.u64 \t{}, {}, {}, {};", addr, i, n * esz, c));
        self.line(&format!("mad.lo.u64 \t{}, {}, {}, {};", addr, j, esz, addr));
        self.line(&format!("ld.{} \t{}, [{}];", sfx, acc, addr));
        self.line(&format!("mov.u64 \t{}, 0;", kk));
        let _ = writeln!(self.body, "{}:", l_k);
        self.line(&format!("mad.lo.u64 \t{}, {}, {}, {};", addr, i, k * esz, a));
        self.line(&format!("mad.lo.u64 \t{}, {}, {}, {};", addr, kk, esz, addr));
        self.line(&format!("ld.{} \t{}, [{}];", sfx, lhs, addr));
        self.line(&format!("mad.lo.u64 \t{}, {}, {}, {};", addr, kk, n * esz, b));
        self.line(&format!("mad.lo.u64 \t{}, {}, {}, {};", addr, j, esz, addr));
        self.line(&format!("ld.{} \t{}, [{}];", sfx, rhs, addr));
        self.line(&format!("fma.rn.f32 \t{}, {}, {}, {};", acc, lhs, rhs, acc));
        self.line(&format!("add.u64 \t{}, {}, 1;", kk, kk));
        self.line(&format!("setp.lt.u64 \t{}, {}, {};", pred, kk, k));
        self.line(&format!("@{} bra \t{};", pred, l_k));
        self.line(&format!("mad.lo.u64 \t{}, {}, {}, {};", addr, i, n * esz, d));
        self.line(&format!("mad.lo.u64 \t{}, {}, {}, {};", addr, j, esz, addr));
        self.line(&format!("st.{} \t[{}], {};", sfx, addr, acc));
        self.line(&format!("add.u64 \t{}, {}, 1;", j, j));
        self.line(&format!("setp.lt.u64 \t{}, {}, {};", pred, j, n));
        self.line(&format!("@{} bra \t{};", pred, l_j));
        self.line(&format!("add.u64 \t{}, {}, 1;", i, i));
        self.line(&format!("setp.lt.u64 \t{}, {}, {};", pred, i, m));
        self.line(&format!("@{} bra \t{};", pred, l_i));
        Ok(())
    }
}

fn mov_suffix(kind: ScalarKind) -> &'static str {
    match class_of(kind) {
        RegClass::Pred => "pred",
        RegClass::B16 => "b16",
        RegClass::B32 => "b32",
        RegClass::B64 => "b64",
        RegClass::F32 => "f32",
        RegClass::F64 => "f64",
    }
}

fn selp_suffix(kind: ScalarKind) -> &'static str {
    match class_of(kind) {
        RegClass::B16 => "b16",
        RegClass::B32 => "b32",
        RegClass::B64 => "b64",
        RegClass::F32 => "f32",
        RegClass::F64 => "f64",
        RegClass::Pred => "b32",
    }
}

fn cmp_suffix(op: CmpOp) -> &'static str {
    match op {
        CmpOp::Eq => "eq",
        CmpOp::Ne => "ne",
        CmpOp::Lt => "lt",
        CmpOp::Le => "le",
        CmpOp::Gt => "gt",
        CmpOp::Ge => "ge",
    }
}

fn bin_inst(op: BinOp, kind: ScalarKind) -> String {
    let sfx = ty_suffix(kind);
    let bits = kind.bits().max(16);
    match op {
        BinOp::Add => format!("add.{}", sfx),
        BinOp::Sub => format!("sub.{}", sfx),
        BinOp::Mul if kind.is_float() => format!("mul.{}", sfx),
        BinOp::Mul => format!("mul.lo.{}", sfx),
        BinOp::Div if kind.is_float() => format!("div.rn.{}", sfx),
        BinOp::Div => format!("div.{}", sfx),
        BinOp::Rem => format!("rem.{}", sfx),
        BinOp::And => format!("and.b{}", bits),
        BinOp::Or => format!("or.b{}", bits),
        BinOp::Xor => format!("xor.b{}", bits),
        BinOp::Shl => format!("shl.b{}", bits),
        BinOp::Shr if kind.is_signed() => format!("shr.s{}", bits),
        BinOp::Shr => format!("shr.u{}", bits),
        BinOp::Min => format!("min.{}", sfx),
        BinOp::Max => format!("max.{}", sfx),
    }
}

fn atom_op(op: AtomicRmwOp) -> &'static str {
    match op {
        AtomicRmwOp::Add | AtomicRmwOp::Sub => "add",
        AtomicRmwOp::And => "and",
        AtomicRmwOp::Or => "or",
        AtomicRmwOp::Xor => "xor",
        AtomicRmwOp::Min => "min",
        AtomicRmwOp::Max => "max",
        AtomicRmwOp::Exchange => "exch",
    }
}

fn atom_ty(op: AtomicRmwOp, kind: ScalarKind) -> String {
    match op {
        AtomicRmwOp::And | AtomicRmwOp::Or | AtomicRmwOp::Xor | AtomicRmwOp::Exchange => {
            format!("b{}", kind.bits().max(32))
        }
        _ => ty_suffix(kind).to_owned(),
    }
}

fn const_imm(kind: ScalarKind, c: ConstVal) -> String {
    match kind {
        ScalarKind::F32 => {
            let v = match c {
                ConstVal::Float(f) => f as f32,
                other => other.bits() as f32,
            };
            format!("0F{:08x}", v.to_bits())
        }
        ScalarKind::F64 => {
            let v = match c {
                ConstVal::Float(f) => f,
                other => other.bits() as f64,
            };
            format!("0D{:016x}", v.to_bits())
        }
        ScalarKind::F16 | ScalarKind::BF16 => format!("0x{:04x}", c.bits() as u16),
        _ => match c {
            ConstVal::Int(v) => format!("{}", v),
            other => format!("{}", other.bits()),
        },
    }
}
