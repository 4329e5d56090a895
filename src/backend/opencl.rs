//! The OpenCL backend.
//!
//! Emits OpenCL C program source, or SPIR-V words via [`spirv`]
//! (super::spirv), from the same lowered IR. Every pointer carries its
//! address-space qualifier, group and warp primitives lower to the
//! OpenCL built-ins, and operations a device cannot execute surface
//! `UnsupportedCapability` at lowering time.
//!
//! Dynamically sized shared memory follows the OpenCL convention of a
//! trailing `__local` kernel parameter, which the runtime sizes at
//! launch.

use std::collections::HashSet;
use std::fmt::Write;

use super::spirv;
use super::{
    Artifact, ArtifactBody, Backend, BackendKind, CompilationError, DeviceFeatures, EntryMeta,
    Fingerprint, TargetCaps,
};
use crate::ir::{
    AddrSpace, AtomicRmwOp, BinOp, BlockId, CmpOp, ConstVal, Function, Intrinsic, Module, Op,
    ParamKind, ScalarKind, TensorPrecision, TypeId, TypeKind, ValueId, WarpOp,
};

/// Output flavor of the OpenCL backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClFlavor {
    /// OpenCL C program source text.
    Source,
    /// A SPIR-V module, for drivers that consume IL.
    SpirV,
}

pub struct OpenClBackend {
    flavor: ClFlavor,
}

impl OpenClBackend {
    pub fn new(flavor: ClFlavor) -> OpenClBackend {
        OpenClBackend { flavor }
    }
}

impl Backend for OpenClBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::OpenCl
    }

    fn query_caps(&self) -> TargetCaps {
        TargetCaps::opencl(1, 2)
    }

    fn lower(&self, module: &Module, caps: &TargetCaps) -> Result<Artifact, CompilationError> {
        let flavor = match self.flavor {
            ClFlavor::SpirV if !caps.features.contains(DeviceFeatures::SPIRV) => {
                return Err(CompilationError::UnsupportedCapability {
                    backend: BackendKind::OpenCl,
                    detail: "target does not consume SPIR-V modules".to_owned(),
                })
            }
            f => f,
        };

        let mut requires = DeviceFeatures::empty();
        let metas: Vec<EntryMeta> = module
            .entry_points()
            .iter()
            .map(|e| EntryMeta {
                name: e.name.clone(),
                params: e.params.clone(),
                shared_bytes: e.shared_bytes,
                simd_width: 1,
            })
            .collect();

        let body = match flavor {
            ClFlavor::Source => {
                let mut emitter = ClEmitter::new(module, caps);
                let text = emitter.emit()?;
                requires |= emitter.requires;
                #[cfg(feature = "emit_debug_print")]
                println!("##### OpenCL C for '{}':\n{}", module.name, text);
                ArtifactBody::OpenClC(text)
            }
            ClFlavor::SpirV => {
                requires |= DeviceFeatures::SPIRV;
                ArtifactBody::SpirV(spirv::emit_module(module, caps)?)
            }
        };

        Ok(Artifact {
            backend: BackendKind::OpenCl,
            fingerprint: Fingerprint([0; 16]),
            body,
            requires,
            min_compute: caps.compute,
            entries: metas,
        })
    }
}

fn cl_scalar(kind: ScalarKind) -> Result<&'static str, CompilationError> {
    Ok(match kind {
        ScalarKind::I8 => "char",
        ScalarKind::U8 => "uchar",
        ScalarKind::I16 => "short",
        ScalarKind::U16 => "ushort",
        ScalarKind::I32 => "int",
        ScalarKind::U32 => "uint",
        ScalarKind::I64 => "long",
        ScalarKind::U64 => "ulong",
        ScalarKind::F16 => "half",
        ScalarKind::F32 => "float",
        ScalarKind::F64 => "double",
        ScalarKind::Bool => "int",
        ScalarKind::BF16 => {
            return Err(CompilationError::UnsupportedCapability {
                backend: BackendKind::OpenCl,
                detail: "bf16 has no OpenCL C representation".to_owned(),
            })
        }
    })
}

fn cl_space(space: AddrSpace) -> &'static str {
    match space {
        AddrSpace::Global => "__global ",
        AddrSpace::Shared => "__local ",
        AddrSpace::Constant => "__constant ",
        AddrSpace::Local => "__private ",
        AddrSpace::Generic => "",
    }
}

struct ClEmitter<'a> {
    module: &'a Module,
    caps: &'a TargetCaps,
    out: String,
    requires: DeviceFeatures,
    struct_names: Vec<Option<String>>,
}

impl<'a> ClEmitter<'a> {
    fn new(module: &'a Module, caps: &'a TargetCaps) -> ClEmitter<'a> {
        ClEmitter {
            module,
            caps,
            out: String::with_capacity(4096),
            requires: DeviceFeatures::empty(),
            struct_names: vec![None; module.types.len()],
        }
    }

    fn unsupported(&self, detail: String) -> CompilationError {
        CompilationError::UnsupportedCapability {
            backend: BackendKind::OpenCl,
            detail,
        }
    }

    fn emit(&mut self) -> Result<String, CompilationError> {
        let _ = writeln!(self.out, "// Generated by ucl from module '{}'", self.module.name);
        if self
            .module
            .funcs()
            .iter()
            .any(|f| uses_kind(self.module, f, ScalarKind::F64))
        {
            if !self.caps.features.contains(DeviceFeatures::FP64) {
                return Err(self.unsupported("fp64 arithmetic on a device without cl_khr_fp64".into()));
            }
            self.requires |= DeviceFeatures::FP64;
            let _ = writeln!(self.out, "#pragma OPENCL EXTENSION cl_khr_fp64 : enable");
        }
        if self
            .module
            .funcs()
            .iter()
            .any(|f| uses_kind(self.module, f, ScalarKind::F16))
        {
            self.requires |= DeviceFeatures::FP16;
            let _ = writeln!(self.out, "#pragma OPENCL EXTENSION cl_khr_fp16 : enable");
        }
        self.out.push('\n');

        self.emit_struct_typedefs()?;

        // Non-entry functions become plain device functions; entries get
        // the `__kernel` qualifier and their declared parameter layout.
        let module = self.module;
        let entry_funcs: HashSet<_> = module.entry_points().iter().map(|e| e.func).collect();
        for func_id in module.func_ids() {
            if entry_funcs.contains(&func_id) {
                continue;
            }
            self.emit_function(module.func(func_id), None)?;
        }
        for entry in module.entry_points() {
            self.emit_function(module.func(entry.func), Some(entry))?;
        }
        Ok(std::mem::take(&mut self.out))
    }

    fn emit_struct_typedefs(&mut self) -> Result<(), CompilationError> {
        for i in 0..self.module.types.len() {
            let id = TypeId(i as u32);
            if let TypeKind::Struct { ref fields } = *self.module.types.kind(id) {
                let name = format!("ucl_s{}", i);
                let mut def = String::from("typedef struct {\n");
                for (fi, &f) in fields.iter().enumerate() {
                    let fty = self.type_name(f)?;
                    let _ = writeln!(def, "    {} f{};", fty, fi);
                }
                let _ = writeln!(def, "}} {};\n", name);
                self.out.push_str(&def);
                self.struct_names[i] = Some(name);
            }
        }
        Ok(())
    }

    fn type_name(&self, ty: TypeId) -> Result<String, CompilationError> {
        match *self.module.types.kind(ty) {
            TypeKind::Scalar(kind) => Ok(cl_scalar(kind)?.to_owned()),
            TypeKind::Pointer { pointee, space } => Ok(format!(
                "{}{}*",
                cl_space(space),
                self.type_name(pointee)?
            )),
            TypeKind::Struct { .. } => Ok(self.struct_names[ty.index()]
                .clone()
                .unwrap_or_else(|| format!("ucl_s{}", ty.index()))),
            TypeKind::Array { elem, .. } => Ok(format!("{}*", self.type_name(elem)?)),
            TypeKind::Vector { elem, width } => {
                Ok(format!("{}{}", cl_scalar(elem)?, width))
            }
            TypeKind::Void => Ok("void".to_owned()),
            TypeKind::OpaqueHandle => Err(self.unsupported(
                "opaque device handles cannot cross the OpenCL C surface".into(),
            )),
        }
    }

    fn emit_function(
        &mut self,
        func: &Function,
        entry: Option<&crate::ir::EntryPoint>,
    ) -> Result<(), CompilationError> {
        let uses_dynamic_shared = func_uses(func, |op| {
            matches!(op, Op::Intr(Intrinsic::SharedBase))
        });
        let uses_subgroups = func_uses(func, |op| {
            matches!(op, Op::Warp(_) | Op::Intr(Intrinsic::LaneId | Intrinsic::WarpSize))
        });
        if uses_subgroups {
            if !self.caps.features.contains(DeviceFeatures::SUB_GROUPS) {
                return Err(self.unsupported(format!(
                    "fn '{}' uses sub-group operations the target lacks",
                    func.name
                )));
            }
            self.requires |= DeviceFeatures::SUB_GROUPS;
        }

        // Signature.
        let mut sig = String::new();
        match entry {
            Some(entry) => {
                let _ = write!(sig, "__kernel void {}(", entry.name);
                for (i, param) in entry.params.iter().enumerate() {
                    if i > 0 {
                        sig.push_str(", ");
                    }
                    match param.kind {
                        ParamKind::Buffer(kind) => {
                            let _ = write!(sig, "__global {}* p{}", cl_scalar(kind)?, i);
                        }
                        ParamKind::Scalar(kind) => {
                            let _ = write!(sig, "const {} p{}", cl_scalar(kind)?, i);
                        }
                    }
                }
                if uses_dynamic_shared {
                    if !entry.params.is_empty() {
                        sig.push_str(", ");
                    }
                    sig.push_str("__local uchar* ucl_dyn_smem");
                }
                sig.push(')');
            }
            None => {
                let ret = self.type_name(func.ret)?;
                let _ = write!(sig, "static {} {}(", ret, mangle(&func.name));
                for (i, &p) in func.params.iter().enumerate() {
                    if i > 0 {
                        sig.push_str(", ");
                    }
                    let _ = write!(sig, "{} p{}", self.type_name(p)?, i);
                }
                sig.push(')');
            }
        }
        let _ = writeln!(self.out, "{} {{", sig);

        // Declarations for every block-resident value with a type.
        for b in func.block_ids() {
            for &id in &func.blocks[b.index()].insts {
                let val = func.value(id);
                if matches!(*self.module.types.kind(val.ty), TypeKind::Void) {
                    continue;
                }
                if matches!(val.op, Op::Alloca) {
                    let pointee = self.module.types.pointee(val.ty).unwrap();
                    let pointee_name = self.type_name(pointee)?;
                    let ptr_name = self.type_name(val.ty)?;
                    let _ = writeln!(
                        self.out,
                        "    {} a{}; {} v{} = &a{};",
                        pointee_name, id.0, ptr_name, id.0, id.0
                    );
                } else {
                    let ty_name = self.type_name(val.ty)?;
                    let _ = writeln!(self.out, "    {} v{};", ty_name, id.0);
                }
            }
        }

        for b in func.block_ids() {
            let _ = writeln!(self.out, "bb{}_{}:", mangle(&func.name), b.0);
            // Labels must precede a statement.
            let _ = writeln!(self.out, "    ;");
            for &id in &func.blocks[b.index()].insts {
                self.emit_value(func, b, id)?;
            }
        }
        let _ = writeln!(self.out, "}}\n");
        Ok(())
    }

    fn stmt(&mut self, text: &str) {
        self.out.push_str("    ");
        self.out.push_str(text);
        self.out.push('\n');
    }

    /// Phi moves for the edge `from -> to`, emitted just before the jump.
    fn edge_assigns(&self, func: &Function, from: BlockId, to: BlockId) -> String {
        let mut out = String::new();
        for &id in &func.blocks[to.index()].insts {
            let val = func.value(id);
            if let Op::Phi(ref incoming) = val.op {
                for (&src, &opnd) in incoming.iter().zip(val.operands.iter()) {
                    if src == from {
                        let _ = write!(out, "v{} = v{}; ", id.0, opnd.0);
                    }
                }
            }
        }
        out
    }

    fn emit_value(
        &mut self,
        func: &Function,
        block: BlockId,
        id: ValueId,
    ) -> Result<(), CompilationError> {
        let val = func.value(id);
        let v = |x: ValueId| format!("v{}", x.0);
        let opnd = |i: usize| v(val.operands[i]);
        let fname = mangle(&func.name);

        match val.op {
            Op::Phi(_) | Op::Alloca => {} // declared up front
            Op::Param(i) => self.stmt(&format!("v{} = p{};", id.0, i)),
            Op::Const(c) => {
                let kind = self.module.types.scalar_kind(val.ty).unwrap_or(ScalarKind::U64);
                self.stmt(&format!("v{} = {};", id.0, cl_const(kind, c)));
            }
            Op::Bin(op) => {
                let kind = self.module.types.scalar_kind(val.ty);
                let expr = match (op, kind) {
                    (BinOp::Min, Some(k)) if k.is_float() => {
                        format!("fmin({}, {})", opnd(0), opnd(1))
                    }
                    (BinOp::Max, Some(k)) if k.is_float() => {
                        format!("fmax({}, {})", opnd(0), opnd(1))
                    }
                    (BinOp::Min, _) => format!("min({}, {})", opnd(0), opnd(1)),
                    (BinOp::Max, _) => format!("max({}, {})", opnd(0), opnd(1)),
                    _ => format!("{} {} {}", opnd(0), cl_binop(op), opnd(1)),
                };
                self.stmt(&format!("v{} = {};", id.0, expr));
            }
            Op::Cmp(op) => self.stmt(&format!(
                "v{} = ({} {} {});",
                id.0,
                opnd(0),
                cl_cmpop(op),
                opnd(1)
            )),
            Op::Select => self.stmt(&format!(
                "v{} = {} ? {} : {};",
                id.0,
                opnd(0),
                opnd(1),
                opnd(2)
            )),
            Op::Cast => {
                let to = self.type_name(val.ty)?;
                self.stmt(&format!("v{} = ({})({});", id.0, to, opnd(0)));
            }
            Op::Load => self.stmt(&format!("v{} = *{};", id.0, opnd(0))),
            Op::Store => self.stmt(&format!("*{} = {};", opnd(0), opnd(1))),
            Op::PtrOffset => self.stmt(&format!("v{} = {} + {};", id.0, opnd(0), opnd(1))),
            Op::FieldPtr(n) => {
                self.stmt(&format!("v{} = &({}->f{});", id.0, opnd(0), n))
            }
            Op::Call(callee) => {
                let callee_name = mangle(&self.module.func(callee).name);
                let args: Vec<String> = val.operands.iter().map(|&a| v(a)).collect();
                if matches!(*self.module.types.kind(val.ty), TypeKind::Void) {
                    self.stmt(&format!("{}({});", callee_name, args.join(", ")));
                } else {
                    self.stmt(&format!(
                        "v{} = {}({});",
                        id.0,
                        callee_name,
                        args.join(", ")
                    ));
                }
            }
            Op::Intr(intr) => self.emit_intrinsic(id, intr)?,
            Op::AtomicRmw(op) => {
                let kind = self
                    .module
                    .types
                    .pointee(func.value(val.operands[0]).ty)
                    .and_then(|p| self.module.types.scalar_kind(p));
                if matches!(kind, Some(k) if k.size() == 8)
                    && !self.caps.features.contains(DeviceFeatures::ATOMIC_64)
                {
                    return Err(self.unsupported(
                        "64-bit atomics require OpenCL 2.0 atomics".into(),
                    ));
                }
                let f = match op {
                    AtomicRmwOp::Add => "atomic_add",
                    AtomicRmwOp::Sub => "atomic_sub",
                    AtomicRmwOp::And => "atomic_and",
                    AtomicRmwOp::Or => "atomic_or",
                    AtomicRmwOp::Xor => "atomic_xor",
                    AtomicRmwOp::Min => "atomic_min",
                    AtomicRmwOp::Max => "atomic_max",
                    AtomicRmwOp::Exchange => "atomic_xchg",
                };
                self.stmt(&format!("v{} = {}({}, {});", id.0, f, opnd(0), opnd(1)));
            }
            Op::AtomicCas => self.stmt(&format!(
                "v{} = atomic_cmpxchg({}, {}, {});",
                id.0,
                opnd(0),
                opnd(1),
                opnd(2)
            )),
            Op::Warp(mode) => {
                let expr = match mode {
                    WarpOp::ShuffleIdx => {
                        format!("sub_group_shuffle({}, {})", opnd(0), opnd(1))
                    }
                    WarpOp::ShuffleUp => {
                        format!("sub_group_shuffle_up({}, {})", opnd(0), opnd(1))
                    }
                    WarpOp::ShuffleDown => {
                        format!("sub_group_shuffle_down({}, {})", opnd(0), opnd(1))
                    }
                    WarpOp::ShuffleXor => {
                        format!("sub_group_shuffle_xor({}, {})", opnd(0), opnd(1))
                    }
                    WarpOp::VoteAll => format!("sub_group_all({})", opnd(0)),
                    WarpOp::VoteAny => format!("sub_group_any({})", opnd(0)),
                    WarpOp::Ballot => format!("sub_group_ballot({}).x", opnd(0)),
                };
                self.stmt(&format!("v{} = {};", id.0, expr));
            }
            Op::TensorMma { shape, precision } => {
                if !shape.is_valid() {
                    return Err(self.unsupported(format!(
                        "tensor fragment shape {} is not defined",
                        shape
                    )));
                }
                if precision == TensorPrecision::Bf16 {
                    return Err(self.unsupported(
                        "bf16 tensor fragments have no OpenCL lowering".into(),
                    ));
                }
                // Portable scalar walk; OpenCL exposes no fragment ops.
                let (m, n, k) = (shape.m, shape.n, shape.k);
                self.stmt(&format!(
                    "for (int _i = 0; _i < {m}; _i++) for (int _j = 0; _j < {n}; _j++) {{ \
                     float _acc = {c}[_i * {n} + _j]; \
                     for (int _k = 0; _k < {k}; _k++) \
                     _acc += (float){a}[_i * {k} + _k] * (float){b}[_k * {n} + _j]; \
                     {d}[_i * {n} + _j] = _acc; }}",
                    m = m,
                    n = n,
                    k = k,
                    d = opnd(0),
                    a = opnd(1),
                    b = opnd(2),
                    c = opnd(3),
                ));
            }
            Op::Br(target) => {
                let moves = self.edge_assigns(func, block, target);
                self.stmt(&format!("{{ {}goto bb{}_{}; }}", moves, fname, target.0));
            }
            Op::CondBr(then, els) => {
                let then_moves = self.edge_assigns(func, block, then);
                let els_moves = self.edge_assigns(func, block, els);
                self.stmt(&format!(
                    "if ({}) {{ {}goto bb{}_{}; }} else {{ {}goto bb{}_{}; }}",
                    opnd(0),
                    then_moves,
                    fname,
                    then.0,
                    els_moves,
                    fname,
                    els.0
                ));
            }
            Op::Ret => {
                if val.operands.is_empty() {
                    self.stmt("return;");
                } else {
                    self.stmt(&format!("return {};", opnd(0)));
                }
            }
        }
        Ok(())
    }

    fn emit_intrinsic(&mut self, id: ValueId, intr: Intrinsic) -> Result<(), CompilationError> {
        let expr = match intr {
            Intrinsic::GlobalId(a) => format!("(uint)get_global_id({})", a.index()),
            Intrinsic::LocalId(a) => format!("(uint)get_local_id({})", a.index()),
            Intrinsic::GroupId(a) => format!("(uint)get_group_id({})", a.index()),
            Intrinsic::GroupDim(a) => format!("(uint)get_local_size({})", a.index()),
            Intrinsic::GridDim(a) => format!("(uint)get_num_groups({})", a.index()),
            Intrinsic::LaneId => "get_sub_group_local_id()".to_owned(),
            Intrinsic::WarpSize => "get_sub_group_size()".to_owned(),
            Intrinsic::Barrier => {
                self.stmt("barrier(CLK_LOCAL_MEM_FENCE | CLK_GLOBAL_MEM_FENCE);");
                return Ok(());
            }
            Intrinsic::SharedBase => "ucl_dyn_smem".to_owned(),
        };
        self.stmt(&format!("v{} = {};", id.0, expr));
        Ok(())
    }
}

fn func_uses(func: &Function, pred: impl Fn(&Op) -> bool) -> bool {
    func.blocks
        .iter()
        .flat_map(|b| b.insts.iter())
        .any(|&id| pred(&func.value(id).op))
}

fn uses_kind(module: &Module, func: &Function, kind: ScalarKind) -> bool {
    func.blocks.iter().flat_map(|b| b.insts.iter()).any(|&id| {
        module.types.scalar_kind(func.value(id).ty) == Some(kind)
    })
}

/// C-safe identifier for a function name.
fn mangle(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn cl_binop(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::Rem => "%",
        BinOp::And => "&",
        BinOp::Or => "|",
        BinOp::Xor => "^",
        BinOp::Shl => "<<",
        BinOp::Shr => ">>",
        BinOp::Min | BinOp::Max => unreachable!("lowered to builtins"),
    }
}

fn cl_cmpop(op: CmpOp) -> &'static str {
    match op {
        CmpOp::Eq => "==",
        CmpOp::Ne => "!=",
        CmpOp::Lt => "<",
        CmpOp::Le => "<=",
        CmpOp::Gt => ">",
        CmpOp::Ge => ">=",
    }
}

fn cl_const(kind: ScalarKind, c: ConstVal) -> String {
    match kind {
        ScalarKind::F32 | ScalarKind::F16 => match c {
            ConstVal::Float(f) => format!("{:?}f", f as f32),
            other => format!("{}.0f", other.bits()),
        },
        ScalarKind::F64 => match c {
            ConstVal::Float(f) => format!("{:?}", f),
            other => format!("{}.0", other.bits()),
        },
        ScalarKind::I64 => format!("{}L", c.bits() as i64),
        ScalarKind::U64 => format!("{}UL", c.bits()),
        _ => match c {
            ConstVal::Int(v) => format!("{}", v),
            other => format!("{}", other.bits()),
        },
    }
}
