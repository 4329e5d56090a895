//! SPIR-V module emission for the OpenCL backend.
//!
//! Produces a Kernel-model (OpenCL flavor) SPIR-V module: physical
//! 64-bit addressing, builtin-variable launch geometry, subgroup ops for
//! warp primitives. The subset mirrors what the OpenCL C emitter covers;
//! anything beyond it surfaces `UnsupportedCapability`.
//!
//! Parameter and constant values need no instructions of their own:
//! their SSA ids alias the `OpFunctionParameter` and module-level
//! `OpConstant` ids directly.

use std::collections::HashMap;

use super::{BackendKind, CompilationError, TargetCaps};
use crate::ir::{
    AddrSpace, AtomicRmwOp, BinOp, CmpOp, Function, Intrinsic, Module, Op, ParamKind,
    ScalarKind, TypeId as IrTypeId, TypeKind, ValueId, WarpOp,
};

const MAGIC: u32 = 0x0723_0203;
const VERSION: u32 = 0x0001_0200; // 1.2

// Opcodes.
const OP_CAPABILITY: u16 = 17;
const OP_MEMORY_MODEL: u16 = 14;
const OP_ENTRY_POINT: u16 = 15;
const OP_TYPE_VOID: u16 = 19;
const OP_TYPE_BOOL: u16 = 20;
const OP_TYPE_INT: u16 = 21;
const OP_TYPE_FLOAT: u16 = 22;
const OP_TYPE_VECTOR: u16 = 23;
const OP_TYPE_POINTER: u16 = 32;
const OP_TYPE_FUNCTION: u16 = 33;
const OP_CONSTANT_TRUE: u16 = 41;
const OP_CONSTANT_FALSE: u16 = 42;
const OP_CONSTANT: u16 = 43;
const OP_FUNCTION: u16 = 54;
const OP_FUNCTION_PARAMETER: u16 = 55;
const OP_FUNCTION_END: u16 = 56;
const OP_FUNCTION_CALL: u16 = 57;
const OP_VARIABLE: u16 = 59;
const OP_LOAD: u16 = 61;
const OP_STORE: u16 = 62;
const OP_IN_BOUNDS_ACCESS_CHAIN: u16 = 66;
const OP_IN_BOUNDS_PTR_ACCESS_CHAIN: u16 = 70;
const OP_DECORATE: u16 = 71;
const OP_COMPOSITE_EXTRACT: u16 = 81;
const OP_CONVERT_F_TO_U: u16 = 109;
const OP_CONVERT_F_TO_S: u16 = 110;
const OP_CONVERT_S_TO_F: u16 = 111;
const OP_CONVERT_U_TO_F: u16 = 112;
const OP_U_CONVERT: u16 = 113;
const OP_S_CONVERT: u16 = 114;
const OP_F_CONVERT: u16 = 115;
const OP_I_ADD: u16 = 128;
const OP_F_ADD: u16 = 129;
const OP_I_SUB: u16 = 130;
const OP_F_SUB: u16 = 131;
const OP_I_MUL: u16 = 132;
const OP_F_MUL: u16 = 133;
const OP_U_DIV: u16 = 134;
const OP_S_DIV: u16 = 135;
const OP_F_DIV: u16 = 136;
const OP_U_MOD: u16 = 137;
const OP_S_REM: u16 = 138;
const OP_F_REM: u16 = 140;
const OP_SELECT: u16 = 169;
const OP_I_EQUAL: u16 = 170;
const OP_I_NOT_EQUAL: u16 = 171;
const OP_U_GREATER_THAN: u16 = 172;
const OP_S_GREATER_THAN: u16 = 173;
const OP_U_GREATER_THAN_EQUAL: u16 = 174;
const OP_S_GREATER_THAN_EQUAL: u16 = 175;
const OP_U_LESS_THAN: u16 = 176;
const OP_S_LESS_THAN: u16 = 177;
const OP_U_LESS_THAN_EQUAL: u16 = 178;
const OP_S_LESS_THAN_EQUAL: u16 = 179;
const OP_F_ORD_EQUAL: u16 = 180;
const OP_F_ORD_NOT_EQUAL: u16 = 182;
const OP_F_ORD_LESS_THAN: u16 = 184;
const OP_F_ORD_GREATER_THAN: u16 = 186;
const OP_F_ORD_LESS_THAN_EQUAL: u16 = 188;
const OP_F_ORD_GREATER_THAN_EQUAL: u16 = 190;
const OP_SHIFT_RIGHT_LOGICAL: u16 = 194;
const OP_SHIFT_RIGHT_ARITHMETIC: u16 = 195;
const OP_SHIFT_LEFT_LOGICAL: u16 = 196;
const OP_BITWISE_OR: u16 = 197;
const OP_BITWISE_XOR: u16 = 198;
const OP_BITWISE_AND: u16 = 199;
const OP_CONTROL_BARRIER: u16 = 224;
const OP_ATOMIC_EXCHANGE: u16 = 229;
const OP_ATOMIC_COMPARE_EXCHANGE: u16 = 230;
const OP_ATOMIC_I_ADD: u16 = 234;
const OP_ATOMIC_I_SUB: u16 = 235;
const OP_ATOMIC_S_MIN: u16 = 236;
const OP_ATOMIC_U_MIN: u16 = 237;
const OP_ATOMIC_S_MAX: u16 = 238;
const OP_ATOMIC_U_MAX: u16 = 239;
const OP_ATOMIC_AND: u16 = 240;
const OP_ATOMIC_OR: u16 = 241;
const OP_ATOMIC_XOR: u16 = 242;
const OP_PHI: u16 = 245;
const OP_LABEL: u16 = 248;
const OP_BRANCH: u16 = 249;
const OP_BRANCH_CONDITIONAL: u16 = 250;
const OP_RETURN: u16 = 253;
const OP_RETURN_VALUE: u16 = 254;
const OP_GROUP_NON_UNIFORM_ALL: u16 = 334;
const OP_GROUP_NON_UNIFORM_ANY: u16 = 335;
const OP_GROUP_NON_UNIFORM_BALLOT: u16 = 339;
const OP_GROUP_NON_UNIFORM_SHUFFLE: u16 = 345;
const OP_GROUP_NON_UNIFORM_SHUFFLE_XOR: u16 = 346;
const OP_GROUP_NON_UNIFORM_SHUFFLE_UP: u16 = 347;
const OP_GROUP_NON_UNIFORM_SHUFFLE_DOWN: u16 = 348;

// Capabilities.
const CAP_ADDRESSES: u32 = 4;
const CAP_KERNEL: u32 = 6;
const CAP_FLOAT16: u32 = 9;
const CAP_FLOAT64: u32 = 10;
const CAP_INT64: u32 = 11;
const CAP_GROUP_NON_UNIFORM: u32 = 61;
const CAP_GROUP_NON_UNIFORM_VOTE: u32 = 62;
const CAP_GROUP_NON_UNIFORM_BALLOT: u32 = 64;
const CAP_GROUP_NON_UNIFORM_SHUFFLE: u32 = 65;
const CAP_GROUP_NON_UNIFORM_SHUFFLE_RELATIVE: u32 = 66;

// Builtins (decoration 11).
const BUILTIN_NUM_WORKGROUPS: u32 = 24;
const BUILTIN_WORKGROUP_SIZE: u32 = 25;
const BUILTIN_WORKGROUP_ID: u32 = 26;
const BUILTIN_LOCAL_INVOCATION_ID: u32 = 27;
const BUILTIN_GLOBAL_INVOCATION_ID: u32 = 28;
const BUILTIN_SUBGROUP_SIZE: u32 = 36;
const BUILTIN_SUBGROUP_LOCAL_INVOCATION_ID: u32 = 41;

const SCOPE_DEVICE: u32 = 1;
const SCOPE_WORKGROUP: u32 = 2;
const SCOPE_SUBGROUP: u32 = 3;
const SEMANTICS_ACQ_REL_WORKGROUP: u32 = 0x8 | 0x100;
const SEMANTICS_RELAXED: u32 = 0x0;

const STORAGE_INPUT: u32 = 1;

fn storage_class(space: AddrSpace) -> u32 {
    match space {
        AddrSpace::Constant => 0, // UniformConstant
        AddrSpace::Shared => 4,   // Workgroup
        AddrSpace::Global => 5,   // CrossWorkgroup
        AddrSpace::Local => 7,    // Function
        AddrSpace::Generic => 8,  // Generic
    }
}

/// Emits a SPIR-V module covering every function and entry point of
/// `module`.
pub fn emit_module(module: &Module, caps: &TargetCaps) -> Result<Vec<u32>, CompilationError> {
    let mut b = SpvBuilder::new(module, caps);
    b.emit()?;
    Ok(b.assemble())
}

/// Keys for interned SPIR-V type ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TyKey {
    Void,
    Bool,
    Int(u32),
    Float(u32),
    Vec3U64,
    Ptr(u32, Box<TyKey>),
    PtrInputVec3,
    Func(Vec<u32>),
}

struct SpvBuilder<'a> {
    module: &'a Module,
    caps: &'a TargetCaps,
    next_id: u32,
    capabilities: Vec<Vec<u32>>,
    entry_points: Vec<Vec<u32>>,
    decorations: Vec<Vec<u32>>,
    globals: Vec<Vec<u32>>,
    types_consts: Vec<Vec<u32>>,
    functions: Vec<Vec<u32>>,
    ty_ids: HashMap<TyKey, u32>,
    const_ids: HashMap<(u32, u64), u32>,
    builtin_vars: HashMap<u32, u32>,
    cap_set: Vec<u32>,
}

impl<'a> SpvBuilder<'a> {
    fn new(module: &'a Module, caps: &'a TargetCaps) -> SpvBuilder<'a> {
        SpvBuilder {
            module,
            caps,
            next_id: 1,
            capabilities: Vec::new(),
            entry_points: Vec::new(),
            decorations: Vec::new(),
            globals: Vec::new(),
            types_consts: Vec::new(),
            functions: Vec::new(),
            ty_ids: HashMap::new(),
            const_ids: HashMap::new(),
            builtin_vars: HashMap::new(),
            cap_set: Vec::new(),
        }
    }

    fn unsupported(&self, detail: String) -> CompilationError {
        CompilationError::UnsupportedCapability {
            backend: BackendKind::OpenCl,
            detail,
        }
    }

    fn id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn capability(&mut self, cap: u32) {
        if !self.cap_set.contains(&cap) {
            self.cap_set.push(cap);
            self.capabilities.push(enc(OP_CAPABILITY, &[cap]));
        }
    }

    fn subgroup_caps(&mut self, extra: u32) {
        self.capability(CAP_GROUP_NON_UNIFORM);
        self.capability(extra);
    }

    fn ty(&mut self, key: TyKey) -> u32 {
        if let Some(&id) = self.ty_ids.get(&key) {
            return id;
        }
        let words;
        let id;
        match key {
            TyKey::Void => {
                id = self.id();
                words = enc(OP_TYPE_VOID, &[id]);
            }
            TyKey::Bool => {
                id = self.id();
                words = enc(OP_TYPE_BOOL, &[id]);
            }
            TyKey::Int(width) => {
                id = self.id();
                words = enc(OP_TYPE_INT, &[id, width, 0]);
            }
            TyKey::Float(width) => {
                id = self.id();
                words = enc(OP_TYPE_FLOAT, &[id, width]);
            }
            TyKey::Vec3U64 => {
                let elem = self.ty(TyKey::Int(64));
                id = self.id();
                words = enc(OP_TYPE_VECTOR, &[id, elem, 3]);
            }
            TyKey::Ptr(class, ref pointee) => {
                let p = self.ty((**pointee).clone());
                id = self.id();
                words = enc(OP_TYPE_POINTER, &[id, class, p]);
            }
            TyKey::PtrInputVec3 => {
                let v = self.ty(TyKey::Vec3U64);
                id = self.id();
                words = enc(OP_TYPE_POINTER, &[id, STORAGE_INPUT, v]);
            }
            TyKey::Func(ref sig) => {
                id = self.id();
                let mut ops = vec![id];
                ops.extend_from_slice(sig);
                words = enc(OP_TYPE_FUNCTION, &ops);
            }
        }
        self.ty_ids.insert(key, id);
        self.types_consts.push(words);
        id
    }

    fn scalar_key(&mut self, kind: ScalarKind) -> Result<TyKey, CompilationError> {
        Ok(match kind {
            ScalarKind::Bool => TyKey::Bool,
            ScalarKind::F16 => {
                self.capability(CAP_FLOAT16);
                TyKey::Float(16)
            }
            ScalarKind::F32 => TyKey::Float(32),
            ScalarKind::F64 => {
                if !self.caps.features.contains(super::DeviceFeatures::FP64) {
                    return Err(
                        self.unsupported("fp64 on a device without the capability".into())
                    );
                }
                self.capability(CAP_FLOAT64);
                TyKey::Float(64)
            }
            ScalarKind::BF16 => {
                return Err(
                    self.unsupported("bf16 has no SPIR-V kernel representation".into())
                )
            }
            k => {
                if k.size() == 8 {
                    self.capability(CAP_INT64);
                }
                TyKey::Int(k.bits().max(8))
            }
        })
    }

    fn ir_ty_key(&mut self, ty: IrTypeId) -> Result<TyKey, CompilationError> {
        match *self.module.types.kind(ty) {
            TypeKind::Void => Ok(TyKey::Void),
            TypeKind::Scalar(kind) => self.scalar_key(kind),
            TypeKind::Pointer { pointee, space } => {
                let inner = self.ir_ty_key(pointee)?;
                Ok(TyKey::Ptr(storage_class(space), Box::new(inner)))
            }
            ref other => Err(self.unsupported(format!(
                "type {:?} has no SPIR-V lowering in the kernel subset",
                other
            ))),
        }
    }

    fn ir_ty(&mut self, ty: IrTypeId) -> Result<u32, CompilationError> {
        let key = self.ir_ty_key(ty)?;
        Ok(self.ty(key))
    }

    fn constant(&mut self, ty: u32, bits: u64, wide: bool) -> u32 {
        if let Some(&id) = self.const_ids.get(&(ty, bits)) {
            return id;
        }
        let id = self.id();
        let words = if wide {
            enc(
                OP_CONSTANT,
                &[ty, id, (bits & 0xffff_ffff) as u32, (bits >> 32) as u32],
            )
        } else {
            enc(OP_CONSTANT, &[ty, id, bits as u32])
        };
        self.const_ids.insert((ty, bits), id);
        self.types_consts.push(words);
        id
    }

    fn const_u32(&mut self, v: u32) -> u32 {
        let ty = self.ty(TyKey::Int(32));
        self.constant(ty, v as u64, false)
    }

    fn bool_constant(&mut self, ty: u32, truth: bool) -> u32 {
        let key = (ty, truth as u64 + 2); // distinct from numeric keys 0/1
        if let Some(&id) = self.const_ids.get(&key) {
            return id;
        }
        let id = self.id();
        let opcode = if truth { OP_CONSTANT_TRUE } else { OP_CONSTANT_FALSE };
        self.types_consts.push(enc(opcode, &[ty, id]));
        self.const_ids.insert(key, id);
        id
    }

    /// Input variable decorated with `builtin`, created on first use.
    fn builtin_var(&mut self, builtin: u32) -> u32 {
        if let Some(&id) = self.builtin_vars.get(&builtin) {
            return id;
        }
        let ptr_ty = self.ty(TyKey::PtrInputVec3);
        let id = self.id();
        self.globals
            .push(enc(OP_VARIABLE, &[ptr_ty, id, STORAGE_INPUT]));
        self.decorations
            .push(enc(OP_DECORATE, &[id, 11 /* BuiltIn */, builtin]));
        self.builtin_vars.insert(builtin, id);
        id
    }

    fn emit(&mut self) -> Result<(), CompilationError> {
        self.capability(CAP_ADDRESSES);
        self.capability(CAP_KERNEL);

        let module = self.module;
        let mut func_ids = Vec::with_capacity(module.funcs().len());
        for _ in module.funcs() {
            func_ids.push(self.id());
        }

        for (idx, func) in module.funcs().iter().enumerate() {
            let fid = func_ids[idx];
            let entry = module
                .entry_points()
                .iter()
                .find(|e| e.func.index() == idx);
            self.emit_function(func, fid, entry, &func_ids)?;
            if let Some(entry) = entry {
                let mut ops = vec![6 /* Kernel */, fid];
                ops.extend(str_words(&entry.name));
                let mut interface: Vec<u32> = self.builtin_vars.values().copied().collect();
                interface.sort_unstable();
                ops.extend(interface);
                self.entry_points.push(enc(OP_ENTRY_POINT, &ops));
            }
        }
        Ok(())
    }

    fn emit_function(
        &mut self,
        func: &Function,
        fid: u32,
        entry: Option<&crate::ir::EntryPoint>,
        func_ids: &[u32],
    ) -> Result<(), CompilationError> {
        let mut body: Vec<Vec<u32>> = Vec::new();
        let ret_ty = self.ir_ty(func.ret)?;

        let mut param_tys = Vec::with_capacity(func.params.len());
        for (i, &p) in func.params.iter().enumerate() {
            let ty = match entry.and_then(|e| e.params.get(i).map(|l| l.kind)) {
                Some(ParamKind::Buffer(kind)) => {
                    let key = self.scalar_key(kind)?;
                    self.ty(TyKey::Ptr(
                        storage_class(AddrSpace::Global),
                        Box::new(key),
                    ))
                }
                _ => self.ir_ty(p)?,
            };
            param_tys.push(ty);
        }
        let mut sig = vec![ret_ty];
        sig.extend_from_slice(&param_tys);
        let fn_ty = self.ty(TyKey::Func(sig));

        body.push(enc(OP_FUNCTION, &[ret_ty, fid, 0 /* None */, fn_ty]));
        let mut param_ids = Vec::with_capacity(func.params.len());
        for &pty in &param_tys {
            let id = self.id();
            body.push(enc(OP_FUNCTION_PARAMETER, &[pty, id]));
            param_ids.push(id);
        }

        let block_ids: Vec<u32> = (0..func.blocks.len()).map(|_| self.id()).collect();

        // Value ids: parameters and constants alias existing ids,
        // everything else gets a fresh one.
        let mut value_ids: Vec<u32> = vec![0; func.value_count()];
        for b in func.block_ids() {
            for &id in &func.blocks[b.index()].insts {
                let val = func.value(id);
                value_ids[id.index()] = match val.op {
                    Op::Param(i) => param_ids[i as usize],
                    Op::Const(c) => {
                        let kind =
                            self.module.types.scalar_kind(val.ty).ok_or_else(|| {
                                self.unsupported("constant of non-scalar type".into())
                            })?;
                        let ty = self.ir_ty(val.ty)?;
                        match kind {
                            ScalarKind::Bool => self.bool_constant(ty, c.bits() != 0),
                            k if k.size() == 8 => self.constant(ty, c.bits(), true),
                            k => self.constant(ty, c.bits() & mask64(k), false),
                        }
                    }
                    _ => self.id(),
                };
            }
        }

        for b in func.block_ids() {
            body.push(enc(OP_LABEL, &[block_ids[b.index()]]));
            for &id in &func.blocks[b.index()].insts {
                self.emit_value(func, id, &value_ids, &block_ids, func_ids, &mut body)?;
            }
        }
        body.push(enc(OP_FUNCTION_END, &[]));
        self.functions.extend(body);
        Ok(())
    }

    fn emit_value(
        &mut self,
        func: &Function,
        id: ValueId,
        value_ids: &[u32],
        block_ids: &[u32],
        func_ids: &[u32],
        body: &mut Vec<Vec<u32>>,
    ) -> Result<(), CompilationError> {
        let val = func.value(id);
        let rid = value_ids[id.index()];
        let vid = |x: ValueId| value_ids[x.index()];

        match val.op {
            // Aliased at id-assignment time.
            Op::Param(_) | Op::Const(_) => {}

            Op::Bin(op) => {
                let kind = self
                    .module
                    .types
                    .scalar_kind(val.ty)
                    .ok_or_else(|| self.unsupported("binop on non-scalar".into()))?;
                let ty = self.ir_ty(val.ty)?;
                let opcode = bin_opcode(op, kind)?;
                body.push(enc(
                    opcode,
                    &[ty, rid, vid(val.operands[0]), vid(val.operands[1])],
                ));
            }

            Op::Cmp(op) => {
                let kind = self
                    .module
                    .types
                    .scalar_kind(func.value(val.operands[0]).ty)
                    .ok_or_else(|| self.unsupported("cmp on non-scalar".into()))?;
                let ty = self.ty(TyKey::Bool);
                let opcode = cmp_opcode(op, kind);
                body.push(enc(
                    opcode,
                    &[ty, rid, vid(val.operands[0]), vid(val.operands[1])],
                ));
            }

            Op::Select => {
                let ty = self.ir_ty(val.ty)?;
                body.push(enc(
                    OP_SELECT,
                    &[
                        ty,
                        rid,
                        vid(val.operands[0]),
                        vid(val.operands[1]),
                        vid(val.operands[2]),
                    ],
                ));
            }

            Op::Cast => {
                let from = self
                    .module
                    .types
                    .scalar_kind(func.value(val.operands[0]).ty)
                    .ok_or_else(|| self.unsupported("cast of non-scalar".into()))?;
                let to = self
                    .module
                    .types
                    .scalar_kind(val.ty)
                    .ok_or_else(|| self.unsupported("cast to non-scalar".into()))?;
                let ty = self.ir_ty(val.ty)?;
                let opcode = cast_opcode(from, to);
                body.push(enc(opcode, &[ty, rid, vid(val.operands[0])]));
            }

            Op::Alloca => {
                let ty = self.ir_ty(val.ty)?;
                body.push(enc(
                    OP_VARIABLE,
                    &[ty, rid, storage_class(AddrSpace::Local)],
                ));
            }

            Op::Load => {
                let ty = self.ir_ty(val.ty)?;
                body.push(enc(OP_LOAD, &[ty, rid, vid(val.operands[0])]));
            }

            Op::Store => {
                body.push(enc(
                    OP_STORE,
                    &[vid(val.operands[0]), vid(val.operands[1])],
                ));
            }

            Op::PtrOffset => {
                let ty = self.ir_ty(val.ty)?;
                body.push(enc(
                    OP_IN_BOUNDS_PTR_ACCESS_CHAIN,
                    &[ty, rid, vid(val.operands[0]), vid(val.operands[1])],
                ));
            }

            Op::FieldPtr(n) => {
                let ty = self.ir_ty(val.ty)?;
                let idx = self.const_u32(n);
                body.push(enc(
                    OP_IN_BOUNDS_ACCESS_CHAIN,
                    &[ty, rid, vid(val.operands[0]), idx],
                ));
            }

            Op::Call(callee) => {
                let ty = self.ir_ty(val.ty)?;
                let mut ops = vec![ty, rid, func_ids[callee.index()]];
                ops.extend(val.operands.iter().map(|&a| vid(a)));
                body.push(enc(OP_FUNCTION_CALL, &ops));
            }

            Op::Intr(intr) => self.emit_intrinsic(func, id, intr, value_ids, body)?,

            Op::AtomicRmw(op) => {
                let kind = self
                    .module
                    .types
                    .scalar_kind(val.ty)
                    .ok_or_else(|| self.unsupported("atomic on non-scalar".into()))?;
                let ty = self.ir_ty(val.ty)?;
                let scope = self.const_u32(SCOPE_DEVICE);
                let sem = self.const_u32(SEMANTICS_RELAXED);
                let opcode = atomic_opcode(op, kind);
                body.push(enc(
                    opcode,
                    &[ty, rid, vid(val.operands[0]), scope, sem, vid(val.operands[1])],
                ));
            }

            Op::AtomicCas => {
                let ty = self.ir_ty(val.ty)?;
                let scope = self.const_u32(SCOPE_DEVICE);
                let sem = self.const_u32(SEMANTICS_RELAXED);
                body.push(enc(
                    OP_ATOMIC_COMPARE_EXCHANGE,
                    &[
                        ty,
                        rid,
                        vid(val.operands[0]),
                        scope,
                        sem,
                        sem,
                        vid(val.operands[2]), // value
                        vid(val.operands[1]), // comparator
                    ],
                ));
            }

            Op::Warp(mode) => {
                let ty = self.ir_ty(val.ty)?;
                let scope = self.const_u32(SCOPE_SUBGROUP);
                match mode {
                    WarpOp::VoteAll | WarpOp::VoteAny => {
                        self.subgroup_caps(CAP_GROUP_NON_UNIFORM_VOTE);
                        let opcode = if mode == WarpOp::VoteAll {
                            OP_GROUP_NON_UNIFORM_ALL
                        } else {
                            OP_GROUP_NON_UNIFORM_ANY
                        };
                        body.push(enc(opcode, &[ty, rid, scope, vid(val.operands[0])]));
                    }
                    WarpOp::Ballot => {
                        self.subgroup_caps(CAP_GROUP_NON_UNIFORM_BALLOT);
                        body.push(enc(
                            OP_GROUP_NON_UNIFORM_BALLOT,
                            &[ty, rid, scope, vid(val.operands[0])],
                        ));
                    }
                    _ => {
                        let (cap, opcode) = match mode {
                            WarpOp::ShuffleIdx => {
                                (CAP_GROUP_NON_UNIFORM_SHUFFLE, OP_GROUP_NON_UNIFORM_SHUFFLE)
                            }
                            WarpOp::ShuffleXor => (
                                CAP_GROUP_NON_UNIFORM_SHUFFLE,
                                OP_GROUP_NON_UNIFORM_SHUFFLE_XOR,
                            ),
                            WarpOp::ShuffleUp => (
                                CAP_GROUP_NON_UNIFORM_SHUFFLE_RELATIVE,
                                OP_GROUP_NON_UNIFORM_SHUFFLE_UP,
                            ),
                            _ => (
                                CAP_GROUP_NON_UNIFORM_SHUFFLE_RELATIVE,
                                OP_GROUP_NON_UNIFORM_SHUFFLE_DOWN,
                            ),
                        };
                        self.subgroup_caps(cap);
                        body.push(enc(
                            opcode,
                            &[ty, rid, scope, vid(val.operands[0]), vid(val.operands[1])],
                        ));
                    }
                }
            }

            Op::TensorMma { .. } => {
                return Err(self.unsupported(
                    "tensor fragments have no SPIR-V kernel lowering".into(),
                ))
            }

            Op::Br(target) => {
                body.push(enc(OP_BRANCH, &[block_ids[target.index()]]));
            }

            Op::CondBr(then, els) => {
                body.push(enc(
                    OP_BRANCH_CONDITIONAL,
                    &[
                        vid(val.operands[0]),
                        block_ids[then.index()],
                        block_ids[els.index()],
                    ],
                ));
            }

            Op::Ret => {
                if val.operands.is_empty() {
                    body.push(enc(OP_RETURN, &[]));
                } else {
                    body.push(enc(OP_RETURN_VALUE, &[vid(val.operands[0])]));
                }
            }

            Op::Phi(ref incoming) => {
                let ty = self.ir_ty(val.ty)?;
                let mut ops = vec![ty, rid];
                for (&block, &opnd) in incoming.iter().zip(val.operands.iter()) {
                    ops.push(vid(opnd));
                    ops.push(block_ids[block.index()]);
                }
                body.push(enc(OP_PHI, &ops));
            }
        }
        Ok(())
    }

    fn emit_intrinsic(
        &mut self,
        func: &Function,
        id: ValueId,
        intr: Intrinsic,
        value_ids: &[u32],
        body: &mut Vec<Vec<u32>>,
    ) -> Result<(), CompilationError> {
        let rid = value_ids[id.index()];
        let vec_builtin = |i: &mut Self, builtin: u32, axis: u8, body: &mut Vec<Vec<u32>>, rid: u32| -> Result<(), CompilationError> {
            let var = i.builtin_var(builtin);
            let vec_ty = i.ty(TyKey::Vec3U64);
            let u64_ty = i.ty(TyKey::Int(64));
            let u32_ty = i.ty(TyKey::Int(32));
            let loaded = i.id();
            body.push(enc(OP_LOAD, &[vec_ty, loaded, var]));
            let extracted = i.id();
            body.push(enc(
                OP_COMPOSITE_EXTRACT,
                &[u64_ty, extracted, loaded, axis as u32],
            ));
            body.push(enc(OP_U_CONVERT, &[u32_ty, rid, extracted]));
            Ok(())
        };

        match intr {
            Intrinsic::GlobalId(a) => {
                vec_builtin(self, BUILTIN_GLOBAL_INVOCATION_ID, a.index() as u8, body, rid)?
            }
            Intrinsic::LocalId(a) => {
                vec_builtin(self, BUILTIN_LOCAL_INVOCATION_ID, a.index() as u8, body, rid)?
            }
            Intrinsic::GroupId(a) => {
                vec_builtin(self, BUILTIN_WORKGROUP_ID, a.index() as u8, body, rid)?
            }
            Intrinsic::GroupDim(a) => {
                vec_builtin(self, BUILTIN_WORKGROUP_SIZE, a.index() as u8, body, rid)?
            }
            Intrinsic::GridDim(a) => {
                vec_builtin(self, BUILTIN_NUM_WORKGROUPS, a.index() as u8, body, rid)?
            }
            Intrinsic::LaneId | Intrinsic::WarpSize => {
                self.subgroup_caps(CAP_GROUP_NON_UNIFORM);
                let builtin = if intr == Intrinsic::LaneId {
                    BUILTIN_SUBGROUP_LOCAL_INVOCATION_ID
                } else {
                    BUILTIN_SUBGROUP_SIZE
                };
                // Scalar u32 builtins.
                let u32_ty = self.ty(TyKey::Int(32));
                let ptr_ty = self.ty(TyKey::Ptr(STORAGE_INPUT, Box::new(TyKey::Int(32))));
                let var = match self.builtin_vars.get(&builtin) {
                    Some(&v) => v,
                    None => {
                        let v = self.id();
                        self.globals
                            .push(enc(OP_VARIABLE, &[ptr_ty, v, STORAGE_INPUT]));
                        self.decorations.push(enc(OP_DECORATE, &[v, 11, builtin]));
                        self.builtin_vars.insert(builtin, v);
                        v
                    }
                };
                body.push(enc(OP_LOAD, &[u32_ty, rid, var]));
            }
            Intrinsic::Barrier => {
                let scope = self.const_u32(SCOPE_WORKGROUP);
                let sem = self.const_u32(SEMANTICS_ACQ_REL_WORKGROUP);
                body.push(enc(OP_CONTROL_BARRIER, &[scope, scope, sem]));
            }
            Intrinsic::SharedBase => {
                // A Workgroup-storage byte array stands in for the
                // dynamic window; drivers rebind its size at launch.
                let ty = self.ir_ty(func.value(id).ty)?;
                self.globals.push(enc(
                    OP_VARIABLE,
                    &[ty, rid, storage_class(AddrSpace::Shared)],
                ));
            }
        }
        Ok(())
    }

    fn assemble(&self) -> Vec<u32> {
        let mut words = vec![MAGIC, VERSION, 0, self.next_id, 0];
        for cap in &self.capabilities {
            words.extend(cap.iter().copied());
        }
        words.extend(enc(OP_MEMORY_MODEL, &[2 /* Physical64 */, 2 /* OpenCL */]));
        for ep in &self.entry_points {
            words.extend(ep.iter().copied());
        }
        for d in &self.decorations {
            words.extend(d.iter().copied());
        }
        for t in &self.types_consts {
            words.extend(t.iter().copied());
        }
        for g in &self.globals {
            words.extend(g.iter().copied());
        }
        for f in &self.functions {
            words.extend(f.iter().copied());
        }
        words
    }
}

fn mask64(kind: ScalarKind) -> u64 {
    match kind.size() {
        1 => 0xff,
        2 => 0xffff,
        4 => 0xffff_ffff,
        _ => u64::MAX,
    }
}

fn bin_opcode(op: BinOp, kind: ScalarKind) -> Result<u16, CompilationError> {
    let float = kind.is_float();
    let signed = kind.is_signed();
    Ok(match op {
        BinOp::Add if float => OP_F_ADD,
        BinOp::Add => OP_I_ADD,
        BinOp::Sub if float => OP_F_SUB,
        BinOp::Sub => OP_I_SUB,
        BinOp::Mul if float => OP_F_MUL,
        BinOp::Mul => OP_I_MUL,
        BinOp::Div if float => OP_F_DIV,
        BinOp::Div if signed => OP_S_DIV,
        BinOp::Div => OP_U_DIV,
        BinOp::Rem if float => OP_F_REM,
        BinOp::Rem if signed => OP_S_REM,
        BinOp::Rem => OP_U_MOD,
        BinOp::And => OP_BITWISE_AND,
        BinOp::Or => OP_BITWISE_OR,
        BinOp::Xor => OP_BITWISE_XOR,
        BinOp::Shl => OP_SHIFT_LEFT_LOGICAL,
        BinOp::Shr if signed => OP_SHIFT_RIGHT_ARITHMETIC,
        BinOp::Shr => OP_SHIFT_RIGHT_LOGICAL,
        BinOp::Min | BinOp::Max => {
            return Err(CompilationError::UnsupportedCapability {
                backend: BackendKind::OpenCl,
                detail: "min/max require the OpenCL extended instruction set".to_owned(),
            })
        }
    })
}

fn cmp_opcode(op: CmpOp, kind: ScalarKind) -> u16 {
    let float = kind.is_float();
    let signed = kind.is_signed();
    match op {
        CmpOp::Eq if float => OP_F_ORD_EQUAL,
        CmpOp::Eq => OP_I_EQUAL,
        CmpOp::Ne if float => OP_F_ORD_NOT_EQUAL,
        CmpOp::Ne => OP_I_NOT_EQUAL,
        CmpOp::Lt if float => OP_F_ORD_LESS_THAN,
        CmpOp::Lt if signed => OP_S_LESS_THAN,
        CmpOp::Lt => OP_U_LESS_THAN,
        CmpOp::Le if float => OP_F_ORD_LESS_THAN_EQUAL,
        CmpOp::Le if signed => OP_S_LESS_THAN_EQUAL,
        CmpOp::Le => OP_U_LESS_THAN_EQUAL,
        CmpOp::Gt if float => OP_F_ORD_GREATER_THAN,
        CmpOp::Gt if signed => OP_S_GREATER_THAN,
        CmpOp::Gt => OP_U_GREATER_THAN,
        CmpOp::Ge if float => OP_F_ORD_GREATER_THAN_EQUAL,
        CmpOp::Ge if signed => OP_S_GREATER_THAN_EQUAL,
        CmpOp::Ge => OP_U_GREATER_THAN_EQUAL,
    }
}

fn cast_opcode(from: ScalarKind, to: ScalarKind) -> u16 {
    match (from.is_float(), to.is_float()) {
        (true, true) => OP_F_CONVERT,
        (true, false) => {
            if to.is_signed() {
                OP_CONVERT_F_TO_S
            } else {
                OP_CONVERT_F_TO_U
            }
        }
        (false, true) => {
            if from.is_signed() {
                OP_CONVERT_S_TO_F
            } else {
                OP_CONVERT_U_TO_F
            }
        }
        (false, false) => {
            if from.is_signed() && to.is_signed() {
                OP_S_CONVERT
            } else {
                OP_U_CONVERT
            }
        }
    }
}

fn atomic_opcode(op: AtomicRmwOp, kind: ScalarKind) -> u16 {
    match op {
        AtomicRmwOp::Add => OP_ATOMIC_I_ADD,
        AtomicRmwOp::Sub => OP_ATOMIC_I_SUB,
        AtomicRmwOp::And => OP_ATOMIC_AND,
        AtomicRmwOp::Or => OP_ATOMIC_OR,
        AtomicRmwOp::Xor => OP_ATOMIC_XOR,
        AtomicRmwOp::Min if kind.is_signed() => OP_ATOMIC_S_MIN,
        AtomicRmwOp::Min => OP_ATOMIC_U_MIN,
        AtomicRmwOp::Max if kind.is_signed() => OP_ATOMIC_S_MAX,
        AtomicRmwOp::Max => OP_ATOMIC_U_MAX,
        AtomicRmwOp::Exchange => OP_ATOMIC_EXCHANGE,
    }
}

/// Packs one instruction: word 0 is `(word_count << 16) | opcode`.
fn enc(opcode: u16, operands: &[u32]) -> Vec<u32> {
    let mut words = Vec::with_capacity(operands.len() + 1);
    words.push(((operands.len() as u32 + 1) << 16) | opcode as u32);
    words.extend_from_slice(operands);
    words
}

/// Null-terminated UTF-8 packed little-endian into words.
fn str_words(s: &str) -> Vec<u32> {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    while bytes.len() % 4 != 0 {
        bytes.push(0);
    }
    bytes
        .chunks(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_packing() {
        let words = enc(OP_CAPABILITY, &[CAP_KERNEL]);
        assert_eq!(words, vec![(2 << 16) | OP_CAPABILITY as u32, CAP_KERNEL]);
    }

    #[test]
    fn string_packing() {
        // "add" + NUL fits one word.
        assert_eq!(str_words("add").len(), 1);
        assert_eq!(str_words("vadd").len(), 2);
    }
}
