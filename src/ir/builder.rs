//! Builders for modules and functions.
//!
//! The frontend boundary: everything upstream of the pass pipeline
//! constructs IR through these types, which keep the invariants a closed
//! module is expected to satisfy (SSA form, structured control flow,
//! terminator placement).

use super::types::{AddrSpace, ScalarKind, TypeId, TypeTable};
use super::{
    AtomicRmwOp, Axis, BinOp, Block, BlockId, CmpOp, ConstVal, DebugLoc, EntryAttrs, EntryPoint,
    FuncId, Function, Intrinsic, Module, Op, ParamLayout, TensorPrecision, TensorShape, ValueData,
    ValueId, WarpOp,
};

/// Builds a [`Module`]. Functions are declared first and filled in via
/// [`FunctionBuilder`]; `build` closes the module.
#[must_use = "builders do nothing unless '::build' is called"]
#[derive(Debug)]
pub struct ModuleBuilder {
    module: Module,
}

impl ModuleBuilder {
    pub fn new(name: &str) -> ModuleBuilder {
        ModuleBuilder {
            module: Module::new(name),
        }
    }

    /// The module's type intern table.
    pub fn types(&mut self) -> &mut TypeTable {
        &mut self.module.types
    }

    /// Declares an empty function with an entry block and returns its id.
    pub fn declare_function(&mut self, name: &str, params: Vec<TypeId>, ret: TypeId) -> FuncId {
        let id = FuncId(self.module.funcs.len() as u32);
        self.module.funcs.push(Function {
            name: name.to_owned(),
            params,
            ret,
            blocks: vec![Block::default()],
            vals: Vec::new(),
        });
        id
    }

    /// Returns a builder positioned at the entry block of `func`.
    pub fn function(&mut self, func: FuncId) -> FunctionBuilder<'_> {
        FunctionBuilder {
            module: &mut self.module,
            func,
            block: BlockId(0),
        }
    }

    /// Registers `func` as a host-visible entry point.
    pub fn add_entry_point(
        &mut self,
        func: FuncId,
        name: &str,
        dims: u8,
        params: Vec<ParamLayout>,
        shared_bytes: u32,
    ) {
        assert!((1..=3).contains(&dims), "entry dims must be 1-3");
        self.module.entries.push(EntryPoint {
            func,
            name: name.to_owned(),
            dims,
            params,
            shared_bytes,
            implicit_group: false,
            attrs: EntryAttrs::default(),
        });
    }

    /// Mutable access to the most recently added entry point, for setting
    /// attributes.
    pub fn last_entry_mut(&mut self) -> &mut EntryPoint {
        self.module
            .entries
            .last_mut()
            .expect("no entry point added yet")
    }

    /// Closes and returns the module.
    pub fn build(mut self) -> Module {
        self.module.close();
        self.module
    }
}

/// Appends values to one function. All `push`-style methods add to the
/// current block; terminators end it.
#[derive(Debug)]
pub struct FunctionBuilder<'m> {
    module: &'m mut Module,
    func: FuncId,
    block: BlockId,
}

impl<'m> FunctionBuilder<'m> {
    /// Appends a new empty block (without switching to it).
    pub fn new_block(&mut self) -> BlockId {
        let func = self.module.func_mut(self.func);
        let id = BlockId(func.blocks.len() as u32);
        func.blocks.push(Block::default());
        id
    }

    /// Makes `block` the insertion point.
    pub fn switch_to(&mut self, block: BlockId) {
        self.block = block;
    }

    pub fn current_block(&self) -> BlockId {
        self.block
    }

    /// Appends a raw value. Prefer the typed helpers below.
    pub fn push(&mut self, ty: TypeId, op: Op, operands: Vec<ValueId>) -> ValueId {
        self.push_dbg(ty, op, operands, None)
    }

    pub fn push_dbg(
        &mut self,
        ty: TypeId,
        op: Op,
        operands: Vec<ValueId>,
        dbg: Option<DebugLoc>,
    ) -> ValueId {
        let block = self.block;
        let func = self.module.func_mut(self.func);
        let id = ValueId(func.vals.len() as u32);
        func.vals.push(ValueData {
            ty,
            op,
            operands,
            dbg,
        });
        func.blocks[block.index()].insts.push(id);
        id
    }

    fn scalar_ty(&mut self, kind: ScalarKind) -> TypeId {
        self.module.types.scalar(kind)
    }

    // ---------------------------- constants ----------------------------

    pub fn const_val(&mut self, kind: ScalarKind, val: ConstVal) -> ValueId {
        let ty = self.scalar_ty(kind);
        self.push(ty, Op::Const(val), vec![])
    }

    pub fn const_i32(&mut self, val: i32) -> ValueId {
        self.const_val(ScalarKind::I32, ConstVal::Int(val as i64))
    }

    pub fn const_u32(&mut self, val: u32) -> ValueId {
        self.const_val(ScalarKind::U32, ConstVal::Uint(val as u64))
    }

    pub fn const_u64(&mut self, val: u64) -> ValueId {
        self.const_val(ScalarKind::U64, ConstVal::Uint(val))
    }

    pub fn const_f32(&mut self, val: f32) -> ValueId {
        self.const_val(ScalarKind::F32, ConstVal::Float(val as f64))
    }

    pub fn const_bool(&mut self, val: bool) -> ValueId {
        self.const_val(ScalarKind::Bool, ConstVal::Bool(val))
    }

    // --------------------------- computation ---------------------------

    /// Materializes function parameter `idx` as a value.
    pub fn param(&mut self, idx: u32) -> ValueId {
        let ty = self.module.func(self.func).params[idx as usize];
        self.push(ty, Op::Param(idx), vec![])
    }

    pub fn bin(&mut self, op: BinOp, a: ValueId, b: ValueId) -> ValueId {
        let ty = self.module.func(self.func).value(a).ty;
        self.push(ty, Op::Bin(op), vec![a, b])
    }

    pub fn cmp(&mut self, op: CmpOp, a: ValueId, b: ValueId) -> ValueId {
        let ty = self.scalar_ty(ScalarKind::Bool);
        self.push(ty, Op::Cmp(op), vec![a, b])
    }

    pub fn select(&mut self, cond: ValueId, then: ValueId, els: ValueId) -> ValueId {
        let ty = self.module.func(self.func).value(then).ty;
        self.push(ty, Op::Select, vec![cond, then, els])
    }

    pub fn cast(&mut self, src: ValueId, to: ScalarKind) -> ValueId {
        let ty = self.scalar_ty(to);
        self.push(ty, Op::Cast, vec![src])
    }

    // ----------------------------- memory ------------------------------

    /// Stack allocation of one `pointee`, yielding a `local` pointer.
    pub fn alloca(&mut self, pointee: TypeId) -> ValueId {
        let ty = self.module.types.pointer(pointee, AddrSpace::Local);
        self.push(ty, Op::Alloca, vec![])
    }

    pub fn load(&mut self, ptr: ValueId) -> ValueId {
        let ptr_ty = self.module.func(self.func).value(ptr).ty;
        let ty = self
            .module
            .types
            .pointee(ptr_ty)
            .expect("load from non-pointer");
        self.push(ty, Op::Load, vec![ptr])
    }

    pub fn store(&mut self, ptr: ValueId, val: ValueId) {
        let ty = self.module.types.void();
        self.push(ty, Op::Store, vec![ptr, val]);
    }

    pub fn ptr_offset(&mut self, ptr: ValueId, index: ValueId) -> ValueId {
        let ty = self.module.func(self.func).value(ptr).ty;
        self.push(ty, Op::PtrOffset, vec![ptr, index])
    }

    pub fn field_ptr(&mut self, ptr: ValueId, field: u32) -> ValueId {
        let ptr_ty = self.module.func(self.func).value(ptr).ty;
        let space = self
            .module
            .types
            .pointer_space(ptr_ty)
            .expect("field_ptr on non-pointer");
        let strct = self.module.types.pointee(ptr_ty).unwrap();
        let field_ty = match *self.module.types.kind(strct) {
            super::TypeKind::Struct { ref fields } => fields[field as usize],
            ref other => panic!("field_ptr pointee is not a struct: {:?}", other),
        };
        let ty = self.module.types.pointer(field_ty, space);
        self.push(ty, Op::FieldPtr(field), vec![ptr])
    }

    pub fn call(&mut self, callee: FuncId, args: Vec<ValueId>) -> ValueId {
        let ty = self.module.func(callee).ret;
        self.push(ty, Op::Call(callee), args)
    }

    // --------------------------- intrinsics ----------------------------

    fn index_intr(&mut self, intr: Intrinsic) -> ValueId {
        let ty = self.scalar_ty(ScalarKind::U32);
        self.push(ty, Op::Intr(intr), vec![])
    }

    pub fn global_id(&mut self, axis: Axis) -> ValueId {
        self.index_intr(Intrinsic::GlobalId(axis))
    }

    pub fn local_id(&mut self, axis: Axis) -> ValueId {
        self.index_intr(Intrinsic::LocalId(axis))
    }

    pub fn group_id(&mut self, axis: Axis) -> ValueId {
        self.index_intr(Intrinsic::GroupId(axis))
    }

    pub fn group_dim(&mut self, axis: Axis) -> ValueId {
        self.index_intr(Intrinsic::GroupDim(axis))
    }

    pub fn grid_dim(&mut self, axis: Axis) -> ValueId {
        self.index_intr(Intrinsic::GridDim(axis))
    }

    pub fn lane_id(&mut self) -> ValueId {
        self.index_intr(Intrinsic::LaneId)
    }

    pub fn warp_size(&mut self) -> ValueId {
        self.index_intr(Intrinsic::WarpSize)
    }

    pub fn barrier(&mut self) {
        let ty = self.module.types.void();
        self.push(ty, Op::Intr(Intrinsic::Barrier), vec![]);
    }

    /// Base pointer of the dynamic shared-memory window, as a `shared`
    /// byte pointer.
    pub fn shared_base(&mut self) -> ValueId {
        let u8_ty = self.module.types.scalar(ScalarKind::U8);
        let ty = self.module.types.pointer(u8_ty, AddrSpace::Shared);
        self.push(ty, Op::Intr(Intrinsic::SharedBase), vec![])
    }

    // ---------------------- atomics / warp / tensor ---------------------

    pub fn atomic_rmw(&mut self, op: AtomicRmwOp, ptr: ValueId, val: ValueId) -> ValueId {
        let ty = self.module.func(self.func).value(val).ty;
        self.push(ty, Op::AtomicRmw(op), vec![ptr, val])
    }

    pub fn atomic_cas(&mut self, ptr: ValueId, cmp: ValueId, new: ValueId) -> ValueId {
        let ty = self.module.func(self.func).value(cmp).ty;
        self.push(ty, Op::AtomicCas, vec![ptr, cmp, new])
    }

    pub fn warp(&mut self, op: WarpOp, val: ValueId, operand: ValueId) -> ValueId {
        let ty = self.module.func(self.func).value(val).ty;
        self.push(ty, Op::Warp(op), vec![val, operand])
    }

    pub fn vote(&mut self, op: WarpOp, pred: ValueId) -> ValueId {
        debug_assert!(matches!(
            op,
            WarpOp::VoteAll | WarpOp::VoteAny | WarpOp::Ballot
        ));
        let ty = match op {
            WarpOp::Ballot => self.scalar_ty(ScalarKind::U64),
            _ => self.scalar_ty(ScalarKind::Bool),
        };
        self.push(ty, Op::Warp(op), vec![pred])
    }

    pub fn tensor_mma(
        &mut self,
        shape: TensorShape,
        precision: TensorPrecision,
        d: ValueId,
        a: ValueId,
        b: ValueId,
        c: ValueId,
    ) {
        let ty = self.module.types.void();
        self.push(ty, Op::TensorMma { shape, precision }, vec![d, a, b, c]);
    }

    // --------------------------- control flow --------------------------

    pub fn br(&mut self, target: BlockId) {
        let ty = self.module.types.void();
        self.push(ty, Op::Br(target), vec![]);
    }

    pub fn cond_br(&mut self, cond: ValueId, then: BlockId, els: BlockId) {
        let ty = self.module.types.void();
        self.push(ty, Op::CondBr(then, els), vec![cond]);
    }

    pub fn ret(&mut self, val: Option<ValueId>) {
        let ty = self.module.types.void();
        self.push(ty, Op::Ret, val.into_iter().collect());
    }

    /// Inserts an empty phi at the head of the current block. Incoming
    /// edges are added with [`phi_add_incoming`](Self::phi_add_incoming)
    /// once their values exist (loop-carried values are defined after
    /// the phi that consumes them).
    pub fn phi_incomplete(&mut self, ty: TypeId) -> ValueId {
        self.phi(ty, &[])
    }

    /// Appends an incoming edge to a previously created phi.
    pub fn phi_add_incoming(&mut self, phi: ValueId, block: BlockId, value: ValueId) {
        let func = self.module.func_mut(self.func);
        let val = func.value_mut(phi);
        match val.op {
            Op::Phi(ref mut blocks) => blocks.push(block),
            ref other => panic!("phi_add_incoming on non-phi {:?}", other),
        }
        val.operands.push(value);
    }

    /// Inserts a phi at the head of the current block.
    pub fn phi(&mut self, ty: TypeId, incoming: &[(BlockId, ValueId)]) -> ValueId {
        let blocks = incoming.iter().map(|&(b, _)| b).collect::<Vec<_>>();
        let operands = incoming.iter().map(|&(_, v)| v).collect::<Vec<_>>();
        let block = self.block;
        let func = self.module.func_mut(self.func);
        let id = ValueId(func.vals.len() as u32);
        func.vals.push(ValueData {
            ty,
            op: Op::Phi(blocks),
            operands,
            dbg: None,
        });
        // Phis precede every non-phi value in their block.
        let insts = &mut func.blocks[block.index()].insts;
        let at = insts
            .iter()
            .position(|&v| !matches!(func.vals[v.index()].op, Op::Phi(_)))
            .unwrap_or(insts.len());
        insts.insert(at, id);
        id
    }
}
