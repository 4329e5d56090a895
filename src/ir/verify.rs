//! Module verification.
//!
//! Runs after module closure and after every transform pass. Checks type
//! consistency, per-opcode operand counts, terminator placement, phi
//! coherence and the dominance property (definition before use). A
//! failure names the offending function and value; the pipeline attaches
//! the active pass name before surfacing it.

use std::fmt;

use super::types::TypeKind;
use super::{BlockId, Function, Module, Op, ValueId};

/// A verification diagnostic naming the offending value.
#[derive(Debug, Clone)]
pub struct VerifyDiag {
    pub func: String,
    pub value: Option<ValueId>,
    pub detail: String,
}

impl fmt::Display for VerifyDiag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.value {
            Some(v) => write!(f, "fn '{}', {}: {}", self.func, v, self.detail),
            None => write!(f, "fn '{}': {}", self.func, self.detail),
        }
    }
}

/// Fixed operand count of `op`, or `None` when the count is variable
/// (calls, returns, phis).
pub fn operand_count(op: &Op) -> Option<usize> {
    match *op {
        Op::Param(_) | Op::Const(_) | Op::Alloca | Op::Intr(_) | Op::Br(_) => Some(0),
        Op::Cast | Op::Load | Op::FieldPtr(_) | Op::CondBr(..) => Some(1),
        Op::Bin(_) | Op::Cmp(_) | Op::Store | Op::PtrOffset | Op::AtomicRmw(_) => Some(2),
        Op::Select | Op::AtomicCas => Some(3),
        Op::TensorMma { .. } => Some(4),
        Op::Warp(w) => Some(match w {
            super::WarpOp::VoteAll | super::WarpOp::VoteAny | super::WarpOp::Ballot => 1,
            _ => 2,
        }),
        Op::Call(_) | Op::Ret | Op::Phi(_) => None,
    }
}

/// Verifies every function of `module`.
pub fn verify_module(module: &Module) -> Result<(), VerifyDiag> {
    for func in module.funcs() {
        verify_function(module, func)?;
    }
    Ok(())
}

fn diag(func: &Function, value: Option<ValueId>, detail: String) -> VerifyDiag {
    VerifyDiag {
        func: func.name.clone(),
        value,
        detail,
    }
}

fn verify_function(module: &Module, func: &Function) -> Result<(), VerifyDiag> {
    if func.blocks.is_empty() {
        return Err(diag(func, None, "function has no blocks".into()));
    }

    let preds = func.predecessors();
    if !preds[0].is_empty() {
        return Err(diag(func, None, "entry block has predecessors".into()));
    }

    let mut ret_count = 0usize;
    for b in func.block_ids() {
        verify_block(module, func, b, &preds[b.index()])?;
        if matches!(
            func.terminator(b).map(|t| &func.value(t).op),
            Some(&Op::Ret)
        ) {
            ret_count += 1;
        }
    }
    if ret_count != 1 {
        return Err(diag(
            func,
            None,
            format!("structured region must have a single exit, found {} rets", ret_count),
        ));
    }

    verify_dominance(func, &preds)?;
    Ok(())
}

fn verify_block(
    module: &Module,
    func: &Function,
    block: BlockId,
    preds: &[BlockId],
) -> Result<(), VerifyDiag> {
    let insts = &func.blocks[block.index()].insts;
    if insts.is_empty() {
        return Err(diag(func, None, format!("{} is empty", block)));
    }

    let mut seen_non_phi = false;
    for (pos, &id) in insts.iter().enumerate() {
        let val = func.value(id);

        // Terminator placement.
        if val.op.is_terminator() && pos + 1 != insts.len() {
            return Err(diag(func, Some(id), "terminator is not last in block".into()));
        }

        // Phi placement and incoming-edge coherence.
        if let Op::Phi(ref blocks) = val.op {
            if seen_non_phi {
                return Err(diag(func, Some(id), "phi after non-phi value".into()));
            }
            if blocks.len() != val.operands.len() {
                return Err(diag(
                    func,
                    Some(id),
                    "phi incoming-block count does not match operand count".into(),
                ));
            }
            let mut incoming = blocks.clone();
            incoming.sort();
            let mut expect = preds.to_vec();
            expect.sort();
            if incoming != expect {
                return Err(diag(
                    func,
                    Some(id),
                    "phi incoming blocks do not match predecessors".into(),
                ));
            }
        } else {
            seen_non_phi = true;
        }

        // Operand count.
        if let Some(expect) = operand_count(&val.op) {
            if val.operands.len() != expect {
                return Err(diag(
                    func,
                    Some(id),
                    format!(
                        "opcode {:?} expects {} operands, found {}",
                        val.op,
                        expect,
                        val.operands.len()
                    ),
                ));
            }
        }
        if matches!(val.op, Op::Ret) && val.operands.len() > 1 {
            return Err(diag(func, Some(id), "ret takes at most one operand".into()));
        }

        for &opnd in &val.operands {
            if opnd.index() >= func.value_count() {
                return Err(diag(func, Some(id), format!("operand {} out of range", opnd)));
            }
        }

        verify_types(module, func, id)?;
    }

    if !func.value(*insts.last().unwrap()).op.is_terminator() {
        return Err(diag(func, None, format!("{} lacks a terminator", block)));
    }
    Ok(())
}

fn verify_types(module: &Module, func: &Function, id: ValueId) -> Result<(), VerifyDiag> {
    let types = &module.types;
    let val = func.value(id);
    let opnd_ty = |i: usize| func.value(val.operands[i]).ty;

    match val.op {
        Op::Bin(_) => {
            if opnd_ty(0) != val.ty || opnd_ty(1) != val.ty {
                return Err(diag(func, Some(id), "binop operand/result type mismatch".into()));
            }
        }
        Op::Cmp(_) => {
            if opnd_ty(0) != opnd_ty(1) {
                return Err(diag(func, Some(id), "cmp operand types differ".into()));
            }
        }
        Op::Select => {
            if opnd_ty(1) != val.ty || opnd_ty(2) != val.ty {
                return Err(diag(func, Some(id), "select arm/result type mismatch".into()));
            }
        }
        Op::Load => match types.pointee(opnd_ty(0)) {
            Some(pointee) if pointee == val.ty => {}
            Some(_) => {
                return Err(diag(func, Some(id), "load result differs from pointee".into()))
            }
            None => return Err(diag(func, Some(id), "load from non-pointer".into())),
        },
        Op::Store => match types.pointee(opnd_ty(0)) {
            Some(pointee) if pointee == opnd_ty(1) => {}
            Some(_) => {
                return Err(diag(func, Some(id), "store value differs from pointee".into()))
            }
            None => return Err(diag(func, Some(id), "store to non-pointer".into())),
        },
        Op::PtrOffset => {
            if val.ty != opnd_ty(0) {
                return Err(diag(
                    func,
                    Some(id),
                    "ptr_offset changes pointer type or space".into(),
                ));
            }
            if types.pointer_space(val.ty).is_none() {
                return Err(diag(func, Some(id), "ptr_offset on non-pointer".into()));
            }
        }
        Op::FieldPtr(n) => {
            let (pointee, space) = match *types.kind(opnd_ty(0)) {
                TypeKind::Pointer { pointee, space } => (pointee, space),
                _ => return Err(diag(func, Some(id), "field_ptr on non-pointer".into())),
            };
            match *types.kind(pointee) {
                TypeKind::Struct { ref fields } => {
                    let field = match fields.get(n as usize) {
                        Some(&f) => f,
                        None => {
                            return Err(diag(func, Some(id), "field index out of range".into()))
                        }
                    };
                    match *types.kind(val.ty) {
                        TypeKind::Pointer {
                            pointee: rp,
                            space: rs,
                        } if rp == field && rs == space => {}
                        _ => {
                            return Err(diag(
                                func,
                                Some(id),
                                "field_ptr result type or space mismatch".into(),
                            ))
                        }
                    }
                }
                _ => return Err(diag(func, Some(id), "field_ptr pointee not a struct".into())),
            }
        }
        Op::AtomicRmw(_) => match types.pointee(opnd_ty(0)) {
            Some(p) if p == opnd_ty(1) && p == val.ty => {}
            _ => return Err(diag(func, Some(id), "atomic rmw type mismatch".into())),
        },
        Op::AtomicCas => match types.pointee(opnd_ty(0)) {
            Some(p) if p == opnd_ty(1) && p == opnd_ty(2) && p == val.ty => {}
            _ => return Err(diag(func, Some(id), "atomic cas type mismatch".into())),
        },
        Op::Call(callee) => {
            let callee = module.func(callee);
            if callee.params.len() != val.operands.len() {
                return Err(diag(func, Some(id), "call arity mismatch".into()));
            }
            for (i, &p) in callee.params.iter().enumerate() {
                if opnd_ty(i) != p {
                    return Err(diag(func, Some(id), format!("call arg {} type mismatch", i)));
                }
            }
            if callee.ret != val.ty {
                return Err(diag(func, Some(id), "call result type mismatch".into()));
            }
        }
        Op::Phi(_) => {
            for i in 0..val.operands.len() {
                if opnd_ty(i) != val.ty {
                    return Err(diag(func, Some(id), "phi operand type mismatch".into()));
                }
            }
        }
        Op::CondBr(t, f) => {
            if t.index() >= func.blocks.len() || f.index() >= func.blocks.len() {
                return Err(diag(func, Some(id), "branch target out of range".into()));
            }
        }
        Op::Br(t) => {
            if t.index() >= func.blocks.len() {
                return Err(diag(func, Some(id), "branch target out of range".into()));
            }
        }
        _ => {}
    }
    Ok(())
}

/// Iterative immediate-dominator computation over reverse postorder.
/// `idom[entry]` points at the entry itself; unreachable blocks stay
/// `None`.
pub(crate) fn compute_idom(func: &Function, preds: &[Vec<BlockId>]) -> Vec<Option<BlockId>> {
    let rpo = func.rpo();
    let mut rpo_index = vec![usize::MAX; func.blocks.len()];
    for (i, &b) in rpo.iter().enumerate() {
        rpo_index[b.index()] = i;
    }

    let mut idom: Vec<Option<BlockId>> = vec![None; func.blocks.len()];
    idom[0] = Some(BlockId(0));
    let mut changed = true;
    while changed {
        changed = false;
        for &b in rpo.iter().skip(1) {
            let mut new_idom: Option<BlockId> = None;
            for &p in &preds[b.index()] {
                if idom[p.index()].is_none() {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => p,
                    Some(cur) => intersect(&idom, &rpo_index, p, cur),
                });
            }
            if let Some(ni) = new_idom {
                if idom[b.index()] != Some(ni) {
                    idom[b.index()] = Some(ni);
                    changed = true;
                }
            }
        }
    }
    idom
}

/// Whether `a` dominates `b` given an idom tree.
pub(crate) fn block_dominates(idom: &[Option<BlockId>], a: BlockId, b: BlockId) -> bool {
    let mut cur = b;
    loop {
        if cur == a {
            return true;
        }
        match idom[cur.index()] {
            Some(next) if next != cur => cur = next,
            _ => return false,
        }
    }
}

/// Def-dominates-use check for every operand.
fn verify_dominance(func: &Function, preds: &[Vec<BlockId>]) -> Result<(), VerifyDiag> {
    let rpo = func.rpo();
    let mut rpo_index = vec![usize::MAX; func.blocks.len()];
    for (i, &b) in rpo.iter().enumerate() {
        rpo_index[b.index()] = i;
    }
    let idom = compute_idom(func, preds);

    let dominates = |a: BlockId, b: BlockId| -> bool {
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            match idom[cur.index()] {
                Some(next) if next != cur => cur = next,
                _ => return false,
            }
        }
    };

    // Map every value to its defining (block, position).
    let mut def_site = vec![None; func.value_count()];
    for b in func.block_ids() {
        for (pos, &id) in func.blocks[b.index()].insts.iter().enumerate() {
            def_site[id.index()] = Some((b, pos));
        }
    }

    for b in func.block_ids() {
        // Unreachable blocks are removed by simplification; skip them
        // here rather than reasoning about dominance within them.
        if rpo_index[b.index()] == usize::MAX {
            continue;
        }
        for (pos, &id) in func.blocks[b.index()].insts.iter().enumerate() {
            let val = func.value(id);
            if let Op::Phi(ref blocks) = val.op {
                // A phi operand must dominate the end of its incoming block.
                for (&opnd, &inc) in val.operands.iter().zip(blocks.iter()) {
                    let (db, _) = match def_site[opnd.index()] {
                        Some(site) => site,
                        None => {
                            return Err(diag(func, Some(id), format!("{} is not defined", opnd)))
                        }
                    };
                    if !dominates(db, inc) {
                        return Err(diag(
                            func,
                            Some(id),
                            format!("use of {} does not dominate incoming edge", opnd),
                        ));
                    }
                }
                continue;
            }
            for &opnd in &val.operands {
                let (db, dp) = match def_site[opnd.index()] {
                    Some(site) => site,
                    None => {
                        return Err(diag(func, Some(id), format!("{} is not defined", opnd)))
                    }
                };
                let ok = if db == b { dp < pos } else { dominates(db, b) };
                if !ok {
                    return Err(diag(
                        func,
                        Some(id),
                        format!("use of {} before its definition", opnd),
                    ));
                }
            }
        }
    }
    Ok(())
}

fn intersect(
    idom: &[Option<BlockId>],
    rpo_index: &[usize],
    mut a: BlockId,
    mut b: BlockId,
) -> BlockId {
    while a != b {
        while rpo_index[a.index()] > rpo_index[b.index()] {
            a = idom[a.index()].unwrap();
        }
        while rpo_index[b.index()] > rpo_index[a.index()] {
            b = idom[b.index()].unwrap();
        }
    }
    a
}
