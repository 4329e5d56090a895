//! Loop canonicalization.
//!
//! Finds natural loops via dominator back edges, recognizes simple
//! induction variables (a header phi stepped by a constant along the
//! latch), derives trip counts where init, step and bound are constant,
//! and canonicalizes `!=`-style exit tests into `<` when the variable
//! provably steps through the bound.

use crate::backend::{CompilationError, TargetCaps};
use crate::ir::verify::{block_dominates, compute_idom};
use crate::ir::{BinOp, BlockId, CmpOp, ConstVal, Function, Module, Op, ValueId};

use super::Pass;

/// A recognized induction variable.
#[derive(Debug, Clone)]
pub struct IndVar {
    pub phi: ValueId,
    pub init: ValueId,
    pub step: i64,
    /// Iteration count, when init and bound are constant.
    pub trip_count: Option<u64>,
}

/// One natural loop.
#[derive(Debug, Clone)]
pub struct LoopRecord {
    pub header: BlockId,
    pub latch: BlockId,
    pub blocks: Vec<BlockId>,
    pub iv: Option<IndVar>,
}

/// Loop structure of one function.
#[derive(Debug, Clone, Default)]
pub struct LoopInfo {
    pub loops: Vec<LoopRecord>,
}

pub struct LoopCanon;

impl Pass for LoopCanon {
    fn name(&self) -> &'static str {
        "loops"
    }

    fn run(&self, module: &mut Module, _caps: &TargetCaps) -> Result<bool, CompilationError> {
        let mut changed = false;
        for func_id in module.func_ids().collect::<Vec<_>>() {
            let info = analyze(module.func(func_id));
            for l in &info.loops {
                log::trace!(
                    "loop in '{}' at {}: iv {:?}",
                    module.func(func_id).name,
                    l.header,
                    l.iv.as_ref().map(|iv| (iv.phi, iv.step, iv.trip_count)),
                );
            }
            changed |= canonicalize_exits(module.func_mut(func_id), &info);
        }
        Ok(changed)
    }
}

/// Computes the loop structure of `func`.
pub fn analyze(func: &Function) -> LoopInfo {
    let preds = func.predecessors();
    let idom = compute_idom(func, &preds);

    let mut info = LoopInfo::default();
    for latch in func.block_ids() {
        for header in func.successors(latch) {
            // A back edge targets a dominator of its source.
            if !block_dominates(&idom, header, latch) {
                continue;
            }
            let blocks = loop_body(&preds, header, latch);
            let iv = recognize_iv(func, &preds, header, latch);
            info.loops.push(LoopRecord {
                header,
                latch,
                blocks,
                iv,
            });
        }
    }
    info
}

/// The classic backwards walk from the latch up to the header.
fn loop_body(preds: &[Vec<BlockId>], header: BlockId, latch: BlockId) -> Vec<BlockId> {
    let mut body = vec![header];
    let mut stack = vec![latch];
    while let Some(b) = stack.pop() {
        if body.contains(&b) {
            continue;
        }
        body.push(b);
        for &p in &preds[b.index()] {
            stack.push(p);
        }
    }
    body.sort();
    body
}

fn const_of(func: &Function, id: ValueId) -> Option<ConstVal> {
    match func.value(id).op {
        Op::Const(c) => Some(c),
        _ => None,
    }
}

fn recognize_iv(
    func: &Function,
    preds: &[Vec<BlockId>],
    header: BlockId,
    latch: BlockId,
) -> Option<IndVar> {
    if preds[header.index()].len() != 2 {
        return None;
    }

    for &id in &func.blocks[header.index()].insts {
        let val = func.value(id);
        let incoming = match val.op {
            Op::Phi(ref blocks) => blocks,
            _ => break,
        };
        let mut init = None;
        let mut next = None;
        for (&block, &opnd) in incoming.iter().zip(val.operands.iter()) {
            if block == latch {
                next = Some(opnd);
            } else {
                init = Some(opnd);
            }
        }
        let (init, next) = match (init, next) {
            (Some(i), Some(n)) => (i, n),
            _ => continue,
        };

        // next = phi + c  (either operand order).
        let next_val = func.value(next);
        let step = match next_val.op {
            Op::Bin(BinOp::Add) => {
                let (a, b) = (next_val.operands[0], next_val.operands[1]);
                if a == id {
                    const_of(func, b)
                } else if b == id {
                    const_of(func, a)
                } else {
                    None
                }
            }
            Op::Bin(BinOp::Sub) if next_val.operands[0] == id => {
                const_of(func, next_val.operands[1]).map(negate)
            }
            _ => None,
        };
        let step = match step {
            Some(ConstVal::Int(s)) => s,
            Some(ConstVal::Uint(s)) => s as i64,
            _ => continue,
        };
        if step == 0 {
            continue;
        }

        let trip_count = trip_count(func, header, id, init, step);
        return Some(IndVar {
            phi: id,
            init,
            step,
            trip_count,
        });
    }
    None
}

fn negate(c: ConstVal) -> ConstVal {
    match c {
        ConstVal::Int(v) => ConstVal::Int(-v),
        ConstVal::Uint(v) => ConstVal::Int(-(v as i64)),
        other => other,
    }
}

/// Trip count of `for (i = init; i <cmp> bound; i += step)` when both
/// ends are constant.
fn trip_count(
    func: &Function,
    header: BlockId,
    phi: ValueId,
    init: ValueId,
    step: i64,
) -> Option<u64> {
    let term = func.terminator(header)?;
    let cond = match func.value(term).op {
        Op::CondBr(..) => func.value(term).operands[0],
        _ => return None,
    };
    let cond_val = func.value(cond);
    let (op, bound) = match cond_val.op {
        Op::Cmp(op) if cond_val.operands[0] == phi => (op, cond_val.operands[1]),
        _ => return None,
    };
    let init = const_int(const_of(func, init)?)?;
    let bound = const_int(const_of(func, bound)?)?;

    match (op, step > 0) {
        (CmpOp::Lt, true) if bound > init => {
            Some(((bound - init) as u64).div_ceil(step as u64))
        }
        (CmpOp::Le, true) if bound >= init => {
            Some(((bound - init + 1) as u64).div_ceil(step as u64))
        }
        (CmpOp::Ne, true) if bound >= init && (bound - init) % step == 0 => {
            Some(((bound - init) / step) as u64)
        }
        (CmpOp::Gt, false) if bound < init => {
            Some(((init - bound) as u64).div_ceil((-step) as u64))
        }
        _ => None,
    }
}

fn const_int(c: ConstVal) -> Option<i64> {
    match c {
        ConstVal::Int(v) => Some(v),
        ConstVal::Uint(v) => Some(v as i64),
        _ => None,
    }
}

/// Rewrites `i != bound` exit tests to `i < bound` for unit-step
/// variables starting at or below the bound, giving backends the
/// canonical form. Only a condition with a single (branch) use is
/// rewritten.
fn canonicalize_exits(func: &mut Function, info: &LoopInfo) -> bool {
    let mut changed = false;
    let uses = func.use_counts();
    for l in &info.loops {
        let iv = match l.iv {
            Some(ref iv) if iv.step == 1 => iv,
            _ => continue,
        };
        let term = match func.terminator(l.header) {
            Some(t) => t,
            None => continue,
        };
        let cond = match func.value(term).op {
            Op::CondBr(..) => func.value(term).operands[0],
            _ => continue,
        };
        if uses[cond.index()] != 1 {
            continue;
        }
        let cond_val = func.value(cond);
        let rewrite = match cond_val.op {
            Op::Cmp(CmpOp::Ne) if cond_val.operands[0] == iv.phi => {
                let init = const_of(func, iv.init).and_then(const_int);
                let bound = const_of(func, cond_val.operands[1]).and_then(const_int);
                matches!((init, bound), (Some(i), Some(b)) if i <= b)
            }
            _ => false,
        };
        if rewrite {
            func.value_mut(cond).op = Op::Cmp(CmpOp::Lt);
            changed = true;
        }
    }
    changed
}
