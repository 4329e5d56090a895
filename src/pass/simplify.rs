//! Control-flow simplification.
//!
//! Folds conditional branches whose arms coincide, merges linear block
//! chains, drops unreachable blocks and retires single-incoming phis.
//! Runs late, cleaning up the seams other passes leave behind.

use crate::backend::{CompilationError, TargetCaps};
use crate::ir::{Block, BlockId, Function, Module, Op, ValueId};

use super::{replace_uses, Pass};

pub struct CfgSimplify;

impl Pass for CfgSimplify {
    fn name(&self) -> &'static str {
        "simplify"
    }

    fn run(&self, module: &mut Module, _caps: &TargetCaps) -> Result<bool, CompilationError> {
        let mut changed = false;
        for func_id in module.func_ids().collect::<Vec<_>>() {
            let func = module.func_mut(func_id);
            loop {
                let mut round = false;
                round |= fold_trivial_branches(func);
                round |= merge_linear_chain(func);
                round |= drop_unreachable(func);
                round |= retire_single_incoming_phis(func);
                changed |= round;
                if !round {
                    break;
                }
            }
        }
        Ok(changed)
    }
}

/// `cond_br %c, b, b` carries no decision; rewrite to `br b` and drop
/// the duplicated phi edge in the target.
fn fold_trivial_branches(func: &mut Function) -> bool {
    let mut changed = false;
    for b in func.block_ids().collect::<Vec<_>>() {
        let term = match func.terminator(b) {
            Some(t) => t,
            None => continue,
        };
        let target = match func.value(term).op {
            Op::CondBr(t, f) if t == f => t,
            _ => continue,
        };
        {
            let val = func.value_mut(term);
            val.op = Op::Br(target);
            val.operands.clear();
        }
        dedup_phi_incoming(func, target, b);
        changed = true;
    }
    changed
}

/// Drops all but the first phi entry from `pred` in every phi of `block`.
fn dedup_phi_incoming(func: &mut Function, block: BlockId, pred: BlockId) {
    for i in 0..func.blocks[block.index()].insts.len() {
        let id = func.blocks[block.index()].insts[i];
        let val = func.value_mut(id);
        if let Op::Phi(ref mut blocks) = val.op {
            let mut seen = false;
            let mut keep = Vec::with_capacity(blocks.len());
            for &inc in blocks.iter() {
                if inc == pred {
                    keep.push(!seen);
                    seen = true;
                } else {
                    keep.push(true);
                }
            }
            let mut it = keep.iter();
            blocks.retain(|_| *it.next().unwrap());
            let mut it = keep.iter();
            val.operands.retain(|_| *it.next().unwrap());
        }
    }
}

/// Merges the first `A → B` chain found where `A` is `B`'s only
/// predecessor and `B` is `A`'s only successor.
fn merge_linear_chain(func: &mut Function) -> bool {
    let preds = func.predecessors();
    for a in func.block_ids().collect::<Vec<_>>() {
        let succs = func.successors(a);
        if succs.len() != 1 {
            continue;
        }
        let b = succs[0];
        if b == func.entry_block() || b == a || preds[b.index()].len() != 1 {
            continue;
        }

        // Phis in `b` have a single incoming value; alias them away
        // before splicing.
        let phis: Vec<ValueId> = func.blocks[b.index()]
            .insts
            .iter()
            .copied()
            .filter(|&id| matches!(func.value(id).op, Op::Phi(_)))
            .collect();
        for phi in phis {
            let operand = func.value(phi).operands[0];
            let _ = replace_uses(func, phi, operand);
        }

        let term = func.terminator(a).expect("merge: block without terminator");
        let body: Vec<ValueId> = func.blocks[b.index()]
            .insts
            .iter()
            .copied()
            .filter(|&id| !matches!(func.value(id).op, Op::Phi(_)))
            .collect();
        let a_insts = &mut func.blocks[a.index()].insts;
        a_insts.pop(); // a's terminator
        a_insts.extend(body);
        debug_assert!(func.value(term).op.is_terminator());
        func.blocks[b.index()].insts.clear();

        // Successor phis of `b` now receive control from `a`.
        for s in 0..func.blocks.len() {
            for i in 0..func.blocks[s].insts.len() {
                let id = func.blocks[s].insts[i];
                if let Op::Phi(ref mut blocks) = func.value_mut(id).op {
                    for inc in blocks.iter_mut() {
                        if *inc == b {
                            *inc = a;
                        }
                    }
                }
            }
        }
        return true;
    }
    false
}

/// Removes blocks unreachable from the entry, compacting ids.
fn drop_unreachable(func: &mut Function) -> bool {
    let rpo = func.rpo();
    if rpo.len() == func.blocks.len() {
        return false;
    }
    let mut reachable = vec![false; func.blocks.len()];
    for &b in &rpo {
        reachable[b.index()] = true;
    }

    let mut remap = vec![BlockId(u32::MAX); func.blocks.len()];
    let mut kept: Vec<Block> = Vec::with_capacity(rpo.len());
    for b in func.block_ids().collect::<Vec<_>>() {
        if reachable[b.index()] {
            remap[b.index()] = BlockId(kept.len() as u32);
            kept.push(std::mem::take(&mut func.blocks[b.index()]));
        }
    }
    func.blocks = kept;

    for block in 0..func.blocks.len() {
        for i in 0..func.blocks[block].insts.len() {
            let id = func.blocks[block].insts[i];
            let val = func.value_mut(id);
            match val.op {
                Op::Br(ref mut t) => *t = remap[t.index()],
                Op::CondBr(ref mut t, ref mut f) => {
                    *t = remap[t.index()];
                    *f = remap[f.index()];
                }
                Op::Phi(ref mut blocks) => {
                    // Entries arriving from removed blocks vanish with
                    // their edge.
                    let keep: Vec<bool> =
                        blocks.iter().map(|inc| reachable[inc.index()]).collect();
                    let mut it = keep.iter();
                    blocks.retain(|_| *it.next().unwrap());
                    for inc in blocks.iter_mut() {
                        *inc = remap[inc.index()];
                    }
                    let mut it = keep.iter();
                    val.operands.retain(|_| *it.next().unwrap());
                }
                _ => {}
            }
        }
    }
    true
}

/// A phi with one incoming edge is its operand.
fn retire_single_incoming_phis(func: &mut Function) -> bool {
    let mut changed = false;
    for b in func.block_ids().collect::<Vec<_>>() {
        let singles: Vec<ValueId> = func.blocks[b.index()]
            .insts
            .iter()
            .copied()
            .filter(|&id| {
                matches!(func.value(id).op, Op::Phi(ref blocks) if blocks.len() == 1)
            })
            .collect();
        for phi in singles {
            let operand = func.value(phi).operands[0];
            let _ = replace_uses(func, phi, operand);
            super::remove_inst(func, phi);
            changed = true;
        }
    }
    changed
}
