//! Function inlining with a cost model.
//!
//! A call site is inlined when the callee is small (value count at or
//! under the threshold), when the callee has at most one non-trivial
//! block, or when the calling entry point is marked hot. Callee blocks
//! are spliced into the caller; the callee's single exit branches to a
//! continuation block holding the remainder of the call site's block.

use crate::backend::{CompilationError, TargetCaps};
use crate::ir::{Block, BlockId, FuncId, Module, Op, ValueData, ValueId};

use super::{replace_uses, Pass};

pub struct Inline {
    /// Callee value-count ceiling for unconditional inlining.
    pub threshold: usize,
    /// Upper bound on inlines per function per run, bounding growth on
    /// deep call chains.
    pub fuel: usize,
}

impl Default for Inline {
    fn default() -> Inline {
        Inline {
            threshold: 40,
            fuel: 16,
        }
    }
}

impl Pass for Inline {
    fn name(&self) -> &'static str {
        "inline"
    }

    fn run(&self, module: &mut Module, _caps: &TargetCaps) -> Result<bool, CompilationError> {
        let mut changed = false;
        let func_count = module.funcs().len();

        for caller_idx in 0..func_count {
            let caller_id = FuncId(caller_idx as u32);
            let caller_hot = module
                .entry_points()
                .iter()
                .any(|e| e.func == caller_id && e.attrs.hot);

            for _ in 0..self.fuel {
                let site = find_site(module, caller_id, caller_hot, self.threshold);
                let (block, pos, call, callee) = match site {
                    Some(s) => s,
                    None => break,
                };
                inline_call(module, caller_id, block, pos, call, callee);
                changed = true;
                log::trace!(
                    "inlined '{}' into '{}'",
                    module.func(callee).name,
                    module.func(caller_id).name
                );
            }
        }
        Ok(changed)
    }
}

/// Number of values a function actually holds in its blocks.
fn live_count(module: &Module, func: FuncId) -> usize {
    module
        .func(func)
        .blocks
        .iter()
        .map(|b| b.insts.len())
        .sum()
}

/// Blocks holding more than a bare terminator.
fn nontrivial_blocks(module: &Module, func: FuncId) -> usize {
    module
        .func(func)
        .blocks
        .iter()
        .filter(|b| b.insts.len() > 1)
        .count()
}

fn find_site(
    module: &Module,
    caller: FuncId,
    caller_hot: bool,
    threshold: usize,
) -> Option<(BlockId, usize, ValueId, FuncId)> {
    let func = module.func(caller);
    for b in func.block_ids() {
        for (pos, &id) in func.blocks[b.index()].insts.iter().enumerate() {
            if let Op::Call(callee) = func.value(id).op {
                if callee == caller {
                    continue;
                }
                let inline = live_count(module, callee) <= threshold
                    || nontrivial_blocks(module, callee) <= 1
                    || caller_hot;
                if inline {
                    return Some((b, pos, id, callee));
                }
            }
        }
    }
    None
}

fn inline_call(
    module: &mut Module,
    caller_id: FuncId,
    site_block: BlockId,
    site_pos: usize,
    call: ValueId,
    callee_id: FuncId,
) {
    let callee = module.func(callee_id).clone();
    let args = module.func(caller_id).value(call).operands.clone();
    let void_ty = module.types.void();
    let caller = module.func_mut(caller_id);

    let base_block = caller.blocks.len() as u32;
    let block_map = |b: BlockId| BlockId(base_block + b.0);
    let cont_block = BlockId(base_block + callee.blocks.len() as u32);

    // Phase 1: allocate caller ids for every callee value; parameters map
    // straight to the call arguments.
    let mut value_map: Vec<Option<ValueId>> = vec![None; callee.vals.len()];
    let mut ret_operand: Option<ValueId> = None;
    let mut new_blocks: Vec<Block> = Vec::with_capacity(callee.blocks.len() + 1);

    for cb in &callee.blocks {
        let mut insts = Vec::with_capacity(cb.insts.len());
        for &cv in &cb.insts {
            let val = callee.value(cv);
            match val.op {
                Op::Param(i) => {
                    value_map[cv.index()] = Some(args[i as usize]);
                }
                Op::Ret => {
                    // Remembered raw; remapped below once the map is
                    // complete.
                    ret_operand = val.operands.first().copied();
                }
                _ => {
                    let id = ValueId(caller.vals.len() as u32);
                    caller.vals.push(val.clone());
                    value_map[cv.index()] = Some(id);
                    insts.push(id);
                }
            }
        }
        new_blocks.push(Block { insts });
    }

    // Phase 2: remap operands and intra-callee control flow.
    for block in &new_blocks {
        for &id in &block.insts {
            let val = &mut caller.vals[id.index()];
            for opnd in val.operands.iter_mut() {
                *opnd = value_map[opnd.index()].expect("inline: unmapped operand");
            }
            match val.op {
                Op::Br(ref mut t) => *t = block_map(*t),
                Op::CondBr(ref mut t, ref mut f) => {
                    *t = block_map(*t);
                    *f = block_map(*f);
                }
                Op::Phi(ref mut blocks) => {
                    for b in blocks.iter_mut() {
                        *b = block_map(*b);
                    }
                }
                _ => {}
            }
        }
    }
    let ret_operand = ret_operand.map(|v| value_map[v.index()].expect("inline: unmapped ret"));

    // The callee's single exit now falls through to the continuation.
    for block in new_blocks.iter_mut() {
        let ends_open = block
            .insts
            .last()
            .map(|&id| !caller.vals[id.index()].op.is_terminator())
            .unwrap_or(true);
        if ends_open {
            let br = ValueId(caller.vals.len() as u32);
            caller.vals.push(ValueData {
                ty: void_ty,
                op: Op::Br(cont_block),
                operands: vec![],
                dbg: None,
            });
            block.insts.push(br);
        }
    }

    // Split the call site: head keeps the prefix and branches into the
    // callee; the continuation takes the rest (including the original
    // terminator).
    let rest: Vec<ValueId> = caller.blocks[site_block.index()]
        .insts
        .split_off(site_pos + 1);
    let removed_call = caller.blocks[site_block.index()].insts.pop();
    debug_assert_eq!(removed_call, Some(call));
    let entry_br = ValueId(caller.vals.len() as u32);
    caller.vals.push(ValueData {
        ty: void_ty,
        op: Op::Br(block_map(BlockId(0))),
        operands: vec![],
        dbg: None,
    });
    caller.blocks[site_block.index()].insts.push(entry_br);

    caller.blocks.extend(new_blocks);
    caller.blocks.push(Block { insts: rest });

    // Successor phis that named the split block now receive control from
    // the continuation.
    for b in 0..caller.blocks.len() {
        for i in 0..caller.blocks[b].insts.len() {
            let id = caller.blocks[b].insts[i];
            if let Op::Phi(ref mut blocks) = caller.vals[id.index()].op {
                for inc in blocks.iter_mut() {
                    if *inc == site_block {
                        *inc = cont_block;
                    }
                }
            }
        }
    }

    if let Some(result) = ret_operand {
        let _ = replace_uses(caller, call, result);
    }
}
