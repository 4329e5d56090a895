//! Dead-code elimination.
//!
//! Mark-and-sweep over each function: terminators and side-effecting
//! values are roots, liveness propagates through operands, everything
//! else is removed from its block. Iterates to fixpoint and is
//! idempotent, a second run removes nothing.

use crate::backend::{CompilationError, TargetCaps};
use crate::ir::Module;

use super::Pass;

pub struct Dce;

impl Pass for Dce {
    fn name(&self) -> &'static str {
        "dce"
    }

    fn run(&self, module: &mut Module, _caps: &TargetCaps) -> Result<bool, CompilationError> {
        let mut changed = false;
        for func_id in module.func_ids().collect::<Vec<_>>() {
            loop {
                let func = module.func_mut(func_id);
                let mut live = vec![false; func.value_count()];
                let mut worklist = Vec::new();

                for block in &func.blocks {
                    for &id in &block.insts {
                        if func.value(id).op.has_side_effect() {
                            live[id.index()] = true;
                            worklist.push(id);
                        }
                    }
                }
                while let Some(id) = worklist.pop() {
                    for &opnd in &func.value(id).operands {
                        if !live[opnd.index()] {
                            live[opnd.index()] = true;
                            worklist.push(opnd);
                        }
                    }
                }

                let mut removed = 0usize;
                for block in func.blocks.iter_mut() {
                    let before = block.insts.len();
                    block.insts.retain(|&id| live[id.index()]);
                    removed += before - block.insts.len();
                }
                if removed == 0 {
                    break;
                }
                changed = true;
            }
        }
        Ok(changed)
    }
}
