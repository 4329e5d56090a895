//! Entry-point parameter materialization.
//!
//! Guarantees that every declared parameter of an entry-point function is
//! represented by exactly one `Param` value at the head of the entry
//! block. Later passes and the backends may then treat parameters like
//! any other value.

use crate::backend::{CompilationError, TargetCaps};
use crate::ir::{Module, Op, ValueData, ValueId};

use super::{replace_uses, Pass};

pub struct ParamMaterialize;

impl Pass for ParamMaterialize {
    fn name(&self) -> &'static str {
        "materialize"
    }

    fn run(&self, module: &mut Module, _caps: &TargetCaps) -> Result<bool, CompilationError> {
        let mut changed = false;
        let entry_funcs: Vec<_> = module.entry_points().iter().map(|e| e.func).collect();

        for func_id in entry_funcs {
            let func = module.func_mut(func_id);
            let param_count = func.params.len() as u32;

            // First value for each parameter index; duplicates alias it.
            let mut canonical: Vec<Option<ValueId>> = vec![None; param_count as usize];
            let mut duplicates: Vec<(ValueId, u32)> = Vec::new();
            for block in &func.blocks {
                for &id in &block.insts {
                    if let Op::Param(n) = func.value(id).op {
                        match canonical[n as usize] {
                            None => canonical[n as usize] = Some(id),
                            Some(_) => duplicates.push((id, n)),
                        }
                    }
                }
            }

            for (dup, n) in duplicates {
                let keep = canonical[n as usize].unwrap();
                let _ = replace_uses(func, dup, keep);
                super::remove_inst(func, dup);
                changed = true;
            }

            // Materialize missing parameters and hoist everything to the
            // head of the entry block, in declaration order.
            let mut head = Vec::with_capacity(param_count as usize);
            for n in 0..param_count {
                let id = match canonical[n as usize] {
                    Some(id) => id,
                    None => {
                        let ty = func.params[n as usize];
                        let id = ValueId(func.vals.len() as u32);
                        func.vals.push(ValueData {
                            ty,
                            op: Op::Param(n),
                            operands: vec![],
                            dbg: None,
                        });
                        changed = true;
                        id
                    }
                };
                head.push(id);
            }

            let entry = func.entry_block().index();
            let rest: Vec<ValueId> = func.blocks[entry]
                .insts
                .iter()
                .copied()
                .filter(|id| !head.contains(id))
                .collect();
            // Param values defined in non-entry blocks move to the entry.
            for block in func.blocks.iter_mut().skip(1) {
                block.insts.retain(|id| !head.contains(id));
            }
            let reordered: Vec<ValueId> = head.iter().copied().chain(rest).collect();
            if func.blocks[entry].insts != reordered {
                changed = true;
            }
            func.blocks[entry].insts = reordered;
        }
        Ok(changed)
    }
}
