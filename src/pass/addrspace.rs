//! Address-space inference.
//!
//! Propagates concrete address spaces forward from allocation sites
//! (allocas, shared-memory bases, entry-point buffer parameters) to every
//! pointer derived from them. Pointer values connected by offset, field,
//! select and phi edges form a class which refines together; a class
//! whose seeds disagree keeps `generic`, failed propagation is not an
//! error.

use crate::backend::{CompilationError, TargetCaps};
use crate::ir::{AddrSpace, Module, Op, ParamKind, ValueId};

use super::Pass;

pub struct AddrSpaceInfer;

impl Pass for AddrSpaceInfer {
    fn name(&self) -> &'static str {
        "addrspace"
    }

    fn run(&self, module: &mut Module, _caps: &TargetCaps) -> Result<bool, CompilationError> {
        let mut changed = false;
        let entry_info: Vec<_> = module
            .entry_points()
            .iter()
            .map(|e| (e.func, e.params.clone()))
            .collect();

        for func_id in module.func_ids().collect::<Vec<_>>() {
            let buffer_params: Option<&Vec<_>> = entry_info
                .iter()
                .find(|(f, _)| *f == func_id)
                .map(|(_, p)| p);

            // Union-find over the function's values; only pointer values
            // participate.
            let count = module.func(func_id).value_count();
            let mut parent: Vec<u32> = (0..count as u32).collect();
            fn find(parent: &mut [u32], v: u32) -> u32 {
                let mut root = v;
                while parent[root as usize] != root {
                    root = parent[root as usize];
                }
                let mut cur = v;
                while parent[cur as usize] != root {
                    let next = parent[cur as usize];
                    parent[cur as usize] = root;
                    cur = next;
                }
                root
            }
            let union = |parent: &mut Vec<u32>, a: ValueId, b: ValueId| {
                let (ra, rb) = (find(parent, a.0), find(parent, b.0));
                if ra != rb {
                    parent[ra as usize] = rb;
                }
            };

            {
                let func = module.func(func_id);
                for b in func.block_ids() {
                    for &id in &func.blocks[b.index()].insts {
                        let val = func.value(id);
                        if module.types.pointer_space(val.ty).is_none() {
                            continue;
                        }
                        match val.op {
                            Op::PtrOffset | Op::FieldPtr(_) => {
                                union(&mut parent, id, val.operands[0]);
                            }
                            Op::Select => {
                                union(&mut parent, id, val.operands[1]);
                                union(&mut parent, id, val.operands[2]);
                            }
                            Op::Phi(_) => {
                                for &opnd in &val.operands {
                                    union(&mut parent, id, opnd);
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }

            // Join the seeds per class: a unique concrete space wins,
            // disagreement latches `None` (stay generic).
            let mut seed: Vec<Option<Option<AddrSpace>>> = vec![None; count];
            {
                let func = module.func(func_id);
                for b in func.block_ids() {
                    for &id in &func.blocks[b.index()].insts {
                        let val = func.value(id);
                        let mut space = module.types.pointer_space(val.ty);
                        if let (Op::Param(i), Some(params)) = (&val.op, buffer_params) {
                            if matches!(
                                params.get(*i as usize).map(|p| p.kind),
                                Some(ParamKind::Buffer(_))
                            ) {
                                space = Some(AddrSpace::Global);
                            }
                        }
                        // Pointers escaping into a remaining call keep
                        // their declared space; the callee's signature
                        // fixes it.
                        if let Op::Call(_) = val.op {
                            for &opnd in &val.operands {
                                if module
                                    .types
                                    .pointer_space(func.value(opnd).ty)
                                    .is_some()
                                {
                                    let root = find(&mut parent, opnd.0) as usize;
                                    seed[root] = Some(None);
                                }
                            }
                        }
                        let space = match space {
                            Some(s) if s.is_concrete() => s,
                            _ => continue,
                        };
                        let root = find(&mut parent, id.0) as usize;
                        seed[root] = match seed[root] {
                            None => Some(Some(space)),
                            Some(Some(prev)) if prev == space => Some(Some(space)),
                            _ => Some(None),
                        };
                    }
                }
            }

            // Rewrite every generic member of a decided class.
            let ids: Vec<ValueId> = {
                let func = module.func(func_id);
                func.block_ids()
                    .flat_map(|b| func.blocks[b.index()].insts.clone())
                    .collect()
            };
            for id in ids {
                let ty = module.func(func_id).value(id).ty;
                let space = match module.types.pointer_space(ty) {
                    Some(s) => s,
                    None => continue,
                };
                let root = find(&mut parent, id.0) as usize;
                let target = match seed[root] {
                    Some(Some(s)) => s,
                    _ => continue,
                };
                if space == AddrSpace::Generic && target.is_concrete() {
                    let new_ty = module.types.with_space(ty, target);
                    module.func_mut(func_id).value_mut(id).ty = new_ty;
                    if let Op::Param(i) = module.func(func_id).value(id).op {
                        module.func_mut(func_id).params[i as usize] = new_ty;
                    }
                    changed = true;
                }
            }
        }
        Ok(changed)
    }
}
