//! Scalar replacement of aggregates.
//!
//! A stack-allocated struct whose address never escapes, every use of
//! the alloca is a field address, and every field address is only loaded
//! from or stored to, is split into one alloca per field. Dead-code
//! elimination then retires the original allocation.

use crate::backend::{CompilationError, TargetCaps};
use crate::ir::{Module, Op, TypeKind, ValueData, ValueId};

use super::{replace_uses, Pass};

pub struct ScalarReplace;

impl Pass for ScalarReplace {
    fn name(&self) -> &'static str {
        "sroa"
    }

    fn run(&self, module: &mut Module, _caps: &TargetCaps) -> Result<bool, CompilationError> {
        let mut changed = false;
        for func_id in module.func_ids().collect::<Vec<_>>() {
            changed |= split_in_function(module, func_id);
        }
        Ok(changed)
    }
}

fn split_in_function(module: &mut Module, func_id: crate::ir::FuncId) -> bool {
    // Users of every value, and each value's (block, pos) site.
    let (users, sites) = {
        let func = module.func(func_id);
        let mut users: Vec<Vec<ValueId>> = vec![Vec::new(); func.value_count()];
        let mut sites = vec![None; func.value_count()];
        for b in func.block_ids() {
            for (pos, &id) in func.blocks[b.index()].insts.iter().enumerate() {
                sites[id.index()] = Some((b, pos));
                for &opnd in &func.value(id).operands {
                    users[opnd.index()].push(id);
                }
            }
        }
        (users, sites)
    };

    // Candidate allocas: struct pointee, address never taken.
    let mut candidates: Vec<(ValueId, Vec<crate::ir::TypeId>)> = Vec::new();
    {
        let func = module.func(func_id);
        'values: for b in func.block_ids() {
            for &id in &func.blocks[b.index()].insts {
                if !matches!(func.value(id).op, Op::Alloca) {
                    continue;
                }
                let pointee = match module.types.pointee(func.value(id).ty) {
                    Some(p) => p,
                    None => continue,
                };
                let fields = match *module.types.kind(pointee) {
                    TypeKind::Struct { ref fields } => fields.clone(),
                    _ => continue,
                };
                for &user in &users[id.index()] {
                    match func.value(user).op {
                        Op::FieldPtr(_) => {
                            for &fuser in &users[user.index()] {
                                match func.value(fuser).op {
                                    Op::Load => {}
                                    // A store is fine only when the field
                                    // address is the destination, not the
                                    // stored value.
                                    Op::Store if func.value(fuser).operands[0] == user => {}
                                    _ => continue 'values,
                                }
                            }
                        }
                        _ => continue 'values,
                    }
                }
                candidates.push((id, fields));
            }
        }
    }

    let mut changed = false;
    for (alloca, fields) in candidates {
        let space = crate::ir::AddrSpace::Local;
        let (block, pos) = sites[alloca.index()].expect("sroa: alloca without a site");

        // One replacement alloca per field, placed right after the
        // original so dominance is preserved.
        let mut field_allocas = Vec::with_capacity(fields.len());
        for &field_ty in &fields {
            let ptr_ty = module.types.pointer(field_ty, space);
            let func = module.func_mut(func_id);
            let id = ValueId(func.vals.len() as u32);
            func.vals.push(ValueData {
                ty: ptr_ty,
                op: Op::Alloca,
                operands: vec![],
                dbg: None,
            });
            field_allocas.push(id);
        }
        {
            let func = module.func_mut(func_id);
            let insts = &mut func.blocks[block.index()].insts;
            let at = insts.iter().position(|&v| v == alloca).unwrap_or(pos);
            for (i, &fa) in field_allocas.iter().enumerate() {
                insts.insert(at + 1 + i, fa);
            }
        }

        // Alias every field address to its dedicated alloca.
        for &user in &users[alloca.index()] {
            let n = match module.func(func_id).value(user).op {
                Op::FieldPtr(n) => n as usize,
                _ => unreachable!("sroa candidate with non-field user"),
            };
            let func = module.func_mut(func_id);
            let _ = replace_uses(func, user, field_allocas[n]);
        }
        changed = true;
        log::trace!(
            "sroa: split {}-field struct alloca in '{}'",
            fields.len(),
            module.func(func_id).name
        );
    }
    changed
}
