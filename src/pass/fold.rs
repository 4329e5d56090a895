//! Constant folding and strength reduction.
//!
//! Folds operations whose operands are all constants, rewrites
//! multiplication/division/remainder by power-of-two constants into
//! shifts and masks, and removes algebraic identities. Division by a
//! constant zero is left in place for the target to define.

use crate::backend::{CompilationError, TargetCaps};
use crate::ir::{BinOp, CmpOp, ConstVal, Function, Module, Op, ScalarKind, ValueData, ValueId};

use super::{replace_uses, Pass};

pub struct ConstFold;

impl Pass for ConstFold {
    fn name(&self) -> &'static str {
        "fold"
    }

    fn run(&self, module: &mut Module, _caps: &TargetCaps) -> Result<bool, CompilationError> {
        let mut changed = false;
        let mut scratch = module.types.clone();
        for func_id in module.func_ids().collect::<Vec<_>>() {
            let func = module.func_mut(func_id);
            // Repeat until nothing folds; each round may expose new
            // constant operands.
            loop {
                let round = fold_function(func, &mut scratch);
                changed |= round;
                if !round {
                    break;
                }
            }
        }
        module.types = scratch;
        Ok(changed)
    }
}

fn const_of(func: &Function, id: ValueId) -> Option<ConstVal> {
    match func.value(id).op {
        Op::Const(c) => Some(c),
        _ => None,
    }
}

fn scalar_kind(
    types: &crate::ir::TypeTable,
    func: &Function,
    id: ValueId,
) -> Option<ScalarKind> {
    types.scalar_kind(func.value(id).ty)
}

/// One rewrite decided during the scan, applied afterwards so the scan
/// never aliases a live borrow.
enum Action {
    /// Replace the op of a value with a constant.
    Fold(ValueId, ConstVal),
    /// Alias a value to one of its operands.
    Alias(ValueId, ValueId),
    /// Strength-reduce: new opcode plus a fresh shift/mask constant.
    Reduce(ValueId, BinOp, ValueId, ConstVal, ScalarKind),
}

fn fold_function(func: &mut Function, types: &mut crate::ir::TypeTable) -> bool {
    let mut changed = false;

    let mut actions: Vec<Action> = Vec::new();

    for b in 0..func.blocks.len() {
        for &id in &func.blocks[b].insts {
            let val = func.value(id);
            match val.op {
                Op::Bin(op) => {
                    let (a, bb) = (val.operands[0], val.operands[1]);
                    let kind = match scalar_kind(types, func, id) {
                        Some(k) => k,
                        None => continue,
                    };
                    match (const_of(func, a), const_of(func, bb)) {
                        (Some(ca), Some(cb)) => {
                            if let Some(folded) = eval_bin(kind, op, ca, cb) {
                                actions.push(Action::Fold(id, folded));
                            }
                        }
                        (_, Some(cb)) => {
                            if let Some(action) = reduce_rhs(id, op, a, cb, kind) {
                                actions.push(action);
                            }
                        }
                        (Some(ca), _) => {
                            // Commutative identities with the constant on
                            // the left.
                            if matches!(op, BinOp::Add | BinOp::Mul | BinOp::Or | BinOp::Xor) {
                                if let Some(action) = reduce_rhs(id, op, bb, ca, kind) {
                                    actions.push(action);
                                }
                            }
                        }
                        _ => {}
                    }
                }
                Op::Cmp(op) => {
                    let (a, bb) = (val.operands[0], val.operands[1]);
                    let kind = match scalar_kind(types, func, a) {
                        Some(k) => k,
                        None => continue,
                    };
                    if let (Some(ca), Some(cb)) = (const_of(func, a), const_of(func, bb)) {
                        if let Some(folded) = eval_cmp(kind, op, ca, cb) {
                            actions.push(Action::Fold(id, ConstVal::Bool(folded)));
                        }
                    }
                }
                Op::Select => {
                    if let Some(ConstVal::Bool(c)) = const_of(func, val.operands[0]) {
                        let pick = if c { val.operands[1] } else { val.operands[2] };
                        actions.push(Action::Alias(id, pick));
                    }
                }
                Op::Cast => {
                    let src = val.operands[0];
                    let from = match scalar_kind(types, func, src) {
                        Some(k) => k,
                        None => continue,
                    };
                    let to = match scalar_kind(types, func, id) {
                        Some(k) => k,
                        None => continue,
                    };
                    if let Some(c) = const_of(func, src) {
                        if let Some(folded) = eval_cast(from, to, c) {
                            actions.push(Action::Fold(id, folded));
                        }
                    }
                }
                _ => {}
            }
        }
    }

    for action in actions {
        match action {
            Action::Fold(id, c) => {
                let val = func.value_mut(id);
                val.op = Op::Const(c);
                val.operands.clear();
                changed = true;
            }
            Action::Alias(id, to) => {
                changed |= replace_uses(func, id, to);
            }
            Action::Reduce(id, op, lhs, amount, kind) => {
                // The fresh constant goes to the head of the entry block,
                // which dominates every use.
                let ty = types.scalar(kind);
                let cid = ValueId(func.vals.len() as u32);
                func.vals.push(ValueData {
                    ty,
                    op: Op::Const(amount),
                    operands: vec![],
                    dbg: None,
                });
                func.blocks[0].insts.insert(0, cid);
                let val = func.value_mut(id);
                val.op = Op::Bin(op);
                val.operands = vec![lhs, cid];
                changed = true;
            }
        }
    }
    changed
}

/// Identity and power-of-two reductions for `x <op> c`.
fn reduce_rhs(
    id: ValueId,
    op: BinOp,
    x: ValueId,
    c: ConstVal,
    kind: ScalarKind,
) -> Option<Action> {
    let bits = c.bits();
    let is_int = kind.is_int();
    match op {
        BinOp::Add | BinOp::Sub | BinOp::Or | BinOp::Xor if is_int && bits == 0 => {
            Some(Action::Alias(id, x))
        }
        BinOp::Shl | BinOp::Shr if is_int && bits == 0 => Some(Action::Alias(id, x)),
        BinOp::Mul if is_int && bits == 1 => Some(Action::Alias(id, x)),
        BinOp::Div if is_int && bits == 1 => Some(Action::Alias(id, x)),
        BinOp::Mul if is_int && bits == 0 => Some(Action::Fold(id, zero_of(kind))),
        BinOp::And if is_int && bits == 0 => Some(Action::Fold(id, zero_of(kind))),
        BinOp::Mul if is_int && bits.is_power_of_two() => Some(Action::Reduce(
            id,
            BinOp::Shl,
            x,
            ConstVal::Uint(bits.trailing_zeros() as u64),
            kind,
        )),
        // Shift/mask reductions are only value-preserving for unsigned
        // division and remainder.
        BinOp::Div if is_int && !kind.is_signed() && bits.is_power_of_two() => {
            Some(Action::Reduce(
                id,
                BinOp::Shr,
                x,
                ConstVal::Uint(bits.trailing_zeros() as u64),
                kind,
            ))
        }
        BinOp::Rem if is_int && !kind.is_signed() && bits.is_power_of_two() => {
            Some(Action::Reduce(
                id,
                BinOp::And,
                x,
                ConstVal::Uint(bits - 1),
                kind,
            ))
        }
        _ => None,
    }
}

fn zero_of(kind: ScalarKind) -> ConstVal {
    if kind.is_float() {
        ConstVal::Float(0.0)
    } else {
        ConstVal::Uint(0)
    }
}

fn mask(kind: ScalarKind) -> u64 {
    match kind.size() {
        1 => 0xff,
        2 => 0xffff,
        4 => 0xffff_ffff,
        _ => u64::MAX,
    }
}

fn sext(kind: ScalarKind, bits: u64) -> i64 {
    let width = kind.size() as u32 * 8;
    let shift = 64 - width;
    ((bits << shift) as i64) >> shift
}

fn to_f64(kind: ScalarKind, c: ConstVal) -> f64 {
    match c {
        ConstVal::Float(v) => v,
        ConstVal::Int(v) => v as f64,
        ConstVal::Uint(v) => v as f64,
        ConstVal::Bool(v) => v as u64 as f64,
    }
    .pipe_round(kind)
}

trait PipeRound {
    fn pipe_round(self, kind: ScalarKind) -> f64;
}

impl PipeRound for f64 {
    /// Rounds through the storage precision so folded results match what
    /// the device would compute.
    fn pipe_round(self, kind: ScalarKind) -> f64 {
        match kind {
            ScalarKind::F32 => self as f32 as f64,
            ScalarKind::F16 => half::f16::from_f64(self).to_f64(),
            ScalarKind::BF16 => half::bf16::from_f64(self).to_f64(),
            _ => self,
        }
    }
}

/// Evaluates an integer or float binary op on constants. Returns `None`
/// for division by zero and for kinds the folder does not model.
fn eval_bin(kind: ScalarKind, op: BinOp, a: ConstVal, b: ConstVal) -> Option<ConstVal> {
    if kind.is_float() {
        let (x, y) = (to_f64(kind, a), to_f64(kind, b));
        let v = match op {
            BinOp::Add => x + y,
            BinOp::Sub => x - y,
            BinOp::Mul => x * y,
            BinOp::Div => x / y,
            BinOp::Rem => x % y,
            BinOp::Min => x.min(y),
            BinOp::Max => x.max(y),
            _ => return None,
        };
        return Some(ConstVal::Float(v.pipe_round(kind)));
    }
    if !kind.is_int() {
        return None;
    }

    let m = mask(kind);
    let (ua, ub) = (a.bits() & m, b.bits() & m);
    if matches!(op, BinOp::Div | BinOp::Rem) && ub == 0 {
        return None;
    }
    let value = if kind.is_signed() {
        let (sa, sb) = (sext(kind, ua), sext(kind, ub));
        let v = match op {
            BinOp::Add => sa.wrapping_add(sb),
            BinOp::Sub => sa.wrapping_sub(sb),
            BinOp::Mul => sa.wrapping_mul(sb),
            BinOp::Div => sa.wrapping_div(sb),
            BinOp::Rem => sa.wrapping_rem(sb),
            BinOp::And => sa & sb,
            BinOp::Or => sa | sb,
            BinOp::Xor => sa ^ sb,
            BinOp::Shl => sa.wrapping_shl(ub as u32),
            BinOp::Shr => sa.wrapping_shr(ub as u32),
            BinOp::Min => sa.min(sb),
            BinOp::Max => sa.max(sb),
        };
        v as u64 & m
    } else {
        match op {
            BinOp::Add => ua.wrapping_add(ub) & m,
            BinOp::Sub => ua.wrapping_sub(ub) & m,
            BinOp::Mul => ua.wrapping_mul(ub) & m,
            BinOp::Div => ua / ub,
            BinOp::Rem => ua % ub,
            BinOp::And => ua & ub,
            BinOp::Or => ua | ub,
            BinOp::Xor => ua ^ ub,
            BinOp::Shl => ua.wrapping_shl(ub as u32) & m,
            BinOp::Shr => ua.wrapping_shr(ub as u32),
            BinOp::Min => ua.min(ub),
            BinOp::Max => ua.max(ub),
        }
    };
    Some(if kind.is_signed() {
        ConstVal::Int(sext(kind, value))
    } else {
        ConstVal::Uint(value)
    })
}

fn eval_cmp(kind: ScalarKind, op: CmpOp, a: ConstVal, b: ConstVal) -> Option<bool> {
    if kind.is_float() {
        let (x, y) = (to_f64(kind, a), to_f64(kind, b));
        return Some(match op {
            CmpOp::Eq => x == y,
            CmpOp::Ne => x != y,
            CmpOp::Lt => x < y,
            CmpOp::Le => x <= y,
            CmpOp::Gt => x > y,
            CmpOp::Ge => x >= y,
        });
    }
    let m = mask(kind);
    let (ua, ub) = (a.bits() & m, b.bits() & m);
    Some(if kind.is_signed() {
        let (x, y) = (sext(kind, ua), sext(kind, ub));
        match op {
            CmpOp::Eq => x == y,
            CmpOp::Ne => x != y,
            CmpOp::Lt => x < y,
            CmpOp::Le => x <= y,
            CmpOp::Gt => x > y,
            CmpOp::Ge => x >= y,
        }
    } else {
        match op {
            CmpOp::Eq => ua == ub,
            CmpOp::Ne => ua != ub,
            CmpOp::Lt => ua < ub,
            CmpOp::Le => ua <= ub,
            CmpOp::Gt => ua > ub,
            CmpOp::Ge => ua >= ub,
        }
    })
}

fn eval_cast(from: ScalarKind, to: ScalarKind, c: ConstVal) -> Option<ConstVal> {
    if to.is_float() {
        let v = if from.is_float() {
            to_f64(from, c)
        } else if from.is_signed() {
            sext(from, c.bits() & mask(from)) as f64
        } else {
            (c.bits() & mask(from)) as f64
        };
        return Some(ConstVal::Float(v.pipe_round(to)));
    }
    if !to.is_int() {
        return None;
    }
    let value = if from.is_float() {
        let v = to_f64(from, c);
        if to.is_signed() {
            v as i64 as u64
        } else {
            v as u64
        }
    } else if from.is_signed() {
        sext(from, c.bits() & mask(from)) as u64
    } else {
        c.bits() & mask(from)
    };
    let value = value & mask(to);
    Some(if to.is_signed() {
        ConstVal::Int(sext(to, value))
    } else {
        ConstVal::Uint(value)
    })
}
