//! The IR transform pipeline.
//!
//! Passes run in a fixed order over a private clone of the closed module;
//! each preserves semantic equivalence and the whole module is re-verified
//! after every pass. The first failure aborts the pipeline with the pass
//! name attached.

mod addrspace;
mod dce;
mod fold;
mod inline;
mod loops;
mod materialize;
mod simplify;
mod sroa;

pub use self::addrspace::AddrSpaceInfer;
pub use self::dce::Dce;
pub use self::fold::ConstFold;
pub use self::inline::Inline;
pub use self::loops::{analyze as analyze_loops, IndVar, LoopCanon, LoopInfo, LoopRecord};
pub use self::materialize::ParamMaterialize;
pub use self::simplify::CfgSimplify;
pub use self::sroa::ScalarReplace;

use crate::backend::{CompilationError, TargetCaps};
use crate::ir::verify::verify_module;
use crate::ir::{Function, Module, ValueId};

/// Identifier of the fixed pass ordering, mixed into every fingerprint so
/// a pipeline change invalidates cached artifacts.
pub const PIPELINE_ID: &str = "materialize.fold.inline.addrspace.sroa.dce.loops.simplify#1";

/// A single transform over a whole module.
///
/// `run` returns whether anything changed; passes never panic on
/// ill-formed IR, verification catches it first.
pub trait Pass {
    fn name(&self) -> &'static str;

    fn run(&self, module: &mut Module, caps: &TargetCaps) -> Result<bool, CompilationError>;
}

fn pipeline() -> Vec<Box<dyn Pass>> {
    vec![
        Box::new(ParamMaterialize),
        Box::new(ConstFold),
        Box::new(Inline::default()),
        Box::new(AddrSpaceInfer),
        Box::new(ScalarReplace),
        Box::new(Dce),
        Box::new(LoopCanon),
        Box::new(CfgSimplify),
    ]
}

/// Runs the full fixed-order pipeline over `module` for `caps`.
///
/// The module is verified before the first pass (rejecting ill-formed
/// frontend input without invoking any backend) and after every pass.
pub fn run_pipeline(module: &mut Module, caps: &TargetCaps) -> Result<(), CompilationError> {
    verify(module, "input")?;
    for pass in pipeline() {
        let changed = pass.run(module, caps)?;
        verify(module, pass.name())?;
        log::trace!(
            "pass '{}' on module '{}': {}",
            pass.name(),
            module.name,
            if changed { "changed" } else { "no change" }
        );
    }
    Ok(())
}

fn verify(module: &Module, pass: &str) -> Result<(), CompilationError> {
    verify_module(module).map_err(|d| CompilationError::VerificationFailed {
        pass: pass.to_owned(),
        detail: d.to_string(),
    })
}

/// Rewrites every use of `from` to `to` across `func`, returning whether
/// any use was rewritten.
///
/// Callers guarantee that `to`'s definition dominates every rewritten
/// use; the post-pass verification would catch a violation.
pub(crate) fn replace_uses(func: &mut Function, from: ValueId, to: ValueId) -> bool {
    let mut changed = false;
    for block in 0..func.blocks.len() {
        for i in 0..func.blocks[block].insts.len() {
            let id = func.blocks[block].insts[i];
            let val = func.value_mut(id);
            for opnd in val.operands.iter_mut() {
                if *opnd == from {
                    *opnd = to;
                    changed = true;
                }
            }
        }
    }
    changed
}

/// Removes `id` from its block's instruction list (the arena entry
/// remains as a tombstone; ids are never reused).
pub(crate) fn remove_inst(func: &mut Function, id: ValueId) {
    for block in func.blocks.iter_mut() {
        if let Some(pos) = block.insts.iter().position(|&v| v == id) {
            block.insts.remove(pos);
            return;
        }
    }
}
