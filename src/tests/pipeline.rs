//! Transform-pipeline behavior: verification, folding, inlining,
//! address-space inference, DCE idempotence and loop analysis.

use crate::backend::{CompilationError, TargetCaps};
use crate::ir::verify::verify_module;
use crate::ir::{
    AddrSpace, Axis, BinOp, ModuleBuilder, Op, ParamLayout, ScalarKind, ValueData, ValueId,
};
use crate::pass::{self, Dce, Pass};

use super::{conv2d_module, vector_add_module};

// A use preceding its definition fails verification naming the value,
// and no backend ever runs.
#[test]
fn use_before_def_fails_verification() {
    let mut mb = ModuleBuilder::new("broken");
    let u32t = mb.types().scalar(ScalarKind::U32);
    let void = mb.types().void();
    let func = mb.declare_function("broken", vec![], void);
    {
        let mut fb = mb.function(func);
        // Reference a value id that is defined *after* this use by
        // assembling the instruction by hand.
        let later = ValueId((2) as u32);
        fb.push(u32t, Op::Bin(BinOp::Add), vec![later, later]);
        let _defined_late = fb.const_u32(1); // takes id 1
        let _other = fb.const_u32(2); // takes id 2
        fb.ret(None);
    }
    mb.add_entry_point(func, "broken", 1, vec![], 0);
    let module = mb.build();

    let err = verify_module(&module).unwrap_err();
    assert!(err.to_string().contains("v2"), "diagnostic: {}", err);

    match crate::backend::compile(&module, &TargetCaps::host()) {
        Err(crate::Error::Compilation(CompilationError::VerificationFailed {
            pass, ..
        })) => {
            assert_eq!(pass, "input");
        }
        other => panic!("expected verification failure, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn well_formed_fixtures_verify() {
    assert!(verify_module(&vector_add_module()).is_ok());
    assert!(verify_module(&conv2d_module()).is_ok());
    assert!(verify_module(&super::cas_module()).is_ok());
    assert!(verify_module(&super::shuffle_module()).is_ok());
}

// Running DCE twice produces a byte-identical module.
#[test]
fn dce_is_idempotent() {
    let caps = TargetCaps::host();
    // An unused computation gives the first run something to remove.
    let mut mb = ModuleBuilder::new("deadweight");
    let _u32t = mb.types().scalar(ScalarKind::U32);
    let void = mb.types().void();
    let func = mb.declare_function("deadweight", vec![], void);
    {
        let mut fb = mb.function(func);
        let a = fb.const_u32(4);
        let b = fb.const_u32(5);
        let dead = fb.bin(BinOp::Mul, a, b);
        let deader = fb.bin(BinOp::Add, dead, a);
        let _ = deader;
        fb.ret(None);
    }
    mb.add_entry_point(func, "deadweight", 1, vec![], 0);
    let module = mb.build();

    let mut once = module.clone();
    once.reopen();
    Dce.run(&mut once, &caps).unwrap();
    let first = once.encode_for_hash();

    Dce.run(&mut once, &caps).unwrap();
    let second = once.encode_for_hash();
    assert_eq!(first, second);

    // The dead chain is actually gone: only the ret remains.
    let func = once.func(crate::ir::FuncId(0));
    assert_eq!(func.blocks[0].insts.len(), 1);
}

#[test]
fn constant_folding_and_strength_reduction() {
    let caps = TargetCaps::host();
    let mut mb = ModuleBuilder::new("folds");
    let u32t = mb.types().scalar(ScalarKind::U32);
    let ptr = {
        let t = mb.types();
        t.pointer(u32t, AddrSpace::Global)
    };
    let void = mb.types().void();
    let func = mb.declare_function("folds", vec![ptr], void);
    {
        let mut fb = mb.function(func);
        let p = fb.param(0);
        let gid = fb.global_id(Axis::X);
        let three = fb.const_u32(3);
        let four = fb.const_u32(4);
        let twelve = fb.bin(BinOp::Mul, three, four); // folds to 12
        let scaled = fb.bin(BinOp::Mul, gid, four); // reduces to shl
        let sum = fb.bin(BinOp::Add, twelve, scaled);
        let slot = fb.ptr_offset(p, gid);
        fb.store(slot, sum);
        fb.ret(None);
    }
    mb.add_entry_point(func, "folds", 1, vec![ParamLayout::buffer(ScalarKind::U32)], 0);
    let mut module = mb.build();
    module.reopen();

    pass::run_pipeline(&mut module, &caps).unwrap();

    let func = module.func(crate::ir::FuncId(0));
    let ops: Vec<&Op> = func.blocks[0]
        .insts
        .iter()
        .map(|&id| &func.value(id).op)
        .collect();
    assert!(
        ops.iter()
            .any(|op| matches!(op, Op::Const(crate::ir::ConstVal::Uint(12)))),
        "3*4 folded: {:?}",
        ops
    );
    assert!(
        ops.iter().any(|op| matches!(op, Op::Bin(BinOp::Shl))),
        "gid*4 strength-reduced: {:?}",
        ops
    );
    assert!(
        !ops.iter().any(|op| matches!(op, Op::Bin(BinOp::Mul))),
        "no multiply survives: {:?}",
        ops
    );
}

// A small helper function disappears into its caller.
#[test]
fn small_callee_is_inlined() {
    let caps = TargetCaps::host();
    let mut mb = ModuleBuilder::new("inlining");
    let u32t = mb.types().scalar(ScalarKind::U32);
    let ptr = {
        let t = mb.types();
        t.pointer(u32t, AddrSpace::Global)
    };
    let void = mb.types().void();

    let double = mb.declare_function("double", vec![u32t], u32t);
    {
        let mut fb = mb.function(double);
        let x = fb.param(0);
        let two = fb.const_u32(2);
        let doubled = fb.bin(BinOp::Mul, x, two);
        fb.ret(Some(doubled));
    }

    let main = mb.declare_function("main", vec![ptr], void);
    {
        let mut fb = mb.function(main);
        let p = fb.param(0);
        let gid = fb.global_id(Axis::X);
        let doubled = fb.call(double, vec![gid]);
        let slot = fb.ptr_offset(p, gid);
        fb.store(slot, doubled);
        fb.ret(None);
    }
    mb.add_entry_point(main, "main", 1, vec![ParamLayout::buffer(ScalarKind::U32)], 0);
    let mut module = mb.build();
    module.reopen();

    pass::run_pipeline(&mut module, &caps).unwrap();

    let func = module.func(main);
    for b in func.block_ids() {
        for &id in &func.blocks[b.index()].insts {
            assert!(
                !matches!(func.value(id).op, Op::Call(_)),
                "call survived inlining"
            );
        }
    }
}

// Buffer parameters seed global; derived pointers follow.
#[test]
fn address_spaces_are_inferred() {
    let caps = TargetCaps::host();
    let mut mb = ModuleBuilder::new("spaces");
    let u32t = mb.types().scalar(ScalarKind::U32);
    // The frontend leaves the pointer generic.
    let generic_ptr = {
        let t = mb.types();
        t.pointer(u32t, AddrSpace::Generic)
    };
    let void = mb.types().void();
    let func = mb.declare_function("spaces", vec![generic_ptr], void);
    let (param, derived) = {
        let mut fb = mb.function(func);
        let p = fb.param(0);
        let gid = fb.global_id(Axis::X);
        let q = fb.ptr_offset(p, gid);
        fb.store(q, gid);
        fb.ret(None);
        (p, q)
    };
    mb.add_entry_point(
        func,
        "spaces",
        1,
        vec![ParamLayout::buffer(ScalarKind::U32)],
        0,
    );
    let mut module = mb.build();
    module.reopen();

    pass::run_pipeline(&mut module, &caps).unwrap();

    let func = module.func(crate::ir::FuncId(0));
    for v in [param, derived] {
        assert_eq!(
            module.types.pointer_space(func.value(v).ty),
            Some(AddrSpace::Global),
            "{} refined to global",
            v
        );
    }
}

// Induction variable and trip count of a canonical counted loop.
#[test]
fn loop_analysis_recognizes_trip_count() {
    let module = conv2d_module();
    let func = module.func(module.entry_points()[0].func);
    let info = pass::analyze_loops(func);
    assert_eq!(info.loops.len(), 1);
    let l = &info.loops[0];
    let iv = l.iv.as_ref().expect("induction variable recognized");
    assert_eq!(iv.step, 1);
    assert_eq!(iv.trip_count, Some(27));
}

// A block left without its terminator is caught by the verifier, which
// runs after every pass.
#[test]
fn verifier_reports_missing_terminator() {
    struct Clobber;
    impl Pass for Clobber {
        fn name(&self) -> &'static str {
            "clobber"
        }
        fn run(
            &self,
            module: &mut crate::ir::Module,
            _caps: &TargetCaps,
        ) -> Result<bool, CompilationError> {
            // Damage the module: drop the terminator of block 0.
            let func = module.func_mut(crate::ir::FuncId(0));
            func.blocks[0].insts.pop();
            Ok(true)
        }
    }

    let mut module = vector_add_module();
    module.reopen();
    let caps = TargetCaps::host();
    Clobber.run(&mut module, &caps).unwrap();
    let err = verify_module(&module).unwrap_err();
    assert!(
        err.to_string().contains("terminator") || err.to_string().contains("lacks"),
        "diagnostic: {}",
        err
    );
}

/// The dead weight above exercises values; make sure the arena ids in
/// hand-assembled IR stay within range for the verifier.
#[test]
fn operand_range_is_checked() {
    let mut mb = ModuleBuilder::new("oob");
    let u32t = mb.types().scalar(ScalarKind::U32);
    let void = mb.types().void();
    let func = mb.declare_function("oob", vec![], void);
    {
        let mut fb = mb.function(func);
        fb.push(u32t, Op::Bin(BinOp::Add), vec![ValueId(90), ValueId(91)]);
        fb.ret(None);
    }
    mb.add_entry_point(func, "oob", 1, vec![], 0);
    let module = mb.build();
    assert!(verify_module(&module).is_err());
}

// Keep `ValueData` externally constructible for frontends that build IR
// without the builder.
#[test]
fn value_data_is_open() {
    let _ = ValueData {
        ty: crate::ir::TypeId(0),
        op: Op::Ret,
        operands: vec![],
        dbg: None,
    };
}
