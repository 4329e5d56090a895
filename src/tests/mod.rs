//! Crate integration tests and shared kernel fixtures.

mod buffer_ops;
mod cache_behavior;
mod emit;
mod engine;
mod kernels;
mod launch;
mod pipeline;
mod scheduler;

use crate::ir::{
    Axis, BinOp, CmpOp, Module, ModuleBuilder, ParamLayout, ScalarKind, WarpOp,
};
use crate::standard::{Accelerator, Context};

pub(crate) fn host_context() -> Context {
    Context::builder()
        .ignore_env()
        .build()
        .expect("host context")
}

pub(crate) fn host_accel(context: &Context) -> Accelerator {
    context.accelerator_by_index(0).expect("host accelerator")
}

/// `c[i] = a[i] + b[i]` for `i < n`.
pub(crate) fn vector_add_module() -> Module {
    let mut mb = ModuleBuilder::new("vadd");
    let f32p = {
        let t = mb.types();
        let f32t = t.scalar(ScalarKind::F32);
        t.pointer(f32t, crate::ir::AddrSpace::Global)
    };
    let u32t = mb.types().scalar(ScalarKind::U32);
    let void = mb.types().void();

    let func = mb.declare_function("vadd", vec![f32p, f32p, f32p, u32t], void);
    {
        let mut fb = mb.function(func);
        let pa = fb.param(0);
        let pb = fb.param(1);
        let pc = fb.param(2);
        let pn = fb.param(3);
        let body = fb.new_block();
        let exit = fb.new_block();

        let gid = fb.global_id(Axis::X);
        let in_range = fb.cmp(CmpOp::Lt, gid, pn);
        fb.cond_br(in_range, body, exit);

        fb.switch_to(body);
        let ap = fb.ptr_offset(pa, gid);
        let av = fb.load(ap);
        let bp = fb.ptr_offset(pb, gid);
        let bv = fb.load(bp);
        let sum = fb.bin(BinOp::Add, av, bv);
        let cp = fb.ptr_offset(pc, gid);
        fb.store(cp, sum);
        fb.br(exit);

        fb.switch_to(exit);
        fb.ret(None);
    }
    mb.add_entry_point(
        func,
        "vadd",
        1,
        vec![
            ParamLayout::buffer(ScalarKind::F32),
            ParamLayout::buffer(ScalarKind::F32),
            ParamLayout::buffer(ScalarKind::F32),
            ParamLayout::scalar(ScalarKind::U32),
        ],
        0,
    );
    mb.build()
}

/// `d[i] = CAS(&a[0], b[i], c[i])`.
pub(crate) fn cas_module() -> Module {
    let mut mb = ModuleBuilder::new("cas");
    let u32p = {
        let t = mb.types();
        let u32t = t.scalar(ScalarKind::U32);
        t.pointer(u32t, crate::ir::AddrSpace::Global)
    };
    let void = mb.types().void();

    let func = mb.declare_function("cas", vec![u32p, u32p, u32p, u32p], void);
    {
        let mut fb = mb.function(func);
        let pa = fb.param(0);
        let pb = fb.param(1);
        let pc = fb.param(2);
        let pd = fb.param(3);
        let gid = fb.global_id(Axis::X);
        let bp = fb.ptr_offset(pb, gid);
        let expected = fb.load(bp);
        let cp = fb.ptr_offset(pc, gid);
        let replacement = fb.load(cp);
        let old = fb.atomic_cas(pa, expected, replacement);
        let dp = fb.ptr_offset(pd, gid);
        fb.store(dp, old);
        fb.ret(None);
    }
    mb.add_entry_point(
        func,
        "cas",
        1,
        vec![ParamLayout::buffer(ScalarKind::U32); 4],
        0,
    );
    mb.build()
}

/// `data[lane] = shuffle(lane_id, warp_size - 1)`.
pub(crate) fn shuffle_module() -> Module {
    let mut mb = ModuleBuilder::new("shfl");
    let u32p = {
        let t = mb.types();
        let u32t = t.scalar(ScalarKind::U32);
        t.pointer(u32t, crate::ir::AddrSpace::Global)
    };
    let void = mb.types().void();

    let func = mb.declare_function("shfl", vec![u32p], void);
    {
        let mut fb = mb.function(func);
        let data = fb.param(0);
        let lid = fb.lane_id();
        let w = fb.warp_size();
        let one = fb.const_u32(1);
        let last = fb.bin(BinOp::Sub, w, one);
        let shuffled = fb.warp(WarpOp::ShuffleIdx, lid, last);
        let slot = fb.ptr_offset(data, lid);
        fb.store(slot, shuffled);
        fb.ret(None);
    }
    mb.add_entry_point(
        func,
        "shfl",
        1,
        vec![ParamLayout::buffer(ScalarKind::U32)],
        0,
    );
    mb.build()
}

/// Direct 2-D convolution: input NCHW `(1,3,4,4)`, filter KCRS
/// `(1,3,3,3)`, stride 1, no padding, output `(1,1,2,2)`. One thread
/// per output element, reducing over a flattened `c*r*s` loop.
pub(crate) fn conv2d_module() -> Module {
    let mut mb = ModuleBuilder::new("conv2d");
    let f32p = {
        let t = mb.types();
        let f32t = t.scalar(ScalarKind::F32);
        t.pointer(f32t, crate::ir::AddrSpace::Global)
    };
    let f32t = mb.types().scalar(ScalarKind::F32);
    let u32t = mb.types().scalar(ScalarKind::U32);
    let void = mb.types().void();

    let func = mb.declare_function("conv2d", vec![f32p, f32p, f32p], void);
    {
        let mut fb = mb.function(func);
        let input = fb.param(0);
        let filter = fb.param(1);
        let output = fb.param(2);
        let header = fb.new_block();
        let body = fb.new_block();
        let exit = fb.new_block();
        let entry = fb.current_block();

        // oh = gid / 2, ow = gid % 2
        let gid = fb.global_id(Axis::X);
        let two = fb.const_u32(2);
        let oh = fb.bin(BinOp::Div, gid, two);
        let ow = fb.bin(BinOp::Rem, gid, two);
        let zero_u = fb.const_u32(0);
        let zero_f = fb.const_f32(0.0);
        let three = fb.const_u32(3);
        let four = fb.const_u32(4);
        let nine = fb.const_u32(9);
        let sixteen = fb.const_u32(16);
        let limit = fb.const_u32(27);
        let one = fb.const_u32(1);
        fb.br(header);

        // Reduction over j = c*9 + r*3 + s.
        fb.switch_to(header);
        let j = fb.phi_incomplete(u32t);
        let acc = fb.phi_incomplete(f32t);
        let more = fb.cmp(CmpOp::Lt, j, limit);
        fb.cond_br(more, body, exit);

        fb.switch_to(body);
        let c = fb.bin(BinOp::Div, j, nine);
        let rem9 = fb.bin(BinOp::Rem, j, nine);
        let r = fb.bin(BinOp::Div, rem9, three);
        let s = fb.bin(BinOp::Rem, rem9, three);
        // in_idx = c*16 + (oh + r)*4 + (ow + s)
        let c16 = fb.bin(BinOp::Mul, c, sixteen);
        let ohr = fb.bin(BinOp::Add, oh, r);
        let ohr4 = fb.bin(BinOp::Mul, ohr, four);
        let ows = fb.bin(BinOp::Add, ow, s);
        let in_row = fb.bin(BinOp::Add, c16, ohr4);
        let in_idx = fb.bin(BinOp::Add, in_row, ows);
        // f_idx = c*9 + r*3 + s  (= j, spelled out for clarity)
        let c9 = fb.bin(BinOp::Mul, c, nine);
        let r3 = fb.bin(BinOp::Mul, r, three);
        let f_row = fb.bin(BinOp::Add, c9, r3);
        let f_idx = fb.bin(BinOp::Add, f_row, s);

        let in_ptr = fb.ptr_offset(input, in_idx);
        let in_val = fb.load(in_ptr);
        let f_ptr = fb.ptr_offset(filter, f_idx);
        let f_val = fb.load(f_ptr);
        let prod = fb.bin(BinOp::Mul, in_val, f_val);
        let acc_next = fb.bin(BinOp::Add, acc, prod);
        let j_next = fb.bin(BinOp::Add, j, one);
        fb.br(header);

        fb.phi_add_incoming(j, entry, zero_u);
        fb.phi_add_incoming(j, body, j_next);
        fb.phi_add_incoming(acc, entry, zero_f);
        fb.phi_add_incoming(acc, body, acc_next);

        fb.switch_to(exit);
        let out_ptr = fb.ptr_offset(output, gid);
        fb.store(out_ptr, acc);
        fb.ret(None);
    }
    mb.add_entry_point(
        func,
        "conv2d",
        1,
        vec![ParamLayout::buffer(ScalarKind::F32); 3],
        0,
    );
    mb.build()
}
