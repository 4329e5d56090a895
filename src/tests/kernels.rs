//! End-to-end kernel execution on the host backend.

use crate::standard::Buffer;

use super::{cas_module, conv2d_module, host_accel, host_context, shuffle_module, vector_add_module};
use crate::Kernel;

#[test]
fn vector_add_end_to_end() {
    let context = host_context();
    let accel = host_accel(&context);
    let module = vector_add_module();
    let artifact = context.compile(&module, accel.caps()).unwrap();
    let kernel = Kernel::load(&artifact, "vadd", &accel).unwrap();

    let n = 1 << 12;
    let a_host: Vec<f32> = (0..n).map(|i| i as f32).collect();
    let b_host: Vec<f32> = (0..n).map(|i| (i * 2) as f32).collect();

    let a = Buffer::<f32>::builder().accelerator(&accel).len(n).build().unwrap();
    let b = Buffer::<f32>::builder().accelerator(&accel).len(n).build().unwrap();
    let c = Buffer::<f32>::builder()
        .accelerator(&accel)
        .len(n)
        .fill_val(0.0)
        .build()
        .unwrap();
    a.write(&a_host).enq().unwrap();
    b.write(&b_host).enq().unwrap();

    kernel
        .cmd()
        .grid(n as u32 / 64)
        .group(64)
        .arg(&a)
        .arg(&b)
        .arg(&c)
        .arg_scalar(n as u32)
        .enq()
        .unwrap()
        .wait_for()
        .unwrap();

    let mut out = vec![0.0f32; n];
    c.read(&mut out).enq().unwrap();
    for i in 0..n {
        assert_eq!(out[i], (i + i * 2) as f32, "element {}", i);
    }
}

// Exactly one thread wins the compare-and-swap; every other observes
// the winner's value.
#[test]
fn atomic_compare_and_swap() {
    let context = host_context();
    let accel = host_accel(&context);
    let module = cas_module();
    let artifact = context.compile(&module, accel.caps()).unwrap();
    let kernel = Kernel::load(&artifact, "cas", &accel).unwrap();

    let len = 1024usize;
    let a = Buffer::<u32>::builder()
        .accelerator(&accel)
        .len(1)
        .fill_val(0)
        .build()
        .unwrap();
    let b = Buffer::<u32>::builder()
        .accelerator(&accel)
        .len(len)
        .fill_val(0)
        .build()
        .unwrap();
    let c = Buffer::<u32>::builder()
        .accelerator(&accel)
        .len(len)
        .fill_val(1)
        .build()
        .unwrap();
    let d = Buffer::<u32>::builder()
        .accelerator(&accel)
        .len(len)
        .fill_val(7)
        .build()
        .unwrap();

    kernel
        .cmd()
        .grid(len as u32)
        .group(1)
        .arg(&a)
        .arg(&b)
        .arg(&c)
        .arg(&d)
        .enq()
        .unwrap()
        .wait_for()
        .unwrap();

    let mut winner = vec![0u32; 1];
    a.read(&mut winner).enq().unwrap();
    assert_eq!(winner[0], 1);

    let mut observed = vec![0u32; len];
    d.read(&mut observed).enq().unwrap();
    let zeros = observed.iter().filter(|&&v| v == 0).count();
    let ones = observed.iter().filter(|&&v| v == 1).count();
    assert_eq!(zeros, 1, "exactly one thread sees the initial value");
    assert_eq!(ones, len - 1);
}

// Every lane reads the last lane's value.
#[test]
fn warp_shuffle_to_last_lane() {
    let context = host_context();
    let accel = host_accel(&context);
    let warp = accel.caps().warp_size;
    let module = shuffle_module();
    let artifact = context.compile(&module, accel.caps()).unwrap();
    let kernel = Kernel::load(&artifact, "shfl", &accel).unwrap();

    let data = Buffer::<u32>::builder()
        .accelerator(&accel)
        .len(warp as usize)
        .fill_val(0)
        .build()
        .unwrap();

    kernel
        .cmd()
        .grid(warp)
        .group(warp)
        .arg(&data)
        .enq()
        .unwrap()
        .wait_for()
        .unwrap();

    let mut out = vec![0u32; warp as usize];
    data.read(&mut out).enq().unwrap();
    for (i, &v) in out.iter().enumerate() {
        assert_eq!(v, warp - 1, "lane {}", i);
    }
}

// (1,3,4,4) ones through a (1,3,3,3) ones filter: every output is 27.
#[test]
fn conv2d_direct() {
    let context = host_context();
    let accel = host_accel(&context);
    let module = conv2d_module();
    let artifact = context.compile(&module, accel.caps()).unwrap();
    let kernel = Kernel::load(&artifact, "conv2d", &accel).unwrap();

    let input = Buffer::<f32>::builder()
        .accelerator(&accel)
        .len(3 * 4 * 4)
        .fill_val(1.0)
        .build()
        .unwrap();
    let filter = Buffer::<f32>::builder()
        .accelerator(&accel)
        .len(3 * 3 * 3)
        .fill_val(1.0)
        .build()
        .unwrap();
    let output = Buffer::<f32>::builder()
        .accelerator(&accel)
        .len(4)
        .fill_val(0.0)
        .build()
        .unwrap();

    kernel
        .cmd()
        .grid(4)
        .group(1)
        .arg(&input)
        .arg(&filter)
        .arg(&output)
        .enq()
        .unwrap()
        .wait_for()
        .unwrap();

    let mut out = vec![0.0f32; 4];
    output.read(&mut out).enq().unwrap();
    assert_eq!(out, vec![27.0, 27.0, 27.0, 27.0]);
}
