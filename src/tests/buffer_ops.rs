//! Buffer allocation, transfer round trips, views, pinning, lifetimes
//! and allocation-pressure recovery.

use std::sync::Arc;

use rand::Rng;

use crate::driver::{DeviceId, Driver, HostDriver};
use crate::error::Error;
use crate::standard::{Buffer, Context, MemLayout};

use super::{host_accel, host_context};

#[test]
fn round_trip_exact_u32() {
    let context = host_context();
    let accel = host_accel(&context);
    let mut rng = rand::thread_rng();
    let data: Vec<u32> = (0..4096).map(|_| rng.gen()).collect();

    let buf = Buffer::<u32>::builder()
        .accelerator(&accel)
        .len(data.len())
        .build()
        .unwrap();
    buf.write(&data).enq().unwrap();
    let mut out = vec![0u32; data.len()];
    buf.read(&mut out).enq().unwrap();
    assert_eq!(data, out);
}

// Bit-exactness must hold for every representable float pattern,
// including NaNs and denormals.
#[test]
fn round_trip_bit_exact_f32() {
    let context = host_context();
    let accel = host_accel(&context);
    let data: Vec<f32> = vec![
        0.0,
        -0.0,
        1.5,
        f32::INFINITY,
        f32::NEG_INFINITY,
        f32::NAN,
        f32::MIN_POSITIVE / 2.0, // denormal
        f32::MAX,
    ];

    let buf = Buffer::<f32>::builder()
        .accelerator(&accel)
        .len(data.len())
        .build()
        .unwrap();
    buf.write(&data).enq().unwrap();
    let mut out = vec![0.0f32; data.len()];
    buf.read(&mut out).enq().unwrap();
    for (a, b) in data.iter().zip(out.iter()) {
        assert_eq!(a.to_bits(), b.to_bits());
    }
}

#[test]
fn fill_and_offset_read() {
    let context = host_context();
    let accel = host_accel(&context);
    let buf = Buffer::<u32>::builder()
        .accelerator(&accel)
        .len(128)
        .fill_val(9)
        .build()
        .unwrap();
    let mut tail = vec![0u32; 64];
    buf.read(&mut tail).offset(64).enq().unwrap();
    assert!(tail.iter().all(|&v| v == 9));
}

#[test]
fn device_to_device_copy() {
    let context = host_context();
    let accel = host_accel(&context);
    let src = Buffer::<u64>::builder()
        .accelerator(&accel)
        .len(256)
        .build()
        .unwrap();
    let dst = Buffer::<u64>::builder()
        .accelerator(&accel)
        .len(256)
        .fill_val(0)
        .build()
        .unwrap();
    let data: Vec<u64> = (0..256u64).collect();
    src.write(&data).enq().unwrap();
    src.copy_to(&dst).enq().unwrap();
    let mut out = vec![0u64; 256];
    dst.read(&mut out).enq().unwrap();
    assert_eq!(data, out);
}

#[test]
fn strided_view_gather_scatter() {
    let context = host_context();
    let accel = host_accel(&context);
    let buf = Buffer::<u32>::builder()
        .accelerator(&accel)
        .len(16)
        .fill_val(0)
        .build()
        .unwrap();

    // Every fourth element.
    let view = buf.view_strided(1, 4, 4).unwrap();
    view.write_from(&[10, 11, 12, 13]).unwrap();
    let mut gathered = vec![0u32; 4];
    view.read_into(&mut gathered).unwrap();
    assert_eq!(gathered, vec![10, 11, 12, 13]);

    let mut all = vec![0u32; 16];
    buf.read(&mut all).enq().unwrap();
    assert_eq!(all[1], 10);
    assert_eq!(all[5], 11);
    assert_eq!(all[13], 13);
    assert_eq!(all[0], 0);
}

#[test]
fn view_bounds_are_checked() {
    let context = host_context();
    let accel = host_accel(&context);
    let buf = Buffer::<u32>::builder()
        .accelerator(&accel)
        .len(8)
        .build()
        .unwrap();
    assert!(buf.view(4, 8).is_err());
    assert!(buf.view_strided(0, 4, 3).is_err());
    assert!(buf.view(0, 8).is_ok());
}

#[test]
fn pinned_guard_zero_copy() {
    let context = host_context();
    let accel = host_accel(&context);
    let mut host = vec![0u32; 64];
    {
        let mut pinned = accel.pin_host(&mut host).unwrap();
        assert_eq!(accel.live_buffer_count(), 1);

        let buf = Buffer::<u32>::builder()
            .accelerator(&accel)
            .len(64)
            .fill_val(5)
            .build()
            .unwrap();
        pinned.download(&buf).unwrap();
        assert!(pinned.as_slice().iter().all(|&v| v == 5));

        pinned.as_mut_slice()[0] = 42;
        pinned.upload(&buf).unwrap();
        let mut out = vec![0u32; 64];
        buf.read(&mut out).enq().unwrap();
        assert_eq!(out[0], 42);
        buf.dispose().unwrap();
    }
    // Guard dropped before the owning storage; registry is clean again.
    assert_eq!(accel.live_buffer_count(), 0);
    assert_eq!(host[0], 42);
}

// Disposing an accelerator while buffers are live is a lifetime
// violation; after release it succeeds.
#[test]
fn accelerator_outlives_buffers() {
    let context = host_context();
    let accel = host_accel(&context);
    let buf = Buffer::<u32>::builder()
        .accelerator(&accel)
        .len(16)
        .build()
        .unwrap();

    match accel.dispose() {
        Err(Error::Memory(_)) => {}
        other => panic!("expected LifetimeViolation, got {:?}", other.err()),
    }

    buf.dispose().unwrap();
    accel.dispose().unwrap();
    assert!(Buffer::<u32>::builder()
        .accelerator(&accel)
        .len(16)
        .build()
        .is_err());
}

// Allocate to exhaustion, release one, and the next allocation of the
// same size succeeds.
#[test]
fn out_of_memory_recovery() {
    let driver = Arc::new(HostDriver::with_memory_budget(1024 * 1024));
    let context = Context::builder()
        .ignore_env()
        .driver(driver)
        .build()
        .unwrap();
    let accel = host_accel(&context);

    let chunk = 64 * 1024 / std::mem::size_of::<u32>(); // 64 KiB
    let mut held = Vec::new();
    let oom = loop {
        match Buffer::<u32>::builder().accelerator(&accel).len(chunk).build() {
            Ok(buf) => held.push(buf),
            Err(err) => break err,
        }
        assert!(held.len() <= 64, "budget never exhausted");
    };
    match oom {
        Error::Device(crate::DeviceError::OutOfMemory { .. }) => {}
        other => panic!("expected OutOfMemory, got {}", other),
    }

    held.pop().unwrap().dispose().unwrap();
    let again = Buffer::<u32>::builder().accelerator(&accel).len(chunk).build();
    assert!(again.is_ok(), "allocation after release failed");
}

#[test]
fn page_locked_layout_allocates() {
    let context = host_context();
    let accel = host_accel(&context);
    let buf = Buffer::<f32>::builder()
        .accelerator(&accel)
        .len(32)
        .layout(MemLayout::PageLocked)
        .fill_val(1.25)
        .build()
        .unwrap();
    assert_eq!(buf.layout(), MemLayout::PageLocked);
    let mut out = vec![0.0f32; 32];
    buf.read(&mut out).enq().unwrap();
    assert!(out.iter().all(|&v| v == 1.25));
}

#[test]
fn host_driver_reports_memory() {
    let driver = HostDriver::with_memory_budget(1 << 20);
    let devices = driver.enumerate();
    assert_eq!(devices.len(), 1);
    let info = driver.mem_info(DeviceId(0));
    assert_eq!(info.total, 1 << 20);
    assert_eq!(info.free, 1 << 20);
}
