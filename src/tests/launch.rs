//! Launch-bounds enforcement, argument checking, stream ordering and
//! accelerator status transitions.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::backend::TargetCaps;
use crate::standard::{AcceleratorStatus, Buffer, EventList, StreamState};
use crate::{Error, Kernel, LaunchError};

use super::{host_accel, host_context, vector_add_module};

fn loaded_vadd() -> (crate::Context, crate::Accelerator, Kernel) {
    let context = host_context();
    let accel = host_accel(&context);
    let artifact = context
        .compile(&vector_add_module(), accel.caps())
        .unwrap();
    let kernel = Kernel::load(&artifact, "vadd", &accel).unwrap();
    (context, accel, kernel)
}

// Any grid, group or shared-memory component beyond the device maxima
// fails with LaunchBounds and never dispatches.
#[test]
fn launch_bounds_are_enforced() {
    let (_context, accel, kernel) = loaded_vadd();
    let n = 64usize;
    let a = Buffer::<f32>::builder()
        .accelerator(&accel)
        .len(n)
        .fill_val(1.0)
        .build()
        .unwrap();
    let b = Buffer::<f32>::builder()
        .accelerator(&accel)
        .len(n)
        .fill_val(2.0)
        .build()
        .unwrap();
    let c = Buffer::<f32>::builder()
        .accelerator(&accel)
        .len(n)
        .fill_val(-1.0)
        .build()
        .unwrap();
    let caps = accel.caps().clone();

    let attempts: Vec<crate::SpatialDims> = vec![
        (1u32, caps.max_grid[1] + 1, 1u32).into(),
        (1u32, 1u32, caps.max_grid[2] + 1).into(),
    ];
    for grid in attempts {
        let err = kernel
            .cmd()
            .grid(grid)
            .group(1)
            .arg(&a)
            .arg(&b)
            .arg(&c)
            .arg_scalar(n as u32)
            .enq()
            .unwrap_err();
        assert!(
            matches!(err, Error::Launch(LaunchError::LaunchBounds { .. })),
            "grid {:?}: {}",
            grid,
            err
        );
    }

    let err = kernel
        .cmd()
        .grid(1)
        .group((caps.max_group[0] + 1, 1u32, 1u32))
        .arg(&a)
        .arg(&b)
        .arg(&c)
        .arg_scalar(n as u32)
        .enq()
        .unwrap_err();
    assert!(matches!(err, Error::Launch(LaunchError::LaunchBounds { .. })));

    let err = kernel
        .cmd()
        .grid(1)
        .group(1)
        .shared_bytes(caps.max_shared + 1)
        .arg(&a)
        .arg(&b)
        .arg(&c)
        .arg_scalar(n as u32)
        .enq()
        .unwrap_err();
    assert!(matches!(err, Error::Launch(LaunchError::LaunchBounds { .. })));

    // Nothing dispatched: the output still holds its fill value.
    let mut out = vec![0.0f32; n];
    c.read(&mut out).enq().unwrap();
    assert!(out.iter().all(|&v| v == -1.0));
}

#[test]
fn degenerate_extents_are_rejected() {
    let (_context, accel, kernel) = loaded_vadd();
    let a = Buffer::<f32>::builder()
        .accelerator(&accel)
        .len(8)
        .build()
        .unwrap();
    let err = kernel
        .cmd()
        .grid(0)
        .arg(&a)
        .arg(&a)
        .arg(&a)
        .arg_scalar(8u32)
        .enq()
        .unwrap_err();
    assert!(matches!(err, Error::Launch(LaunchError::LaunchBounds { .. })));
}

#[test]
fn argument_tuple_is_checked() {
    let (_context, accel, kernel) = loaded_vadd();
    let f32_buf = Buffer::<f32>::builder()
        .accelerator(&accel)
        .len(8)
        .build()
        .unwrap();
    let u32_buf = Buffer::<u32>::builder()
        .accelerator(&accel)
        .len(8)
        .build()
        .unwrap();

    // Too few arguments.
    let err = kernel.cmd().grid(1).arg(&f32_buf).enq().unwrap_err();
    assert!(matches!(
        err,
        Error::Launch(LaunchError::ArgumentMismatch { .. })
    ));

    // Wrong element kind in the first slot.
    let err = kernel
        .cmd()
        .grid(1)
        .arg(&u32_buf)
        .arg(&f32_buf)
        .arg(&f32_buf)
        .arg_scalar(8u32)
        .enq()
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Launch(LaunchError::ArgumentMismatch { .. })
    ));

    // A scalar where a buffer is declared.
    let err = kernel
        .cmd()
        .grid(1)
        .arg_scalar(1.0f32)
        .arg(&f32_buf)
        .arg(&f32_buf)
        .arg_scalar(8u32)
        .enq()
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Launch(LaunchError::ArgumentMismatch { .. })
    ));
}

// Submission order is completion order on one stream.
#[test]
fn stream_is_fifo() {
    let context = host_context();
    let accel = host_accel(&context);
    let stream = accel.create_stream();
    let journal: Arc<Mutex<Vec<(&'static str, Instant)>>> = Arc::new(Mutex::new(Vec::new()));

    let j = Arc::clone(&journal);
    let first = stream
        .submit(move || {
            std::thread::sleep(Duration::from_millis(30));
            j.lock().unwrap().push(("a", Instant::now()));
            Ok(())
        })
        .unwrap();
    let j = Arc::clone(&journal);
    let second = stream
        .submit(move || {
            j.lock().unwrap().push(("b", Instant::now()));
            Ok(())
        })
        .unwrap();

    second.wait_for().unwrap();
    first.wait_for().unwrap();

    let journal = journal.lock().unwrap();
    assert_eq!(journal[0].0, "a");
    assert_eq!(journal[1].0, "b");
    assert!(journal[1].1 >= journal[0].1);
}

#[test]
fn stream_states_and_finish() {
    let context = host_context();
    let accel = host_accel(&context);
    let stream = accel.create_stream();
    assert_eq!(stream.state(), StreamState::Idle);

    let _ = stream
        .submit(|| {
            std::thread::sleep(Duration::from_millis(20));
            Ok(())
        })
        .unwrap();
    assert_eq!(stream.state(), StreamState::Submitted);
    stream.finish().unwrap();
    assert_eq!(stream.state(), StreamState::Idle);
}

#[test]
fn accelerator_status_tracks_inflight_work() {
    let context = host_context();
    let accel = host_accel(&context);
    assert_eq!(accel.status(), AcceleratorStatus::Available);

    let stream = accel.create_stream();
    let event = stream
        .submit(|| {
            std::thread::sleep(Duration::from_millis(30));
            Ok(())
        })
        .unwrap();
    assert_eq!(accel.status(), AcceleratorStatus::Busy);
    event.wait_for().unwrap();
    assert_eq!(accel.status(), AcceleratorStatus::Available);
}

#[test]
fn unavailable_accelerator_rejects_work() {
    let context = host_context();
    let accel = host_accel(&context);
    accel.mark_unavailable();
    assert_eq!(accel.status(), AcceleratorStatus::Unavailable);
    let err = Buffer::<u32>::builder()
        .accelerator(&accel)
        .len(4)
        .build()
        .unwrap_err();
    assert!(matches!(err, Error::Device(_)));
}

#[test]
fn released_kernel_rejects_launches() {
    let (_context, accel, kernel) = loaded_vadd();
    let spare = kernel.clone();
    kernel.release().unwrap();
    let buf = Buffer::<f32>::builder()
        .accelerator(&accel)
        .len(4)
        .build()
        .unwrap();
    let err = spare
        .cmd()
        .grid(1)
        .arg(&buf)
        .arg(&buf)
        .arg(&buf)
        .arg_scalar(4u32)
        .enq()
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Launch(LaunchError::KernelNotLoaded { .. })
    ));
}

#[test]
fn ptx_artifact_does_not_load_on_host() {
    let context = host_context();
    let accel = host_accel(&context);
    let artifact = context
        .compile(&vector_add_module(), &TargetCaps::sm(7, 0))
        .unwrap();
    let err = Kernel::load(&artifact, "vadd", &accel).unwrap_err();
    assert!(matches!(
        err,
        Error::Launch(LaunchError::CapabilityMissing { .. })
    ));
}

#[test]
fn event_timeout_and_lists() {
    let context = host_context();
    let accel = host_accel(&context);
    let stream = accel.create_stream();

    let slow = stream
        .submit(|| {
            std::thread::sleep(Duration::from_millis(50));
            Ok(())
        })
        .unwrap();
    let err = slow.wait_for_timeout(Duration::from_millis(1)).unwrap_err();
    assert!(matches!(
        err,
        Error::Device(crate::DeviceError::Timeout { .. })
    ));

    let mut list = EventList::new();
    list.push(slow.clone());
    list.push(stream.enqueue_marker().unwrap());
    list.wait_for().unwrap();
    assert!(slow.elapsed().unwrap() >= Duration::from_millis(50));
    list.clear_completed();
    assert!(list.is_empty());
}

// Launches on distinct streams of one accelerator may overlap; each
// stream stays serial.
#[test]
fn distinct_streams_overlap() {
    let context = host_context();
    let accel = host_accel(&context);
    let s1 = accel.create_stream();
    let s2 = accel.create_stream();

    let started = Instant::now();
    let e1 = s1
        .submit(|| {
            std::thread::sleep(Duration::from_millis(40));
            Ok(())
        })
        .unwrap();
    let e2 = s2
        .submit(|| {
            std::thread::sleep(Duration::from_millis(40));
            Ok(())
        })
        .unwrap();
    e1.wait_for().unwrap();
    e2.wait_for().unwrap();
    // Serial execution would need ~80ms; allow generous scheduling
    // slack while still distinguishing overlap.
    assert!(started.elapsed() < Duration::from_millis(75));
}
