//! # `ucl`
//!
//! A heterogeneous compute platform for Rust: a device-independent kernel
//! IR, transformation passes that lower it, code generators for CPU, PTX
//! and OpenCL/SPIR-V targets, and a runtime that owns accelerators,
//! streams, device buffers and a content-addressed cache of compiled
//! kernels.
//!
//! ## Layers
//!
//! From the bottom up:
//!
//! * [`ir`], the kernel intermediate representation: interned types,
//!   SSA values in basic blocks, functions, modules and entry points.
//! * [`pass`], the fixed-order transform pipeline which lowers a closed
//!   module for one target.
//! * [`backend`], capability descriptors, compiled artifacts, and the
//!   CPU / PTX / OpenCL code generators.
//! * [`standard`], the high-level runtime types: [`Context`],
//!   [`Accelerator`], [`Stream`], [`Buffer`] and [`Kernel`].
//! * [`cache`], content-addressed storage of compiled artifacts.
//! * [`sched`] and [`exec`], the cross-device scheduler and the plan
//!   execution engine.
//!
//! Kernel launches are non-blocking submissions onto a [`Stream`]; an
//! explicit `finish` (or waiting on an [`Event`]) blocks the calling host
//! thread until prior submissions on that stream have completed.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! let context = Context::builder().build()?;
//! let accel = context.accelerator_by_index(0)?;
//! let artifact = context.cache().get_or_compile(&module, accel.caps())?;
//! let kernel = Kernel::load(&artifact, "add", &accel)?;
//! let buffer = Buffer::<f32>::builder().accelerator(&accel).len(1024).build()?;
//! kernel.cmd().grid(1024).group(64).arg(&buffer).enq()?.wait_for()?;
//! ```

#![allow(clippy::too_many_arguments)]

#[cfg(test)]
mod tests;

pub mod error;
pub mod r#async;
pub mod ir;
pub mod pass;
pub mod backend;
pub mod standard;
pub mod cache;
pub mod sched;
pub mod exec;
mod driver;

pub use crate::error::{Error, Result};
pub use crate::r#async::{CancelToken, CompletionFuture};
pub use crate::backend::{
    Artifact, ArtifactBody, BackendKind, CompilationError, DeviceFeatures, Fingerprint,
    TargetCaps,
};
pub use crate::cache::KernelCache;
pub use crate::driver::{
    DeviceDesc, DeviceId, Driver, HostDriver, LaunchArg, LoadedKernel, MemHandle, MemInfo,
};
pub use crate::exec::{ExecBindings, ExecReport, ExecutionEngine, TransferFn};
pub use crate::sched::{
    analyze, build_plan, AccessPattern, ComputeGraph, DeviceProfile, ExecutionPlan, OpClass,
    OpDesc, SchedulingError, SchedulingPolicy, Transfer, WorkloadClass, WorkloadProfile,
};
pub use crate::standard::{
    Accelerator, AcceleratorStatus, Buffer, BufferBuilder, BufferView, Context, ContextBuilder,
    DeviceError, Event, EventList, Kernel, LaunchCmd, LaunchError, MemLayout, MemoryError,
    PinnedGuard, SpatialDims, Stream, StreamState, UclPrm,
};

pub mod prm {
    //! Host-side element primitives usable in device buffers.
    //!
    //! The half-precision types come from the `half` crate and behave
    //! identically to their device-side counterparts for representable
    //! values.

    pub use half::{bf16, f16};

    pub use crate::standard::UclPrm;
}

pub mod traits {
    //! Commonly used traits.

    pub use crate::backend::Backend;
    pub use crate::driver::Driver;
    pub use crate::pass::Pass;
    pub use crate::standard::{UclPrm, WorkDims};
}

pub mod builders {
    //! Builders and associated settings-related types.

    pub use crate::ir::{FunctionBuilder, ModuleBuilder};
    pub use crate::standard::{BufferBuilder, ContextBuilder, LaunchCmd};
}

pub mod flags {
    //! Bitflags for capability and support sets.

    pub use crate::backend::{DeviceFeatures, OpSupport};
    pub use crate::sched::OpClassSet;
}
