//! A compiled kernel bound to one accelerator, and its launch command.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::backend::{Artifact, EntryMeta};
use crate::driver::{LaunchArg, LoadedKernel};
use crate::error::Result as UclResult;
use crate::ir::ParamKind;

use super::accelerator::Accelerator;
use super::buffer::{Buffer, UclPrm};
use super::event::Event;
use super::spatial_dims::SpatialDims;
use super::stream::Stream;

/// An error related to kernel loading or launching. Fatal for the
/// launch; the accelerator remains usable.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LaunchError {
    #[error("launch bounds exceeded: {detail}")]
    LaunchBounds { detail: String },
    #[error("argument mismatch: {detail}")]
    ArgumentMismatch { detail: String },
    #[error("capability missing: {detail}")]
    CapabilityMissing { detail: String },
    #[error("kernel '{name}' is not loaded")]
    KernelNotLoaded { name: String },
}

struct KernelInner {
    artifact: Arc<Artifact>,
    entry_idx: usize,
    entry: EntryMeta,
    loaded: LoadedKernel,
    accel: Accelerator,
    outstanding: AtomicUsize,
    released: AtomicBool,
}

/// A compiled artifact bound to one accelerator plus an entry point.
///
/// Holds its accelerator alive for its own lifetime; the artifact stays
/// pinned in the kernel cache while any kernel references it. Launches
/// are non-blocking submissions onto a stream.
#[derive(Clone)]
pub struct Kernel {
    inner: Arc<KernelInner>,
}

impl Kernel {
    /// Loads `entry` of `artifact` onto `accel`.
    ///
    /// Fails with `CapabilityMissing` when the artifact's requirements
    /// exceed the accelerator's capability bits.
    pub fn load(artifact: &Arc<Artifact>, entry: &str, accel: &Accelerator) -> UclResult<Kernel> {
        accel.ensure_usable()?;
        if !artifact.requirements_met(accel.caps()) {
            return Err(LaunchError::CapabilityMissing {
                detail: format!(
                    "artifact {} requires {:?} (compute {}.{}) beyond accelerator {}",
                    artifact.fingerprint,
                    artifact.requires,
                    artifact.min_compute.0,
                    artifact.min_compute.1,
                    accel.label()
                ),
            }
            .into());
        }
        let (entry_idx, meta) = artifact.entry(entry).ok_or_else(|| {
            LaunchError::KernelNotLoaded {
                name: entry.to_owned(),
            }
        })?;
        let loaded = accel.driver().load(accel.device_id(), artifact)?;
        accel.retain_kernel();
        Ok(Kernel {
            inner: Arc::new(KernelInner {
                artifact: Arc::clone(artifact),
                entry_idx,
                entry: meta.clone(),
                loaded,
                accel: accel.clone(),
                outstanding: AtomicUsize::new(0),
                released: AtomicBool::new(false),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.entry.name
    }

    pub fn accelerator(&self) -> &Accelerator {
        &self.inner.accel
    }

    pub fn artifact(&self) -> &Arc<Artifact> {
        &self.inner.artifact
    }

    /// Launches currently submitted but not yet completed.
    pub fn outstanding_launches(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Returns a new launch command builder.
    pub fn cmd(&self) -> LaunchCmd<'_> {
        LaunchCmd {
            kernel: self,
            grid: None,
            group: SpatialDims::unit(),
            shared_bytes: 0,
            args: Vec::with_capacity(self.inner.entry.params.len()),
            provided_kinds: Vec::with_capacity(self.inner.entry.params.len()),
            stream: None,
        }
    }

    /// Explicitly releases the kernel. Requires that no launches are
    /// outstanding.
    pub fn release(self) -> UclResult<()> {
        let outstanding = self.outstanding_launches();
        if outstanding > 0 {
            return Err(LaunchError::ArgumentMismatch {
                detail: format!(
                    "kernel '{}' released with {} outstanding launch(es)",
                    self.name(),
                    outstanding
                ),
            }
            .into());
        }
        self.inner.released.store(true, Ordering::Release);
        Ok(())
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("entry", &self.inner.entry.name)
            .field("accelerator", &self.inner.accel.label())
            .field("fingerprint", &self.inner.artifact.fingerprint)
            .field("outstanding", &self.outstanding_launches())
            .finish()
    }
}

impl Drop for KernelInner {
    fn drop(&mut self) {
        // Outstanding launches hold their own clone of the inner arc, so
        // reaching here means none are in flight.
        self.accel
            .driver()
            .unload(self.accel.device_id(), &self.loaded);
        self.accel.release_kernel();
    }
}

/// A kernel launch command builder.
#[must_use = "commands do nothing unless enqueued"]
pub struct LaunchCmd<'k> {
    kernel: &'k Kernel,
    grid: Option<SpatialDims>,
    group: SpatialDims,
    shared_bytes: u32,
    args: Vec<LaunchArg>,
    provided_kinds: Vec<ParamKind>,
    stream: Option<&'k Stream>,
}

impl<'k> LaunchCmd<'k> {
    /// Grid extent in groups. Required.
    pub fn grid<D: Into<SpatialDims>>(mut self, grid: D) -> LaunchCmd<'k> {
        self.grid = Some(grid.into());
        self
    }

    /// Group extent in threads; defaults to a unit group.
    pub fn group<D: Into<SpatialDims>>(mut self, group: D) -> LaunchCmd<'k> {
        self.group = group.into();
        self
    }

    /// Dynamic shared-memory bytes on top of the entry's static
    /// requirement.
    pub fn shared_bytes(mut self, bytes: u32) -> LaunchCmd<'k> {
        self.shared_bytes = bytes;
        self
    }

    /// Appends a buffer argument. The provided element kind is checked
    /// against the entry's declared layout at enqueue.
    pub fn arg<T: UclPrm>(mut self, buffer: &Buffer<T>) -> LaunchCmd<'k> {
        self.args.push(LaunchArg::Mem(buffer.mem().clone()));
        self.provided_kinds.push(ParamKind::Buffer(T::KIND));
        self
    }

    /// Appends an immediate scalar argument.
    pub fn arg_scalar<T: UclPrm>(mut self, val: T) -> LaunchCmd<'k> {
        let mut bits = [0u8; 8];
        let raw = bytemuck::bytes_of(&val);
        bits[..raw.len()].copy_from_slice(raw);
        self.args.push(LaunchArg::Scalar(u64::from_le_bytes(bits)));
        self.provided_kinds.push(ParamKind::Scalar(T::KIND));
        self
    }

    /// Specifies a stream for this launch; defaults to the
    /// accelerator's default stream.
    pub fn queue(mut self, stream: &'k Stream) -> LaunchCmd<'k> {
        self.stream = Some(stream);
        self
    }

    /// Enqueues the launch: verifies bounds and arguments, then submits
    /// without blocking. The returned event completes when the kernel
    /// finishes.
    pub fn enq(self) -> UclResult<Event> {
        let kernel = &self.kernel.inner;
        if kernel.released.load(Ordering::Acquire) {
            return Err(LaunchError::KernelNotLoaded {
                name: kernel.entry.name.clone(),
            }
            .into());
        }
        kernel.accel.ensure_usable()?;

        let grid = self.grid.ok_or_else(|| LaunchError::LaunchBounds {
            detail: "grid extent unspecified".to_owned(),
        })?;
        let caps = kernel.accel.caps();
        verify_bounds("grid", grid.extent(), caps.max_grid)?;
        verify_bounds("group", self.group.extent(), caps.max_group)?;
        let total_shared = kernel.entry.shared_bytes + self.shared_bytes;
        if total_shared > caps.max_shared {
            return Err(LaunchError::LaunchBounds {
                detail: format!(
                    "shared memory {} bytes exceeds limit {}",
                    total_shared, caps.max_shared
                ),
            }
            .into());
        }

        // Argument tuple must match the entry layout exactly.
        if self.args.len() != kernel.entry.params.len() {
            return Err(LaunchError::ArgumentMismatch {
                detail: format!(
                    "kernel '{}' takes {} argument(s), {} provided",
                    kernel.entry.name,
                    kernel.entry.params.len(),
                    self.args.len()
                ),
            }
            .into());
        }
        for (i, (provided, expect)) in self
            .provided_kinds
            .iter()
            .zip(kernel.entry.params.iter())
            .enumerate()
        {
            if *provided != expect.kind {
                return Err(LaunchError::ArgumentMismatch {
                    detail: format!(
                        "kernel '{}' argument {}: provided {:?}, declared {:?}",
                        kernel.entry.name, i, provided, expect.kind
                    ),
                }
                .into());
            }
        }

        let stream = self
            .stream
            .unwrap_or_else(|| kernel.accel.default_stream());

        kernel.outstanding.fetch_add(1, Ordering::AcqRel);
        let inner = Arc::clone(&self.kernel.inner);
        let args = self.args;
        let grid_extent = grid.extent();
        let group_extent = self.group.extent();
        let dynamic_shared = self.shared_bytes;
        let submitted = stream.submit(move || {
            let outcome = inner.accel.driver().launch(
                inner.accel.device_id(),
                &inner.loaded,
                inner.entry_idx,
                grid_extent,
                group_extent,
                dynamic_shared,
                &args,
            );
            inner.outstanding.fetch_sub(1, Ordering::AcqRel);
            outcome
        });
        if submitted.is_err() {
            kernel.outstanding.fetch_sub(1, Ordering::AcqRel);
        }
        submitted
    }
}

fn verify_bounds(what: &str, requested: [u32; 3], max: [u32; 3]) -> UclResult<()> {
    for axis in 0..3 {
        if requested[axis] > max[axis] {
            return Err(LaunchError::LaunchBounds {
                detail: format!(
                    "{} axis {}: {} exceeds device maximum {}",
                    what, axis, requested[axis], max[axis]
                ),
            }
            .into());
        }
        if requested[axis] == 0 {
            return Err(LaunchError::LaunchBounds {
                detail: format!("{} axis {} is zero", what, axis),
            }
            .into());
        }
    }
    Ok(())
}
