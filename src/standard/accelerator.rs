//! A runtime handle to one compute device.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::backend::{BackendKind, TargetCaps};
use crate::driver::{DeviceDesc, DeviceId, Driver, MemInfo};
use crate::error::{Error, Result as UclResult};

use super::stream::Stream;

/// An error related to a device or its driver.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeviceError {
    #[error("device {device} is unavailable")]
    Unavailable { device: String },
    #[error("device {device} was lost")]
    Lost { device: String },
    #[error("device {device}: driver failure: {detail}")]
    DriverFailure { device: String, detail: String },
    #[error(
        "device {device}: out of memory (requested {requested} bytes, {free} free)"
    )]
    OutOfMemory {
        device: String,
        requested: u64,
        free: u64,
    },
    #[error("device operation timed out after {waited_ms} ms")]
    Timeout { waited_ms: u64 },
}

impl DeviceError {
    /// Whether this failure latches the accelerator into a terminal
    /// state. Allocation pressure and timeouts do not.
    pub fn is_hard(&self) -> bool {
        matches!(
            *self,
            DeviceError::Lost { .. } | DeviceError::DriverFailure { .. }
        )
    }
}

/// Observable accelerator state.
///
/// `Available ↔ Busy` as work is submitted and drains; `Unavailable`
/// on driver loss and `Error` on hard failure are sticky, subsequent
/// operations fail fast with the latched kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceleratorStatus {
    Available,
    Busy,
    Unavailable,
    Error,
}

/// State shared between an accelerator and its streams.
pub(crate) struct AccelShared {
    pub(crate) inflight: AtomicUsize,
    pub(crate) label: String,
    error: Mutex<Option<DeviceError>>,
    unavailable: AtomicBool,
}

impl AccelShared {
    fn new(label: String) -> AccelShared {
        AccelShared {
            inflight: AtomicUsize::new(0),
            label,
            error: Mutex::new(None),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Latches the first hard device failure; later ones are dropped.
    pub(crate) fn latch_hard_failure(&self, err: &Error) {
        if let Some(dev_err) = err.device() {
            if dev_err.is_hard() {
                let mut slot = self.error.lock().unwrap();
                if slot.is_none() {
                    log::warn!("accelerator {}: latched {}", self.label, dev_err);
                    *slot = Some(dev_err.clone());
                }
            }
        }
    }

    fn latched(&self) -> Option<DeviceError> {
        self.error.lock().unwrap().clone()
    }
}

struct AccelInner {
    desc: DeviceDesc,
    driver: Arc<dyn Driver>,
    shared: Arc<AccelShared>,
    /// Live-buffer registry: key → allocation size. Locked only on
    /// registration and unregistration.
    buffers: Mutex<HashMap<u64, usize>>,
    live_kernels: AtomicUsize,
    next_key: AtomicU64,
    default_stream: Stream,
    disposed: AtomicBool,
}

/// Represents one physical or virtual device.
///
/// Owns a default stream and a live-buffer registry; buffers and
/// kernels created from it hold it alive and must be released before
/// it can be disposed. Cheap to clone and share among threads.
#[derive(Clone)]
pub struct Accelerator {
    inner: Arc<AccelInner>,
}

impl Accelerator {
    pub(crate) fn from_parts(driver: Arc<dyn Driver>, desc: DeviceDesc) -> Accelerator {
        let label = format!("{}:{}", desc.backend.tag(), desc.id.0);
        let shared = Arc::new(AccelShared::new(label.clone()));
        let default_stream = Stream::new(Arc::clone(&shared), format!("{}.0", label));
        Accelerator {
            inner: Arc::new(AccelInner {
                desc,
                driver,
                shared,
                buffers: Mutex::new(HashMap::new()),
                live_kernels: AtomicUsize::new(0),
                next_key: AtomicU64::new(1),
                default_stream,
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Stable identity: backend tag plus driver-local device id.
    pub fn label(&self) -> &str {
        &self.inner.shared.label
    }

    pub fn name(&self) -> &str {
        &self.inner.desc.name
    }

    pub fn backend(&self) -> BackendKind {
        self.inner.desc.backend
    }

    pub fn device_id(&self) -> DeviceId {
        self.inner.desc.id
    }

    pub fn caps(&self) -> &TargetCaps {
        &self.inner.desc.caps
    }

    pub fn memory_info(&self) -> MemInfo {
        self.inner.driver.mem_info(self.inner.desc.id)
    }

    pub(crate) fn driver(&self) -> &Arc<dyn Driver> {
        &self.inner.driver
    }

    pub(crate) fn shared(&self) -> &Arc<AccelShared> {
        &self.inner.shared
    }

    /// The accelerator's always-present stream.
    pub fn default_stream(&self) -> &Stream {
        &self.inner.default_stream
    }

    /// Creates an additional stream; work on distinct streams may
    /// overlap.
    pub fn create_stream(&self) -> Stream {
        let n = self.inner.next_key.fetch_add(1, Ordering::Relaxed);
        Stream::new(
            Arc::clone(&self.inner.shared),
            format!("{}.{}", self.label(), n),
        )
    }

    pub fn status(&self) -> AcceleratorStatus {
        if self.inner.shared.latched().is_some() {
            return AcceleratorStatus::Error;
        }
        if self.inner.shared.unavailable.load(Ordering::Acquire)
            || self.inner.disposed.load(Ordering::Acquire)
        {
            return AcceleratorStatus::Unavailable;
        }
        if self.inner.shared.inflight.load(Ordering::Acquire) > 0 {
            AcceleratorStatus::Busy
        } else {
            AcceleratorStatus::Available
        }
    }

    /// Fails fast with the latched error kind when the device can no
    /// longer accept work.
    pub fn ensure_usable(&self) -> UclResult<()> {
        if let Some(err) = self.inner.shared.latched() {
            return Err(err.into());
        }
        if self.inner.shared.unavailable.load(Ordering::Acquire)
            || self.inner.disposed.load(Ordering::Acquire)
        {
            return Err(DeviceError::Unavailable {
                device: self.label().to_owned(),
            }
            .into());
        }
        Ok(())
    }

    /// Marks the device unavailable, as on driver loss. Sticky.
    pub fn mark_unavailable(&self) {
        self.inner.shared.unavailable.store(true, Ordering::Release);
    }

    pub fn live_buffer_count(&self) -> usize {
        self.inner.buffers.lock().unwrap().len()
    }

    pub fn live_kernel_count(&self) -> usize {
        self.inner.live_kernels.load(Ordering::Acquire)
    }

    pub(crate) fn register_buffer(&self, bytes: usize) -> u64 {
        let key = self.inner.next_key.fetch_add(1, Ordering::Relaxed);
        self.inner.buffers.lock().unwrap().insert(key, bytes);
        key
    }

    pub(crate) fn unregister_buffer(&self, key: u64) {
        self.inner.buffers.lock().unwrap().remove(&key);
    }

    pub(crate) fn retain_kernel(&self) {
        self.inner.live_kernels.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release_kernel(&self) {
        self.inner.live_kernels.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.inner.next_key.fetch_add(1, Ordering::Relaxed)
    }

    /// Disposes the accelerator: drains the default stream and marks it
    /// unavailable.
    ///
    /// Fails with `LifetimeViolation` while any live buffer or kernel
    /// still references it.
    pub fn dispose(&self) -> UclResult<()> {
        let buffers = self.live_buffer_count();
        let kernels = self.live_kernel_count();
        if buffers > 0 || kernels > 0 {
            return Err(super::MemoryError::LifetimeViolation {
                detail: format!(
                    "cannot dispose accelerator {}: {} live buffer(s), {} live kernel(s)",
                    self.label(),
                    buffers,
                    kernels
                ),
            }
            .into());
        }
        self.inner.default_stream.finish()?;
        self.inner.disposed.store(true, Ordering::Release);
        Ok(())
    }
}

/// A non-owning reference to an accelerator, used by the context's
/// registry so a forgotten handle never keeps a device alive.
#[derive(Clone)]
pub(crate) struct WeakAccel {
    inner: std::sync::Weak<AccelInner>,
}

impl Accelerator {
    pub(crate) fn downgrade(&self) -> WeakAccel {
        WeakAccel {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl WeakAccel {
    pub(crate) fn upgrade(&self) -> Option<Accelerator> {
        self.inner.upgrade().map(|inner| Accelerator { inner })
    }
}

impl std::fmt::Debug for Accelerator {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Accelerator")
            .field("label", &self.label())
            .field("name", &self.name())
            .field("status", &self.status())
            .field("live_buffers", &self.live_buffer_count())
            .field("live_kernels", &self.live_kernel_count())
            .finish()
    }
}
