//! The backend → driver boundary.
//!
//! Every driver integration sits behind [`Driver`]: enumerate devices,
//! manage raw device memory, move bytes, load artifacts and launch them.
//! The crate ships [`HostDriver`], a complete in-process implementation
//! executing CPU artifacts; PTX and OpenCL artifacts are produced for
//! external drivers implementing the same trait.
//!
//! Ordering is not the driver's concern: streams serialize their own
//! submissions and call into the driver from their worker thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::backend::cpu::{self, DeviceMem, HostArg};
use crate::backend::{Artifact, ArtifactBody, BackendKind, HostImage, TargetCaps};
use crate::error::Result as UclResult;
use crate::standard::DeviceError;

/// Driver-local identifier of one physical or virtual device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Device memory totals as reported by the driver.
#[derive(Debug, Clone, Copy)]
pub struct MemInfo {
    pub total: u64,
    pub free: u64,
    /// Rough main-memory bandwidth estimate, GiB/s.
    pub bandwidth_gbps: f64,
}

/// One enumerated device: identity, capability descriptor and memory.
#[derive(Debug, Clone)]
pub struct DeviceDesc {
    pub id: DeviceId,
    pub backend: BackendKind,
    pub name: String,
    pub caps: TargetCaps,
    pub memory: MemInfo,
}

/// Handle to one device allocation. Cheap to clone; the allocation is
/// released through [`Driver::free`], not on drop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemHandle {
    pub(crate) slot: u64,
    pub bytes: usize,
}

impl MemHandle {
    /// Mints a handle from a driver-chosen slot id. For `Driver`
    /// implementations.
    pub fn new(slot: u64, bytes: usize) -> MemHandle {
        MemHandle { slot, bytes }
    }

    pub fn slot(&self) -> u64 {
        self.slot
    }
}

/// Handle to an artifact loaded onto one device.
#[derive(Debug, Clone)]
pub struct LoadedKernel {
    pub(crate) slot: u64,
}

impl LoadedKernel {
    /// Mints a handle from a driver-chosen slot id. For `Driver`
    /// implementations.
    pub fn new(slot: u64) -> LoadedKernel {
        LoadedKernel { slot }
    }

    pub fn slot(&self) -> u64 {
        self.slot
    }
}

/// A marshaled launch argument.
#[derive(Debug, Clone)]
pub enum LaunchArg {
    Mem(MemHandle),
    /// Scalar bits, zero-extended; the entry's marshaling table carries
    /// the true width.
    Scalar(u64),
}

/// The minimal integration surface a device driver exposes.
pub trait Driver: Send + Sync {
    fn backend(&self) -> BackendKind;

    fn enumerate(&self) -> Vec<DeviceDesc>;

    fn alloc(&self, dev: DeviceId, bytes: usize, align: usize) -> UclResult<MemHandle>;

    fn free(&self, dev: DeviceId, mem: &MemHandle);

    fn read(&self, dev: DeviceId, mem: &MemHandle, offset: usize, dst: &mut [u8])
        -> UclResult<()>;

    fn write(&self, dev: DeviceId, mem: &MemHandle, offset: usize, src: &[u8]) -> UclResult<()>;

    /// Same-driver copy. Cross-driver transfers are staged through host
    /// memory by the runtime.
    fn copy(
        &self,
        dev: DeviceId,
        src: &MemHandle,
        src_offset: usize,
        dst: &MemHandle,
        dst_offset: usize,
        bytes: usize,
    ) -> UclResult<()>;

    fn mem_info(&self, dev: DeviceId) -> MemInfo;

    fn load(&self, dev: DeviceId, artifact: &Artifact) -> UclResult<LoadedKernel>;

    fn unload(&self, dev: DeviceId, kernel: &LoadedKernel);

    fn launch(
        &self,
        dev: DeviceId,
        kernel: &LoadedKernel,
        entry_idx: usize,
        grid: [u32; 3],
        group: [u32; 3],
        shared_bytes: u32,
        args: &[LaunchArg],
    ) -> UclResult<()>;
}

//=============================================================================
//============================== HOST DRIVER ==================================
//=============================================================================

struct HostState {
    allocs: HashMap<u64, Arc<DeviceMem>>,
    used: u64,
    kernels: HashMap<u64, Arc<HostImage>>,
}

/// The in-process CPU driver: one device backed by host memory, with a
/// configurable byte budget so allocation pressure is observable.
pub struct HostDriver {
    budget: u64,
    state: Mutex<HostState>,
    next_slot: AtomicU64,
    caps: TargetCaps,
}

impl HostDriver {
    /// A host driver with an effectively unlimited budget.
    pub fn new() -> HostDriver {
        HostDriver::with_memory_budget(1 << 40)
    }

    /// A host driver that reports `budget` bytes of device memory and
    /// fails allocations beyond it.
    pub fn with_memory_budget(budget: u64) -> HostDriver {
        HostDriver {
            budget,
            state: Mutex::new(HostState {
                allocs: HashMap::new(),
                used: 0,
                kernels: HashMap::new(),
            }),
            next_slot: AtomicU64::new(1),
            caps: TargetCaps::host(),
        }
    }

    fn mem(&self, mem: &MemHandle) -> UclResult<Arc<DeviceMem>> {
        self.state
            .lock()
            .unwrap()
            .allocs
            .get(&mem.slot)
            .cloned()
            .ok_or_else(|| {
                DeviceError::DriverFailure {
                    device: DeviceId(0).to_string(),
                    detail: format!("stale memory handle {}", mem.slot),
                }
                .into()
            })
    }
}

impl Default for HostDriver {
    fn default() -> HostDriver {
        HostDriver::new()
    }
}

impl Driver for HostDriver {
    fn backend(&self) -> BackendKind {
        BackendKind::Cpu
    }

    fn enumerate(&self) -> Vec<DeviceDesc> {
        let state = self.state.lock().unwrap();
        vec![DeviceDesc {
            id: DeviceId(0),
            backend: BackendKind::Cpu,
            name: "host-cpu".to_owned(),
            caps: self.caps.clone(),
            memory: MemInfo {
                total: self.budget,
                free: self.budget.saturating_sub(state.used),
                bandwidth_gbps: 50.0,
            },
        }]
    }

    fn alloc(&self, _dev: DeviceId, bytes: usize, _align: usize) -> UclResult<MemHandle> {
        let mut state = self.state.lock().unwrap();
        if state.used + bytes as u64 > self.budget {
            return Err(DeviceError::OutOfMemory {
                device: DeviceId(0).to_string(),
                requested: bytes as u64,
                free: self.budget.saturating_sub(state.used),
            }
            .into());
        }
        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
        state.allocs.insert(slot, Arc::new(DeviceMem::new(bytes)));
        state.used += bytes as u64;
        Ok(MemHandle { slot, bytes })
    }

    fn free(&self, _dev: DeviceId, mem: &MemHandle) {
        let mut state = self.state.lock().unwrap();
        if state.allocs.remove(&mem.slot).is_some() {
            state.used = state.used.saturating_sub(mem.bytes as u64);
        }
    }

    fn read(
        &self,
        _dev: DeviceId,
        mem: &MemHandle,
        offset: usize,
        dst: &mut [u8],
    ) -> UclResult<()> {
        let arena = self.mem(mem)?;
        arena.read_into(offset, dst).map_err(transfer_err)
    }

    fn write(&self, _dev: DeviceId, mem: &MemHandle, offset: usize, src: &[u8]) -> UclResult<()> {
        let arena = self.mem(mem)?;
        arena.write_from(offset, src).map_err(transfer_err)
    }

    fn copy(
        &self,
        _dev: DeviceId,
        src: &MemHandle,
        src_offset: usize,
        dst: &MemHandle,
        dst_offset: usize,
        bytes: usize,
    ) -> UclResult<()> {
        let src_arena = self.mem(src)?;
        let dst_arena = self.mem(dst)?;
        let mut staged = vec![0u8; bytes];
        src_arena
            .read_into(src_offset, &mut staged)
            .map_err(transfer_err)?;
        dst_arena
            .write_from(dst_offset, &staged)
            .map_err(transfer_err)
    }

    fn mem_info(&self, _dev: DeviceId) -> MemInfo {
        let state = self.state.lock().unwrap();
        MemInfo {
            total: self.budget,
            free: self.budget.saturating_sub(state.used),
            bandwidth_gbps: 50.0,
        }
    }

    fn load(&self, _dev: DeviceId, artifact: &Artifact) -> UclResult<LoadedKernel> {
        let image = match artifact.body {
            ArtifactBody::Host(ref image) => image.clone(),
            ref other => {
                return Err(DeviceError::DriverFailure {
                    device: DeviceId(0).to_string(),
                    detail: format!(
                        "host driver cannot load a {} artifact",
                        match other {
                            ArtifactBody::PtxText(_) => "ptx",
                            ArtifactBody::OpenClC(_) => "opencl-c",
                            ArtifactBody::SpirV(_) => "spir-v",
                            ArtifactBody::Host(_) => unreachable!(),
                        }
                    ),
                }
                .into())
            }
        };
        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
        self.state
            .lock()
            .unwrap()
            .kernels
            .insert(slot, Arc::new(image));
        Ok(LoadedKernel { slot })
    }

    fn unload(&self, _dev: DeviceId, kernel: &LoadedKernel) {
        self.state.lock().unwrap().kernels.remove(&kernel.slot);
    }

    fn launch(
        &self,
        _dev: DeviceId,
        kernel: &LoadedKernel,
        entry_idx: usize,
        grid: [u32; 3],
        group: [u32; 3],
        shared_bytes: u32,
        args: &[LaunchArg],
    ) -> UclResult<()> {
        let image = self
            .state
            .lock()
            .unwrap()
            .kernels
            .get(&kernel.slot)
            .cloned()
            .ok_or_else(|| DeviceError::DriverFailure {
                device: DeviceId(0).to_string(),
                detail: "launch of an unloaded kernel".to_owned(),
            })?;
        let entry = image.entries.get(entry_idx).ok_or_else(|| {
            DeviceError::DriverFailure {
                device: DeviceId(0).to_string(),
                detail: format!("entry index {} out of range", entry_idx),
            }
        })?;

        // Buffer arguments stay alive for the whole launch via the Arc
        // clones resolved here.
        let mut arenas: Vec<Option<Arc<DeviceMem>>> = Vec::with_capacity(args.len());
        for arg in args {
            match arg {
                LaunchArg::Mem(handle) => arenas.push(Some(self.mem(handle)?)),
                LaunchArg::Scalar(_) => arenas.push(None),
            }
        }
        let host_args: Vec<HostArg<'_>> = args
            .iter()
            .zip(arenas.iter())
            .map(|(arg, arena)| match (arg, arena) {
                (LaunchArg::Mem(_), Some(arena)) => HostArg::Buffer(arena),
                (LaunchArg::Scalar(bits), _) => HostArg::Scalar(*bits),
                _ => unreachable!("arena resolved for every mem arg"),
            })
            .collect();

        cpu::execute_entry(
            entry,
            grid,
            group,
            shared_bytes,
            &host_args,
            self.caps.warp_size,
        )
        .map_err(|detail| {
            DeviceError::DriverFailure {
                device: DeviceId(0).to_string(),
                detail,
            }
            .into()
        })
    }
}

fn transfer_err(detail: String) -> crate::error::Error {
    crate::standard::MemoryError::TransferFailed { detail }.into()
}
