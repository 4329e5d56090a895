//! The runtime context: drivers, device enumeration, accelerator
//! creation and the shared kernel cache.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::backend::{Artifact, BackendKind, TargetCaps};
use crate::cache::{KernelCache, ENV_CACHE_BYTES, ENV_CACHE_DIR};
use crate::driver::{DeviceDesc, Driver, HostDriver};
use crate::error::Result as UclResult;
use crate::ir::Module;
use crate::sched::SchedulingPolicy;

use super::accelerator::{Accelerator, DeviceError, WeakAccel};

/// Recognized environment configuration. Unknown environment variables
/// are ignored.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// `UCL_CACHE_DIR`, disk-cache directory.
    pub cache_dir: Option<PathBuf>,
    /// `UCL_CACHE_BYTES`, in-memory cache byte budget.
    pub cache_bytes: Option<usize>,
    /// `UCL_SCHED_POLICY`, default scheduling policy.
    pub default_policy: Option<SchedulingPolicy>,
    /// Backends disabled via `UCL_BACKEND_<TAG>=0`.
    disabled: Vec<BackendKind>,
}

impl RuntimeConfig {
    pub fn from_env() -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        if let Ok(dir) = std::env::var(ENV_CACHE_DIR) {
            if !dir.is_empty() {
                config.cache_dir = Some(PathBuf::from(dir));
            }
        }
        config.cache_bytes = std::env::var(ENV_CACHE_BYTES)
            .ok()
            .and_then(|v| v.parse().ok());
        config.default_policy = std::env::var("UCL_SCHED_POLICY")
            .ok()
            .and_then(|v| SchedulingPolicy::from_name(&v));
        for (kind, var) in [
            (BackendKind::Cpu, "UCL_BACKEND_CPU"),
            (BackendKind::Ptx, "UCL_BACKEND_PTX"),
            (BackendKind::OpenCl, "UCL_BACKEND_OCL"),
        ] {
            if let Ok(val) = std::env::var(var) {
                if val == "0" || val.eq_ignore_ascii_case("false") {
                    config.disabled.push(kind);
                }
            }
        }
        config
    }

    pub fn backend_enabled(&self, kind: BackendKind) -> bool {
        !self.disabled.contains(&kind)
    }
}

struct ContextInner {
    drivers: Vec<Arc<dyn Driver>>,
    cache: KernelCache,
    config: RuntimeConfig,
    accels: Mutex<Vec<WeakAccel>>,
}

/// Owns registered drivers and the kernel cache; creates accelerators.
///
/// Cheap to clone and share among threads.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Returns a new [`ContextBuilder`].
    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    /// Enumerates every device across enabled drivers, in driver
    /// registration order.
    pub fn devices(&self) -> Vec<DeviceDesc> {
        self.inner
            .drivers
            .iter()
            .flat_map(|d| d.enumerate())
            .collect()
    }

    /// Creates (and registers) an accelerator for the `index`th
    /// enumerated device.
    pub fn accelerator_by_index(&self, index: usize) -> UclResult<Accelerator> {
        let mut seen = 0usize;
        for driver in &self.inner.drivers {
            for desc in driver.enumerate() {
                if seen == index {
                    let accel = Accelerator::from_parts(Arc::clone(driver), desc);
                    self.register(&accel);
                    return Ok(accel);
                }
                seen += 1;
            }
        }
        Err(DeviceError::Unavailable {
            device: format!("device index {}", index),
        }
        .into())
    }

    /// Accelerators created from this context that are still alive.
    pub fn live_accelerators(&self) -> Vec<Accelerator> {
        let mut accels = self.inner.accels.lock().unwrap();
        accels.retain(|w| w.upgrade().is_some());
        accels.iter().filter_map(|w| w.upgrade()).collect()
    }

    fn register(&self, accel: &Accelerator) {
        let mut accels = self.inner.accels.lock().unwrap();
        accels.retain(|w| w.upgrade().is_some());
        accels.push(accel.downgrade());
    }

    /// The shared kernel cache.
    pub fn cache(&self) -> &KernelCache {
        &self.inner.cache
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// The scheduling policy used when a caller supplies none.
    pub fn default_policy(&self) -> SchedulingPolicy {
        self.inner
            .config
            .default_policy
            .unwrap_or(SchedulingPolicy::PerformanceOptimized)
    }

    /// Compiles `module` for `caps` through the cache.
    pub fn compile(&self, module: &Module, caps: &TargetCaps) -> UclResult<Arc<Artifact>> {
        self.inner.cache.get_or_compile(module, caps)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("drivers", &self.inner.drivers.len())
            .field("cached_artifacts", &self.inner.cache.len())
            .finish()
    }
}

/// A builder for [`Context`].
#[must_use = "builders do nothing unless '::build' is called"]
#[derive(Default)]
pub struct ContextBuilder {
    drivers: Vec<Arc<dyn Driver>>,
    cache_budget: Option<usize>,
    disk_dir: Option<PathBuf>,
    ignore_env: bool,
}

impl ContextBuilder {
    pub fn new() -> ContextBuilder {
        ContextBuilder::default()
    }

    /// Registers an additional driver. Without any, the host driver is
    /// registered automatically.
    pub fn driver(mut self, driver: Arc<dyn Driver>) -> ContextBuilder {
        self.drivers.push(driver);
        self
    }

    /// Overrides the in-memory cache byte budget.
    pub fn cache_budget(mut self, bytes: usize) -> ContextBuilder {
        self.cache_budget = Some(bytes);
        self
    }

    /// Enables the disk cache layer at `dir`.
    pub fn disk_cache<P: Into<PathBuf>>(mut self, dir: P) -> ContextBuilder {
        self.disk_dir = Some(dir.into());
        self
    }

    /// Skips environment configuration, for hermetic tests.
    pub fn ignore_env(mut self) -> ContextBuilder {
        self.ignore_env = true;
        self
    }

    pub fn build(self) -> UclResult<Context> {
        let config = if self.ignore_env {
            RuntimeConfig::default()
        } else {
            RuntimeConfig::from_env()
        };

        let mut drivers = self.drivers;
        if drivers.is_empty() {
            drivers.push(Arc::new(HostDriver::new()) as Arc<dyn Driver>);
        }
        drivers.retain(|d| config.backend_enabled(d.backend()));

        let budget = self
            .cache_budget
            .or(config.cache_bytes)
            .unwrap_or(256 * 1024 * 1024);
        let mut cache = KernelCache::new(budget);
        if let Some(dir) = self.disk_dir.clone().or_else(|| config.cache_dir.clone()) {
            cache = cache.with_disk(dir);
        }

        Ok(Context {
            inner: Arc::new(ContextInner {
                drivers,
                cache,
                config,
                accels: Mutex::new(Vec::new()),
            }),
        })
    }
}
