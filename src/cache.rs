//! Content-addressed storage of compiled kernel artifacts.
//!
//! The cache maps a [`Fingerprint`], module content hash, backend tag,
//! capability descriptor and pass-pipeline id, to an immutable
//! [`Artifact`]. At most one compilation runs per fingerprint at a time:
//! concurrent requests for the same fingerprint block on the first
//! compiler's latch and share its result, which also gives every launch
//! a compile-happens-before edge. The index lock covers index updates
//! only, never a compilation.
//!
//! Entries are evicted least-recently-used against a byte budget; an
//! entry referenced by any kernel (observable through its artifact's
//! reference count) is never evicted. An optional disk layer persists
//! text-form artifacts under `<fingerprint>.<backend-tag>`; missing or
//! corrupt entries are silently recompiled.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

use serde::{Deserialize, Serialize};

use crate::backend::{
    self, Artifact, ArtifactBody, BackendKind, EntryMeta, Fingerprint, TargetCaps,
};
use crate::error::Result as UclResult;
use crate::ir::Module;

const DEFAULT_BUDGET: usize = 256 * 1024 * 1024;

/// Environment variable naming the disk-cache directory.
pub const ENV_CACHE_DIR: &str = "UCL_CACHE_DIR";
/// Environment variable overriding the in-memory byte budget.
pub const ENV_CACHE_BYTES: &str = "UCL_CACHE_BYTES";

struct Entry {
    artifact: Arc<Artifact>,
    last_use: u64,
    bytes: usize,
}

struct Index {
    map: HashMap<Fingerprint, Entry>,
    tick: u64,
    total: usize,
    budget: usize,
}

impl Index {
    /// Evicts least-recently-used entries until the budget holds.
    /// In-use entries (any outside reference to the artifact) survive.
    fn evict_to_budget(&mut self) {
        while self.total > self.budget {
            let victim = self
                .map
                .iter()
                .filter(|(_, e)| Arc::strong_count(&e.artifact) == 1)
                .min_by_key(|(_, e)| e.last_use)
                .map(|(&fp, _)| fp);
            match victim {
                Some(fp) => {
                    if let Some(entry) = self.map.remove(&fp) {
                        self.total -= entry.bytes;
                        #[cfg(feature = "cache_debug_print")]
                        println!("##### cache evict {}", fp);
                        log::debug!("kernel cache: evicted {} ({} bytes)", fp, entry.bytes);
                    }
                }
                None => break,
            }
        }
    }
}

struct Latch {
    slot: Mutex<Option<UclResult<Arc<Artifact>>>>,
    cond: Condvar,
}

impl Latch {
    fn new() -> Latch {
        Latch {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    fn wait(&self) -> UclResult<Arc<Artifact>> {
        let mut slot = self.slot.lock().unwrap();
        while slot.is_none() {
            slot = self.cond.wait(slot).unwrap();
        }
        slot.as_ref().unwrap().clone()
    }

    fn set(&self, result: UclResult<Arc<Artifact>>) {
        *self.slot.lock().unwrap() = Some(result);
        self.cond.notify_all();
    }
}

/// The kernel cache.
pub struct KernelCache {
    index: Mutex<Index>,
    inflight: Mutex<HashMap<Fingerprint, Arc<Latch>>>,
    disk: Option<DiskCache>,
}

impl KernelCache {
    pub fn new(budget: usize) -> KernelCache {
        KernelCache {
            index: Mutex::new(Index {
                map: HashMap::new(),
                tick: 0,
                total: 0,
                budget,
            }),
            inflight: Mutex::new(HashMap::new()),
            disk: None,
        }
    }

    /// A cache configured from the recognized environment variables;
    /// unknown variables are ignored.
    pub fn from_env() -> KernelCache {
        let budget = std::env::var(ENV_CACHE_BYTES)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_BUDGET);
        let mut cache = KernelCache::new(budget);
        if let Ok(dir) = std::env::var(ENV_CACHE_DIR) {
            if !dir.is_empty() {
                cache = cache.with_disk(PathBuf::from(dir));
            }
        }
        cache
    }

    /// Attaches a disk persistence layer rooted at `dir`.
    pub fn with_disk(mut self, dir: PathBuf) -> KernelCache {
        match DiskCache::open(&dir) {
            Ok(disk) => self.disk = Some(disk),
            Err(err) => {
                // Cache failures are never fatal; run without the disk
                // layer.
                log::warn!("disk cache at {} unusable: {}", dir.display(), err);
            }
        }
        self
    }

    pub fn len(&self) -> usize {
        self.index.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.index.lock().unwrap().total
    }

    pub fn budget(&self) -> usize {
        self.index.lock().unwrap().budget
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.index.lock().unwrap().map.contains_key(fingerprint)
    }

    /// Looks up an already-compiled artifact by fingerprint, touching
    /// its recency.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<Artifact>> {
        let mut index = self.index.lock().unwrap();
        index.tick += 1;
        let tick = index.tick;
        index.map.get_mut(fingerprint).map(|entry| {
            entry.last_use = tick;
            Arc::clone(&entry.artifact)
        })
    }

    /// Compiles `module` for `caps` through the cache.
    pub fn get_or_compile(
        &self,
        module: &Module,
        caps: &TargetCaps,
    ) -> UclResult<Arc<Artifact>> {
        let fingerprint = Fingerprint::compute(module, caps);
        self.get_or_compile_with(fingerprint, || backend::compile(module, caps))
    }

    /// Looks up `fingerprint`, running `compile` on a miss.
    ///
    /// At most one caller executes `compile` per fingerprint at a time;
    /// concurrent callers block and share the first caller's result.
    pub fn get_or_compile_with(
        &self,
        fingerprint: Fingerprint,
        compile: impl FnOnce() -> UclResult<Artifact>,
    ) -> UclResult<Arc<Artifact>> {
        // Hit path.
        {
            let mut index = self.index.lock().unwrap();
            index.tick += 1;
            let tick = index.tick;
            if let Some(entry) = index.map.get_mut(&fingerprint) {
                entry.last_use = tick;
                log::trace!("kernel cache: hit {}", fingerprint);
                return Ok(Arc::clone(&entry.artifact));
            }
        }

        // Miss: either wait on the in-flight compiler or become it.
        let latch = {
            let mut inflight = self.inflight.lock().unwrap();
            match inflight.get(&fingerprint) {
                Some(latch) => {
                    let latch = Arc::clone(latch);
                    drop(inflight);
                    log::trace!("kernel cache: waiting on in-flight {}", fingerprint);
                    return latch.wait();
                }
                None => {
                    let latch = Arc::new(Latch::new());
                    inflight.insert(fingerprint, Arc::clone(&latch));
                    latch
                }
            }
        };

        // This thread owns the compilation; no cache lock is held.
        let compiled = match self.disk.as_ref().and_then(|d| d.load(&fingerprint)) {
            Some(artifact) => {
                log::debug!("kernel cache: disk hit {}", fingerprint);
                Ok(artifact)
            }
            None => compile().map(Arc::new),
        };
        let result = compiled;

        if let Ok(ref artifact) = result {
            let bytes = artifact.size_bytes();
            {
                let mut index = self.index.lock().unwrap();
                index.tick += 1;
                let tick = index.tick;
                index.map.insert(
                    fingerprint,
                    Entry {
                        artifact: Arc::clone(artifact),
                        last_use: tick,
                        bytes,
                    },
                );
                index.total += bytes;
                index.evict_to_budget();
                #[cfg(feature = "cache_debug_print")]
                println!("##### cache insert {} ({} bytes)", fingerprint, bytes);
            }
            if let Some(disk) = self.disk.as_ref() {
                if let Err(err) = disk.store(artifact) {
                    log::warn!("disk cache store of {} failed: {}", fingerprint, err);
                }
            }
        }

        latch.set(result.clone());
        self.inflight.lock().unwrap().remove(&fingerprint);
        result
    }
}

impl Default for KernelCache {
    fn default() -> KernelCache {
        KernelCache::new(DEFAULT_BUDGET)
    }
}

//=============================================================================
//=============================== DISK LAYER ==================================
//=============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct DiskRecord {
    backend: BackendKind,
    body_kind: String,
    requires_bits: u32,
    min_compute: (u16, u16),
    entries: Vec<EntryMeta>,
}

struct DiskCache {
    dir: PathBuf,
    records: Mutex<HashMap<String, DiskRecord>>,
}

impl DiskCache {
    fn open(dir: &Path) -> std::io::Result<DiskCache> {
        std::fs::create_dir_all(dir)?;
        let index_path = dir.join("index.json");
        let records = match std::fs::read(&index_path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                log::debug!("disk cache index corrupt, starting fresh: {}", err);
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        Ok(DiskCache {
            dir: dir.to_owned(),
            records: Mutex::new(records),
        })
    }

    fn body_path(&self, fingerprint: &Fingerprint, backend: BackendKind) -> PathBuf {
        self.dir
            .join(format!("{}.{}", fingerprint.to_hex(), backend.tag()))
    }

    fn load(&self, fingerprint: &Fingerprint) -> Option<Arc<Artifact>> {
        let records = self.records.lock().unwrap();
        let record = records.get(&fingerprint.to_hex())?;
        let bytes = std::fs::read(self.body_path(fingerprint, record.backend)).ok()?;
        let body = match record.body_kind.as_str() {
            "ptx-text" => ArtifactBody::PtxText(String::from_utf8(bytes).ok()?),
            "ocl-c" => ArtifactBody::OpenClC(String::from_utf8(bytes).ok()?),
            "spirv" => {
                if bytes.len() % 4 != 0 {
                    return None;
                }
                ArtifactBody::SpirV(
                    bytes
                        .chunks(4)
                        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                        .collect(),
                )
            }
            _ => return None,
        };
        Some(Arc::new(Artifact {
            backend: record.backend,
            fingerprint: *fingerprint,
            body,
            requires: crate::backend::DeviceFeatures::from_bits_truncate(record.requires_bits),
            min_compute: record.min_compute,
            entries: record.entries.clone(),
        }))
    }

    fn store(&self, artifact: &Arc<Artifact>) -> std::io::Result<()> {
        let (body_kind, bytes): (&str, Vec<u8>) = match artifact.body {
            // Host images are process memory; they never persist.
            ArtifactBody::Host(_) => {
                log::debug!(
                    "disk cache: skipping host artifact {}",
                    artifact.fingerprint
                );
                return Ok(());
            }
            ArtifactBody::PtxText(ref s) => ("ptx-text", s.as_bytes().to_vec()),
            ArtifactBody::OpenClC(ref s) => ("ocl-c", s.as_bytes().to_vec()),
            ArtifactBody::SpirV(ref words) => (
                "spirv",
                words.iter().flat_map(|w| w.to_le_bytes()).collect(),
            ),
        };
        std::fs::write(
            self.body_path(&artifact.fingerprint, artifact.backend),
            &bytes,
        )?;

        let mut records = self.records.lock().unwrap();
        records.insert(
            artifact.fingerprint.to_hex(),
            DiskRecord {
                backend: artifact.backend,
                body_kind: body_kind.to_owned(),
                requires_bits: artifact.requires.bits(),
                min_compute: artifact.min_compute,
                entries: artifact.entries.clone(),
            },
        );
        let serialized = serde_json::to_vec_pretty(&*records)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(self.dir.join("index.json"), serialized)
    }
}
