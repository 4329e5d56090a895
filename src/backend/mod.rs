//! Code-generation backends and their shared vocabulary: target
//! capability descriptors, compiled artifacts and fingerprints.
//!
//! Every backend implements [`Backend`]: it consumes a closed, lowered
//! module plus a [`TargetCaps`] and produces an [`Artifact`], an
//! immutable blob tagged with the backend, the source-module fingerprint
//! and the capability requirements the target must satisfy. Artifacts
//! also carry the ahead-of-time launch-argument marshaling tables for
//! each entry point, so the runtime never synthesizes code at launch
//! time.

pub mod cpu;
pub mod opencl;
pub mod ptx;
pub mod spirv;

pub use self::cpu::{CpuBackend, HostImage};
pub use self::opencl::{ClFlavor, OpenClBackend};
pub use self::ptx::PtxBackend;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result as UclResult;
use crate::ir::{Module, ParamLayout, ScalarKind, TensorPrecision};
use crate::pass;

/// An error arising anywhere in the compilation pipeline, from
/// verification through backend lowering.
///
/// Non-recoverable for the failing fingerprint; callers may retry with a
/// different capability descriptor.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CompilationError {
    #[error("verification failed after pass '{pass}': {detail}")]
    VerificationFailed { pass: String, detail: String },
    #[error("{backend}: opcode {op} in fn '{func}' is not supported by the target")]
    UnsupportedOpcode {
        backend: BackendKind,
        op: String,
        func: String,
    },
    #[error("{backend}: {detail}")]
    UnsupportedCapability {
        backend: BackendKind,
        detail: String,
    },
    #[error("{backend}: lowering failed: {detail}")]
    LoweringFailed {
        backend: BackendKind,
        detail: String,
    },
    #[error("{backend}: internal backend error: {detail}")]
    BackendInternal {
        backend: BackendKind,
        detail: String,
    },
}

/// Discriminates the code generator an artifact was produced by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    Cpu,
    Ptx,
    OpenCl,
}

impl BackendKind {
    /// Stable short tag, used in fingerprints and disk-cache file names.
    pub fn tag(self) -> &'static str {
        match self {
            BackendKind::Cpu => "cpu",
            BackendKind::Ptx => "ptx",
            BackendKind::OpenCl => "ocl",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.tag())
    }
}

bitflags::bitflags! {
    /// Capability bits a device exposes.
    pub struct DeviceFeatures: u32 {
        const TENSOR_CORES   = 1 << 0;
        const UNIFIED_MEMORY = 1 << 1;
        const MEMORY_POOLS   = 1 << 2;
        const FP16           = 1 << 3;
        const BF16           = 1 << 4;
        const TF32           = 1 << 5;
        const FP64           = 1 << 6;
        const WARP_SHUFFLE   = 1 << 7;
        const ATOMIC_64      = 1 << 8;
        const SUB_GROUPS     = 1 << 9;
        /// The device consumes SPIR-V modules rather than program source.
        const SPIRV          = 1 << 10;
        const PAGE_LOCKED    = 1 << 11;
    }
}

bitflags::bitflags! {
    /// Groups of IR opcodes a target can execute.
    pub struct OpSupport: u32 {
        const BASE    = 1 << 0;
        const ATOMICS = 1 << 1;
        const WARP    = 1 << 2;
        const TENSOR  = 1 << 3;
        const FLOAT64 = 1 << 4;
    }
}

/// The set of features one compilation target exposes: compute tier,
/// feature bits, geometric limits and supported opcode groups.
///
/// Consumed abstractly by the transform pipeline and the backends;
/// produced by device probes behind the [`Driver`](crate::Driver)
/// boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetCaps {
    pub backend: BackendKind,
    /// Compute tier: `(major, minor)`, SM version for PTX, platform
    /// version for OpenCL, unused for CPU.
    pub compute: (u16, u16),
    pub features: DeviceFeatures,
    pub warp_size: u32,
    /// Width of the widest SIMD register in bits (CPU lanes).
    pub simd_bits: u32,
    /// Inclusive per-axis maxima.
    pub max_grid: [u32; 3],
    pub max_group: [u32; 3],
    /// Shared-memory ceiling per group in bytes.
    pub max_shared: u32,
    pub ops: OpSupport,
}

impl TargetCaps {
    /// A host-CPU target with lanes sized from 256-bit vectors.
    pub fn host() -> TargetCaps {
        TargetCaps {
            backend: BackendKind::Cpu,
            compute: (0, 0),
            features: DeviceFeatures::UNIFIED_MEMORY
                | DeviceFeatures::FP64
                | DeviceFeatures::ATOMIC_64
                | DeviceFeatures::WARP_SHUFFLE
                | DeviceFeatures::PAGE_LOCKED,
            warp_size: 32,
            simd_bits: 256,
            max_grid: [u32::MAX, 65_535, 65_535],
            max_group: [1024, 1024, 64],
            max_shared: 64 * 1024,
            ops: OpSupport::BASE | OpSupport::ATOMICS | OpSupport::WARP | OpSupport::TENSOR
                | OpSupport::FLOAT64,
        }
    }

    /// A CUDA target for the given SM version.
    pub fn sm(major: u16, minor: u16) -> TargetCaps {
        let mut features = DeviceFeatures::FP16
            | DeviceFeatures::FP64
            | DeviceFeatures::WARP_SHUFFLE
            | DeviceFeatures::ATOMIC_64;
        if (major, minor) >= (7, 0) {
            features |= DeviceFeatures::TENSOR_CORES;
        }
        if (major, minor) >= (8, 0) {
            features |= DeviceFeatures::BF16 | DeviceFeatures::TF32 | DeviceFeatures::MEMORY_POOLS;
        }
        TargetCaps {
            backend: BackendKind::Ptx,
            compute: (major, minor),
            features,
            warp_size: 32,
            simd_bits: 0,
            max_grid: [2_147_483_647, 65_535, 65_535],
            max_group: [1024, 1024, 64],
            max_shared: 48 * 1024,
            ops: OpSupport::BASE | OpSupport::ATOMICS | OpSupport::WARP | OpSupport::TENSOR
                | OpSupport::FLOAT64,
        }
    }

    /// An OpenCL target for the given platform version.
    pub fn opencl(major: u16, minor: u16) -> TargetCaps {
        let mut features = DeviceFeatures::FP16;
        if (major, minor) >= (2, 0) {
            features |= DeviceFeatures::ATOMIC_64 | DeviceFeatures::SUB_GROUPS;
        }
        if (major, minor) >= (2, 1) {
            features |= DeviceFeatures::SPIRV;
        }
        TargetCaps {
            backend: BackendKind::OpenCl,
            compute: (major, minor),
            features,
            warp_size: 32,
            simd_bits: 0,
            max_grid: [u32::MAX, u32::MAX, u32::MAX],
            max_group: [256, 256, 256],
            max_shared: 32 * 1024,
            ops: OpSupport::BASE | OpSupport::ATOMICS | OpSupport::WARP,
        }
    }

    /// Largest supported SIMD lane count for `kind`, at least 1.
    ///
    /// When multiple widths fit, the largest wins.
    pub fn max_simd_width(&self, kind: ScalarKind) -> u32 {
        if self.simd_bits == 0 {
            return 1;
        }
        (self.simd_bits / kind.bits().max(8)).max(1)
    }

    /// Whether the target executes tensor ops at `precision`.
    pub fn supports_precision(&self, precision: TensorPrecision) -> bool {
        if !self.features.contains(DeviceFeatures::TENSOR_CORES) {
            return false;
        }
        match precision {
            TensorPrecision::Fp16 => self.features.contains(DeviceFeatures::FP16),
            TensorPrecision::Bf16 => self.features.contains(DeviceFeatures::BF16),
            TensorPrecision::Tf32 => self.features.contains(DeviceFeatures::TF32),
            TensorPrecision::Fp32 => true,
        }
    }

    /// The smallest supported precision at or above `requested`, if any.
    pub fn pick_tensor_precision(
        &self,
        requested: TensorPrecision,
    ) -> Option<TensorPrecision> {
        [
            TensorPrecision::Fp16,
            TensorPrecision::Bf16,
            TensorPrecision::Tf32,
            TensorPrecision::Fp32,
        ]
        .into_iter()
        .filter(|&p| p >= requested)
        .find(|&p| self.supports_precision(p))
    }

    /// Deterministic encoding mixed into the cache fingerprint.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.backend.tag().as_bytes());
        out.extend_from_slice(&self.compute.0.to_le_bytes());
        out.extend_from_slice(&self.compute.1.to_le_bytes());
        out.extend_from_slice(&self.features.bits().to_le_bytes());
        out.extend_from_slice(&self.warp_size.to_le_bytes());
        out.extend_from_slice(&self.simd_bits.to_le_bytes());
        for v in self.max_grid.iter().chain(self.max_group.iter()) {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&self.max_shared.to_le_bytes());
        out.extend_from_slice(&self.ops.bits().to_le_bytes());
    }
}

/// Deterministic identifier of a (module, target, pipeline) triple; the
/// kernel-cache key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub [u8; 16]);

impl Fingerprint {
    /// Digest of the module content, the capability descriptor and the
    /// pass-pipeline identifier.
    pub fn compute(module: &Module, caps: &TargetCaps) -> Fingerprint {
        let mut bytes = module.encode_for_hash();
        caps.encode(&mut bytes);
        bytes.extend_from_slice(pass::PIPELINE_ID.as_bytes());
        Fingerprint(md5::compute(&bytes).0)
    }

    pub fn to_hex(self) -> String {
        let mut s = String::with_capacity(32);
        for b in self.0.iter() {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }

    /// Parses the hex form produced by [`to_hex`](Self::to_hex).
    pub fn from_hex(hex: &str) -> Option<Fingerprint> {
        if hex.len() != 32 {
            return None;
        }
        let mut out = [0u8; 16];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let s = std::str::from_utf8(chunk).ok()?;
            out[i] = u8::from_str_radix(s, 16).ok()?;
        }
        Some(Fingerprint(out))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Per-entry-point launch metadata carried by an artifact: the marshaling
/// table the runtime checks arguments against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryMeta {
    pub name: String,
    pub params: Vec<ParamLayout>,
    /// Static shared-memory requirement in bytes.
    pub shared_bytes: u32,
    /// Lane count chosen for CPU vector execution; 1 elsewhere.
    pub simd_width: u32,
}

/// The backend-specific payload of an artifact.
#[derive(Debug, Clone)]
pub enum ArtifactBody {
    /// Host-executable image in process memory.
    Host(HostImage),
    /// PTX assembly text.
    PtxText(String),
    /// OpenCL C program source.
    OpenClC(String),
    /// SPIR-V module words.
    SpirV(Vec<u32>),
}

impl ArtifactBody {
    /// Approximate resident size, used for the cache byte budget.
    pub fn size_bytes(&self) -> usize {
        match *self {
            ArtifactBody::Host(ref image) => image.size_bytes(),
            ArtifactBody::PtxText(ref s) | ArtifactBody::OpenClC(ref s) => s.len(),
            ArtifactBody::SpirV(ref words) => words.len() * 4,
        }
    }
}

/// The compiled, immutable output for one module on one target.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub backend: BackendKind,
    pub fingerprint: Fingerprint,
    pub body: ArtifactBody,
    /// Capability bits the executing device must have. Always a subset of
    /// the capability descriptor the artifact was lowered against.
    pub requires: DeviceFeatures,
    /// Minimum compute tier.
    pub min_compute: (u16, u16),
    pub entries: Vec<EntryMeta>,
}

impl Artifact {
    pub fn size_bytes(&self) -> usize {
        self.body.size_bytes() + self.entries.len() * std::mem::size_of::<EntryMeta>()
    }

    pub fn entry(&self, name: &str) -> Option<(usize, &EntryMeta)> {
        self.entries
            .iter()
            .enumerate()
            .find(|(_, e)| e.name == name)
    }

    /// Whether `caps` satisfies this artifact's requirements.
    pub fn requirements_met(&self, caps: &TargetCaps) -> bool {
        caps.backend == self.backend
            && caps.features.contains(self.requires)
            && caps.compute >= self.min_compute
    }
}

/// The capability set every code generator implements.
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// The default capability descriptor this backend lowers against when
    /// the caller supplies none.
    fn query_caps(&self) -> TargetCaps;

    /// Lowers a pipeline-processed module into an artifact.
    fn lower(&self, module: &Module, caps: &TargetCaps) -> Result<Artifact, CompilationError>;
}

/// Returns the backend serving `kind` with default settings.
pub fn backend_for(kind: BackendKind) -> Box<dyn Backend> {
    match kind {
        BackendKind::Cpu => Box::new(CpuBackend::new()),
        BackendKind::Ptx => Box::new(PtxBackend::new()),
        BackendKind::OpenCl => Box::new(OpenClBackend::new(ClFlavor::Source)),
    }
}

/// Compiles `module` for `caps`: clones it, runs the transform pipeline,
/// then lowers with the matching backend.
///
/// This is the uncached path; [`KernelCache::get_or_compile`]
/// (crate::KernelCache::get_or_compile) wraps it.
pub fn compile(module: &Module, caps: &TargetCaps) -> UclResult<Artifact> {
    assert!(
        module.is_closed(),
        "module '{}' must be closed before compilation",
        module.name
    );
    let fingerprint = Fingerprint::compute(module, caps);
    log::debug!(
        "compiling module '{}' for {} ({})",
        module.name,
        caps.backend,
        fingerprint
    );
    let mut lowered = module.clone();
    lowered.reopen();
    pass::run_pipeline(&mut lowered, caps)?;
    let backend = backend_for(caps.backend);
    let mut artifact = backend.lower(&lowered, caps)?;
    artifact.fingerprint = fingerprint;
    debug_assert!(
        caps.features.contains(artifact.requires),
        "artifact requires features its target lacks"
    );
    Ok(artifact)
}
