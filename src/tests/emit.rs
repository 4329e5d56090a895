//! Structural checks over the PTX, OpenCL C and SPIR-V emitters.

use crate::backend::{
    self, ArtifactBody, Backend, BackendKind, ClFlavor, DeviceFeatures, OpenClBackend,
    TargetCaps,
};

use super::{cas_module, shuffle_module, vector_add_module};

fn ptx_text(module: &crate::ir::Module, caps: &TargetCaps) -> String {
    match backend::compile(module, caps).unwrap().body {
        ArtifactBody::PtxText(text) => text,
        other => panic!("expected PTX text, got {:?}", other),
    }
}

#[test]
fn ptx_structure_for_vector_add() {
    let caps = TargetCaps::sm(7, 0);
    let text = ptx_text(&vector_add_module(), &caps);

    assert!(text.contains(".version 7.0"));
    assert!(text.contains(".target sm_70"));
    assert!(text.contains(".visible .entry vadd("));
    // Loads and stores carry their space decoration.
    assert!(text.contains("ld.global.f32"));
    assert!(text.contains("st.global.f32"));
    // Buffer params convert to global pointers.
    assert!(text.contains("cvta.to.global.u64"));
    assert!(text.contains("ret;"));
}

#[test]
fn ptx_atomics_and_warp_ops() {
    let caps = TargetCaps::sm(7, 0);
    let cas = ptx_text(&cas_module(), &caps);
    assert!(cas.contains("atom.global.cas.b32"));

    let shfl = ptx_text(&shuffle_module(), &caps);
    assert!(shfl.contains("shfl.sync.idx.b32"));
    assert!(shfl.contains("%laneid"));
}

#[test]
fn opencl_c_structure() {
    let caps = TargetCaps::opencl(2, 0);
    let artifact = backend::compile(&vector_add_module(), &caps).unwrap();
    let text = match artifact.body {
        ArtifactBody::OpenClC(text) => text,
        other => panic!("expected OpenCL C, got {:?}", other),
    };

    assert!(text.contains("__kernel void vadd("));
    assert!(text.contains("__global float* p0"));
    assert!(text.contains("get_global_id(0)"));
    assert_eq!(artifact.backend, BackendKind::OpenCl);
}

#[test]
fn opencl_subgroups_require_capability() {
    // Shuffle needs sub-groups: OpenCL 1.2 lacks them.
    let old = TargetCaps::opencl(1, 2);
    let err = backend::compile(&shuffle_module(), &old).unwrap_err();
    assert!(matches!(err, crate::Error::Compilation(_)), "{}", err);

    let modern = TargetCaps::opencl(2, 0);
    let text = match backend::compile(&shuffle_module(), &modern).unwrap().body {
        ArtifactBody::OpenClC(text) => text,
        other => panic!("expected OpenCL C, got {:?}", other),
    };
    assert!(text.contains("sub_group_shuffle"));
}

#[test]
fn spirv_module_shape() {
    let caps = TargetCaps::opencl(2, 1);
    assert!(caps.features.contains(DeviceFeatures::SPIRV));
    let lowered = {
        let mut module = vector_add_module();
        module.reopen();
        crate::pass::run_pipeline(&mut module, &caps).unwrap();
        module
    };
    let backend = OpenClBackend::new(ClFlavor::SpirV);
    let artifact = backend.lower(&lowered, &caps).unwrap();
    let words = match artifact.body {
        ArtifactBody::SpirV(words) => words,
        other => panic!("expected SPIR-V, got {:?}", other),
    };

    assert_eq!(words[0], 0x0723_0203, "magic number");
    assert!(words[3] > 1, "id bound populated");
    assert!(artifact.requires.contains(DeviceFeatures::SPIRV));
    // Word-count/opcode packing of the first instruction past the
    // header must be plausible.
    let first = words[5];
    assert!(first >> 16 >= 1);
}

#[test]
fn spirv_flavor_requires_spirv_devices() {
    let caps = TargetCaps::opencl(1, 2);
    let backend = OpenClBackend::new(ClFlavor::SpirV);
    let module = vector_add_module();
    assert!(backend.lower(&module, &caps).is_err());
}

// Identical modules, identical capability descriptors: identical text.
#[test]
fn emission_is_deterministic() {
    let caps = TargetCaps::sm(7, 5);
    let a = ptx_text(&vector_add_module(), &caps);
    let b = ptx_text(&vector_add_module(), &caps);
    assert_eq!(a, b);
}
