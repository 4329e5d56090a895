//! Kernel-cache contract: single compilation per fingerprint, artifact
//! reuse, fingerprint disjointness, eviction and disk persistence.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::backend::{self, BackendKind, Fingerprint, TargetCaps};
use crate::cache::KernelCache;
use crate::ir::{ModuleBuilder, ParamLayout, ScalarKind};

use super::vector_add_module;

// Second compilation returns the pointer-identical artifact without
// invoking the compile function.
#[test]
fn cache_reuse_is_pointer_equal() {
    let cache = KernelCache::default();
    let module = vector_add_module();
    let caps = TargetCaps::host();
    let fingerprint = Fingerprint::compute(&module, &caps);

    let calls = AtomicUsize::new(0);
    let first = cache
        .get_or_compile_with(fingerprint, || {
            calls.fetch_add(1, Ordering::SeqCst);
            backend::compile(&module, &caps)
        })
        .unwrap();
    let second = cache
        .get_or_compile_with(fingerprint, || {
            calls.fetch_add(1, Ordering::SeqCst);
            backend::compile(&module, &caps)
        })
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(Arc::ptr_eq(&first, &second));
}

// Distinct content hashes and distinct capability descriptors both
// produce distinct artifacts.
#[test]
fn fingerprints_are_disjoint() {
    let module_a = vector_add_module();
    let module_b = super::cas_module();
    let host = TargetCaps::host();
    let ptx70 = TargetCaps::sm(7, 0);
    let ptx80 = TargetCaps::sm(8, 0);

    assert_ne!(
        Fingerprint::compute(&module_a, &host),
        Fingerprint::compute(&module_b, &host)
    );
    assert_ne!(
        Fingerprint::compute(&module_a, &ptx70),
        Fingerprint::compute(&module_a, &ptx80)
    );
    assert_ne!(
        Fingerprint::compute(&module_a, &host),
        Fingerprint::compute(&module_a, &ptx70)
    );

    let cache = KernelCache::default();
    let a = cache.get_or_compile(&module_a, &ptx70).unwrap();
    let b = cache.get_or_compile(&module_a, &ptx80).unwrap();
    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(cache.len(), 2);
}

// Property: of N concurrent get-or-compile calls for one fingerprint,
// exactly one executes the compile function; the rest share its
// artifact.
#[test]
fn at_most_one_concurrent_compile() {
    let cache = Arc::new(KernelCache::default());
    let module = Arc::new(vector_add_module());
    let caps = TargetCaps::host();
    let fingerprint = Fingerprint::compute(&module, &caps);
    let calls = Arc::new(AtomicUsize::new(0));

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let module = Arc::clone(&module);
            let caps = caps.clone();
            let calls = Arc::clone(&calls);
            std::thread::spawn(move || {
                cache
                    .get_or_compile_with(fingerprint, || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        // Widen the race window.
                        std::thread::sleep(std::time::Duration::from_millis(20));
                        backend::compile(&module, &caps)
                    })
                    .unwrap()
            })
        })
        .collect();

    let artifacts: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for artifact in &artifacts[1..] {
        assert!(Arc::ptr_eq(&artifacts[0], artifact));
    }
}

fn tiny_module(name: &str) -> crate::ir::Module {
    let mut mb = ModuleBuilder::new(name);
    let u32t = mb.types().scalar(ScalarKind::U32);
    let ptr = {
        let t = mb.types();
        t.pointer(u32t, crate::ir::AddrSpace::Global)
    };
    let void = mb.types().void();
    let func = mb.declare_function(name, vec![ptr], void);
    {
        let mut fb = mb.function(func);
        let p = fb.param(0);
        let v = fb.const_u32(1);
        fb.store(p, v);
        fb.ret(None);
    }
    mb.add_entry_point(func, name, 1, vec![ParamLayout::buffer(ScalarKind::U32)], 0);
    mb.build()
}

#[test]
fn lru_eviction_respects_budget_and_pins() {
    // A budget small enough for roughly one artifact.
    let caps = TargetCaps::sm(7, 0);
    let first = backend::compile(&tiny_module("k0"), &caps).unwrap();
    let budget = first.size_bytes() + first.size_bytes() / 2;
    let cache = KernelCache::new(budget);

    let pinned = cache.get_or_compile(&tiny_module("k0"), &caps).unwrap();
    for i in 1..5 {
        let _ = cache.get_or_compile(&tiny_module(&format!("k{}", i)), &caps).unwrap();
    }
    // Everything unpinned may go, but the artifact we still hold must
    // survive every eviction round.
    assert!(cache.contains(&pinned.fingerprint));
    assert!(cache.total_bytes() >= pinned.size_bytes());
}

#[test]
fn disk_cache_round_trip_and_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let caps = TargetCaps::sm(7, 0);
    let module = tiny_module("disk");
    let fingerprint = Fingerprint::compute(&module, &caps);

    {
        let cache = KernelCache::new(1 << 20).with_disk(dir.path().to_owned());
        let artifact = cache.get_or_compile(&module, &caps).unwrap();
        assert_eq!(artifact.backend, BackendKind::Ptx);
    }

    // A fresh cache over the same directory loads from disk without
    // compiling.
    {
        let cache = KernelCache::new(1 << 20).with_disk(dir.path().to_owned());
        let loaded = cache
            .get_or_compile_with(fingerprint, || {
                panic!("disk hit expected; compile function invoked")
            })
            .unwrap();
        assert_eq!(loaded.fingerprint, fingerprint);
    }

    // Corrupt the body: the entry is silently recompiled.
    let body_path = dir
        .path()
        .join(format!("{}.{}", fingerprint.to_hex(), BackendKind::Ptx.tag()));
    std::fs::remove_file(&body_path).unwrap();
    {
        let cache = KernelCache::new(1 << 20).with_disk(dir.path().to_owned());
        let recompiled = cache.get_or_compile(&module, &caps).unwrap();
        assert_eq!(recompiled.fingerprint, fingerprint);
    }
}

// Host artifacts never persist; a fresh cache recompiles them.
#[test]
fn host_artifacts_stay_in_memory() {
    let dir = tempfile::tempdir().unwrap();
    let caps = TargetCaps::host();
    let module = tiny_module("hostonly");
    {
        let cache = KernelCache::new(1 << 20).with_disk(dir.path().to_owned());
        cache.get_or_compile(&module, &caps).unwrap();
    }
    let cache = KernelCache::new(1 << 20).with_disk(dir.path().to_owned());
    let calls = AtomicUsize::new(0);
    let fingerprint = Fingerprint::compute(&module, &caps);
    cache
        .get_or_compile_with(fingerprint, || {
            calls.fetch_add(1, Ordering::SeqCst);
            backend::compile(&module, &caps)
        })
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
