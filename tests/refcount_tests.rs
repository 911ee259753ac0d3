//! Integration tests for pipe lifetimes.
//!
//! These tests verify that:
//! - Ready and Dead are thrown once each
//! - A dead pipe refuses input and commands
//! - Bins release their inner pipes before they die

mod common;

use sluice::attr::{AttributeRefManager, flow};
use sluice::error::Error;
use sluice::pipe::PipeManager;
use sluice::pipe::bin::LinearBinManager;
use sluice::pipes::{CaptureManager, IdentityManager, NullManager};
use sluice::probe::{Event, FnProbe, Probe};
use sluice::refcount::{Handle, Lifecycle, RefCount};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct Tracked {
    refcount: RefCount,
    no_refs: Arc<AtomicUsize>,
}

impl Lifecycle for Tracked {
    fn refcount(&self) -> &RefCount {
        &self.refcount
    }

    fn no_ref(self: Arc<Self>) {
        self.no_refs.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_no_ref_runs_once_and_real_outlives_usage() {
    let no_refs = Arc::new(AtomicUsize::new(0));
    let handle = Handle::new(Arc::new(Tracked {
        refcount: RefCount::new(),
        no_refs: Arc::clone(&no_refs),
    }));
    let clones: Vec<_> = (0..4).map(|_| handle.clone()).collect();
    let real = Arc::clone(handle.real());
    assert_eq!(real.refcount().count(), 5);

    drop(clones);
    assert_eq!(no_refs.load(Ordering::SeqCst), 0);
    drop(handle);
    assert_eq!(no_refs.load(Ordering::SeqCst), 1);

    // still allocated, but no new usage can be taken
    assert!(real.refcount().is_dead());
    assert!(Handle::upgrade(&real).is_none());
    assert_eq!(no_refs.load(Ordering::SeqCst), 1);
}

#[test]
fn test_ready_and_dead_thrown_once() {
    common::init_tracing();
    let (probe, events) = common::recorder(Probe::end());
    let pipe = IdentityManager::new().alloc(probe).unwrap();
    let other = pipe.clone();
    drop(pipe);
    assert_eq!(common::count(&events, "identity", "dead"), 0);
    drop(other);
    assert_eq!(common::count(&events, "identity", "ready"), 1);
    assert_eq!(common::count(&events, "identity", "dead"), 1);
}

#[test]
fn test_dead_pipe_refuses_input_and_commands() {
    let urefs = AttributeRefManager::new();
    let null = NullManager::new();
    let pipe = null.alloc(Probe::end()).unwrap();
    let real = Arc::clone(pipe.real());
    drop(pipe);

    assert!(real.is_dead());
    real.input(urefs.alloc(), None);
    assert_eq!(null.count(), 0);
    assert!(matches!(
        real.set_flow_def(&flow::alloc_def(&urefs, "void.")),
        Err(Error::Invalid(_))
    ));
}

#[test]
fn test_bin_releases_inner_pipes_before_dying() {
    common::init_tracing();
    let mgr = LinearBinManager::new()
        .stage("one", Arc::new(IdentityManager::new()))
        .stage("two", Arc::new(IdentityManager::new()))
        .stage("three", Arc::new(IdentityManager::new()));

    let inner_weaks = Arc::new(Mutex::new(Vec::new()));
    let inner_gone_at_dead = Arc::new(AtomicBool::new(false));
    let (weaks, gone) = (Arc::clone(&inner_weaks), Arc::clone(&inner_gone_at_dead));
    let probe = Probe::end().push(FnProbe::new(move |_, event| {
        if matches!(event, Event::Dead) {
            let weaks: &Vec<sluice::pipe::PipeWeak> = &weaks.lock().unwrap();
            gone.store(
                weaks.iter().all(|w| w.upgrade_handle().is_none()),
                Ordering::SeqCst,
            );
        }
        Err(Error::Unhandled)
    }));
    let bin = mgr.alloc(probe).unwrap();
    let (capture, _handle) = CaptureManager::new().alloc_capture(Probe::end()).unwrap();
    bin.set_output(&capture).unwrap();

    {
        let mut weaks = inner_weaks.lock().unwrap();
        let mut cursor = bin.bin_first_inner().unwrap();
        while let Some(inner) = cursor {
            if inner.signature() != sluice::pipes::IDENTITY_SIGNATURE {
                break;
            }
            weaks.push(inner.weak());
            cursor = inner.get_output().unwrap();
        }
        assert_eq!(weaks.len(), 3);
    }

    drop(bin);
    assert!(inner_gone_at_dead.load(Ordering::SeqCst));
    // the output was only borrowed
    assert!(!capture.is_dead());
}
