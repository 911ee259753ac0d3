//! Integration tests for resource negotiation.
//!
//! These tests verify that:
//! - A buffer manager request travels downstream and is answered once
//! - A second request of the same kind is refused while one is pending
//! - Requests nobody can satisfy still resolve, as unavailable
//! - Probes answer requests that reach the end of a pipeline
//! - A flow the sink refuses is amended before the buffer manager is given

mod common;

use sluice::attr::{AttributeRef, AttributeRefManager, flow};
use sluice::buffer::{BufferManager, BufferSize, manager_for_flow_def};
use sluice::error::Error;
use sluice::memory::MemoryPool;
use sluice::pipe::PipeManager;
use sluice::pipes::{CaptureConfig, CaptureManager, IdentityManager, NullManager};
use sluice::probe::{BufferManagerProbe, FlowFormatProbe, Probe};
use sluice::request::{Provision, Request};
use std::sync::{Arc, Mutex};

fn sound_flow(urefs: &AttributeRefManager) -> AttributeRef {
    let mut def = flow::alloc_def(urefs, "sound.s16.");
    flow::set_rate(&mut def, 48_000);
    flow::set_channels(&mut def, 2);
    def
}

type Answers = Arc<Mutex<Vec<Provision>>>;

fn ubuf_request(flow_def: AttributeRef, answers: &Answers) -> Request {
    let answers = Arc::clone(answers);
    Request::ubuf_mgr(flow_def, move |provision| {
        answers.lock().unwrap().push(provision);
        Ok(())
    })
}

#[test]
fn test_ubuf_mgr_negotiated_once() {
    common::init_tracing();
    let urefs = AttributeRefManager::new();
    let pool = MemoryPool::default();

    // pipe A forwards requests; B, its output, decides later
    let a = IdentityManager::new().alloc(Probe::end()).unwrap();
    let (b, b_handle) = CaptureManager::with_config(CaptureConfig::default().with_deferred_requests())
        .alloc_capture(Probe::end())
        .unwrap();
    a.set_output(&b).unwrap();

    let answers: Answers = Arc::new(Mutex::new(Vec::new()));
    let first = ubuf_request(sound_flow(&urefs), &answers);
    a.register_request(&first).unwrap();
    assert_eq!(b_handle.pending_requests(), 1);

    let second = ubuf_request(sound_flow(&urefs), &answers);
    assert!(matches!(a.register_request(&second), Err(Error::Busy(_))));

    let answered = b_handle.answer_pending(|request| {
        let flow_def = request.query().expect("ubuf_mgr carries its flow");
        match manager_for_flow_def(&pool, flow_def) {
            Ok(manager) => Provision::UbufMgr {
                manager,
                flow_def: flow_def.duplicate(),
            },
            Err(_) => Provision::Unavailable,
        }
    });
    assert_eq!(answered, 1);
    assert!(first.is_provided());
    assert!(!second.is_provided());

    let answers = answers.lock().unwrap();
    assert_eq!(answers.len(), 1);
    let Provision::UbufMgr { manager, flow_def } = &answers[0] else {
        panic!("expected a buffer manager");
    };
    assert_eq!(flow::rate(flow_def), Some(48_000));
    manager.check(flow_def).unwrap();
    let buffer = manager.alloc(BufferSize::Sound(480)).unwrap();
    assert_eq!(buffer.sound_size().unwrap(), 480);

    // answered: the kind is free again
    drop(answers);
    a.register_request(&second).unwrap();
    assert_eq!(b_handle.pending_requests(), 1);
    b_handle.answer_pending(|_| Provision::Unavailable);
}

#[test]
fn test_request_answered_by_probe_at_pipeline_end() {
    let urefs = AttributeRefManager::new();
    let probe = Probe::end().push(BufferManagerProbe::new(MemoryPool::default()));
    let sink = NullManager::new().alloc(probe).unwrap();
    let answers: Answers = Arc::new(Mutex::new(Vec::new()));
    sink.register_request(&ubuf_request(sound_flow(&urefs), &answers))
        .unwrap();
    assert!(matches!(
        answers.lock().unwrap().as_slice(),
        [Provision::UbufMgr { .. }]
    ));
}

#[test]
fn test_unsatisfiable_request_resolves_unavailable() {
    let urefs = AttributeRefManager::new();
    let probe = Probe::end().push(BufferManagerProbe::new(MemoryPool::default()));
    let identity = IdentityManager::new().alloc(Probe::end()).unwrap();
    let sink = NullManager::new().alloc(probe).unwrap();
    identity.set_output(&sink).unwrap();

    let answers: Answers = Arc::new(Mutex::new(Vec::new()));
    let request = ubuf_request(flow::alloc_def(&urefs, "sound.s13."), &answers);
    identity.register_request(&request).unwrap();
    assert!(request.is_provided());
    assert!(answers.lock().unwrap()[0].is_unavailable());
    assert!(matches!(
        request.provide(Provision::Unavailable),
        Err(Error::Invalid(_))
    ));
}

#[test]
fn test_pending_request_moves_to_new_output() {
    let urefs = AttributeRefManager::new();
    let identity = IdentityManager::new().alloc(Probe::end()).unwrap();
    let answers: Answers = Arc::new(Mutex::new(Vec::new()));
    let request = ubuf_request(flow::alloc_def(&urefs, "block."), &answers);

    // no output and no probe able to answer: stays pending
    identity.register_request(&request).unwrap();
    assert!(!request.is_provided());

    let (sink, _) = CaptureManager::with_config(
        CaptureConfig::default().with_ubuf_mgr(manager_for_flow_def(
            &MemoryPool::default(),
            &flow::alloc_def(&urefs, "block."),
        )
        .unwrap()),
    )
    .alloc_capture(Probe::end())
    .unwrap();
    identity.set_output(&sink).unwrap();
    assert!(request.is_provided());
    let answers = answers.lock().unwrap();
    let Provision::UbufMgr { manager, .. } = &answers[0] else {
        panic!("expected a buffer manager");
    };
    assert!(manager.alloc(BufferSize::Block(64)).is_ok());
}

/// A capture allocating two-channel sound, with `probe`.
fn stereo_capture(
    urefs: &AttributeRefManager,
    probe: Probe,
) -> (sluice::pipe::Pipe, sluice::pipes::CaptureHandle) {
    let manager = manager_for_flow_def(&MemoryPool::default(), &sound_flow(urefs)).unwrap();
    CaptureManager::with_config(CaptureConfig::default().with_ubuf_mgr(manager))
        .alloc_capture(probe)
        .unwrap()
}

fn surround_flow(urefs: &AttributeRefManager) -> AttributeRef {
    let mut def = sound_flow(urefs);
    flow::set_channels(&mut def, 6);
    def
}

#[test]
fn test_refused_flow_is_amended_before_ubuf_mgr() {
    common::init_tracing();
    let urefs = AttributeRefManager::new();
    let downmix = FlowFormatProbe::new(|query| {
        let mut amended = query.duplicate();
        flow::set_channels(&mut amended, 2);
        Some(amended)
    });
    let (sink, captured) = stereo_capture(&urefs, Probe::end().push(downmix));
    let identity = IdentityManager::new().alloc(Probe::end()).unwrap();
    identity.set_output(&sink).unwrap();

    let answers: Answers = Arc::new(Mutex::new(Vec::new()));
    let request = ubuf_request(surround_flow(&urefs), &answers);
    identity.register_request(&request).unwrap();
    assert!(request.is_provided());

    let answers = answers.lock().unwrap();
    let Provision::UbufMgr { manager, flow_def } = &answers[0] else {
        panic!("expected a buffer manager");
    };
    assert_eq!(flow::channels(flow_def), Some(2));
    assert_eq!(flow::rate(flow_def), Some(48_000));

    // the requester switches to the agreed flow and its buffers go through
    identity.set_flow_def(flow_def).unwrap();
    let buffer = manager.alloc(BufferSize::Sound(480)).unwrap();
    identity.input(urefs.alloc_with_buffer(buffer), None);
    assert_eq!(captured.len(), 1);
    assert_eq!(flow::channels(&captured.flow_def().unwrap()), Some(2));
    assert!(!flow::has_error(&captured.refs()[0]));
}

#[test]
fn test_refused_flow_without_agreement_degrades() {
    common::init_tracing();
    let urefs = AttributeRefManager::new();
    // a format answer the sink still refuses
    let echo = FlowFormatProbe::new(|query| Some(query.duplicate()));
    let (sink, _captured) = stereo_capture(&urefs, Probe::end().push(echo));

    let answers: Answers = Arc::new(Mutex::new(Vec::new()));
    let request = ubuf_request(surround_flow(&urefs), &answers);
    sink.register_request(&request).unwrap();
    assert!(request.is_provided());
    assert!(answers.lock().unwrap()[0].is_unavailable());

    // nobody to agree with at all: same outcome
    let (sink, _captured) = stereo_capture(&urefs, Probe::end());
    let answers: Answers = Arc::new(Mutex::new(Vec::new()));
    let request = ubuf_request(surround_flow(&urefs), &answers);
    sink.register_request(&request).unwrap();
    assert!(answers.lock().unwrap()[0].is_unavailable());
}

#[test]
fn test_refused_flow_falls_back_to_other_provider() {
    let urefs = AttributeRefManager::new();
    // no format agreed, but a probe further up has a matching manager
    let probe = Probe::end().push(BufferManagerProbe::new(MemoryPool::default()));
    let (sink, _captured) = stereo_capture(&urefs, probe);
    let answers: Answers = Arc::new(Mutex::new(Vec::new()));
    let request = ubuf_request(surround_flow(&urefs), &answers);
    sink.register_request(&request).unwrap();

    let answers = answers.lock().unwrap();
    let Provision::UbufMgr { manager, flow_def } = &answers[0] else {
        panic!("expected a buffer manager");
    };
    assert_eq!(flow::channels(flow_def), Some(6));
    manager.check(flow_def).unwrap();
}
