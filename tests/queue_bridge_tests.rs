//! Integration tests for the queue bridge between two event loops.
//!
//! These tests verify that:
//! - A producer faster than its queue is blocked, not dropped, and every ref
//!   comes out in order on the other loop
//! - Request answers cross back to the loop that registered the request
//! - Releasing a pipeline while a request waits on the other side is safe
//! - Releasing the sink ends the source once queued refs are out

mod common;

use sluice::attr::{AttributeRefManager, flow};
use sluice::pipe::PipeManager;
use sluice::pipe::bin::LinearBinManager;
use sluice::pipes::{CaptureConfig, CaptureManager, CaptureHandle, IdentityManager};
use sluice::probe::{Probe, PumpManagerProbe};
use sluice::pump::{LoopConfig, PumpManager};
use sluice::queue::{QueueConfig, QueueSinkManager, QueueSourceManager, source_length};
use sluice::request::{Provision, Request};
use sluice::{Error, pipe::Pipe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const STEP: Duration = Duration::from_millis(10);
const LIMIT: Duration = Duration::from_secs(20);

fn event_loop(name: &str) -> PumpManager {
    PumpManager::new(LoopConfig::with_name(name)).unwrap()
}

/// A queue source on `downstream` feeding a capture.
fn source_to_capture(
    downstream: &PumpManager,
    length: usize,
    capture: CaptureManager,
) -> (Pipe, Pipe, CaptureHandle, common::Recorded) {
    let (probe, events) =
        common::recorder(Probe::end().push(PumpManagerProbe::new(downstream.clone())));
    let qsrc = QueueSourceManager::new(QueueConfig::with_length(length).with_name("bridge"))
        .alloc(probe)
        .unwrap();
    let (sink, handle) = capture.alloc_capture(Probe::end()).unwrap();
    qsrc.set_output(&sink).unwrap();
    (qsrc, sink, handle, events)
}

#[test]
fn test_backpressure_without_loss() {
    common::init_tracing();
    const TOTAL: u64 = 2000;
    let urefs = AttributeRefManager::new();
    let upstream = event_loop("upstream");
    let downstream = event_loop("downstream");

    let (qsrc, _capture, captured, src_events) =
        source_to_capture(&downstream, 100, CaptureManager::new());
    let (probe, sink_events) =
        common::recorder(Probe::end().push(PumpManagerProbe::new(upstream.clone())));
    let qsink = QueueSinkManager::new().alloc_sink(probe, &qsrc).unwrap();
    qsink.set_flow_def(&flow::alloc_def(&urefs, "void.")).unwrap();

    let sent = Arc::new(AtomicU64::new(0));
    let producer = {
        let (sink, urefs, sent) = (qsink.clone(), Arc::clone(&urefs), Arc::clone(&sent));
        upstream.idler(move |pump| {
            let seq = sent.load(Ordering::Relaxed);
            if seq == TOTAL {
                pump.stop();
                return;
            }
            let mut uref = urefs.alloc();
            uref.set_unsigned("seq", seq);
            sent.store(seq + 1, Ordering::Relaxed);
            sink.input(uref, Some(pump));
        })
    };
    producer.start();

    // nobody reads yet: the producer fills the queue, then stalls
    common::spin_until(
        LIMIT,
        || {
            upstream.run_once(Some(STEP)).unwrap();
        },
        || common::count(&sink_events, "qsink", "stalled") > 0,
    );
    assert!(producer.is_blocked());
    assert_eq!(source_length(&qsrc).unwrap(), 100);
    let sent_while_stalled = sent.load(Ordering::Relaxed);
    upstream.run_once(Some(STEP)).unwrap();
    assert_eq!(sent.load(Ordering::Relaxed), sent_while_stalled);

    let consumer = {
        let (downstream, captured) = (downstream.clone(), captured.clone());
        thread::spawn(move || {
            let deadline = Instant::now() + LIMIT;
            while captured.len() < TOTAL as usize && Instant::now() < deadline {
                downstream.run_once(Some(STEP)).unwrap();
            }
        })
    };
    common::spin_until(
        LIMIT,
        || {
            upstream.run_once(Some(STEP)).unwrap();
        },
        || captured.len() == TOTAL as usize,
    );
    consumer.join().unwrap();

    let seqs: Vec<u64> = captured
        .refs()
        .iter()
        .map(|uref| uref.get_unsigned("seq").unwrap())
        .collect();
    assert_eq!(seqs, (0..TOTAL).collect::<Vec<_>>());
    assert!(!producer.is_blocked());
    assert_eq!(flow::def(&captured.flow_def().unwrap()), Some("void."));

    // teardown is queued behind the data and runs on the reading loop
    drop(producer);
    drop(qsink);
    drop(qsrc);
    common::spin_until(
        LIMIT,
        || {
            downstream.run_once(Some(STEP)).unwrap();
        },
        || common::count(&src_events, "qsrc", "dead") == 1,
    );
    assert_eq!(common::count(&src_events, "qsrc", "source_end"), 1);
}

#[test]
fn test_request_answer_runs_on_registering_loop() {
    common::init_tracing();
    let urefs = AttributeRefManager::new();
    let upstream = event_loop("upstream");
    let downstream = event_loop("downstream");
    let (qsrc, _capture, captured, _) = source_to_capture(
        &downstream,
        4,
        CaptureManager::with_config(CaptureConfig::default().with_deferred_requests()),
    );
    let qsink = QueueSinkManager::new()
        .alloc_sink(Probe::end().push(PumpManagerProbe::new(upstream.clone())), &qsrc)
        .unwrap();
    qsink.set_flow_def(&flow::alloc_def(&urefs, "void.")).unwrap();

    let answer = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&answer);
    let request = Request::sink_latency(move |provision| {
        *slot.lock().unwrap() = Some(provision);
        Ok(())
    });
    qsink.register_request(&request).unwrap();

    common::spin_until(
        LIMIT,
        || {
            downstream.run_once(Some(STEP)).unwrap();
        },
        || captured.pending_requests() == 1,
    );
    assert_eq!(captured.answer_pending(|_| Provision::SinkLatency(7)), 1);
    // answered downstream, not yet delivered
    assert!(answer.lock().unwrap().is_none());

    common::spin_until(
        LIMIT,
        || {
            upstream.run_once(Some(STEP)).unwrap();
        },
        || answer.lock().unwrap().is_some(),
    );
    assert!(matches!(
        answer.lock().unwrap().as_ref(),
        Some(Provision::SinkLatency(7))
    ));
    assert!(request.is_provided());
}

#[test]
fn test_release_with_pending_request_across_loops() {
    common::init_tracing();
    let urefs = AttributeRefManager::new();
    let upstream = event_loop("upstream");
    let downstream = event_loop("downstream");
    let (qsrc, _capture, captured, src_events) = source_to_capture(
        &downstream,
        8,
        CaptureManager::with_config(CaptureConfig::default().with_deferred_requests()),
    );
    let qsink = QueueSinkManager::new()
        .alloc_sink(Probe::end().push(PumpManagerProbe::new(upstream.clone())), &qsrc)
        .unwrap();

    let bin = LinearBinManager::new()
        .stage("one", Arc::new(IdentityManager::new()))
        .stage("two", Arc::new(IdentityManager::new()))
        .stage("three", Arc::new(IdentityManager::new()))
        .alloc(Probe::end())
        .unwrap();
    bin.set_output(&qsink).unwrap();
    bin.set_flow_def(&flow::alloc_def(&urefs, "void.")).unwrap();
    let qsink_weak = qsink.weak();
    drop(qsink);

    let answered = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&answered);
    let request = Request::sink_latency(move |_| {
        flag.store(true, Ordering::SeqCst);
        Ok(())
    });
    bin.register_request(&request).unwrap();
    common::spin_until(
        LIMIT,
        || {
            downstream.run_once(Some(STEP)).unwrap();
        },
        || captured.pending_requests() == 1,
    );

    // the whole upstream side goes away with the request still pending
    drop(bin);
    assert!(qsink_weak.upgrade_handle().is_none());

    // answering now reaches nobody
    assert_eq!(captured.answer_pending(|_| Provision::SinkLatency(3)), 1);
    for _ in 0..3 {
        upstream.run_once(Some(Duration::ZERO)).unwrap();
    }
    assert!(!answered.load(Ordering::SeqCst));

    common::spin_until(
        LIMIT,
        || {
            downstream.run_once(Some(STEP)).unwrap();
        },
        || common::count(&src_events, "qsrc", "source_end") == 1,
    );
    assert_eq!(captured.pending_requests(), 0);
    drop(qsrc);
    common::spin_until(
        LIMIT,
        || {
            downstream.run_once(Some(STEP)).unwrap();
        },
        || common::count(&src_events, "qsrc", "dead") == 1,
    );
}

#[test]
fn test_sink_release_ends_source_after_queued_refs() {
    common::init_tracing();
    let urefs = AttributeRefManager::new();
    let downstream = event_loop("downstream");
    let (qsrc, _capture, captured, src_events) =
        source_to_capture(&downstream, 8, CaptureManager::new());
    let qsink = QueueSinkManager::new().alloc_sink(Probe::end(), &qsrc).unwrap();
    qsink.set_flow_def(&flow::alloc_def(&urefs, "void.")).unwrap();
    for seq in 0..3 {
        let mut uref = urefs.alloc();
        uref.set_unsigned("seq", seq);
        qsink.input(uref, None);
    }
    drop(qsink);
    assert_eq!(common::count(&src_events, "qsrc", "source_end"), 0);

    common::spin_until(
        LIMIT,
        || {
            downstream.run_once(Some(STEP)).unwrap();
        },
        || common::count(&src_events, "qsrc", "source_end") == 1,
    );
    assert_eq!(captured.len(), 3);
    assert!(!qsrc.is_dead());
    assert!(matches!(
        QueueSinkManager::new().alloc_sink(Probe::end(), &qsrc),
        Err(Error::Busy(_))
    ));
}
