//! Queue bridge benchmarks.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use sluice::attr::{AttributeRefManager, flow};
use sluice::pipe::PipeManager;
use sluice::pipes::NullManager;
use sluice::probe::{Probe, PumpManagerProbe};
use sluice::pump::{LoopConfig, PumpManager};
use sluice::queue::{ControlQueue, Queue, QueueConfig, QueueSinkManager, QueueSourceManager};
use std::time::Duration;

fn bench_ring_push_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_push_pop");

    for length in [4usize, 64, 255] {
        let queue = Queue::new(length, "bench").expect("queue");
        group.throughput(Throughput::Elements(length as u64));
        group.bench_with_input(BenchmarkId::from_parameter(length), &queue, |b, queue| {
            b.iter(|| {
                for i in 0..queue.length() {
                    queue.try_push(i).expect("room");
                }
                while let Some(i) = queue.try_pop() {
                    std::hint::black_box(i);
                }
            });
        });
    }

    group.finish();
}

fn bench_control_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("control_queue");
    let queue = ControlQueue::new("bench").expect("queue");

    group.throughput(Throughput::Elements(32));
    group.bench_function("push_32_drain", |b| {
        b.iter(|| {
            for i in 0..32u32 {
                queue.push(i).expect("push");
            }
            std::hint::black_box(queue.drain().len());
        });
    });

    group.finish();
}

fn bench_bridge_single_thread(c: &mut Criterion) {
    let mut group = c.benchmark_group("bridge_single_thread");
    let urefs = AttributeRefManager::new();
    let event_loop = PumpManager::new(LoopConfig::with_name("bench")).expect("loop");
    let null = NullManager::new();

    let qsrc = QueueSourceManager::new(QueueConfig::with_length(255).with_name("bench"))
        .alloc(Probe::end().push(PumpManagerProbe::new(event_loop.clone())))
        .expect("qsrc");
    let output = null.alloc(Probe::end()).expect("null");
    qsrc.set_output(&output).expect("output");
    let qsink = QueueSinkManager::new()
        .alloc_sink(Probe::end(), &qsrc)
        .expect("qsink");
    qsink
        .set_flow_def(&flow::alloc_def(&urefs, "void."))
        .expect("flow def");

    group.throughput(Throughput::Elements(128));
    group.bench_function("128_refs", |b| {
        b.iter(|| {
            let target = null.count() + 128;
            for seq in 0..128 {
                let mut uref = urefs.alloc();
                uref.set_unsigned("seq", seq);
                qsink.input(uref, None);
            }
            while null.count() < target {
                event_loop
                    .run_once(Some(Duration::from_millis(1)))
                    .expect("loop");
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_ring_push_pop,
    bench_control_queue,
    bench_bridge_single_thread
);
criterion_main!(benches);
