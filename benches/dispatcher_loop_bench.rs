use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dispatch_core::config::ConfigBuilder;
use dispatch_core::dispatcher::Dispatcher;
use dispatch_core::policy::Fifo;
use dispatch_core::preempt::CooperativeChannel;
use dispatch_core::registry::{Classifier, Networker, PacketBatch};
use dispatch_core::slot::SlotTable;
use dispatch_core::stats::DispatchStats;
use dispatch_core::task::{Packet, RequestType};

struct RepeatingNetworker;

impl Networker for RepeatingNetworker {
    fn poll_batch(&mut self, max_batch: usize) -> PacketBatch {
        PacketBatch {
            packets: (0..max_batch).map(|_| (Packet::new(vec![0u8; 64]), 0)).collect(),
        }
    }
}

struct AlwaysSynthetic;

impl Classifier for AlwaysSynthetic {
    fn classify(&self, _packet: &Packet) -> Option<(RequestType, usize)> {
        Some((RequestType::Synthetic, 0))
    }
}

fn bench_dispatcher_iteration(c: &mut Criterion) {
    let config = Arc::new(
        ConfigBuilder::new()
            .num_workers(4)
            .classes(vec![1_000_000], vec![2_000])
            .build()
            .unwrap(),
    );
    let slots = Arc::new(SlotTable::new(4));
    let preempt = Arc::new(CooperativeChannel::new(4));
    let mut dispatcher = Dispatcher::new(config, slots, preempt, Box::new(Fifo), Arc::new(DispatchStats::new()));
    let mut networker = RepeatingNetworker;
    let classifier = AlwaysSynthetic;

    c.bench_function("dispatcher_run_once", |b| {
        b.iter(|| black_box(dispatcher.run_once(&mut networker, &classifier)));
    });
}

criterion_group!(benches, bench_dispatcher_iteration);
criterion_main!(benches);
