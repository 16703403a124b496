use criterion::{Criterion, black_box, criterion_group, criterion_main};
use meshlink_core::csma::backoff_delay;
use meshlink_core::{FrameList, LinkAddr, LinkConfig, LinkLayer, QueueId, Rdc, Timestamp, TxStatus};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::time::Duration;

#[derive(Default)]
struct AckingRdc {
    pending: Option<QueueId>,
}

impl Rdc for AckingRdc {
    fn send_list(&mut self, queue: QueueId, _frames: &dyn FrameList) {
        self.pending = Some(queue);
    }
}

fn bench_backoff_delay(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(1);
    let period = Duration::from_micros(320);

    c.bench_function("backoff_delay", |b| {
        b.iter(|| backoff_delay(&mut rng, black_box(3), black_box(4), period))
    });
}

/// One packet through send, backoff, transmit and completion
fn bench_send_complete(c: &mut Criterion) {
    let config = LinkConfig {
        rng_seed: Some(1),
        ..LinkConfig::default()
    };
    let mut layer = LinkLayer::new(config, AckingRdc::default()).unwrap();
    let dest = LinkAddr::from_short(2);
    let payload = [0x5A; 60];

    c.bench_function("send_complete_ok", |b| {
        b.iter(|| {
            layer.packetbuf_mut().copy_in(&payload);
            layer.send(black_box(dest), None).unwrap();
            layer.poll();
            if let Some(queue) = layer.rdc_mut().pending.take() {
                layer.rdc_completed(queue, TxStatus::Ok, 1);
            }
            layer.poll_report()
        })
    });
}

fn bench_retry_cycle(c: &mut Criterion) {
    let config = LinkConfig {
        rng_seed: Some(2),
        ..LinkConfig::default()
    };
    let mut layer = LinkLayer::new(config, AckingRdc::default()).unwrap();
    let dest = LinkAddr::from_short(3);

    c.bench_function("send_noack_until_drop", |b| {
        b.iter(|| {
            layer.packetbuf_mut().copy_in(b"retry");
            layer.send(dest, Some(4)).unwrap();
            let mut now = layer.now();
            while layer.poll_report().is_none() {
                now = now + Duration::from_millis(10);
                layer.advance_to(now);
                if let Some(queue) = layer.rdc_mut().pending.take() {
                    layer.rdc_completed(queue, TxStatus::NoAck, 1);
                }
            }
            black_box(layer.now() > Timestamp::ZERO)
        })
    });
}

criterion_group!(benches, bench_backoff_delay, bench_send_complete, bench_retry_cycle);
criterion_main!(benches);
