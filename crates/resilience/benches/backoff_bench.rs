use std::time::Duration;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use resilience::RetryPolicy;

fn bench_backoff(c: &mut Criterion) {
    let policy = RetryPolicy::new(5, Duration::from_millis(200), Duration::from_secs(2), 0.1);

    c.bench_function("backoff_for", |b| {
        b.iter(|| {
            for attempt in 1..=5u32 {
                black_box(policy.backoff_for(black_box(attempt)));
            }
        })
    });

    c.bench_function("delay_for_with_jitter", |b| {
        b.iter(|| {
            for attempt in 1..=5u32 {
                black_box(policy.delay_for(black_box(attempt)));
            }
        })
    });
}

criterion_group!(benches, bench_backoff);
criterion_main!(benches);
