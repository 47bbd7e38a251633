//! Benchmarks for retry delay computation.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tickerflow::pipeline::{BackoffStrategy, JitterStrategy, RetryPolicy};

fn retry_benchmark(c: &mut Criterion) {
    let exponential = RetryPolicy::new().with_base_delay_ms(100);
    c.bench_function("wait_for_retry_exponential", |b| {
        b.iter(|| {
            for retry in 1..=10 {
                black_box(exponential.wait_for_retry(black_box(retry)));
            }
        });
    });

    let jittered = RetryPolicy::new()
        .with_base_delay_ms(100)
        .with_backoff(BackoffStrategy::Linear)
        .with_jitter(JitterStrategy::Full);
    c.bench_function("wait_for_retry_full_jitter", |b| {
        b.iter(|| {
            for retry in 1..=10 {
                black_box(jittered.wait_for_retry(black_box(retry)));
            }
        });
    });
}

criterion_group!(benches, retry_benchmark);
criterion_main!(benches);
