use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::time::Duration;
use triad::RateLimiter;

async fn ok() -> Result<&'static str, std::io::Error> {
    Ok("request")
}

fn rate_limiter_throughput_under_capacity(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let limiter = RateLimiter::fixed_window(1_000_000, Duration::from_secs(1)).unwrap().build();

    c.bench_function("rate_limiter_fixed_window_admit", |b| {
        b.to_async(&rt).iter(|| async { let _ = black_box(limiter.call(1, None, ok).await); });
    });
}

fn rate_limiter_throughput_token_bucket(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let limiter = RateLimiter::token_bucket(1_000_000, Duration::from_secs(1)).unwrap().build();

    c.bench_function("rate_limiter_token_bucket_admit", |b| {
        b.to_async(&rt).iter(|| async { let _ = black_box(limiter.call(1, None, ok).await); });
    });
}

criterion_group!(benches, rate_limiter_throughput_under_capacity, rate_limiter_throughput_token_bucket);
criterion_main!(benches);
