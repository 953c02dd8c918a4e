use std::hint::black_box;
use std::time::{Duration, Instant};

use breakwater::breaker::CircuitBreaker;
use breakwater::config::BreakerConfig;
use breakwater::limiter::{Admission, ConcurrencyLimiter};
use breakwater::window::RollingWindow;
use criterion::{Criterion, criterion_group, criterion_main};

fn window_push(c: &mut Criterion) {
    let mut window = RollingWindow::new(50);
    c.bench_function("window_push", |b| {
        b.iter(|| {
            window.push(black_box(true));
            black_box(window.failure_rate())
        })
    });
}

fn breaker_allow_record(c: &mut Criterion) {
    let breaker = CircuitBreaker::new(BreakerConfig::default());
    let now = Instant::now();
    c.bench_function("breaker_allow_success", |b| {
        b.iter(|| {
            let decision = breaker.allow(black_box("bench.example"), now);
            black_box(decision.allowed);
            breaker.on_success("bench.example")
        })
    });
}

fn limiter_fast_path(c: &mut Criterion) {
    let limiter = ConcurrencyLimiter::new(64, 0, Duration::from_millis(100));
    c.bench_function("limiter_admit_release", |b| {
        b.iter(|| match limiter.admit() {
            Admission::Granted(permit) => drop(black_box(permit)),
            _ => unreachable!("uncontended fast path"),
        })
    });
}

criterion_group!(benches, window_push, breaker_allow_record, limiter_fast_path);
criterion_main!(benches);
