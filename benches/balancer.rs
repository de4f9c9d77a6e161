//! Benchmarks for tcpxy backend selection.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use tcpxy::backend::{Backend, BackendState, Update};
use tcpxy::balancer::{LoadBalancer, Policy};

fn populated(policy: Policy, num_backends: usize) -> (Arc<dyn LoadBalancer>, Vec<Arc<Backend>>) {
    let balancer = policy.build();
    let backends: Vec<Arc<Backend>> = (0..num_backends)
        .map(|i| {
            Arc::new(Backend::new(
                format!("127.0.0.1:{}", 9000 + i),
                BackendState::Healthy,
            ))
        })
        .collect();
    for backend in &backends {
        balancer.update_backend(&Update::Joined(Arc::clone(backend)));
    }
    (balancer, backends)
}

fn benchmark_random(c: &mut Criterion) {
    let (balancer, _backends) = populated(Policy::Random, 10);

    c.bench_function("random_next_backend", |b| {
        b.iter(|| {
            black_box(balancer.next_backend().unwrap());
        })
    });
}

fn benchmark_p2c(c: &mut Criterion) {
    let (balancer, backends) = populated(Policy::P2C, 10);

    // Uneven load so the comparison branch is exercised.
    for (i, backend) in backends.iter().enumerate() {
        for _ in 0..i {
            backend.incr_active_conns();
        }
    }

    c.bench_function("p2c_next_backend", |b| {
        b.iter(|| {
            black_box(balancer.next_backend().unwrap());
        })
    });
}

fn benchmark_membership_churn(c: &mut Criterion) {
    let (balancer, _backends) = populated(Policy::P2C, 10);
    let extra = Arc::new(Backend::new("127.0.0.1:9999", BackendState::Healthy));

    c.bench_function("membership_churn", |b| {
        b.iter(|| {
            balancer.update_backend(&Update::Joined(Arc::clone(&extra)));
            balancer.update_backend(&Update::Removed(Arc::clone(&extra)));
        })
    });
}

criterion_group!(
    benches,
    benchmark_random,
    benchmark_p2c,
    benchmark_membership_churn
);
criterion_main!(benches);
