use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::sync::Arc;

use larder_auth::{Hs256TokenCodec, PermissionSet, Principal, Role, TokenCodec};
use larder_core::{SystemClock, UserId};
use larder_infra::sessions::{InMemorySessionStore, SessionConfig, SessionLifecycleManager};
use secrecy::SecretString;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("failed to build tokio runtime")
}

fn manager(max_concurrent_sessions: usize) -> SessionLifecycleManager<InMemorySessionStore> {
    let codec: Arc<dyn TokenCodec> =
        Arc::new(Hs256TokenCodec::new(&SecretString::from("bench-secret".to_string())));
    let config = SessionConfig {
        max_concurrent_sessions,
        ..SessionConfig::default()
    };
    SessionLifecycleManager::new(InMemorySessionStore::new(), codec, Arc::new(SystemClock), config)
        .expect("valid config")
}

fn principal() -> Principal {
    let perms = PermissionSet::from_strings(["orders:create", "recipes:update", "reports:view"])
        .expect("valid permissions");
    Principal::new(UserId::new(), "bench", Role::new("staff"), perms)
}

fn bench_create(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("session_create");

    // Steady state: every create past the cap evicts the oldest session.
    group.bench_function("create_at_cap", |b| {
        let m = manager(5);
        let p = principal();
        b.iter(|| {
            let issued = rt.block_on(m.create(&p, false)).expect("create");
            black_box(issued);
        });
    });

    group.finish();
}

fn bench_validate(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("session_validate");
    group.throughput(Throughput::Elements(1));

    for users in [1usize, 100, 10_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(users), users, |b, &users| {
            let m = manager(5);
            let tokens: Vec<String> = (0..users)
                .map(|_| rt.block_on(m.create(&principal(), false)).expect("create").token)
                .collect();

            let mut i = 0;
            b.iter(|| {
                let claims = rt.block_on(m.validate(&tokens[i % tokens.len()])).expect("validate");
                i += 1;
                black_box(claims);
            });
        });
    }

    group.finish();
}

fn bench_sweep(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("session_sweep");

    for sessions in [100usize, 10_000].iter() {
        group.throughput(Throughput::Elements(*sessions as u64));
        group.bench_with_input(BenchmarkId::from_parameter(sessions), sessions, |b, &sessions| {
            let m = manager(sessions);
            let p = principal();
            for _ in 0..sessions {
                rt.block_on(m.create(&p, false)).expect("create");
            }

            // Nothing has expired: measures the scan cost.
            b.iter(|| black_box(rt.block_on(m.sweep_expired()).expect("sweep")));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_create, bench_validate, bench_sweep);
criterion_main!(benches);
