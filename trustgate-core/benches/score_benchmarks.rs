use chrono::{Duration, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use trustgate_core::{compute_score, params_fingerprint, ReputationInputs};

fn bench_compute_score(c: &mut Criterion) {
    let inputs = ReputationInputs {
        identity_verified: true,
        stake_amount: 750.0,
        vouches_received: 6,
        total_actions: 420,
        successful_actions: 390,
        failed_actions: 30,
        created_at: Utc::now() - Duration::days(120),
    };
    let now = Utc::now();
    c.bench_function("compute_score", |b| {
        b.iter(|| compute_score(black_box(&inputs), black_box(now)))
    });
}

fn bench_params_fingerprint(c: &mut Criterion) {
    let params = json!({
        "query": "rust borrow checker",
        "limit": 25,
        "filters": {"language": "en", "recent": true},
        "tags": ["systems", "memory-safety", "ownership"],
    })
    .as_object()
    .cloned()
    .unwrap();
    c.bench_function("params_fingerprint", |b| {
        b.iter(|| params_fingerprint(black_box("search"), black_box(&params)))
    });
}

criterion_group!(benches, bench_compute_score, bench_params_fingerprint);
criterion_main!(benches);
