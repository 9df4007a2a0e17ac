//! Benchmarks for session tokens and policy hashing.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use std::time::Duration;
use warden::signer::canonical_hash;
use warden::{SessionTokenAuthority, TokenConfig};

fn config() -> TokenConfig {
    TokenConfig {
        window: Duration::from_secs(30),
        clock_skew: Duration::from_secs(5),
        max_nonces: 10_000,
    }
}

fn benchmark_token_generation(c: &mut Criterion) {
    let authority = SessionTokenAuthority::new(config());

    c.bench_function("token_generate", |b| {
        b.iter(|| black_box(authority.generate_token()))
    });
}

fn benchmark_token_verification(c: &mut Criterion) {
    // Fresh authority per token so the replay store stays small.
    c.bench_function("token_verify", |b| {
        b.iter_batched(
            || {
                let authority = SessionTokenAuthority::new(config());
                let token = authority.generate_token();
                (authority, token)
            },
            |(authority, token)| authority.verify_token(black_box(&token)).unwrap(),
            BatchSize::SmallInput,
        )
    });

    let authority = SessionTokenAuthority::new(config());
    let forged = SessionTokenAuthority::new(config()).generate_token();
    c.bench_function("token_reject_bad_signature", |b| {
        b.iter(|| authority.verify_token(black_box(&forged)).is_err())
    });
}

fn benchmark_policy_hash(c: &mut Criterion) {
    let whitelist: Vec<_> = (0..200)
        .map(|i| serde_json::json!({ "name": format!("tool-{}.exe", i), "paths": ["C:/Tools"] }))
        .collect();
    let policy = serde_json::json!({
        "version": 1,
        "mode": "production",
        "processes": { "default": "deny", "whitelist": whitelist },
    });

    c.bench_function("policy_canonical_hash_200_entries", |b| {
        b.iter(|| canonical_hash(black_box(&policy)).unwrap())
    });
}

criterion_group!(
    benches,
    benchmark_token_generation,
    benchmark_token_verification,
    benchmark_policy_hash,
);
criterion_main!(benches);
