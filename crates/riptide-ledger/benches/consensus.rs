//! Benchmarks for the consensus hot paths.

use std::collections::HashMap;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use riptide_avl::Tree;
use riptide_db::MemStore;
use riptide_ids::TransactionId;
use riptide_ledger::{Snowball, SnowballParams};

#[derive(Clone)]
struct Candidate(TransactionId);

impl riptide_ledger::snowball::Identifiable for Candidate {
    fn candidate_id(&self) -> TransactionId {
        self.0
    }
}

fn bench_snowball_tick(c: &mut Criterion) {
    let snowball: Snowball<Candidate> = Snowball::new(SnowballParams::new(10, 0.8, u32::MAX));

    let id = TransactionId::from_bytes([1u8; 32]);
    let mut counts = HashMap::new();
    counts.insert(id, 1.0);
    let mut candidates = HashMap::new();
    candidates.insert(id, Candidate(id));

    c.bench_function("snowball_tick", |b| {
        b.iter(|| snowball.tick(&counts, &candidates));
    });
}

fn bench_tree_insert(c: &mut Criterion) {
    c.bench_function("tree_insert_1k", |b| {
        b.iter(|| {
            let mut tree = Tree::new(Arc::new(MemStore::new())).unwrap();
            for i in 0u64..1_000 {
                tree.insert(&i.to_be_bytes(), &i.to_le_bytes()).unwrap();
            }
            tree.checksum()
        });
    });
}

fn bench_tree_lookup(c: &mut Criterion) {
    let mut tree = Tree::new(Arc::new(MemStore::new())).unwrap();
    for i in 0u64..10_000 {
        tree.insert(&i.to_be_bytes(), &i.to_le_bytes()).unwrap();
    }

    c.bench_function("tree_lookup", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i = (i + 1) % 10_000;
            tree.lookup(&i.to_be_bytes()).unwrap()
        });
    });
}

criterion_group!(
    benches,
    bench_snowball_tick,
    bench_tree_insert,
    bench_tree_lookup
);
criterion_main!(benches);
