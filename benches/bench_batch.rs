use std::collections::BTreeMap;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tub_store::batch::BatchGenerator;
use tub_store::table::Table;
use tub_store::value::{Kind, Record, Value};

fn build_table(n: usize) -> Arc<Table> {
    let mut kinds = BTreeMap::new();
    kinds.insert("user/angle".to_string(), Kind::Float);
    kinds.insert("user/throttle".to_string(), Kind::Float);
    kinds.insert("user/mode".to_string(), Kind::Str);
    let rows = (0..n)
        .map(|i| {
            let mut r = Record::new();
            r.insert("user/angle".into(), Value::Float((i % 200) as f64 / 100.0 - 1.0));
            r.insert("user/throttle".into(), Value::Float(0.3));
            r.insert("user/mode".into(), Value::Str("user".into()));
            r
        })
        .collect();
    Arc::new(Table::new(kinds, rows))
}

fn bench_shuffled_batches(c: &mut Criterion) {
    let generator = BatchGenerator::new(build_table(10_000));
    let mut batches = generator
        .batch_sequence(
            &["user/angle", "user/throttle"],
            None,
            128,
            true,
            StdRng::seed_from_u64(1),
        )
        .unwrap();
    c.bench_function("batch_128_shuffled_10k", |b| {
        b.iter(|| batches.next().unwrap().unwrap())
    });
}

fn bench_train_val_split(c: &mut Criterion) {
    let generator = BatchGenerator::new(build_table(10_000));
    let mut rng = StdRng::seed_from_u64(200);
    c.bench_function("train_val_split_10k", |b| {
        b.iter(|| {
            generator
                .train_val_split(&["user/angle"], &["user/throttle"], 128, None, 0.8, &mut rng)
                .unwrap()
        })
    });
}

criterion_group!(benches, bench_shuffled_batches, bench_train_val_split);
criterion_main!(benches);
