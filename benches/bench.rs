//! Criterion benchmarks for the Kontos indexing primitives:
//! - Posting tree insertion and seek throughput
//! - Attribute value store set/get
//! - Attribute persistence save/load

use std::hint::black_box;
use std::sync::Arc;

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use kontos::attribute::{AttributeConfig, AttributeStore};
use kontos::blob::BlobStore;
use kontos::generation::GenerationHandler;
use kontos::persistence::{load_from, save_to};
use kontos::posting::{PostingEntry, PostingTree};
use kontos::storage::MemoryStorage;

fn build_tree(keys: u32) -> PostingTree {
    let generations = Arc::new(GenerationHandler::new());
    let features = BlobStore::new(Arc::clone(&generations));
    let tree = PostingTree::new(generations);
    for doc_id in 0..keys {
        let blob_ref = features.put(&doc_id.to_le_bytes()).unwrap();
        tree.insert(doc_id * 3, PostingEntry::new(blob_ref));
    }
    tree
}

fn bench_posting_tree(c: &mut Criterion) {
    let mut group = c.benchmark_group("posting_tree");

    group.throughput(Throughput::Elements(10_000));
    group.bench_function("insert_10k", |b| {
        b.iter(|| {
            let tree = PostingTree::new(Arc::new(GenerationHandler::new()));
            for doc_id in 0..10_000u32 {
                tree.insert(black_box(doc_id), PostingEntry::new(Default::default()));
            }
            black_box(tree.len())
        })
    });

    let tree = build_tree(10_000);
    group.throughput(Throughput::Elements(1_000));
    group.bench_function("seek_1k", |b| {
        b.iter(|| {
            let snapshot = tree.snapshot();
            let mut iter = snapshot.iter();
            let mut target = 0u32;
            for _ in 0..1_000 {
                target += 29;
                iter.linear_seek(black_box(target));
                if !iter.valid() {
                    break;
                }
            }
            black_box(iter.valid())
        })
    });

    group.finish();
}

fn bench_attribute_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("attribute_store");
    let payload = vec![0x5a; 256];

    group.throughput(Throughput::Elements(1_000));
    group.bench_function("set_commit_1k", |b| {
        b.iter(|| {
            let store = AttributeStore::new(AttributeConfig::new("bench"));
            for doc_id in 0..1_000u32 {
                store.set(doc_id, black_box(&payload)).unwrap();
            }
            store.commit();
            black_box(store.doc_id_limit())
        })
    });

    let store = AttributeStore::new(AttributeConfig::new("bench"));
    for doc_id in 0..1_000u32 {
        store.set(doc_id, &payload).unwrap();
    }
    store.commit();
    group.throughput(Throughput::Elements(1_000));
    group.bench_function("guarded_get_1k", |b| {
        b.iter(|| {
            let _guard = store.take_guard();
            let mut total = 0usize;
            for doc_id in 0..1_000u32 {
                total += store.get(black_box(doc_id)).map_or(0, |view| view.len());
            }
            black_box(total)
        })
    });

    group.finish();
}

fn bench_persistence(c: &mut Criterion) {
    let mut group = c.benchmark_group("persistence");
    let store = AttributeStore::new(AttributeConfig::new("bench"));
    for doc_id in 0..1_000u32 {
        store.set(doc_id, &vec![doc_id as u8; 128]).unwrap();
    }
    store.commit();

    group.bench_function("save_1k", |b| {
        let storage = MemoryStorage::new();
        b.iter(|| save_to(black_box(&store), &storage, "bench.dat").unwrap())
    });

    let storage = MemoryStorage::new();
    save_to(&store, &storage, "bench.dat").unwrap();
    group.bench_function("load_1k", |b| {
        b.iter(|| {
            let loaded =
                load_from(AttributeConfig::new("bench"), &storage, "bench.dat").unwrap();
            black_box(loaded.committed_doc_id_limit())
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_posting_tree,
    bench_attribute_store,
    bench_persistence
);
criterion_main!(benches);
