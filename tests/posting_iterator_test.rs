//! End-to-end scenarios for the posting index and its search iterator.

use std::sync::Arc;

use kontos::blob::BlobStore;
use kontos::generation::GenerationHandler;
use kontos::posting::{
    NO_DOC, PostingEntry, PostingIterator, PostingTree, RawFeatureDecoder, UnpackMode,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

struct Index {
    features: Arc<BlobStore>,
    tree: PostingTree,
}

impl Index {
    fn new() -> Self {
        let generations = Arc::new(GenerationHandler::new());
        Index {
            features: Arc::new(BlobStore::new(Arc::clone(&generations))),
            tree: PostingTree::new(generations),
        }
    }

    fn insert(&self, doc_id: u32, payload: &[u8]) {
        let blob_ref = self.features.put(payload).unwrap();
        self.tree.insert(doc_id, PostingEntry::with_occurrences(blob_ref, 1));
    }

    fn iterator(&self, mode: UnpackMode) -> PostingIterator {
        PostingIterator::new(
            self.tree.snapshot(),
            Arc::clone(&self.features),
            Arc::new(RawFeatureDecoder),
            mode,
        )
    }
}

/// Duplicate insert overwrites: walking [0, 100) yields 3, 7, 12 with the
/// replacement feature payload for document 7.
#[test]
fn test_overwrite_scenario() {
    let index = Index::new();
    index.insert(3, b"a");
    index.insert(7, b"b");
    index.insert(7, b"c");
    index.insert(12, b"d");

    let mut iter = index.iterator(UnpackMode::Features);
    iter.init_range(0, 100);

    let mut seen = Vec::new();
    while !iter.is_exhausted() {
        let doc_id = iter.doc_id();
        iter.unpack(doc_id).unwrap();
        seen.push((doc_id, iter.match_data().features.clone()));
        iter.next();
    }
    assert_eq!(
        seen,
        vec![
            (3, b"a".to_vec()),
            (7, b"c".to_vec()),
            (12, b"d".to_vec()),
        ]
    );
}

/// Full iteration visits document ids strictly ascending with no
/// duplicates, for an arbitrary insertion order with repeated keys.
#[test]
fn test_ordering_property() {
    let index = Index::new();
    let mut rng = StdRng::seed_from_u64(0x0bad_5eed);
    for _ in 0..2000 {
        let doc_id = rng.random_range(0..500u32);
        index.insert(doc_id, &doc_id.to_le_bytes());
    }

    let mut iter = index.iterator(UnpackMode::Features);
    iter.init_range(0, NO_DOC);
    let mut previous = None;
    let mut count = 0usize;
    while !iter.is_exhausted() {
        let doc_id = iter.doc_id();
        if let Some(prev) = previous {
            assert!(doc_id > prev, "{doc_id} must be greater than {prev}");
        }
        iter.unpack(doc_id).unwrap();
        assert_eq!(iter.match_data().features, doc_id.to_le_bytes());
        previous = Some(doc_id);
        count += 1;
    }
    assert_eq!(count, index.tree.len());
}

/// A sequence of nondecreasing seek targets never observes a document id
/// below the running maximum target, and seeking past the last posting is
/// terminal.
#[test]
fn test_seek_monotonicity_property() {
    let index = Index::new();
    for doc_id in (0..300u32).map(|i| i * 7) {
        index.insert(doc_id, b"f");
    }

    let mut rng = StdRng::seed_from_u64(42);
    let mut iter = index.iterator(UnpackMode::None);
    iter.init_range(0, NO_DOC);

    let mut target = 0u32;
    while !iter.is_exhausted() {
        target = target.saturating_add(rng.random_range(0..40u32));
        if target < iter.doc_id() {
            target = iter.doc_id();
        }
        iter.seek(target);
        if iter.is_exhausted() {
            break;
        }
        assert!(
            iter.doc_id() >= target,
            "strict iterator returned {} below target {}",
            iter.doc_id(),
            target
        );
    }
    assert!(iter.is_exhausted());
    assert_eq!(iter.doc_id(), NO_DOC);
}

/// An iterator opened before a mutation batch keeps observing the
/// pre-mutation postings; one opened after sees the new state.
#[test]
fn test_iterator_snapshot_isolation() {
    let index = Index::new();
    index.insert(1, b"one");
    index.insert(5, b"five");
    index.insert(9, b"nine");

    let mut before = index.iterator(UnpackMode::Features);
    before.init_range(0, 100);

    index.tree.remove(5);
    index.insert(7, b"seven");
    index.tree.generation_handler().increment_generation();

    let mut ids = Vec::new();
    while !before.is_exhausted() {
        ids.push(before.doc_id());
        before.next();
    }
    assert_eq!(ids, vec![1, 5, 9]);

    let mut after = index.iterator(UnpackMode::Features);
    after.init_range(0, 100);
    let mut ids = Vec::new();
    while !after.is_exhausted() {
        ids.push(after.doc_id());
        after.next();
    }
    assert_eq!(ids, vec![1, 7, 9]);
}

/// Feature payloads retired by an overwrite stay readable through an
/// iterator whose guard predates the overwrite; the writer's reclaim pass
/// cannot free them until that guard is released.
#[test]
fn test_features_survive_overwrite_under_guard() {
    let index = Index::new();
    index.insert(4, b"original");

    let generations = Arc::clone(index.tree.generation_handler());
    let guard = generations.take_guard();
    let mut iter = index.iterator(UnpackMode::Features);
    iter.init_range(0, 100);

    // Overwrite, retire the old feature payload, and try to reclaim.
    let old_entry = index.tree.lookup(4).unwrap();
    index.insert(4, b"replacement");
    index.features.remove(old_entry.features);
    generations.increment_generation();
    assert_eq!(index.features.reclaim(), 0, "guard pins the old payload");
    index.tree.reclaim();

    // The guarded reader still unpacks the pre-overwrite bytes.
    iter.unpack(4).unwrap();
    assert_eq!(iter.match_data().features, b"original");

    drop(guard);
    assert_eq!(index.features.reclaim(), 1);

    // A fresh snapshot sees the replacement.
    let entry = index.tree.snapshot().lookup(4).unwrap();
    let view = index.features.read(entry.features).unwrap();
    assert_eq!(&*view, b"replacement");
}
