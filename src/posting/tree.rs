//! Ordered posting index keyed by document id.
//!
//! A B-tree with copy-on-write structural updates: every mutation copies the
//! root-to-leaf path it touches and publishes a new root, retiring the
//! replaced nodes to a per-generation hold list. A [`TreeSnapshot`] clones
//! the root handle, so iterators opened on a snapshot keep observing the
//! pre-mutation tree no matter what the writer does afterwards.
//!
//! Mutation is single-writer by contract. Keys are totally ordered by
//! unsigned value; inserting an existing key replaces its entry.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::blob::BlobRef;
use crate::generation::{GenerationHandler, HoldList};

/// Maximum number of keys in a leaf node.
const LEAF_SLOTS: usize = 16;
/// Maximum number of children in an internal node.
const INTERNAL_SLOTS: usize = 16;

/// Value stored per document id in the posting index.
///
/// Carries the feature payload reference and, when the index variant
/// enables it, an interleaved aggregate (term occurrence count) inlined for
/// access without dereferencing the blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostingEntry {
    /// Reference to the entry's feature payload.
    pub features: BlobRef,
    /// Interleaved occurrence count, if the index variant carries one.
    pub occurrences: Option<u32>,
}

impl PostingEntry {
    /// Entry with features only.
    pub fn new(features: BlobRef) -> Self {
        PostingEntry {
            features,
            occurrences: None,
        }
    }

    /// Entry with features and an interleaved occurrence count.
    pub fn with_occurrences(features: BlobRef, occurrences: u32) -> Self {
        PostingEntry {
            features,
            occurrences: Some(occurrences),
        }
    }
}

#[derive(Debug)]
enum Node {
    Leaf {
        keys: Vec<u32>,
        entries: Vec<PostingEntry>,
    },
    Internal {
        /// `keys[i]` is the largest key in the subtree `children[i]`.
        keys: Vec<u32>,
        children: Vec<Arc<Node>>,
    },
}

impl Node {
    fn max_key(&self) -> u32 {
        match self {
            Node::Leaf { keys, .. } => *keys.last().expect("leaf nodes are never empty"),
            Node::Internal { keys, .. } => *keys.last().expect("internal nodes are never empty"),
        }
    }
}

enum InsertResult {
    /// The subtree was replaced by a single node; true if a new key was added.
    Single(Arc<Node>, bool),
    /// The subtree split into two nodes; true if a new key was added.
    Split(Arc<Node>, Arc<Node>, bool),
}

enum RemoveResult {
    NotFound,
    /// The subtree was replaced; `None` means it became empty.
    Replaced(Option<Arc<Node>>),
}

fn insert_rec(
    node: &Arc<Node>,
    doc_id: u32,
    entry: PostingEntry,
    retired: &mut Vec<Arc<Node>>,
) -> InsertResult {
    match node.as_ref() {
        Node::Leaf { keys, entries } => {
            let mut keys = keys.clone();
            let mut entries = entries.clone();
            let added = match keys.binary_search(&doc_id) {
                Ok(idx) => {
                    // Duplicate insert replaces the entry, never appends.
                    entries[idx] = entry;
                    false
                }
                Err(idx) => {
                    keys.insert(idx, doc_id);
                    entries.insert(idx, entry);
                    true
                }
            };
            retired.push(Arc::clone(node));
            if keys.len() > LEAF_SLOTS {
                let mid = keys.len() / 2;
                let right_keys = keys.split_off(mid);
                let right_entries = entries.split_off(mid);
                InsertResult::Split(
                    Arc::new(Node::Leaf { keys, entries }),
                    Arc::new(Node::Leaf {
                        keys: right_keys,
                        entries: right_entries,
                    }),
                    added,
                )
            } else {
                InsertResult::Single(Arc::new(Node::Leaf { keys, entries }), added)
            }
        }
        Node::Internal { keys, children } => {
            let child_idx = match keys.binary_search(&doc_id) {
                Ok(idx) => idx,
                // Keys beyond the current maximum go into the last subtree.
                Err(idx) => idx.min(children.len() - 1),
            };
            let result = insert_rec(&children[child_idx], doc_id, entry, retired);
            let mut keys = keys.clone();
            let mut children = children.clone();
            retired.push(Arc::clone(node));
            let added = match result {
                InsertResult::Single(child, added) => {
                    keys[child_idx] = child.max_key();
                    children[child_idx] = child;
                    added
                }
                InsertResult::Split(left, right, added) => {
                    keys[child_idx] = left.max_key();
                    children[child_idx] = left;
                    keys.insert(child_idx + 1, right.max_key());
                    children.insert(child_idx + 1, right);
                    added
                }
            };
            if children.len() > INTERNAL_SLOTS {
                let mid = children.len() / 2;
                let right_keys = keys.split_off(mid);
                let right_children = children.split_off(mid);
                InsertResult::Split(
                    Arc::new(Node::Internal { keys, children }),
                    Arc::new(Node::Internal {
                        keys: right_keys,
                        children: right_children,
                    }),
                    added,
                )
            } else {
                InsertResult::Single(Arc::new(Node::Internal { keys, children }), added)
            }
        }
    }
}

fn remove_rec(node: &Arc<Node>, doc_id: u32, retired: &mut Vec<Arc<Node>>) -> RemoveResult {
    match node.as_ref() {
        Node::Leaf { keys, entries } => match keys.binary_search(&doc_id) {
            Err(_) => RemoveResult::NotFound,
            Ok(idx) => {
                retired.push(Arc::clone(node));
                if keys.len() == 1 {
                    return RemoveResult::Replaced(None);
                }
                let mut keys = keys.clone();
                let mut entries = entries.clone();
                keys.remove(idx);
                entries.remove(idx);
                RemoveResult::Replaced(Some(Arc::new(Node::Leaf { keys, entries })))
            }
        },
        Node::Internal { keys, children } => {
            let child_idx = match keys.binary_search(&doc_id) {
                Ok(idx) => idx,
                Err(idx) => {
                    if idx == children.len() {
                        return RemoveResult::NotFound;
                    }
                    idx
                }
            };
            match remove_rec(&children[child_idx], doc_id, retired) {
                RemoveResult::NotFound => RemoveResult::NotFound,
                RemoveResult::Replaced(replacement) => {
                    retired.push(Arc::clone(node));
                    let mut keys = keys.clone();
                    let mut children = children.clone();
                    match replacement {
                        Some(child) => {
                            keys[child_idx] = child.max_key();
                            children[child_idx] = child;
                        }
                        None => {
                            // An emptied leaf is unlinked, not rebalanced.
                            keys.remove(child_idx);
                            children.remove(child_idx);
                        }
                    }
                    if children.is_empty() {
                        RemoveResult::Replaced(None)
                    } else {
                        RemoveResult::Replaced(Some(Arc::new(Node::Internal { keys, children })))
                    }
                }
            }
        }
    }
}

#[derive(Debug)]
struct RootState {
    root: Option<Arc<Node>>,
    size: usize,
}

/// Ordered map from document id to [`PostingEntry`] with copy-on-write
/// updates safe under concurrent readers.
#[derive(Debug)]
pub struct PostingTree {
    root: RwLock<RootState>,
    hold: Mutex<HoldList<Arc<Node>>>,
    generations: Arc<GenerationHandler>,
}

impl PostingTree {
    /// Create an empty tree coordinating reclamation through `generations`.
    pub fn new(generations: Arc<GenerationHandler>) -> Self {
        PostingTree {
            root: RwLock::new(RootState {
                root: None,
                size: 0,
            }),
            hold: Mutex::new(HoldList::new()),
            generations,
        }
    }

    /// The generation handler this tree reclaims under.
    pub fn generation_handler(&self) -> &Arc<GenerationHandler> {
        &self.generations
    }

    /// Number of postings in the tree.
    pub fn len(&self) -> usize {
        self.root.read().size
    }

    /// True if the tree holds no postings.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a posting. Inserting an existing key replaces its entry.
    pub fn insert(&self, doc_id: u32, entry: PostingEntry) {
        let mut retired = Vec::new();
        {
            let mut state = self.root.write();
            let (new_root, added) = match state.root.as_ref() {
                None => (
                    Arc::new(Node::Leaf {
                        keys: vec![doc_id],
                        entries: vec![entry],
                    }),
                    true,
                ),
                Some(root) => match insert_rec(root, doc_id, entry, &mut retired) {
                    InsertResult::Single(node, added) => (node, added),
                    InsertResult::Split(left, right, added) => (
                        Arc::new(Node::Internal {
                            keys: vec![left.max_key(), right.max_key()],
                            children: vec![left, right],
                        }),
                        added,
                    ),
                },
            };
            state.root = Some(new_root);
            if added {
                state.size += 1;
            }
        }
        self.retire(retired);
    }

    /// Remove a posting. Removing a nonexistent key is a no-op.
    pub fn remove(&self, doc_id: u32) {
        let mut retired = Vec::new();
        {
            let mut state = self.root.write();
            let Some(root) = state.root.as_ref() else {
                return;
            };
            match remove_rec(root, doc_id, &mut retired) {
                RemoveResult::NotFound => return,
                RemoveResult::Replaced(replacement) => {
                    let mut new_root = replacement;
                    // Collapse a single-child root so lookups stay shallow.
                    loop {
                        let child = match new_root.as_ref() {
                            Some(node) => match node.as_ref() {
                                Node::Internal { children, .. } if children.len() == 1 => {
                                    retired.push(Arc::clone(node));
                                    Some(Arc::clone(&children[0]))
                                }
                                _ => None,
                            },
                            None => None,
                        };
                        match child {
                            Some(child) => new_root = Some(child),
                            None => break,
                        }
                    }
                    state.root = new_root;
                    state.size -= 1;
                }
            }
        }
        self.retire(retired);
    }

    /// Point lookup.
    pub fn lookup(&self, doc_id: u32) -> Option<PostingEntry> {
        self.snapshot().lookup(doc_id)
    }

    /// Clone the current root handle. The snapshot is immutable: mutations
    /// after this call are invisible through it.
    pub fn snapshot(&self) -> TreeSnapshot {
        let state = self.root.read();
        TreeSnapshot {
            root: state.root.clone(),
            size: state.size,
        }
    }

    /// Drain the hold list up to the oldest generation still observed by a
    /// live guard. Returns the number of nodes reclaimed.
    pub fn reclaim(&self) -> usize {
        let oldest_used = self.generations.oldest_used_generation();
        self.hold.lock().reclaim(oldest_used)
    }

    /// Force-drain the hold list. Shutdown path only.
    pub fn reclaim_all(&self) -> usize {
        self.hold.lock().reclaim_all_with(|_| {})
    }

    /// Number of retired nodes awaiting reclamation.
    pub fn hold_count(&self) -> usize {
        self.hold.lock().len()
    }

    fn retire(&self, retired: Vec<Arc<Node>>) {
        if retired.is_empty() {
            return;
        }
        let generation = self.generations.current_generation();
        let mut hold = self.hold.lock();
        for node in retired {
            hold.hold(node, generation);
        }
    }
}

/// Immutable view of the tree at snapshot time.
#[derive(Debug, Clone)]
pub struct TreeSnapshot {
    root: Option<Arc<Node>>,
    size: usize,
}

impl TreeSnapshot {
    /// Number of postings in the snapshot.
    pub fn len(&self) -> usize {
        self.size
    }

    /// True if the snapshot holds no postings.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Point lookup in the snapshot.
    pub fn lookup(&self, doc_id: u32) -> Option<PostingEntry> {
        let mut node = self.root.as_ref()?;
        loop {
            match node.as_ref() {
                Node::Internal { keys, children } => {
                    let idx = match keys.binary_search(&doc_id) {
                        Ok(idx) => idx,
                        Err(idx) => {
                            if idx == children.len() {
                                return None;
                            }
                            idx
                        }
                    };
                    node = &children[idx];
                }
                Node::Leaf { keys, entries } => {
                    return match keys.binary_search(&doc_id) {
                        Ok(idx) => Some(entries[idx]),
                        Err(_) => None,
                    };
                }
            }
        }
    }

    /// Iterator positioned at the smallest key.
    pub fn iter(&self) -> TreeIterator {
        self.lower_bound(0)
    }

    /// Iterator positioned at the first key `>= doc_id`; exhausted if no
    /// such key exists.
    pub fn lower_bound(&self, doc_id: u32) -> TreeIterator {
        let mut iter = TreeIterator { stack: Vec::new() };
        let Some(root) = self.root.as_ref() else {
            return iter;
        };

        enum Step {
            Descend(usize, Arc<Node>),
            AtLeaf(usize),
            Exhausted,
        }

        let mut node = Arc::clone(root);
        loop {
            let step = match node.as_ref() {
                Node::Internal { keys, children } => {
                    let idx = match keys.binary_search(&doc_id) {
                        Ok(idx) | Err(idx) => idx,
                    };
                    if idx == children.len() {
                        Step::Exhausted
                    } else {
                        Step::Descend(idx, Arc::clone(&children[idx]))
                    }
                }
                Node::Leaf { keys, .. } => {
                    let idx = match keys.binary_search(&doc_id) {
                        Ok(idx) | Err(idx) => idx,
                    };
                    if idx == keys.len() {
                        Step::Exhausted
                    } else {
                        Step::AtLeaf(idx)
                    }
                }
            };
            match step {
                Step::Descend(idx, child) => {
                    iter.stack.push((node, idx));
                    node = child;
                }
                Step::AtLeaf(idx) => {
                    iter.stack.push((node, idx));
                    return iter;
                }
                Step::Exhausted => {
                    iter.stack.clear();
                    return iter;
                }
            }
        }
    }
}

/// Forward cursor over a [`TreeSnapshot`].
///
/// The cursor owns its path, so it stays valid for the snapshot's lifetime
/// regardless of writer activity. Seeking backward is a caller bug.
#[derive(Debug)]
pub struct TreeIterator {
    /// Root-to-leaf path; the last element is the current leaf position.
    stack: Vec<(Arc<Node>, usize)>,
}

impl TreeIterator {
    /// True if positioned at a posting.
    pub fn valid(&self) -> bool {
        !self.stack.is_empty()
    }

    /// Current document id. Panics if exhausted.
    pub fn doc_id(&self) -> u32 {
        let (node, idx) = self.stack.last().expect("iterator is exhausted");
        match node.as_ref() {
            Node::Leaf { keys, .. } => keys[*idx],
            Node::Internal { .. } => unreachable!("iterator path must end at a leaf"),
        }
    }

    /// Current entry. Panics if exhausted.
    pub fn entry(&self) -> PostingEntry {
        let (node, idx) = self.stack.last().expect("iterator is exhausted");
        match node.as_ref() {
            Node::Leaf { entries, .. } => entries[*idx],
            Node::Internal { .. } => unreachable!("iterator path must end at a leaf"),
        }
    }

    /// Advance to the next posting, exhausting the cursor at the end.
    pub fn step(&mut self) {
        let advanced = {
            let Some((node, idx)) = self.stack.last_mut() else {
                return;
            };
            match node.as_ref() {
                Node::Leaf { keys, .. } if *idx + 1 < keys.len() => {
                    *idx += 1;
                    true
                }
                _ => false,
            }
        };
        if advanced {
            return;
        }
        // Leaf exhausted: climb until a parent has a further subtree.
        self.stack.pop();
        while !self.stack.is_empty() {
            let child = {
                let (node, idx) = self.stack.last_mut().unwrap();
                match node.as_ref() {
                    Node::Internal { children, .. } if *idx + 1 < children.len() => {
                        *idx += 1;
                        Some(Arc::clone(&children[*idx]))
                    }
                    _ => None,
                }
            };
            match child {
                Some(child) => {
                    self.descend_first(child);
                    return;
                }
                None => {
                    self.stack.pop();
                }
            }
        }
    }

    /// Forward seek to the first key `>= doc_id`, optimized for targets
    /// near the current position. The target must not be behind the
    /// current key.
    pub fn linear_seek(&mut self, doc_id: u32) {
        debug_assert!(
            !self.valid() || self.doc_id() <= doc_id,
            "backward seek on a forward-only iterator"
        );
        // Fast path: the target is within the current leaf.
        let found = {
            match self.stack.last_mut() {
                None => return,
                Some((node, idx)) => match node.as_ref() {
                    Node::Leaf { keys, .. } if *keys.last().unwrap() >= doc_id => {
                        while keys[*idx] < doc_id {
                            *idx += 1;
                        }
                        true
                    }
                    _ => false,
                },
            }
        };
        if found {
            return;
        }
        while self.valid() && self.doc_id() < doc_id {
            self.step();
        }
    }

    fn descend_first(&mut self, node: Arc<Node>) {
        let mut node = node;
        loop {
            let next = match node.as_ref() {
                Node::Internal { children, .. } => Some(Arc::clone(&children[0])),
                Node::Leaf { .. } => None,
            };
            self.stack.push((node, 0));
            match next {
                Some(child) => node = child,
                None => return,
            }
        }
    }
}
