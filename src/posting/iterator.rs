//! Strict search iterator over one posting-tree snapshot.
//!
//! The iterator is a three-state machine: uninitialized until
//! [`init_range`](PostingIterator::init_range), then active at a document
//! id, then exhausted once no id remains in range. It declares itself
//! strict: it never reports a document id below a requested seek target,
//! so evaluators may use it for intersection and skip optimizations.
//!
//! Ranking features are not decoded on movement. The evaluator calls
//! [`unpack`](PostingIterator::unpack) for the documents it actually
//! scores, and the decoded output is dropped again on the next seek.

use std::fmt::Debug;
use std::sync::Arc;

use ahash::AHashMap;

use crate::blob::BlobStore;
use crate::error::Result;
use crate::posting::tree::{TreeIterator, TreeSnapshot};

/// Document id reported when an iterator holds no position.
pub const NO_DOC: u32 = u32::MAX;

/// Which parts of a posting entry [`unpack`](PostingIterator::unpack)
/// decodes into the match data.
///
/// Selected at construction time; replaces compile-time iterator variants
/// with a per-instance mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnpackMode {
    /// No output sink is wired up; unpack is a no-op.
    None,
    /// Decode the feature payload.
    Features,
    /// Decode the feature payload and forward the interleaved occurrence
    /// count. The aggregate is surfaced verbatim; interpreting it is the
    /// decoder's concern.
    FeaturesAndOccurrences,
}

/// Per-term output slot filled by [`unpack`](PostingIterator::unpack) and
/// read by the query evaluator.
#[derive(Debug, Clone, Default)]
pub struct TermMatchData {
    /// Document id the slot was last filled for.
    pub doc_id: u32,
    /// Decoded feature bytes.
    pub features: Vec<u8>,
    /// Interleaved occurrence count, when the index variant carries one
    /// and the unpack mode forwards it.
    pub occurrences: Option<u32>,
}

/// Decodes a feature payload into a [`TermMatchData`] slot.
///
/// The index configuration supplies one decoder per field; this is the
/// extension point for field-specific feature encodings.
pub trait FeatureDecoder: Send + Sync + Debug {
    /// Decode `raw` into `out`.
    fn decode(&self, raw: &[u8], out: &mut TermMatchData) -> Result<()>;
}

/// Pass-through decoder: the payload bytes are the features.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawFeatureDecoder;

impl FeatureDecoder for RawFeatureDecoder {
    fn decode(&self, raw: &[u8], out: &mut TermMatchData) -> Result<()> {
        out.features.clear();
        out.features.extend_from_slice(raw);
        Ok(())
    }
}

/// Field id → decoder mapping, supplied by the index configuration.
///
/// Fields without a registered decoder fall back to [`RawFeatureDecoder`].
#[derive(Debug, Default)]
pub struct FieldDecoders {
    decoders: AHashMap<u32, Arc<dyn FeatureDecoder>>,
}

impl FieldDecoders {
    /// Empty mapping; every field decodes raw.
    pub fn new() -> Self {
        FieldDecoders {
            decoders: AHashMap::new(),
        }
    }

    /// Register the decoder for a field.
    pub fn register(&mut self, field_id: u32, decoder: Arc<dyn FeatureDecoder>) {
        self.decoders.insert(field_id, decoder);
    }

    /// The decoder to use for a field.
    pub fn for_field(&self, field_id: u32) -> Arc<dyn FeatureDecoder> {
        self.decoders
            .get(&field_id)
            .cloned()
            .unwrap_or_else(|| Arc::new(RawFeatureDecoder))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IteratorState {
    Uninitialized,
    Active,
    Exhausted,
}

/// Strictly-ordered, forward-only cursor over one posting range.
#[derive(Debug)]
pub struct PostingIterator {
    snapshot: TreeSnapshot,
    cursor: Option<TreeIterator>,
    features: Arc<BlobStore>,
    decoder: Arc<dyn FeatureDecoder>,
    mode: UnpackMode,
    state: IteratorState,
    doc_id: u32,
    end: u32,
    unpacked: bool,
    match_data: TermMatchData,
}

impl PostingIterator {
    /// Create an uninitialized iterator over `snapshot`, decoding feature
    /// payloads out of `features` with `decoder` according to `mode`.
    pub fn new(
        snapshot: TreeSnapshot,
        features: Arc<BlobStore>,
        decoder: Arc<dyn FeatureDecoder>,
        mode: UnpackMode,
    ) -> Self {
        PostingIterator {
            snapshot,
            cursor: None,
            features,
            decoder,
            mode,
            state: IteratorState::Uninitialized,
            doc_id: NO_DOC,
            end: NO_DOC,
            unpacked: false,
            match_data: TermMatchData::default(),
        }
    }

    /// Position at the first document id in `[begin, end)`, or exhaust the
    /// iterator if the range holds none. Clears any unpacked features.
    pub fn init_range(&mut self, begin: u32, end: u32) {
        self.end = end;
        self.unpacked = false;
        let cursor = self.snapshot.lower_bound(begin);
        if cursor.valid() && cursor.doc_id() < end {
            self.doc_id = cursor.doc_id();
            self.state = IteratorState::Active;
        } else {
            self.doc_id = NO_DOC;
            self.state = IteratorState::Exhausted;
        }
        self.cursor = Some(cursor);
    }

    /// Forward seek to the first document id `>= target`, exhausting the
    /// iterator if none remains in range.
    ///
    /// Only valid while active, with `target` at or ahead of the current
    /// document id; violating either is a caller bug.
    pub fn seek(&mut self, target: u32) {
        assert_eq!(
            self.state,
            IteratorState::Active,
            "seek on an iterator that is not active"
        );
        assert!(
            target >= self.doc_id,
            "backward seek: target {} is behind current document {}",
            target,
            self.doc_id
        );
        self.unpacked = false;
        let cursor = self.cursor.as_mut().expect("active iterator has a cursor");
        cursor.linear_seek(target);
        if cursor.valid() && cursor.doc_id() < self.end {
            self.doc_id = cursor.doc_id();
        } else {
            self.doc_id = NO_DOC;
            self.state = IteratorState::Exhausted;
        }
    }

    /// Advance past the current document.
    pub fn next(&mut self) {
        let target = self.doc_id.saturating_add(1);
        self.seek(target);
    }

    /// Decode the current posting's features into the match data slot.
    ///
    /// Idempotent: a second call without an intervening seek is a no-op,
    /// as is any call when no output sink is wired up
    /// ([`UnpackMode::None`]). `doc_id` must equal the iterator's current
    /// document id; anything else is a caller bug.
    pub fn unpack(&mut self, doc_id: u32) -> Result<()> {
        if self.mode == UnpackMode::None || self.unpacked {
            return Ok(());
        }
        assert_eq!(
            self.state,
            IteratorState::Active,
            "unpack on an iterator that is not active"
        );
        assert_eq!(
            doc_id, self.doc_id,
            "unpack for document {} but iterator is at {}",
            doc_id, self.doc_id
        );
        let entry = self
            .cursor
            .as_ref()
            .expect("active iterator has a cursor")
            .entry();
        match self.features.read(entry.features) {
            Some(view) => self.decoder.decode(&view, &mut self.match_data)?,
            None => self.decoder.decode(&[], &mut self.match_data)?,
        }
        self.match_data.doc_id = doc_id;
        self.match_data.occurrences = if self.mode == UnpackMode::FeaturesAndOccurrences {
            entry.occurrences
        } else {
            None
        };
        self.unpacked = true;
        Ok(())
    }

    /// Current document id, or [`NO_DOC`] when not active.
    pub fn doc_id(&self) -> u32 {
        self.doc_id
    }

    /// True once no document remains in range.
    pub fn is_exhausted(&self) -> bool {
        self.state == IteratorState::Exhausted
    }

    /// This iterator never returns a document id below the requested seek
    /// target.
    pub fn is_strict(&self) -> bool {
        true
    }

    /// Iteration cost hint: number of postings in the underlying snapshot.
    pub fn cost(&self) -> u64 {
        self.snapshot.len() as u64
    }

    /// The unpack mode this iterator was constructed with.
    pub fn mode(&self) -> UnpackMode {
        self.mode
    }

    /// The match data slot filled by the last unpack.
    pub fn match_data(&self) -> &TermMatchData {
        &self.match_data
    }
}
