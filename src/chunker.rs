//! Streaming chunk partitioner (C4).
//!
//! Consumes an already EAVT-ordered tuple stream and groups it into
//! size-bounded chunks that never split a commit (`t`) across two chunks,
//! *unless* a single commit alone exceeds `chunk_bytes` — in which case the
//! chunk is flagged `partial_commit_prefix` and the commit is split so memory
//! stays O(chunk_bytes) regardless of commit size (spec §4.4). Modeled on the
//! teacher's `ChunkStream`/`FixedChunkStream` "accumulate until boundary,
//! emit, carry remainder" control flow, made synchronous since the pipeline
//! has no async requirement (spec §5).

use std::iter::Peekable;

use crate::tuple::Tuple;

/// Rough serialized-size estimate used for the size budget; doesn't need to
/// match the codec's output exactly, only to bound memory within a constant
/// factor of `chunk_bytes`.
fn estimated_size(tuple: &Tuple) -> usize {
    const TUPLE_OVERHEAD: usize = 24;
    let value_size = match &tuple.v {
        crate::tuple::Value::Keyword(s) | crate::tuple::Value::Str(s) | crate::tuple::Value::BigDecimal(s) => s.len(),
        crate::tuple::Value::Bytes(b) => b.len(),
        crate::tuple::Value::Uuid(_) => 16,
        _ => 8,
    };
    TUPLE_OVERHEAD + tuple.a.len() + value_size
}

/// One chunk's worth of tuples plus the metadata the backup engine needs to
/// populate a `ChunkDescriptor` (spec §4.3).
#[derive(Debug)]
pub struct ChunkPayload {
    pub tuples: Vec<Tuple>,
    pub tx_range: (i64, i64),
    /// True when this chunk holds only a prefix of its last commit because
    /// that commit alone exceeded `chunk_bytes`; the remainder follows in
    /// the next chunk with the same `t`.
    pub partial_commit_prefix: bool,
}

pub struct Chunker<I: Iterator<Item = Tuple>> {
    inner: Peekable<I>,
    chunk_bytes: usize,
    chunk_id: u64,
}

impl<I: Iterator<Item = Tuple>> Chunker<I> {
    pub fn new(inner: I, chunk_bytes: usize) -> Self {
        Self { inner: inner.peekable(), chunk_bytes: chunk_bytes.max(1), chunk_id: 0 }
    }

    pub fn next_chunk_id(&self) -> u64 {
        self.chunk_id
    }
}

impl<I: Iterator<Item = Tuple>> Iterator for Chunker<I> {
    type Item = ChunkPayload;

    fn next(&mut self) -> Option<ChunkPayload> {
        let first = self.inner.next()?;
        let mut size = estimated_size(&first);
        let mut t_min = first.t;
        let mut t_max = first.t;
        let mut current_t = first.t;
        let mut tuples = vec![first];
        let mut partial_commit_prefix = false;

        loop {
            let over_budget = size >= self.chunk_bytes;
            match self.inner.peek() {
                None => break,
                Some(next) if next.t != current_t => {
                    if over_budget {
                        break;
                    }
                    // Safe to cross the commit boundary only if doing so
                    // wouldn't be the first thing we do after already being
                    // over budget; we already checked that above.
                    if size + estimated_size(next) > self.chunk_bytes && size > 0 {
                        break;
                    }
                }
                Some(_) => {
                    if over_budget {
                        // Still inside the same commit but over budget: split
                        // mid-commit rather than growing without bound.
                        partial_commit_prefix = true;
                        break;
                    }
                }
            }

            let tuple = self.inner.next().expect("peeked Some");
            current_t = tuple.t;
            t_max = tuple.t;
            size += estimated_size(&tuple);
            tuples.push(tuple);
        }

        self.chunk_id += 1;
        Some(ChunkPayload { tuples, tx_range: (t_min.min(t_max), t_max), partial_commit_prefix })
    }
}
