//! Restore engine (C6): k-way merge of chunk streams into tx-ordered
//! tuples, batch-replayed into an empty target DB (spec §4.6).
//!
//! The merge itself has no direct analogue in the teacher (PBS restores a
//! single index, not N independently-chunked streams); it's grounded in the
//! generic multi-shard replay pattern from the `other_examples` corpus and
//! implemented with `std::collections::BinaryHeap` + `Reverse`, same as any
//! idiomatic k-way merge in this ecosystem.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use anyhow::{bail, Context, Error};

use crate::codec::ChunkReader;
use crate::error::{BackupError, ErrorKind};
use crate::metadata;
use crate::options::RestoreOptions;
use crate::progress::{emit, ProgressEvent};
use crate::store::ObjectStore;
use crate::tuple::{SourceDb, Tuple};

const SUPPORTED_FORMAT_VERSION: u16 = 1;

#[derive(Debug)]
pub struct RestoreResult {
    pub success: bool,
    pub tuples_restored: u64,
    pub chunks_read: u64,
}

/// An entry in the merge frontier. A chunk a reader hasn't been opened for
/// yet sits in the heap as `Unopened`, keyed only by its manifest-known
/// `tx_range.0` (the minimum possible key any tuple in that chunk could
/// have) so the heap can decide *when* a chunk needs opening without ever
/// reading its body. The chunk's body (and thus its backing buffer) is only
/// fetched from the store the moment that placeholder reaches the top of
/// the heap — this keeps peak memory to the bodies of chunks genuinely in
/// contention at the current merge position, not every chunk in the backup
/// (spec §4.6 streaming / O(k) memory bound).
enum FrontierEntry {
    Unopened { chunk_id: u64, start_t: i64 },
    Opened { tuple: Tuple, chunk_id: u64 },
}

impl FrontierEntry {
    fn chunk_id(&self) -> u64 {
        match self {
            FrontierEntry::Unopened { chunk_id, .. } => *chunk_id,
            FrontierEntry::Opened { chunk_id, .. } => *chunk_id,
        }
    }

    /// A lower bound on the entry's true ordering key. For an opened entry
    /// this is exact; for an unopened chunk it uses the minimum possible
    /// secondary fields so the placeholder always sorts at or before the
    /// chunk's real first tuple, guaranteeing it gets opened in time.
    fn sort_key(&self) -> (i64, u8, &str, i64) {
        match self {
            FrontierEntry::Unopened { start_t, .. } => (*start_t, 0, "", i64::MIN),
            FrontierEntry::Opened { tuple, .. } => tuple.ordering_key(),
        }
    }
}

impl PartialEq for FrontierEntry {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key() && self.chunk_id() == other.chunk_id()
    }
}
impl Eq for FrontierEntry {}

impl PartialOrd for FrontierEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FrontierEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Tie-break by chunk_id to make the ordering total (spec §4.6 step 3).
        (self.sort_key(), self.chunk_id()).cmp(&(other.sort_key(), other.chunk_id()))
    }
}

pub fn restore(store: &dyn ObjectStore, target: &dyn SourceDb, options: RestoreOptions) -> Result<RestoreResult, BackupError> {
    run_restore(store, target, options).map_err(classify_restore_err)
}

fn classify_restore_err(err: Error) -> BackupError {
    if let Some(existing) = err.downcast_ref::<BackupError>() {
        return BackupError::new(existing.kind, existing.message.clone());
    }
    BackupError::from_anyhow(ErrorKind::Fatal, err)
}

fn run_restore(store: &dyn ObjectStore, target: &dyn SourceDb, options: RestoreOptions) -> Result<RestoreResult, Error> {
    let database_id = &options.database_id;
    let backup_id = &options.backup_id;
    let span = tracing::info_span!("restore", %database_id, %backup_id);
    let _guard = span.enter();

    if !metadata::is_complete(store, database_id, backup_id) {
        bail!(BackupError::fatal(format!("backup {backup_id} has no complete-marker")));
    }
    let manifest = metadata::read_manifest(store, database_id, backup_id).context("reading manifest")?;
    if manifest.format_version != SUPPORTED_FORMAT_VERSION {
        bail!(BackupError::fatal(format!(
            "manifest format_version {} incompatible with {SUPPORTED_FORMAT_VERSION}",
            manifest.format_version
        )));
    }

    let snapshot = target.snapshot().context("opening target snapshot")?;
    let existing_max_e = target.max_eid(snapshot.as_ref())?;
    if existing_max_e != 0 {
        bail!(BackupError::fatal("restore target is not empty (non-zero max_eid)"));
    }

    emit(&options.progress_fn, ProgressEvent::RestoreStarted { backup_id: backup_id.clone() });

    let schema_bytes = store.get(&crate::store::layout::schema_key(database_id, backup_id))?;
    let config_bytes = store.get(&crate::store::layout::config_key(database_id, backup_id))?;
    let _schema: serde_json::Value = serde_json::from_slice(&schema_bytes)?;
    let _config: serde_json::Value = serde_json::from_slice(&config_bytes)?;

    let mut open_readers: Vec<Option<ChunkReader<std::io::Cursor<Vec<u8>>>>> =
        manifest.chunks.iter().map(|_| None).collect();

    let mut heap: BinaryHeap<Reverse<FrontierEntry>> = BinaryHeap::new();
    for (chunk_id, descriptor) in manifest.chunks.iter().enumerate() {
        if descriptor.tuple_count > 0 {
            heap.push(Reverse(FrontierEntry::Unopened { chunk_id: chunk_id as u64, start_t: descriptor.tx_range.0 }));
        }
    }

    let mut buffer: Vec<Tuple> = Vec::with_capacity(options.batch_size);
    let mut tuples_restored: u64 = 0;
    let mut last_t: Option<i64> = None;

    while let Some(Reverse(entry)) = heap.pop() {
        let chunk_id = entry.chunk_id();
        let tuple = match entry {
            FrontierEntry::Unopened { .. } => {
                let descriptor = &manifest.chunks[chunk_id as usize];
                let bytes = store.get(&descriptor.key).with_context(|| format!("reading chunk {}", descriptor.key))?;
                let expected_sha256 = decode_sha256(&descriptor.sha256)?;
                let reader = ChunkReader::open(std::io::Cursor::new(bytes), expected_sha256, options.verify_checksums)
                    .map_err(|e| Error::new(BackupError::data(format!("chunk {} decode failed: {e:#}", descriptor.chunk_id))))?;
                open_readers[chunk_id as usize] = Some(reader);
                if let Some(next) = advance(open_readers[chunk_id as usize].as_mut().unwrap(), chunk_id)? {
                    heap.push(Reverse(FrontierEntry::Opened { tuple: next, chunk_id }));
                }
                continue;
            }
            FrontierEntry::Opened { tuple, .. } => tuple,
        };

        let reader = open_readers[chunk_id as usize].as_mut().expect("chunk reader must be open for a materialized frontier entry");
        match advance(reader, chunk_id)? {
            Some(next) => heap.push(Reverse(FrontierEntry::Opened { tuple: next, chunk_id })),
            // Exhausted: drop the reader now so its buffered chunk body is
            // freed immediately rather than held until the whole restore ends.
            None => open_readers[chunk_id as usize] = None,
        }

        let commit_boundary = last_t.is_some_and(|t| t != tuple.t);
        if commit_boundary && buffer.len() >= options.batch_size {
            let flushed = buffer.len() as u64;
            flush(target, &mut buffer, manifest.source_max_eid, manifest.source_max_t)?;
            tuples_restored += flushed;
            emit(&options.progress_fn, ProgressEvent::BatchLoaded { tuples_restored });
        }
        last_t = Some(tuple.t);
        buffer.push(tuple);
    }

    if !buffer.is_empty() {
        let count = buffer.len() as u64;
        flush(target, &mut buffer, manifest.source_max_eid, manifest.source_max_t)?;
        tuples_restored += count;
    }

    target.load_pre_formed(Vec::new(), manifest.source_max_eid, manifest.source_max_t)?;

    emit(&options.progress_fn, ProgressEvent::RestoreFinished { tuples_restored });
    tracing::info!(tuples_restored, chunks_read = manifest.chunks.len(), "restore finished");

    Ok(RestoreResult { success: true, tuples_restored, chunks_read: manifest.chunks.len() as u64 })
}

fn flush(target: &dyn SourceDb, buffer: &mut Vec<Tuple>, max_e: i64, max_t: i64) -> Result<(), Error> {
    if buffer.is_empty() {
        return Ok(());
    }
    target.load_pre_formed(std::mem::take(buffer), max_e, max_t)?;
    Ok(())
}

fn advance(reader: &mut ChunkReader<std::io::Cursor<Vec<u8>>>, chunk_id: u64) -> Result<Option<Tuple>, Error> {
    match reader.next() {
        Some(Ok(tuple)) => Ok(Some(tuple)),
        Some(Err(err)) => Err(Error::new(BackupError::data(format!("chunk {chunk_id} read failed: {err:#}")))),
        None => Ok(None),
    }
}

fn decode_sha256(hex_str: &str) -> Result<[u8; 32], Error> {
    let bytes = hex::decode(hex_str).context("invalid sha256 hex in chunk descriptor")?;
    bytes.try_into().map_err(|_| anyhow::anyhow!("sha256 must be 32 bytes"))
}
