//! Backup engine (C5): streams the source DB through the chunker and codec
//! into the object/dir store, checkpointing after each chunk and sealing
//! atomically on success (spec §4.5).
//!
//! Grounded in the teacher's `backup.rs` top-of-module lock/snapshot/
//! pipeline/finalize narrative and in `tools::lock_file`'s retry-with-
//! timeout idiom, translated here to the `atomic_put_if_absent` contract.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{bail, Context, Error};
use serde::{Deserialize, Serialize};

use crate::chunker::Chunker;
use crate::codec::encode_chunk;
use crate::error::{BackupError, ErrorKind};
use crate::metadata::{self, Checkpoint, ChunkDescriptor, Manifest};
use crate::options::BackupOptions;
use crate::progress::{emit, ProgressEvent};
use crate::store::{layout, retrying, ObjectStore};
use crate::tuple::{SourceDb, Tuple};

/// A lock's body: identifies the holder so a stale-takeover can be logged
/// with whose lock was seized (spec §4.5 step 1, §5 "stale-lock takeover").
#[derive(Debug, Serialize, Deserialize)]
struct LockPayload {
    pid: u32,
    host: String,
    started_at: chrono::DateTime<chrono::Utc>,
}

const LOCK_STALE_AFTER_SECS: i64 = 3600;
const FORMAT_VERSION: u16 = 1;

#[derive(Debug)]
pub struct BackupResult {
    pub success: bool,
    pub backup_id: String,
    pub path_or_uri: String,
    pub tuple_count: u64,
    pub chunk_count: u64,
    pub total_bytes: u64,
}

/// Iterator adapter that turns a `Box<dyn Iterator<Item = Result<Tuple>>>`
/// into a plain `Iterator<Item = Tuple>` for the chunker, stashing the first
/// error it sees (if any) instead of panicking. Single-threaded by
/// construction: it's only ever driven from within `backup()`.
struct FallibleTuples<'a> {
    inner: Box<dyn Iterator<Item = Result<Tuple, Error>> + 'a>,
    error: Rc<RefCell<Option<Error>>>,
    skip_t_leq: Option<i64>,
}

impl<'a> Iterator for FallibleTuples<'a> {
    type Item = Tuple;

    fn next(&mut self) -> Option<Tuple> {
        loop {
            match self.inner.next() {
                Some(Ok(tuple)) => {
                    if let Some(threshold) = self.skip_t_leq {
                        if tuple.t <= threshold {
                            continue;
                        }
                    }
                    return Some(tuple);
                }
                Some(Err(err)) => {
                    *self.error.borrow_mut() = Some(err);
                    return None;
                }
                None => return None,
            }
        }
    }
}

pub fn backup(store: &dyn ObjectStore, source: &dyn SourceDb, options: BackupOptions) -> Result<BackupResult, BackupError> {
    run_backup(store, source, options).map_err(|err| classify_backup_err(err))
}

fn classify_backup_err(err: Error) -> BackupError {
    if let Some(existing) = err.downcast_ref::<BackupError>() {
        return BackupError::new(existing.kind, existing.message.clone());
    }
    BackupError::from_anyhow(ErrorKind::Fatal, err)
}

fn run_backup(store: &dyn ObjectStore, source: &dyn SourceDb, options: BackupOptions) -> Result<BackupResult, Error> {
    let database_id = options.database_id.clone();
    let backup_id = options.backup_id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let span = tracing::info_span!("backup", %database_id, %backup_id);
    let _guard = span.enter();

    let existing_manifest = metadata::read_manifest(store, &database_id, &backup_id).ok();
    let resuming = existing_manifest.as_ref().is_some_and(|m| !m.completed);

    // An incomplete manifest for this exact backup_id is evidence that a
    // prior attempt under the same identity owns the lock and crashed
    // without releasing it; re-acquiring to resume is legitimate regardless
    // of the lock's age (spec §4.5, §8 property 4 resumability). A fresh
    // lock with no such manifest (someone else genuinely running right now,
    // or a lock from before any manifest was written) still only yields to
    // the stale-after-`LOCK_STALE_AFTER_SECS` takeover below.
    let lock_key = layout::lock_key(&database_id, &backup_id);
    acquire_lock(store, &lock_key, resuming)?;
    emit(&options.progress_fn, ProgressEvent::BackupStarted { backup_id: backup_id.clone() });

    let snapshot = source.snapshot().context("opening source snapshot")?;
    let max_e = source.max_eid(snapshot.as_ref())?;
    let max_t = source.max_t(snapshot.as_ref())?;

    let mut manifest = if let Some(m) = existing_manifest.filter(|_| resuming) {
        tracing::warn!("resuming in-progress backup");
        m
    } else {
        let schema = source.schema(snapshot.as_ref())?;
        let config = source.config(snapshot.as_ref())?;
        store.put(&layout::schema_key(&database_id, &backup_id), &serde_json::to_vec_pretty(&schema)?)?;
        store.put(&layout::config_key(&database_id, &backup_id), &serde_json::to_vec_pretty(&config)?)?;
        Manifest {
            format_version: FORMAT_VERSION,
            database_id: database_id.clone(),
            backup_id: backup_id.clone(),
            created_at: chrono::Utc::now(),
            source_max_t: max_t,
            source_max_eid: max_e,
            chunks: Vec::new(),
            completed: false,
            completed_at: None,
        }
    };
    metadata::write_manifest(store, &manifest)?;

    let checkpoint = metadata::read_checkpoint(store, &database_id, &backup_id)?;
    let skip_t_leq = checkpoint.as_ref().map(|c| c.last_sealed_t);
    let mut next_chunk_id = manifest.chunks.iter().map(|c| c.chunk_id + 1).max().unwrap_or(0);

    let error_cell = Rc::new(RefCell::new(None));
    let raw = source.datoms_eavt(snapshot.as_ref())?;
    let tuples = FallibleTuples { inner: raw, error: error_cell.clone(), skip_t_leq };

    let chunker = Chunker::new(tuples, options.chunk_bytes);
    let mut any_chunk_written = !manifest.chunks.is_empty();

    for payload in chunker {
        let chunk_id = next_chunk_id;
        next_chunk_id += 1;
        let (compressed, sha256) = encode_chunk(chunk_id, &payload.tuples, options.compression_level)?;
        let key = layout::chunk_key(&database_id, &backup_id, chunk_id);
        retrying(|| store.put(&key, &compressed))?;

        let last_t = payload.tx_range.1;
        let descriptor = ChunkDescriptor {
            chunk_id,
            key: key.clone(),
            tuple_count: payload.tuples.len() as u64,
            tx_range: payload.tx_range,
            sha256: hex::encode(sha256),
            compressed_bytes: compressed.len() as u64,
            partial_commit_prefix: payload.partial_commit_prefix,
        };
        manifest.chunks.push(descriptor);
        any_chunk_written = true;

        if !payload.partial_commit_prefix {
            // Persist the manifest's chunk list alongside the checkpoint: a
            // crash right after this point must still let a resumed backup
            // see every chunk already durably uploaded, not just the latest
            // sealed `t` (otherwise the descriptor for an uploaded chunk is
            // lost and restore silently skips it).
            metadata::write_manifest(store, &manifest)?;
            metadata::write_checkpoint(
                store,
                &database_id,
                &backup_id,
                &Checkpoint { last_sealed_chunk_id: chunk_id, last_sealed_t: last_t, updated_at: chrono::Utc::now() },
            )?;
        }
        emit(
            &options.progress_fn,
            ProgressEvent::ChunkUploaded {
                chunk_id,
                tuple_count: manifest.chunks.last().unwrap().tuple_count,
                total_bytes: manifest.chunks.last().unwrap().compressed_bytes,
            },
        );
    }

    if let Some(err) = error_cell.borrow_mut().take() {
        bail!(BackupError::data(format!("source tuple stream failed: {err:#}")));
    }

    // Edge case (spec §4.5): even an empty stream still seals one chunk so
    // the manifest always has a consistent chunk record.
    if !any_chunk_written {
        let (compressed, sha256) = encode_chunk(0, &[], options.compression_level)?;
        let key = layout::chunk_key(&database_id, &backup_id, 0);
        retrying(|| store.put(&key, &compressed))?;
        manifest.chunks.push(ChunkDescriptor {
            chunk_id: 0,
            key,
            tuple_count: 0,
            tx_range: (max_t, max_t),
            sha256: hex::encode(sha256),
            compressed_bytes: compressed.len() as u64,
            partial_commit_prefix: false,
        });
    }

    manifest.completed = true;
    manifest.completed_at = Some(chrono::Utc::now());
    metadata::write_manifest(store, &manifest)?;
    metadata::mark_complete(store, &database_id, &backup_id)?;
    store.delete(&layout::checkpoint_key(&database_id, &backup_id))?;
    store.delete(&lock_key)?;

    let tuple_count: u64 = manifest.chunks.iter().map(|c| c.tuple_count).sum();
    let total_bytes: u64 = manifest.chunks.iter().map(|c| c.compressed_bytes).sum();
    let chunk_count = manifest.chunks.len() as u64;

    emit(&options.progress_fn, ProgressEvent::BackupSealed { backup_id: backup_id.clone(), chunk_count });
    tracing::info!(tuple_count, chunk_count, "backup sealed");

    Ok(BackupResult {
        success: true,
        backup_id: backup_id.clone(),
        path_or_uri: layout::backup_prefix(&database_id, &backup_id),
        tuple_count,
        chunk_count,
        total_bytes,
    })
}

fn acquire_lock(store: &dyn ObjectStore, lock_key: &str, resuming: bool) -> Result<(), Error> {
    let payload = LockPayload { pid: std::process::id(), host: hostname(), started_at: chrono::Utc::now() };
    let bytes = serde_json::to_vec(&payload)?;

    match store.put_if_absent(lock_key, &bytes) {
        Ok(()) => Ok(()),
        Err(err) if err.kind == ErrorKind::Conflict => {
            let existing = store.get(lock_key)?;
            let existing: LockPayload = serde_json::from_slice(&existing).unwrap_or(LockPayload {
                pid: 0,
                host: "unknown".into(),
                started_at: chrono::Utc::now(),
            });
            let age = chrono::Utc::now().signed_duration_since(existing.started_at).num_seconds();
            if resuming {
                tracing::warn!(stale_pid = existing.pid, stale_host = %existing.host, age, "re-acquiring lock to resume incomplete backup");
                store.put(lock_key, &bytes)?;
                Ok(())
            } else if age > LOCK_STALE_AFTER_SECS {
                tracing::warn!(stale_pid = existing.pid, stale_host = %existing.host, age, "taking over stale backup lock");
                store.put(lock_key, &bytes)?;
                Ok(())
            } else {
                bail!(BackupError::conflict(format!(
                    "backup lock held by pid={} host={} since {}",
                    existing.pid, existing.host, existing.started_at
                )))
            }
        }
        Err(err) => Err(err.into()),
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}
