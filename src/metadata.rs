//! Backup metadata store (C3): manifest, chunk descriptors, checkpoint,
//! migration record, and tx-log-entry shapes, plus atomic read/write helpers
//! layered on [`crate::store::ObjectStore`] (spec §4.3, §6).

use anyhow::{Context, Error};
use serde::{Deserialize, Serialize};

use crate::store::{layout, ObjectStore};

/// One chunk's entry in the manifest (spec §4.3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkDescriptor {
    pub chunk_id: u64,
    pub key: String,
    pub tuple_count: u64,
    pub tx_range: (i64, i64),
    pub sha256: String,
    pub compressed_bytes: u64,
    pub partial_commit_prefix: bool,
}

/// The top-level backup manifest, written once at `backup()` start and
/// sealed (`completed = true`) on successful finish (spec §4.3, §4.5).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    pub format_version: u16,
    pub database_id: String,
    pub backup_id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub source_max_t: i64,
    pub source_max_eid: i64,
    pub chunks: Vec<ChunkDescriptor>,
    pub completed: bool,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Progress checkpoint written after each chunk so a killed backup can
/// resume without re-streaming already-sealed chunks (spec §4.5, §8 S4).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub last_sealed_chunk_id: u64,
    pub last_sealed_t: i64,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Live-migration record (spec §4.8): one entry per migration attempt,
/// advancing through `MigrationState`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationRecord {
    pub migration_id: String,
    pub database_id: String,
    pub state: crate::migration::MigrationState,
    pub backup_id: Option<String>,
    pub capture_start_t: Option<i64>,
    pub replay_cursor: Option<u64>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// One captured transaction in the append-only tx log (spec §4.7).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TxLogEntry {
    pub seq: u64,
    pub t: i64,
    pub tuples: Vec<crate::tuple::Tuple>,
}

/// Read the JSON-encoded manifest for `(database_id, backup_id)`.
pub fn read_manifest(store: &dyn ObjectStore, database_id: &str, backup_id: &str) -> Result<Manifest, Error> {
    let key = layout::manifest_key(database_id, backup_id);
    let bytes = store.get(&key).with_context(|| format!("reading manifest {key}"))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing manifest {key}"))
}

/// Write the manifest, overwriting any prior copy (safe because the
/// underlying store write is atomic; callers only call this while holding
/// the backup lock).
pub fn write_manifest(store: &dyn ObjectStore, manifest: &Manifest) -> Result<(), Error> {
    let key = layout::manifest_key(&manifest.database_id, &manifest.backup_id);
    let bytes = serde_json::to_vec_pretty(manifest)?;
    store.put(&key, &bytes).with_context(|| format!("writing manifest {key}"))?;
    Ok(())
}

pub fn read_checkpoint(
    store: &dyn ObjectStore,
    database_id: &str,
    backup_id: &str,
) -> Result<Option<Checkpoint>, Error> {
    let key = layout::checkpoint_key(database_id, backup_id);
    match store.get(&key) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind == crate::error::ErrorKind::Fatal => Ok(None),
        Err(err) => Err(err.into()),
    }
}

pub fn write_checkpoint(
    store: &dyn ObjectStore,
    database_id: &str,
    backup_id: &str,
    checkpoint: &Checkpoint,
) -> Result<(), Error> {
    let key = layout::checkpoint_key(database_id, backup_id);
    let bytes = serde_json::to_vec_pretty(checkpoint)?;
    store.put(&key, &bytes)?;
    Ok(())
}

pub fn mark_complete(store: &dyn ObjectStore, database_id: &str, backup_id: &str) -> Result<(), Error> {
    let key = layout::complete_marker_key(database_id, backup_id);
    store.put(&key, b"")?;
    Ok(())
}

pub fn is_complete(store: &dyn ObjectStore, database_id: &str, backup_id: &str) -> bool {
    store.get(&layout::complete_marker_key(database_id, backup_id)).is_ok()
}

pub fn read_migration_record(
    store: &dyn ObjectStore,
    database_id: &str,
    migration_id: &str,
) -> Result<MigrationRecord, Error> {
    let key = layout::migration_record_key(database_id, migration_id);
    let bytes = store.get(&key).with_context(|| format!("reading migration record {key}"))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing migration record {key}"))
}

pub fn write_migration_record(store: &dyn ObjectStore, record: &MigrationRecord) -> Result<(), Error> {
    let key = layout::migration_record_key(&record.database_id, &record.migration_id);
    let bytes = serde_json::to_vec_pretty(record)?;
    store.put(&key, &bytes)?;
    Ok(())
}
