//! Object/dir store adapter (C1): a uniform put/get/list/delete/multipart
//! contract over an S3-like backend or a plain filesystem directory, with
//! retry classification (spec §4.1).

mod filesystem;
#[cfg(feature = "s3")]
mod s3;

pub use filesystem::FsStore;
#[cfg(feature = "s3")]
pub use s3::S3Store;

use crate::error::ErrorKind;
use crate::tools::with_retry;
use anyhow::Error;

/// One entry returned by [`ObjectStore::list`].
#[derive(Debug, Clone)]
pub struct ObjectDescriptor {
    pub key: String,
    pub size: u64,
    pub mtime: chrono::DateTime<chrono::Utc>,
}

/// An opaque multipart upload handle. Adapters that have no native
/// multipart support use the default `multipart_*` methods, which buffer
/// parts in memory and issue a single `put` on `complete`.
pub struct MultipartUpload {
    pub upload_id: String,
    pub key: String,
    parts: Vec<Vec<u8>>,
}

/// Classify an adapter-level error so the caller can decide whether to
/// retry, abort, or escalate (spec §4.1, §7). Adapters attach this via
/// [`ClassifiedError`] so `with_retry` callers don't need backend-specific
/// knowledge.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {source}")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    #[source]
    pub source: Error,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, source: Error) -> Self {
        Self { kind, source }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

/// Uniform contract over an object store or a local directory (spec §4.1,
/// §6). Every method is blocking; an async backend (e.g. S3) hides its own
/// runtime behind the adapter (see `store::s3`).
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `key`, creating or overwriting it. At-least-once;
    /// same key overwrites (server-side idempotence).
    fn put(&self, key: &str, bytes: &[u8]) -> Result<String, ClassifiedError>;

    fn get(&self, key: &str) -> Result<Vec<u8>, ClassifiedError>;

    fn list(&self, prefix: &str) -> Result<Vec<ObjectDescriptor>, ClassifiedError>;

    fn delete(&self, key: &str) -> Result<(), ClassifiedError>;

    fn delete_many(&self, keys: &[String]) -> Result<(), ClassifiedError> {
        for key in keys {
            self.delete(key)?;
        }
        Ok(())
    }

    /// Create `key` with `bytes` iff it does not already exist. Used for
    /// locks. Backends without native conditional-put emulate this with a
    /// probe object and a best-effort existence check.
    fn put_if_absent(&self, key: &str, bytes: &[u8]) -> Result<(), ClassifiedError>;

    fn multipart_create(&self, key: &str) -> Result<MultipartUpload, ClassifiedError> {
        Ok(MultipartUpload { upload_id: uuid::Uuid::new_v4().to_string(), key: key.to_string(), parts: Vec::new() })
    }

    fn multipart_upload_part(&self, upload: &mut MultipartUpload, part: Vec<u8>) -> Result<(), ClassifiedError> {
        upload.parts.push(part);
        Ok(())
    }

    fn multipart_complete(&self, upload: MultipartUpload) -> Result<String, ClassifiedError> {
        let mut full = Vec::new();
        for part in upload.parts {
            full.extend(part);
        }
        self.put(&upload.key, &full)
    }

    fn multipart_abort(&self, _upload: MultipartUpload) -> Result<(), ClassifiedError> {
        Ok(())
    }
}

/// Threshold above which `put` should prefer multipart upload (spec §4.1).
pub const MULTIPART_THRESHOLD_BYTES: usize = 64 * 1024 * 1024;

/// Retry a `ClassifiedError`-returning call up to 5 times with capped
/// exponential backoff, surfacing `transient_exhausted` on the last
/// failure (spec §4.1).
pub fn retrying<T>(op: impl FnMut() -> Result<T, ClassifiedError>) -> Result<T, Error> {
    let mut op = op;
    with_retry(
        5,
        move || op().map_err(|e| e.into()),
        |err| err.downcast_ref::<ClassifiedError>().map(|c| c.is_transient()).unwrap_or(false),
    )
}

/// On-disk/object-store layout (spec §6).
pub mod layout {
    pub fn backup_prefix(database_id: &str, backup_id: &str) -> String {
        format!("{database_id}/{backup_id}")
    }

    pub fn manifest_key(database_id: &str, backup_id: &str) -> String {
        format!("{}/manifest", backup_prefix(database_id, backup_id))
    }

    pub fn config_key(database_id: &str, backup_id: &str) -> String {
        format!("{}/config", backup_prefix(database_id, backup_id))
    }

    pub fn schema_key(database_id: &str, backup_id: &str) -> String {
        format!("{}/schema", backup_prefix(database_id, backup_id))
    }

    pub fn checkpoint_key(database_id: &str, backup_id: &str) -> String {
        format!("{}/checkpoint", backup_prefix(database_id, backup_id))
    }

    pub fn complete_marker_key(database_id: &str, backup_id: &str) -> String {
        format!("{}/complete.marker", backup_prefix(database_id, backup_id))
    }

    pub fn lock_key(database_id: &str, backup_id: &str) -> String {
        format!("{}/lock", backup_prefix(database_id, backup_id))
    }

    pub fn chunk_key(database_id: &str, backup_id: &str, chunk_id: u64) -> String {
        format!("{}/chunks/datoms-{chunk_id}.bin.gz", backup_prefix(database_id, backup_id))
    }

    pub fn chunks_prefix(database_id: &str, backup_id: &str) -> String {
        format!("{}/chunks/", backup_prefix(database_id, backup_id))
    }

    pub fn migration_prefix(database_id: &str, migration_id: &str) -> String {
        format!("{database_id}/migrations/{migration_id}")
    }

    pub fn migration_record_key(database_id: &str, migration_id: &str) -> String {
        format!("{}/migration-manifest", migration_prefix(database_id, migration_id))
    }

    pub fn tx_log_key(database_id: &str, migration_id: &str) -> String {
        format!("{}/tx.log", migration_prefix(database_id, migration_id))
    }

    pub fn migration_lock_key(database_id: &str) -> String {
        format!("{database_id}/migrations/lock")
    }
}
