//! Filesystem-backed [`ObjectStore`]: the local-directory half of C1.
//!
//! Writes go through [`crate::tools::file_set_contents`]'s mkstemp+rename
//! idiom so a reader never observes a torn write.

use std::path::{Path, PathBuf};

use anyhow::anyhow;

use super::{ClassifiedError, ObjectDescriptor, ObjectStore};
use crate::error::ErrorKind;
use crate::tools;

pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn classify_io(err: std::io::Error) -> ClassifiedError {
        use std::io::ErrorKind as IoKind;
        let kind = match err.kind() {
            IoKind::NotFound => ErrorKind::Fatal,
            IoKind::AlreadyExists => ErrorKind::Conflict,
            IoKind::PermissionDenied => ErrorKind::Fatal,
            // ENOSPC, hardcoded to avoid a dependency on libc for one errno.
            _ if err.raw_os_error() == Some(28) => ErrorKind::Resource,
            _ => ErrorKind::Transient,
        };
        ClassifiedError::new(kind, err.into())
    }
}

impl ObjectStore for FsStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<String, ClassifiedError> {
        let path = self.path_for(key);
        tools::file_set_contents(&path, bytes).map_err(|e| ClassifiedError::new(ErrorKind::Transient, e))?;
        Ok(etag_of(bytes))
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, ClassifiedError> {
        std::fs::read(self.path_for(key)).map_err(Self::classify_io)
    }

    fn list(&self, prefix: &str) -> Result<Vec<ObjectDescriptor>, ClassifiedError> {
        let base = self.path_for(prefix);
        let mut out = Vec::new();
        if !base.exists() {
            return Ok(out);
        }
        for entry in walkdir::WalkDir::new(&base).into_iter() {
            let entry = entry.map_err(|e| ClassifiedError::new(ErrorKind::Transient, anyhow!(e)))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let meta = entry.metadata().map_err(|e| ClassifiedError::new(ErrorKind::Transient, anyhow!(e)))?;
            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .map_err(|e| ClassifiedError::new(ErrorKind::Fatal, anyhow!(e)))?;
            let mtime: chrono::DateTime<chrono::Utc> = meta.modified().map_err(Self::classify_io)?.into();
            out.push(ObjectDescriptor {
                key: rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/"),
                size: meta.len(),
                mtime,
            });
        }
        Ok(out)
    }

    fn delete(&self, key: &str) -> Result<(), ClassifiedError> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Self::classify_io(err)),
        }
    }

    fn put_if_absent(&self, key: &str, bytes: &[u8]) -> Result<(), ClassifiedError> {
        tools::create_new_file(self.path_for(key), bytes)
            .map_err(|e| ClassifiedError::new(ErrorKind::Conflict, e))
    }
}

fn etag_of(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(bytes);
    hex::encode(digest)
}

pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)
}
