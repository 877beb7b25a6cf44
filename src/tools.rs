//! Small filesystem and timing helpers shared by the store adapters and
//! the backup/restore engines.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Error};
use rand::Rng;

/// Atomically replace the contents of `path` with `data`.
///
/// Writes to a sibling `.tmp-XXXXXX` file first, then renames it into
/// place. This works across processes and threads: a reader either sees
/// the old file or the fully-written new one, never a torn write.
pub fn file_set_contents<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<(), Error> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {parent:?}"))?;
    }

    let suffix: u32 = rand::thread_rng().gen();
    let tmp_path = path.with_extension(format!("tmp-{suffix:08x}"));

    let mut file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&tmp_path)
        .with_context(|| format!("failed to create temp file {tmp_path:?}"))?;

    if let Err(err) = file.write_all(data) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(err).with_context(|| format!("failed to write {tmp_path:?}"));
    }

    if let Err(err) = file.sync_all() {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(err).with_context(|| format!("failed to fsync {tmp_path:?}"));
    }

    if let Err(err) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(err).with_context(|| format!("failed to rename {tmp_path:?} to {path:?}"));
    }

    Ok(())
}

/// Create `path` iff it does not already exist, failing otherwise. Used to
/// emulate `atomic_put_if_absent` for the filesystem backend.
pub fn create_new_file<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<(), Error> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .with_context(|| format!("lock object {path:?} already present"))?;
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}

/// Exponential backoff with jitter, matching §4.1 of the spec: base 1s,
/// factor 2, max 16s, jitter +/-20%, up to `max_attempts`.
pub struct Backoff {
    attempt: u32,
    max_attempts: u32,
}

impl Backoff {
    pub fn new(max_attempts: u32) -> Self {
        Self { attempt: 0, max_attempts }
    }

    /// Returns `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        self.attempt += 1;
        let base_ms = 1000u64 * (1u64 << (self.attempt - 1).min(4)); // 1,2,4,8,16s
        let base_ms = base_ms.min(16_000);
        let jitter_frac = rand::thread_rng().gen_range(-0.2..=0.2);
        let jittered = (base_ms as f64) * (1.0 + jitter_frac);
        Some(Duration::from_millis(jittered.max(0.0) as u64))
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempt
    }
}

/// Run `op`, retrying on `should_retry(&Error) == true` using [`Backoff`].
pub fn with_retry<T>(
    max_attempts: u32,
    mut op: impl FnMut() -> Result<T, Error>,
    should_retry: impl Fn(&Error) -> bool,
) -> Result<T, Error> {
    let mut backoff = Backoff::new(max_attempts);
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if should_retry(&err) => match backoff.next_delay() {
                Some(delay) => {
                    tracing::warn!(attempt = backoff.attempts_made(), ?delay, "retrying after transient error: {err:#}");
                    std::thread::sleep(delay);
                }
                None => bail!("transient error exhausted after {max_attempts} attempts: {err:#}"),
            },
            Err(err) => return Err(err),
        }
    }
}

/// Open (creating if needed) a plain file handle. Used by tests and by the
/// filesystem store for small housekeeping files.
pub fn touch<P: AsRef<Path>>(path: P) -> Result<File, Error> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(path.as_ref())
        .with_context(|| format!("failed to open {:?}", path.as_ref()))?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest");
        file_set_contents(&path, b"first").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"first");
        file_set_contents(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
    }

    #[test]
    fn create_new_file_rejects_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        create_new_file(&path, b"owner-a").unwrap();
        assert!(create_new_file(&path, b"owner-b").is_err());
    }

    #[test]
    fn backoff_caps_and_exhausts() {
        let mut b = Backoff::new(2);
        assert!(b.next_delay().is_some());
        assert!(b.next_delay().is_some());
        assert!(b.next_delay().is_none());
    }
}
