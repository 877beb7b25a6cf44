//! Progress reporting (spec §6 `progress_fn` option, §9 "observer").
//!
//! The callback is invoked synchronously from the operation's own thread;
//! it must not block significantly since backpressure isn't modeled here
//! (unlike the bounded tx-capture queue in `capture.rs`).

use std::sync::Arc;

/// One progress update. `stage` names where in the operation this fired;
/// the rest of the fields are populated per-stage (e.g. `chunk_id` only on
/// `ChunkUploaded`).
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    BackupStarted { backup_id: String },
    ChunkUploaded { chunk_id: u64, tuple_count: u64, total_bytes: u64 },
    BackupSealed { backup_id: String, chunk_count: u64 },
    RestoreStarted { backup_id: String },
    BatchLoaded { tuples_restored: u64 },
    RestoreFinished { tuples_restored: u64 },
    MigrationStateChanged { migration_id: String, state: crate::migration::MigrationState },
    GcMarkProgress { visited_commits: u64 },
    GcSweepProgress { deleted_keys: u64 },
}

pub type ProgressFn = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

pub(crate) fn emit(progress_fn: &Option<ProgressFn>, event: ProgressEvent) {
    if let Some(f) = progress_fn {
        f(event);
    }
}
