//! Migration controller (C8): a persisted state machine from
//! `initializing` to `completed`, driving C5/C6/C7 and exposing a
//! dual-mode router for cutover writes (spec §4.8).
//!
//! Grounded in the durability corpus's "commit record, then act" pattern
//! (persist a state transition before its side effect, so a crash never
//! leaves the record ahead of reality) and in the teacher's atomic-rename
//! persistence for the record itself.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Error};
use serde::{Deserialize, Serialize};

use crate::backup::{self, BackupResult};
use crate::capture::{self, TxCapture};
use crate::error::{BackupError, ErrorKind};
use crate::metadata::{self, MigrationRecord};
use crate::options::{BackupOptions, MigrationOptions, RestoreOptions};
use crate::progress::{emit, ProgressEvent};
use crate::restore;
use crate::store::{layout, ObjectStore};
use crate::tuple::{SourceDb, Tuple, TxReport};

/// Safety margin (spec §4.8 "Resumption"): if the log's last persisted `t`
/// trails the source's current `t` by more than this, a capture gap is
/// assumed and the migration fails rather than silently losing commits.
const CAPTURE_GAP_SAFETY_MARGIN: i64 = 0;

/// "Live tail" detection interval for catch-up (spec §4.8: D default 500ms
/// — the queue is empty and nothing new arrived in the last D ms).
const CATCH_UP_QUIESCE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum MigrationState {
    Initializing,
    Backup,
    Restore,
    CatchingUp,
    Ready,
    Finalizing,
    Completed,
    Failed { reason: String },
    Archived,
}

impl MigrationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrationState::Completed | MigrationState::Failed { .. } | MigrationState::Archived)
    }
}

pub struct FinalizeResult {
    pub status: String,
    pub tuples_captured: u64,
}

/// Returned once the migration reaches `ready`. `submit` forwards writes to
/// the source and captures them; `finalize` drains the remainder and
/// transitions to `completed` (spec §9 "Router dual-mode").
pub struct Router<'a> {
    store: &'a dyn ObjectStore,
    source: &'a dyn SourceDb,
    target: &'a dyn SourceDb,
    database_id: String,
    migration_id: String,
    log_path: PathBuf,
    cursor_path: PathBuf,
    capture: Option<TxCapture>,
    subscription: Option<crate::tuple::SubscriptionKey>,
}

impl<'a> Router<'a> {
    pub fn submit(&self, tuples: Vec<Tuple>) -> Result<TxReport, BackupError> {
        self.source.transact(tuples).map_err(|e| BackupError::from_anyhow(ErrorKind::Fatal, e))
    }

    /// Unsubscribe capture, drain the remaining log into the target, and
    /// mark the migration `completed` (spec §4.8 "finalizing"). Consumes
    /// the router: a finalized migration has nothing left to route through.
    pub fn finalize(mut self) -> Result<FinalizeResult, BackupError> {
        run_finalize(&mut self).map_err(|err| match err.downcast_ref::<BackupError>() {
            Some(existing) => BackupError::new(existing.kind, existing.message.clone()),
            None => BackupError::from_anyhow(ErrorKind::Fatal, err),
        })
    }
}

fn run_finalize(router: &mut Router<'_>) -> Result<FinalizeResult, Error> {
    if let Some(key) = router.subscription.take() {
        router.source.unsubscribe(key)?;
    }
    if let Some(capture) = router.capture.take() {
        capture.stop()?;
    }
    let applied = capture::replay(&router.log_path, &router.cursor_path, router.target)?;

    let mut record = metadata::read_migration_record(router.store, &router.database_id, &router.migration_id)?;
    record.state = MigrationState::Completed;
    record.updated_at = chrono::Utc::now();
    metadata::write_migration_record(router.store, &record)?;
    router.store.delete(&layout::migration_lock_key(&router.database_id))?;

    tracing::info!(migration_id = %router.migration_id, "migration completed");
    Ok(FinalizeResult { status: "completed".to_string(), tuples_captured: applied })
}

/// Drive the migration through `initializing -> ... -> ready` and return
/// the router for the caller to route cutover writes through.
pub fn start_migration<'a>(
    store: &'a dyn ObjectStore,
    source: &'a dyn SourceDb,
    target: &'a dyn SourceDb,
    options: MigrationOptions,
) -> Result<Router<'a>, BackupError> {
    run_migration(store, source, target, options).map_err(|err| match err.downcast_ref::<BackupError>() {
        Some(existing) => BackupError::new(existing.kind, existing.message.clone()),
        None => BackupError::from_anyhow(ErrorKind::Fatal, err),
    })
}

fn run_migration<'a>(
    store: &'a dyn ObjectStore,
    source: &'a dyn SourceDb,
    target: &'a dyn SourceDb,
    options: MigrationOptions,
) -> Result<Router<'a>, Error> {
    let database_id = options.database_id.clone();
    let migration_id = options.migration_id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let span = tracing::info_span!("migration", %database_id, %migration_id);
    let _guard = span.enter();

    let lock_key = layout::migration_lock_key(&database_id);
    let existing_record = metadata::read_migration_record(store, &database_id, &migration_id).ok();

    let resuming = existing_record.as_ref().is_some_and(|r| !r.state.is_terminal());
    if !resuming {
        acquire_migration_lock(store, &lock_key, &migration_id)?;
    }

    let mut record = existing_record.unwrap_or_else(|| MigrationRecord {
        migration_id: migration_id.clone(),
        database_id: database_id.clone(),
        state: MigrationState::Initializing,
        backup_id: None,
        capture_start_t: None,
        replay_cursor: None,
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    });

    let work_dir = options
        .local_work_dir
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("datalog-backup-migrations").join(&migration_id));
    let log_path = work_dir.join("tx.log");
    let cursor_path = work_dir.join("tx.cursor");

    if resuming {
        check_capture_gap(&log_path, source, &record.state, record.capture_start_t)?;
    }

    let mut capture_handle: Option<TxCapture> = None;
    let mut subscription = None;

    if matches!(record.state, MigrationState::Initializing) {
        let snapshot = source.snapshot().context("opening source snapshot before capture")?;
        record.capture_start_t = Some(source.max_t(snapshot.as_ref())?);
        record.state = MigrationState::Backup;
        record.updated_at = chrono::Utc::now();
        metadata::write_migration_record(store, &record)?;
        emit(&options.progress_fn, ProgressEvent::MigrationStateChanged { migration_id: migration_id.clone(), state: record.state.clone() });
    }

    if matches!(record.state, MigrationState::Backup) {
        let capture = TxCapture::start(
            log_path.clone(),
            capture::DEFAULT_QUEUE_CAPACITY,
            capture::DEFAULT_FSYNC_EVERY_N,
            capture::DEFAULT_FSYNC_EVERY,
        )?;
        subscription = Some(capture.subscribe(source)?);

        let backup_result: BackupResult = backup::backup(
            store,
            source,
            BackupOptions {
                database_id: database_id.clone(),
                backup_id: record.backup_id.clone(),
                chunk_bytes: options.chunk_bytes,
                ..Default::default()
            },
        )
        .map_err(|e| anyhow::Error::new(e))?;

        record.backup_id = Some(backup_result.backup_id);
        record.state = MigrationState::Restore;
        record.updated_at = chrono::Utc::now();
        metadata::write_migration_record(store, &record)?;
        emit(&options.progress_fn, ProgressEvent::MigrationStateChanged { migration_id: migration_id.clone(), state: record.state.clone() });
        capture_handle = Some(capture);
    }

    if matches!(record.state, MigrationState::Restore) {
        let backup_id = record.backup_id.clone().context("migration record missing backup_id in restore state")?;
        restore::restore(
            store,
            target,
            RestoreOptions { database_id: database_id.clone(), backup_id, batch_size: options.batch_size, ..Default::default() },
        )
        .map_err(|e| anyhow::Error::new(e))?;

        record.state = MigrationState::CatchingUp;
        record.updated_at = chrono::Utc::now();
        metadata::write_migration_record(store, &record)?;
        emit(&options.progress_fn, ProgressEvent::MigrationStateChanged { migration_id: migration_id.clone(), state: record.state.clone() });
    }

    if matches!(record.state, MigrationState::CatchingUp) {
        loop {
            let applied = capture::replay(&log_path, &cursor_path, target)?;
            if applied == 0 {
                std::thread::sleep(CATCH_UP_QUIESCE.min(Duration::from_millis(1)));
                let second_pass = capture::replay(&log_path, &cursor_path, target)?;
                if second_pass == 0 {
                    break;
                }
            }
        }
        record.replay_cursor = capture::read_cursor(&cursor_path)?;
        record.state = MigrationState::Ready;
        record.updated_at = chrono::Utc::now();
        metadata::write_migration_record(store, &record)?;
        emit(&options.progress_fn, ProgressEvent::MigrationStateChanged { migration_id: migration_id.clone(), state: record.state.clone() });
    }

    if !matches!(record.state, MigrationState::Ready) {
        bail!(BackupError::fatal(format!("migration {migration_id} resumed into unexpected state {:?}", record.state)));
    }

    Ok(Router {
        store,
        source,
        target,
        database_id,
        migration_id,
        log_path,
        cursor_path,
        capture: capture_handle,
        subscription,
    })
}

fn acquire_migration_lock(store: &dyn ObjectStore, lock_key: &str, migration_id: &str) -> Result<(), Error> {
    match store.put_if_absent(lock_key, migration_id.as_bytes()) {
        Ok(()) => Ok(()),
        Err(err) if err.kind == ErrorKind::Conflict => {
            let holder = store.get(lock_key).map(|b| String::from_utf8_lossy(&b).to_string()).unwrap_or_default();
            bail!(BackupError::conflict(format!("migration already in progress for this database_id (holder: {holder})")))
        }
        Err(err) => Err(err.into()),
    }
}

/// Refuse to resume if the appender never caught up to the source before
/// the last clean shutdown (spec §4.8 "Resumption": force `failed` with
/// `capture_gap` rather than silently lose commits). Before `backup` starts,
/// no subscription has ever existed, so there's nothing to gap-check yet.
fn check_capture_gap(
    log_path: &PathBuf,
    source: &dyn SourceDb,
    state: &MigrationState,
    capture_start_t: Option<i64>,
) -> Result<(), Error> {
    if matches!(state, MigrationState::Initializing) {
        return Ok(());
    }
    // An empty (or not-yet-created) log means nothing has been captured
    // since the subscription was opened; the baseline to compare against is
    // then `capture_start_t`, not an unconditioned "earliest possible t"
    // sentinel, which would underflow/overflow against a real `current_t`.
    let baseline = match last_logged_t(log_path)? {
        Some(t) => t,
        None => match capture_start_t {
            Some(t) => t,
            None => bail!(BackupError::capture_gap(
                "resuming past initialization with no capture_start_t and no logged entries; cannot verify capture continuity"
            )),
        },
    };
    let snapshot = source.snapshot()?;
    let current_t = source.max_t(snapshot.as_ref())?;
    if current_t.saturating_sub(baseline) > CAPTURE_GAP_SAFETY_MARGIN {
        bail!(BackupError::capture_gap(format!(
            "tx log last captured t={baseline} but source is at t={current_t}; capture was not continuously subscribed across the restart"
        )));
    }
    Ok(())
}

fn last_logged_t(log_path: &PathBuf) -> Result<Option<i64>, Error> {
    if !log_path.exists() {
        return Ok(None);
    }
    use std::io::BufRead;
    let file = std::fs::File::open(log_path)?;
    let mut last = None;
    for line in std::io::BufReader::new(file).lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let entry: crate::metadata::TxLogEntry = serde_json::from_str(&line)?;
        last = Some(entry.t);
    }
    Ok(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FsStore;
    use crate::tuple::{Snapshot, Value};
    use std::sync::Mutex;

    struct FakeSnapshot;
    impl Snapshot for FakeSnapshot {}

    /// A source DB whose `subscribe` actually remembers a listener so
    /// `transact` can fan commits out to it, the way a real engine's commit
    /// hook would.
    struct FakeSourceDb {
        tuples: Mutex<Vec<Tuple>>,
        next_t: Mutex<i64>,
        listeners: Mutex<Vec<Box<dyn Fn(&TxReport) + Send + Sync>>>,
    }

    impl FakeSourceDb {
        fn new(initial: Vec<Tuple>, start_t: i64) -> Self {
            Self { tuples: Mutex::new(initial), next_t: Mutex::new(start_t), listeners: Mutex::new(Vec::new()) }
        }
    }

    impl SourceDb for FakeSourceDb {
        fn snapshot(&self) -> anyhow::Result<Box<dyn Snapshot>> {
            Ok(Box::new(FakeSnapshot))
        }
        fn datoms_eavt(&self, _s: &dyn Snapshot) -> anyhow::Result<Box<dyn Iterator<Item = anyhow::Result<Tuple>>>> {
            Ok(Box::new(self.tuples.lock().unwrap().clone().into_iter().map(Ok)))
        }
        fn schema(&self, _s: &dyn Snapshot) -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::json!({}))
        }
        fn config(&self, _s: &dyn Snapshot) -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::json!({}))
        }
        fn transact(&self, tuples: Vec<Tuple>) -> anyhow::Result<TxReport> {
            let mut next_t = self.next_t.lock().unwrap();
            let t = *next_t;
            *next_t += 1;
            let tuples: Vec<Tuple> = tuples.into_iter().map(|mut t2| { t2.t = t; t2 }).collect();
            self.tuples.lock().unwrap().extend(tuples.clone());
            let report = TxReport { t, committed_at: chrono::Utc::now(), tuples };
            for listener in self.listeners.lock().unwrap().iter() {
                listener(&report);
            }
            Ok(report)
        }
        fn load_pre_formed(&self, tuples: Vec<Tuple>, _max_e: i64, _max_t: i64) -> anyhow::Result<()> {
            self.tuples.lock().unwrap().extend(tuples);
            Ok(())
        }
        fn subscribe(&self, listener: Box<dyn Fn(&TxReport) + Send + Sync>) -> anyhow::Result<u64> {
            self.listeners.lock().unwrap().push(listener);
            Ok(self.listeners.lock().unwrap().len() as u64)
        }
        fn unsubscribe(&self, _key: u64) -> anyhow::Result<()> {
            Ok(())
        }
        fn max_eid(&self, _s: &dyn Snapshot) -> anyhow::Result<i64> {
            Ok(self.tuples.lock().unwrap().iter().map(|t| t.e).max().unwrap_or(0))
        }
        fn max_t(&self, _s: &dyn Snapshot) -> anyhow::Result<i64> {
            Ok(*self.next_t.lock().unwrap() - 1)
        }
    }

    fn tuple(t: i64, e: i64) -> Tuple {
        Tuple { e, a: "user/name".into(), v: Value::Str("x".into()), t, added: true }
    }

    #[test]
    fn migration_reaches_ready_and_finalizes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path().join("store"));
        let source = FakeSourceDb::new(vec![tuple(0, 1), tuple(0, 2)], 1);
        let target = FakeSourceDb::new(vec![], 0);

        let options = MigrationOptions {
            database_id: "db1".into(),
            local_work_dir: Some(dir.path().join("work")),
            ..Default::default()
        };
        let router = start_migration(&store, &source, &target, options).unwrap();

        source.transact(vec![tuple(0, 3)]).unwrap();

        let result = router.finalize().unwrap();
        assert_eq!(result.status, "completed");
    }

    #[test]
    fn concurrent_migration_attempt_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path().join("store"));
        store.put_if_absent(&layout::migration_lock_key("db1"), b"other-migration").unwrap();

        let source = FakeSourceDb::new(vec![], 0);
        let target = FakeSourceDb::new(vec![], 0);
        let options = MigrationOptions { database_id: "db1".into(), local_work_dir: Some(dir.path().join("work")), ..Default::default() };
        let result = start_migration(&store, &source, &target, options);
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind, ErrorKind::Conflict);
    }
}
