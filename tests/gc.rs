//! GC dry-run invariance (spec §8 S6): a `dry_run` pass must report exactly
//! what a subsequent real pass deletes, and must never itself mutate the
//! content-addressed store.

mod common;

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use datalog_backup::{gc, CommitId, CommitNode, ContentAddressedStore, GcBackend, GcOptions, Key};

struct InMemoryCas {
    heads: Vec<CommitId>,
    commits: HashMap<CommitId, CommitNode>,
    keys: Mutex<HashSet<Key>>,
}

impl InMemoryCas {
    fn new(heads: Vec<CommitId>, commits: Vec<CommitNode>, extra_keys: Vec<Key>) -> Self {
        let mut keys = HashSet::new();
        let mut by_id = HashMap::new();
        for commit in commits {
            for key in &commit.referenced_keys {
                keys.insert(key.clone());
            }
            by_id.insert(commit.id.clone(), commit);
        }
        for key in extra_keys {
            keys.insert(key);
        }
        Self { heads, commits: by_id, keys: Mutex::new(keys) }
    }
}

impl ContentAddressedStore for InMemoryCas {
    fn branch_heads(&self) -> anyhow::Result<Vec<CommitId>> {
        Ok(self.heads.clone())
    }
    fn get_commit(&self, id: &CommitId) -> anyhow::Result<CommitNode> {
        self.commits.get(id).cloned().ok_or_else(|| anyhow::anyhow!("no such commit {id}"))
    }
    fn list_all_keys(&self) -> anyhow::Result<Box<dyn Iterator<Item = anyhow::Result<Key>>>> {
        let keys: Vec<_> = self.keys.lock().unwrap().iter().cloned().collect();
        Ok(Box::new(keys.into_iter().map(Ok)))
    }
    fn delete_keys(&self, keys: &[Key]) -> anyhow::Result<()> {
        let mut guard = self.keys.lock().unwrap();
        for key in keys {
            guard.remove(key);
        }
        Ok(())
    }
    fn key_exists(&self, key: &Key) -> anyhow::Result<bool> {
        Ok(self.keys.lock().unwrap().contains(key))
    }
}

fn options(dry_run: bool) -> GcOptions {
    GcOptions {
        database_id: "db1".into(),
        backend: GcBackend::Memory,
        dry_run,
        retention_seconds: 0,
        force_new: false,
        batch_size: None,
        parallel: None,
        checkpoint_interval: 1000,
        progress_fn: None,
    }
}

fn build_cas() -> InMemoryCas {
    InMemoryCas::new(
        vec!["head".into()],
        vec![
            CommitNode { id: "root".into(), parents: vec![], referenced_keys: vec!["k-root".into()] },
            CommitNode { id: "head".into(), parents: vec!["root".into()], referenced_keys: vec!["k-head".into()] },
        ],
        vec!["orphan-1".into(), "orphan-2".into()],
    )
}

#[test]
fn s6_dry_run_count_matches_subsequent_real_sweep_count() {
    let dir = tempfile::tempdir().unwrap();
    let store = datalog_backup::FsStore::new(dir.path());
    let cas = build_cas();

    let dry = gc(&store, &cas, options(true)).unwrap();
    assert_eq!(dry.would_delete_count, 2);
    assert_eq!(dry.deleted_count, 0);
    assert!(cas.key_exists(&"orphan-1".to_string()).unwrap());
    assert!(cas.key_exists(&"orphan-2".to_string()).unwrap());

    let real = gc(&store, &cas, options(false)).unwrap();
    assert_eq!(real.deleted_count, dry.would_delete_count);
    assert!(!cas.key_exists(&"orphan-1".to_string()).unwrap());
    assert!(!cas.key_exists(&"orphan-2".to_string()).unwrap());
    assert!(cas.key_exists(&"k-root".to_string()).unwrap());
    assert!(cas.key_exists(&"k-head".to_string()).unwrap());
}

#[test]
fn s6_dry_run_never_mutates_the_store_even_when_run_repeatedly() {
    let dir = tempfile::tempdir().unwrap();
    let store = datalog_backup::FsStore::new(dir.path());
    let cas = build_cas();

    for _ in 0..3 {
        gc(&store, &cas, options(true)).unwrap();
    }
    assert!(cas.key_exists(&"orphan-1".to_string()).unwrap());
    assert!(cas.key_exists(&"orphan-2".to_string()).unwrap());
    assert!(cas.key_exists(&"k-root".to_string()).unwrap());
}
