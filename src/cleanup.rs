//! `cleanup_incomplete` (supplemented, SPEC_FULL §2.5): sweep backup
//! prefixes under a `database_id` that were abandoned mid-backup (manifest
//! present, complete-marker absent) and are older than a threshold.

use std::collections::BTreeSet;

use anyhow::{Context, Error};

use crate::error::{BackupError, ErrorKind};
use crate::metadata;
use crate::options::CleanupOptions;
use crate::store::{layout, ObjectStore};

#[derive(Debug)]
pub struct CleanupResult {
    pub removed_backup_ids: Vec<String>,
}

pub fn cleanup_incomplete(store: &dyn ObjectStore, options: CleanupOptions) -> Result<CleanupResult, BackupError> {
    run_cleanup(store, options).map_err(|err| match err.downcast_ref::<BackupError>() {
        Some(existing) => BackupError::new(existing.kind, existing.message.clone()),
        None => BackupError::from_anyhow(ErrorKind::Fatal, err),
    })
}

fn run_cleanup(store: &dyn ObjectStore, options: CleanupOptions) -> Result<CleanupResult, Error> {
    let database_id = &options.database_id;
    let prefix = format!("{database_id}/");
    let objects = store.list(&prefix).context("listing database prefix")?;

    let mut backup_ids = BTreeSet::new();
    for obj in &objects {
        let rest = obj.key.strip_prefix(&prefix).unwrap_or(&obj.key);
        let mut parts = rest.splitn(2, '/');
        if let Some(first) = parts.next() {
            if first != "migrations" && !first.is_empty() {
                backup_ids.insert(first.to_string());
            }
        }
    }

    let cutoff = chrono::Utc::now() - chrono::Duration::seconds(options.older_than_seconds);
    let mut removed = Vec::new();

    for backup_id in backup_ids {
        if metadata::is_complete(store, database_id, &backup_id) {
            continue;
        }
        let manifest = match metadata::read_manifest(store, database_id, &backup_id) {
            Ok(m) => m,
            Err(_) => continue, // no manifest at all: not a backup prefix we recognize
        };
        if manifest.created_at > cutoff {
            continue;
        }

        let backup_prefix = layout::backup_prefix(database_id, &backup_id);
        let keys: Vec<String> = store.list(&backup_prefix)?.into_iter().map(|d| d.key).collect();
        store.delete_many(&keys)?;
        tracing::warn!(%backup_id, key_count = keys.len(), "removed incomplete backup");
        removed.push(backup_id);
    }

    Ok(CleanupResult { removed_backup_ids: removed })
}
