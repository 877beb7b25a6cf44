//! `verify` (supplemented, SPEC_FULL §2.5): re-read the manifest and
//! re-hash every chunk without touching any DB. Shares the adapter/codec/
//! metadata path with restore but never constructs a target-DB session.

use anyhow::{bail, Context, Error};

use crate::error::{BackupError, ErrorKind};
use crate::metadata;
use crate::options::VerifyOptions;
use crate::store::ObjectStore;

#[derive(Debug)]
pub struct VerifyResult {
    pub success: bool,
    pub chunks_verified: u64,
    pub chunk_count: u64,
    pub tuple_count: u64,
}

pub fn verify(store: &dyn ObjectStore, options: VerifyOptions) -> Result<VerifyResult, BackupError> {
    run_verify(store, options).map_err(|err| match err.downcast_ref::<BackupError>() {
        Some(existing) => BackupError::new(existing.kind, existing.message.clone()),
        None => BackupError::from_anyhow(ErrorKind::Fatal, err),
    })
}

fn run_verify(store: &dyn ObjectStore, options: VerifyOptions) -> Result<VerifyResult, Error> {
    let database_id = &options.database_id;
    let backup_id = &options.backup_id;

    if !metadata::is_complete(store, database_id, backup_id) {
        bail!(BackupError::fatal(format!("backup {backup_id} has no complete-marker")));
    }
    let manifest = metadata::read_manifest(store, database_id, backup_id).context("reading manifest")?;
    let chunk_count = manifest.chunks.len() as u64;
    let mut chunks_verified = 0u64;
    let mut tuple_count = 0u64;

    for descriptor in &manifest.chunks {
        let bytes = store.get(&descriptor.key).with_context(|| format!("reading chunk {}", descriptor.key))?;
        let expected = hex::decode(&descriptor.sha256).context("invalid sha256 hex")?;
        let expected: [u8; 32] =
            expected.try_into().map_err(|_| anyhow::anyhow!("sha256 must be 32 bytes"))?;
        let reader = crate::codec::ChunkReader::open(std::io::Cursor::new(bytes), expected, options.verify_checksums)
            .map_err(|e| Error::new(BackupError::data(format!("chunk {} header invalid: {e:#}", descriptor.chunk_id))))?;
        let mut count = 0u64;
        for item in reader {
            item.map_err(|e| BackupError::data(format!("chunk {} failed re-decode: {e:#}", descriptor.chunk_id)))?;
            count += 1;
        }
        if count != descriptor.tuple_count {
            bail!(BackupError::data(format!(
                "chunk {} tuple_count mismatch: manifest says {} but decoded {count}",
                descriptor.chunk_id, descriptor.tuple_count
            )));
        }
        tuple_count += count;
        chunks_verified += 1;
    }

    Ok(VerifyResult { success: true, chunks_verified, chunk_count, tuple_count })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::backup;
    use crate::options::BackupOptions;
    use crate::store::FsStore;
    use crate::tuple::{Snapshot, SourceDb, Tuple, TxReport, Value};

    struct FakeSnapshot;
    impl Snapshot for FakeSnapshot {}

    struct FakeSourceDb {
        tuples: Vec<Tuple>,
    }

    impl SourceDb for FakeSourceDb {
        fn snapshot(&self) -> anyhow::Result<Box<dyn Snapshot>> {
            Ok(Box::new(FakeSnapshot))
        }
        fn datoms_eavt(&self, _s: &dyn Snapshot) -> anyhow::Result<Box<dyn Iterator<Item = anyhow::Result<Tuple>>>> {
            Ok(Box::new(self.tuples.clone().into_iter().map(Ok)))
        }
        fn schema(&self, _s: &dyn Snapshot) -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::json!({}))
        }
        fn config(&self, _s: &dyn Snapshot) -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::json!({}))
        }
        fn transact(&self, _tuples: Vec<Tuple>) -> anyhow::Result<TxReport> {
            unimplemented!()
        }
        fn load_pre_formed(&self, _tuples: Vec<Tuple>, _max_e: i64, _max_t: i64) -> anyhow::Result<()> {
            unimplemented!()
        }
        fn subscribe(&self, _l: Box<dyn Fn(&TxReport) + Send + Sync>) -> anyhow::Result<u64> {
            unimplemented!()
        }
        fn unsubscribe(&self, _key: u64) -> anyhow::Result<()> {
            unimplemented!()
        }
        fn max_eid(&self, _s: &dyn Snapshot) -> anyhow::Result<i64> {
            Ok(5)
        }
        fn max_t(&self, _s: &dyn Snapshot) -> anyhow::Result<i64> {
            Ok(5)
        }
    }

    #[test]
    fn verify_succeeds_on_freshly_sealed_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        let tuples = vec![Tuple { e: 1, a: "user/name".into(), v: Value::Str("a".into()), t: 1, added: true }];
        let source = FakeSourceDb { tuples };
        let backup_result =
            backup(&store, &source, BackupOptions { database_id: "db1".into(), ..Default::default() }).unwrap();

        let result = verify(
            &store,
            VerifyOptions { database_id: "db1".into(), backup_id: backup_result.backup_id, verify_checksums: true, progress_fn: None },
        )
        .unwrap();
        assert!(result.success);
        assert_eq!(result.tuple_count, 1);
        assert_eq!(result.chunks_verified, result.chunk_count);
    }

    #[test]
    fn verify_detects_corrupted_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        let tuples = vec![Tuple { e: 1, a: "user/name".into(), v: Value::Str("a".into()), t: 1, added: true }];
        let source = FakeSourceDb { tuples };
        let backup_result =
            backup(&store, &source, BackupOptions { database_id: "db1".into(), ..Default::default() }).unwrap();

        let chunk_key = crate::store::layout::chunk_key("db1", &backup_result.backup_id, 0);
        store.put(&chunk_key, b"corrupted-bytes").unwrap();

        let result = verify(
            &store,
            VerifyOptions { database_id: "db1".into(), backup_id: backup_result.backup_id, verify_checksums: true, progress_fn: None },
        );
        assert!(result.is_err());
    }
}
