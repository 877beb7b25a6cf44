//! Content-addressed store (CAS) collaborator for GC (C9).
//!
//! This is distinct from [`crate::store::ObjectStore`] (the backup
//! destination, C1): GC marks and sweeps the store the *source* database
//! uses internally to hold commits and the values/segments they reference
//! (spec §4.9). A Datalog source exposes it through this trait rather than
//! through [`crate::tuple::SourceDb`], since `SourceDb` only needs to read
//! tuples, not walk the commit DAG.

use anyhow::Error;

pub type CommitId = String;
pub type Key = String;

/// One node in the commit DAG: its parents and the content-addressed keys
/// it directly references (segment/value keys, not further commits).
#[derive(Debug, Clone)]
pub struct CommitNode {
    pub id: CommitId,
    pub parents: Vec<CommitId>,
    pub referenced_keys: Vec<Key>,
}

/// The underlying content-addressed store a Datalog source keeps its
/// commits and values in. Keys are immutable once written; GC is the only
/// component that deletes from this store (spec §4.9).
pub trait ContentAddressedStore: Send + Sync {
    /// Current heads of every branch that roots reachability for GC.
    fn branch_heads(&self) -> Result<Vec<CommitId>, Error>;

    fn get_commit(&self, id: &CommitId) -> Result<CommitNode, Error>;

    /// Enumerate every key presently stored, for the sweep phase. May be
    /// paginated internally by the implementation; this trait surfaces the
    /// full iterator so GC can batch deletes without holding it all in
    /// memory at once.
    fn list_all_keys(&self) -> Result<Box<dyn Iterator<Item = Result<Key, Error>>>, Error>;

    fn delete_keys(&self, keys: &[Key]) -> Result<(), Error>;

    fn key_exists(&self, key: &Key) -> Result<bool, Error>;
}
