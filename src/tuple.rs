//! The read-only tuple model exposed by the source DB (spec §3, §6).
//!
//! Everything here is a plain data type: the crate never constructs a
//! `Tuple` itself, it only consumes the stream a [`SourceDb`] hands it and
//! re-emits the same shape during restore.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A tagged value as stored by the source DB. Mirrors the attribute value
/// types a Datalog database typically supports; `Double` is kept distinct
/// from a generic float to guarantee IEEE-754 round-trip fidelity through
/// the codec (see `codec.rs` — a prior bug silently narrowed doubles).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Keyword(String),
    Str(String),
    Int(i64),
    Double(f64),
    BigDecimal(String),
    Uuid(uuid::Uuid),
    Instant(chrono::DateTime<chrono::Utc>),
    Bool(bool),
    Bytes(Vec<u8>),
    /// A reference to another entity id.
    Ref(i64),
}

/// An attribute identifier. Keywords sort byte-wise on their UTF-8
/// representation (spec §9: locale-independent, deterministic ordering).
pub type Attribute = String;

/// One `(e, a, v, t, added?)` assertion or retraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tuple {
    pub e: i64,
    pub a: Attribute,
    pub v: Value,
    pub t: i64,
    pub added: bool,
}

/// Well-known attribute marking a commit's tx-instant meta-tuple. Source
/// DBs encode "when a transaction happened" as a normal tuple on the tx
/// entity itself; this attribute name identifies it so it can be sorted
/// first within its commit (spec §3 ordering key).
pub const TX_INSTANT_ATTR: &str = "db/txInstant";

impl Tuple {
    fn is_tx_instant(&self) -> bool {
        self.a == TX_INSTANT_ATTR
    }

    /// The canonical ordering key from spec §3:
    /// `(t, a_is_tx_instant ? 0 : 1, a, e)`.
    pub fn ordering_key(&self) -> (i64, u8, &str, i64) {
        (self.t, if self.is_tx_instant() { 0 } else { 1 }, self.a.as_str(), self.e)
    }
}

impl Eq for Tuple {}

impl PartialOrd for Tuple {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Tuple {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ordering_key().cmp(&other.ordering_key())
    }
}

/// The report produced by a single transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxReport {
    pub t: i64,
    pub committed_at: chrono::DateTime<chrono::Utc>,
    pub tuples: Vec<Tuple>,
}

/// Handle to a listener registered via [`SourceDb::subscribe`].
pub type SubscriptionKey = u64;

/// A snapshot handle, opaque to the core. Source-DB adapters hand these
/// back from `snapshot()` and use them to re-open a consistent read view
/// for `datoms_eavt`/`schema`/`config`/`max_eid`/`max_t`.
pub trait Snapshot: Send + Sync {}

/// The three primitives the pipeline relies on (spec §1, §6). A concrete
/// adapter over a real Datalog engine implements this; the crate never
/// assumes a specific engine.
pub trait SourceDb: Send + Sync {
    /// Open a consistent read handle over the database's current root.
    fn snapshot(&self) -> anyhow::Result<Box<dyn Snapshot>>;

    /// A lazy, finite iterator over tuples in EAVT/commit order. Must be
    /// single-pass and hold O(1) tuples resident at a time.
    fn datoms_eavt(
        &self,
        snapshot: &dyn Snapshot,
    ) -> anyhow::Result<Box<dyn Iterator<Item = anyhow::Result<Tuple>>>>;

    fn schema(&self, snapshot: &dyn Snapshot) -> anyhow::Result<serde_json::Value>;

    fn config(&self, snapshot: &dyn Snapshot) -> anyhow::Result<serde_json::Value>;

    /// Submit a set of tuples as a new transaction; returns the resulting
    /// tx-report.
    fn transact(&self, tuples: Vec<Tuple>) -> anyhow::Result<TxReport>;

    /// Privileged ingest path used by restore (spec §4.6 step 5): loads
    /// pre-formed tuples (which already carry their original `t`/`e`)
    /// without assigning new transaction or entity ids, then advances the
    /// DB's watermarks so future `transact` calls don't collide with the
    /// imported ids.
    fn load_pre_formed(&self, tuples: Vec<Tuple>, max_e: i64, max_t: i64) -> anyhow::Result<()>;

    /// Register a listener invoked synchronously, on the committing
    /// thread, for every tx-report from this point forward. Returns a key
    /// usable with `unsubscribe`.
    fn subscribe(&self, listener: Box<dyn Fn(&TxReport) + Send + Sync>) -> anyhow::Result<SubscriptionKey>;

    fn unsubscribe(&self, key: SubscriptionKey) -> anyhow::Result<()>;

    fn max_eid(&self, snapshot: &dyn Snapshot) -> anyhow::Result<i64>;

    fn max_t(&self, snapshot: &dyn Snapshot) -> anyhow::Result<i64>;
}
