//! Shared fakes for integration tests. Same shape as the inline fakes in
//! `src/backup.rs`/`src/migration.rs`, duplicated here since `#[cfg(test)]`
//! items aren't visible to an external test crate.
#![allow(dead_code)]

use std::sync::Mutex;

use datalog_backup::{Snapshot, SourceDb, Tuple, TxReport, Value};

pub struct FakeSnapshot;
impl Snapshot for FakeSnapshot {}

pub fn tuple(t: i64, e: i64, a: &str) -> Tuple {
    Tuple { e, a: a.to_string(), v: Value::Str(format!("v{e}")), t, added: true }
}

/// A source DB backed by a plain in-memory vec, with working `subscribe`
/// fan-out so migration/capture scenarios can exercise live writes.
pub struct FakeSourceDb {
    tuples: Mutex<Vec<Tuple>>,
    next_t: Mutex<i64>,
    listeners: Mutex<Vec<Box<dyn Fn(&TxReport) + Send + Sync>>>,
}

impl FakeSourceDb {
    pub fn new(initial: Vec<Tuple>, start_t: i64) -> Self {
        Self { tuples: Mutex::new(initial), next_t: Mutex::new(start_t), listeners: Mutex::new(Vec::new()) }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), 0)
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
        Ok(serde_json::json!({"attrs": ["user/name", "user/email"]}))
    }
    fn config(&self, _s: &dyn Snapshot) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::json!({}))
    }
    fn transact(&self, tuples: Vec<Tuple>) -> anyhow::Result<TxReport> {
        let mut next_t = self.next_t.lock().unwrap();
        let t = *next_t;
        *next_t += 1;
        let tuples: Vec<Tuple> = tuples.into_iter().map(|mut tup| { tup.t = t; tup }).collect();
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

/// Wraps a fixed tuple list but fails the stream after `fail_after` tuples,
/// for simulating a backup killed partway through (spec §8 S4).
pub struct FlakySourceDb {
    tuples: Vec<Tuple>,
    max_e: i64,
    max_t: i64,
    fail_after: usize,
}

impl FlakySourceDb {
    pub fn new(tuples: Vec<Tuple>, max_e: i64, max_t: i64, fail_after: usize) -> Self {
        Self { tuples, max_e, max_t, fail_after }
    }
}

impl SourceDb for FlakySourceDb {
    fn snapshot(&self) -> anyhow::Result<Box<dyn Snapshot>> {
        Ok(Box::new(FakeSnapshot))
    }
    fn datoms_eavt(&self, _s: &dyn Snapshot) -> anyhow::Result<Box<dyn Iterator<Item = anyhow::Result<Tuple>>>> {
        let fail_after = self.fail_after;
        let ok_part = self.tuples.iter().take(fail_after).cloned().map(Ok).collect::<Vec<_>>();
        let failure = std::iter::once_with(move || Err(anyhow::anyhow!("simulated source failure")));
        Ok(Box::new(ok_part.into_iter().chain(failure)))
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
        Ok(self.max_e)
    }
    fn max_t(&self, _s: &dyn Snapshot) -> anyhow::Result<i64> {
        Ok(self.max_t)
    }
}

/// Records everything passed to `load_pre_formed`, for restore assertions.
pub struct RecordingTarget {
    pub max_e: i64,
    pub loaded: Mutex<Vec<Tuple>>,
}

impl RecordingTarget {
    pub fn empty() -> Self {
        Self { max_e: 0, loaded: Mutex::new(Vec::new()) }
    }
}

impl SourceDb for RecordingTarget {
    fn snapshot(&self) -> anyhow::Result<Box<dyn Snapshot>> {
        Ok(Box::new(FakeSnapshot))
    }
    fn datoms_eavt(&self, _s: &dyn Snapshot) -> anyhow::Result<Box<dyn Iterator<Item = anyhow::Result<Tuple>>>> {
        Ok(Box::new(std::iter::empty()))
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
    fn load_pre_formed(&self, tuples: Vec<Tuple>, _max_e: i64, _max_t: i64) -> anyhow::Result<()> {
        self.loaded.lock().unwrap().extend(tuples);
        Ok(())
    }
    fn subscribe(&self, _l: Box<dyn Fn(&TxReport) + Send + Sync>) -> anyhow::Result<u64> {
        unimplemented!()
    }
    fn unsubscribe(&self, _key: u64) -> anyhow::Result<()> {
        unimplemented!()
    }
    fn max_eid(&self, _s: &dyn Snapshot) -> anyhow::Result<i64> {
        Ok(self.max_e)
    }
    fn max_t(&self, _s: &dyn Snapshot) -> anyhow::Result<i64> {
        Ok(0)
    }
}
