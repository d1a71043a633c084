//! Deduplicated, resumable work store shared by every worker pool.
//!
//! The store is the only state shared across phases. Every mutating call
//! runs inside a single critical section, so concurrent discovery and
//! extraction workers can never observe a half-applied union or race an
//! insert. `unprocessed_ids` is a snapshot: an id added after the snapshot
//! is simply picked up on the next call.

use crate::error::{HarvestError, Result};
use crate::id::CandidateId;
use crate::record::Record;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Storage primitive behind [`WorkStore`]. Implementations do not need
/// their own locking; the facade serializes all access.
pub trait StoreBackend: Send {
    /// Unions `ids` into the identifier set, returning how many were new.
    fn insert_ids(&mut self, ids: &[CandidateId]) -> Result<usize>;

    /// Insert-if-absent. Returns true when this call stored the record.
    fn insert_record(&mut self, id: &CandidateId, record: &Record) -> Result<bool>;

    /// Marks ids as attempted. Idempotent.
    fn mark_processed(&mut self, ids: &[CandidateId]) -> Result<()>;

    /// `ids − processed`, optionally capped.
    fn unprocessed(&mut self, limit: Option<usize>) -> Result<Vec<CandidateId>>;

    fn get_record(&mut self, id: &CandidateId) -> Result<Option<Record>>;

    /// Replaces the stored record for an id that already has one.
    fn put_record(&mut self, id: &CandidateId, record: &Record) -> Result<()>;

    fn all_records(&mut self) -> Result<Vec<Record>>;

    fn id_count(&mut self) -> Result<usize>;

    fn processed_count(&mut self) -> Result<usize>;

    fn record_count(&mut self) -> Result<usize>;
}

/// In-process backend. The default, and the fallback when a durable
/// backend cannot be opened.
#[derive(Default)]
pub struct MemoryBackend {
    ids: HashSet<CandidateId>,
    processed: HashSet<CandidateId>,
    records: HashMap<CandidateId, Record>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreBackend for MemoryBackend {
    fn insert_ids(&mut self, ids: &[CandidateId]) -> Result<usize> {
        let before = self.ids.len();
        self.ids.extend(ids.iter().cloned());
        Ok(self.ids.len() - before)
    }

    fn insert_record(&mut self, id: &CandidateId, record: &Record) -> Result<bool> {
        if self.records.contains_key(id) {
            return Ok(false);
        }
        self.records.insert(id.clone(), record.clone());
        Ok(true)
    }

    fn mark_processed(&mut self, ids: &[CandidateId]) -> Result<()> {
        self.processed.extend(ids.iter().cloned());
        Ok(())
    }

    fn unprocessed(&mut self, limit: Option<usize>) -> Result<Vec<CandidateId>> {
        let iter = self.ids.iter().filter(|id| !self.processed.contains(*id));
        Ok(match limit {
            Some(cap) => iter.take(cap).cloned().collect(),
            None => iter.cloned().collect(),
        })
    }

    fn get_record(&mut self, id: &CandidateId) -> Result<Option<Record>> {
        Ok(self.records.get(id).cloned())
    }

    fn put_record(&mut self, id: &CandidateId, record: &Record) -> Result<()> {
        self.records.insert(id.clone(), record.clone());
        Ok(())
    }

    fn all_records(&mut self) -> Result<Vec<Record>> {
        Ok(self.records.values().cloned().collect())
    }

    fn id_count(&mut self) -> Result<usize> {
        Ok(self.ids.len())
    }

    fn processed_count(&mut self) -> Result<usize> {
        Ok(self.processed.len())
    }

    fn record_count(&mut self) -> Result<usize> {
        Ok(self.records.len())
    }
}

/// Concurrency-safe store facade handed to every worker.
///
/// The lock is a plain `std::sync::Mutex`: no backend operation awaits, so
/// holding it across an `.await` point cannot happen by construction.
pub struct WorkStore {
    backend: Mutex<Box<dyn StoreBackend>>,
}

impl WorkStore {
    pub fn new(backend: Box<dyn StoreBackend>) -> Self {
        Self {
            backend: Mutex::new(backend),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryBackend::new()))
    }

    fn with_backend<T>(
        &self,
        f: impl FnOnce(&mut Box<dyn StoreBackend>) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self
            .backend
            .lock()
            .map_err(|_| HarvestError::StoreError("store lock poisoned".into()))?;
        f(&mut guard)
    }

    /// Atomically unions `ids` into the identifier set and returns how
    /// many were previously unseen.
    pub fn add_ids(&self, ids: &[CandidateId]) -> Result<usize> {
        self.with_backend(|b| b.insert_ids(ids))
    }

    /// Atomic insert-if-absent; exactly one concurrent caller wins.
    pub fn add_record(&self, id: &CandidateId, record: &Record) -> Result<bool> {
        self.with_backend(|b| b.insert_record(id, record))
    }

    /// Marks ids as attempted; marking an already-processed id is a no-op.
    pub fn mark_processed(&self, ids: &[CandidateId]) -> Result<()> {
        self.with_backend(|b| b.mark_processed(ids))
    }

    /// Snapshot of `ids − processed`, the unit of work for extraction.
    pub fn unprocessed_ids(&self, limit: Option<usize>) -> Result<Vec<CandidateId>> {
        self.with_backend(|b| b.unprocessed(limit))
    }

    pub fn get_record(&self, id: &CandidateId) -> Result<Option<Record>> {
        self.with_backend(|b| b.get_record(id))
    }

    /// Replaces the stored record; used by enrichment to write back a
    /// record whose fields were filled in.
    pub fn update_record(&self, id: &CandidateId, record: &Record) -> Result<()> {
        self.with_backend(|b| b.put_record(id, record))
    }

    pub fn all_records(&self) -> Result<Vec<Record>> {
        self.with_backend(|b| b.all_records())
    }

    pub fn id_count(&self) -> Result<usize> {
        self.with_backend(|b| b.id_count())
    }

    pub fn processed_count(&self) -> Result<usize> {
        self.with_backend(|b| b.processed_count())
    }

    pub fn record_count(&self) -> Result<usize> {
        self.with_backend(|b| b.record_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn sample_ids(n: usize) -> Vec<CandidateId> {
        (0..n)
            .map(|i| {
                CandidateId::parse(&format!("ChIJ{:0>24}", format!("x{i}"))).unwrap()
            })
            .collect()
    }

    fn sample_record(id: &CandidateId) -> Record {
        Record::new(id, "Boulangerie Martin".into())
    }

    #[test]
    fn test_add_ids_dedup_idempotent() {
        let store = WorkStore::in_memory();
        let ids = sample_ids(10);

        let first = store.add_ids(&ids).unwrap();
        let second = store.add_ids(&ids).unwrap();

        assert_eq!(first, 10);
        assert_eq!(second, 0);
        assert_eq!(store.id_count().unwrap(), 10);
    }

    #[test]
    fn test_unprocessed_shrinks_after_mark() {
        let store = WorkStore::in_memory();
        let ids = sample_ids(10);
        store.add_ids(&ids).unwrap();

        let before = store.unprocessed_ids(None).unwrap().len();
        store.mark_processed(&ids[..4]).unwrap();
        let after = store.unprocessed_ids(None).unwrap().len();

        assert_eq!(before, 10);
        assert_eq!(after, 6);

        // Idempotent: re-marking changes nothing
        store.mark_processed(&ids[..4]).unwrap();
        assert_eq!(store.unprocessed_ids(None).unwrap().len(), 6);
    }

    #[test]
    fn test_unprocessed_respects_limit() {
        let store = WorkStore::in_memory();
        store.add_ids(&sample_ids(10)).unwrap();
        assert_eq!(store.unprocessed_ids(Some(3)).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_add_record_single_winner() {
        let store = Arc::new(WorkStore::in_memory());
        let id = sample_ids(1).pop().unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                let record = sample_record(&id);
                store.add_record(&id, &record).unwrap()
            }));
        }

        let mut inserted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                inserted += 1;
            }
        }

        assert_eq!(inserted, 1);
        assert_eq!(store.record_count().unwrap(), 1);
    }

    #[test]
    fn test_update_record_replaces() {
        let store = WorkStore::in_memory();
        let id = sample_ids(1).pop().unwrap();
        let mut record = sample_record(&id);
        store.add_record(&id, &record).unwrap();

        record.email = "contact@boulangerie-martin.fr".into();
        store.update_record(&id, &record).unwrap();

        let stored = store.get_record(&id).unwrap().unwrap();
        assert_eq!(stored.email, "contact@boulangerie-martin.fr");
    }
}
