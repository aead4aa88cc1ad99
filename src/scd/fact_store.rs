//! Append-only fact log.
//!
//! Facts are never updated or re-pointed. Each event key binds at most once,
//! which makes replaying an event batch a no-op.

use anyhow::Result;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

use super::storage::ScdStorage;
use super::types::{FactKey, FactRecord, SurrogateKey};

#[derive(Debug, Default)]
struct FactLog {
    facts: Vec<FactRecord>,
    by_event: HashMap<String, usize>,
    by_dimension: HashMap<SurrogateKey, Vec<usize>>,
}

impl FactLog {
    fn push(&mut self, fact: FactRecord) {
        let slot = self.facts.len();
        self.by_event.insert(fact.event_key.clone(), slot);
        self.by_dimension.entry(fact.dimension_key).or_default().push(slot);
        self.facts.push(fact);
    }
}

pub struct FactStore {
    log: RwLock<FactLog>,
    storage: Option<Arc<ScdStorage>>,
    next_key: AtomicU64,
}

impl FactStore {
    pub fn in_memory() -> Self {
        Self {
            log: RwLock::new(FactLog::default()),
            storage: None,
            next_key: AtomicU64::new(1),
        }
    }

    pub fn open(storage: Arc<ScdStorage>) -> Result<Self> {
        let facts = storage.load_facts()?;
        let next = facts.iter().map(|f| f.fact_key.0).max().unwrap_or(0) + 1;

        let mut log = FactLog::default();
        let count = facts.len();
        for fact in facts {
            log.push(fact);
        }
        info!(facts = count, next_fact_key = next, "fact store loaded");

        Ok(Self {
            log: RwLock::new(log),
            storage: Some(storage),
            next_key: AtomicU64::new(next),
        })
    }

    pub fn allocate_key(&self) -> FactKey {
        FactKey(self.next_key.fetch_add(1, Ordering::SeqCst))
    }

    /// Append a batch. Durable stores write the whole batch in one
    /// transaction before it becomes visible.
    ///
    /// Facts whose event key is already bound are dropped; the number
    /// actually appended is returned.
    pub fn append(&self, facts: Vec<FactRecord>) -> Result<usize> {
        let mut log = self.log.write();
        let mut seen = std::collections::HashSet::new();
        let fresh: Vec<FactRecord> = facts
            .into_iter()
            .filter(|f| !log.by_event.contains_key(&f.event_key) && seen.insert(f.event_key.clone()))
            .collect();

        if let Some(storage) = &self.storage {
            storage.append_facts(&fresh)?;
        }
        let count = fresh.len();
        for fact in fresh {
            log.push(fact);
        }
        Ok(count)
    }

    pub fn contains_event(&self, event_key: &str) -> bool {
        self.log.read().by_event.contains_key(event_key)
    }

    pub fn get_by_event(&self, event_key: &str) -> Option<FactRecord> {
        let log = self.log.read();
        log.by_event.get(event_key).map(|slot| log.facts[*slot].clone())
    }

    /// Facts bound to one dimension version, in append order.
    pub fn by_dimension(&self, sk: SurrogateKey) -> Vec<FactRecord> {
        let log = self.log.read();
        log.by_dimension
            .get(&sk)
            .map(|slots| slots.iter().map(|s| log.facts[*s].clone()).collect())
            .unwrap_or_default()
    }

    /// Copy of the full log in append order.
    pub fn facts(&self) -> Vec<FactRecord> {
        self.log.read().facts.clone()
    }

    pub fn len(&self) -> usize {
        self.log.read().facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scd::types::Measures;

    fn fact(store: &FactStore, event: &str, dim: u64) -> FactRecord {
        FactRecord {
            fact_key: store.allocate_key(),
            event_key: event.to_string(),
            dimension_key: SurrogateKey(dim),
            event_ts: 3,
            measures: Measures::new(),
        }
    }

    #[test]
    fn test_append_skips_bound_events() {
        let store = FactStore::in_memory();
        let first = vec![fact(&store, "E1", 1), fact(&store, "E2", 1)];
        assert_eq!(store.append(first).unwrap(), 2);

        let replay = vec![fact(&store, "E1", 2), fact(&store, "E3", 2), fact(&store, "E3", 2)];
        assert_eq!(store.append(replay).unwrap(), 1);
        assert_eq!(store.len(), 3);
        assert_eq!(store.get_by_event("E1").unwrap().dimension_key, SurrogateKey(1));
        assert_eq!(store.by_dimension(SurrogateKey(1)).len(), 2);
    }

    #[test]
    fn test_durable_reload_resumes_keys() {
        let storage = Arc::new(ScdStorage::open_memory().unwrap());
        {
            let store = FactStore::open(Arc::clone(&storage)).unwrap();
            let f = fact(&store, "E1", 1);
            store.append(vec![f]).unwrap();
        }
        let reopened = FactStore::open(storage).unwrap();
        assert!(reopened.contains_event("E1"));
        assert_eq!(reopened.allocate_key(), FactKey(2));
    }
}
