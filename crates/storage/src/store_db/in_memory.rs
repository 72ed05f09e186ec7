use std::{
    collections::{BTreeMap, HashMap},
    fmt::Debug,
    sync::Arc,
};

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::api::{EngineTransaction, StoreEngine};
use crate::error::StoreError;

#[derive(Default, Clone, Debug)]
pub struct Store(Arc<Mutex<StoreInner>>);

#[derive(Default, Debug)]
struct StoreInner {
    /// Map of table name to its sorted key/value pairs
    tables: HashMap<String, BTreeMap<String, String>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl StoreEngine for Store {
    async fn begin(&self) -> Result<Box<dyn EngineTransaction>, StoreError> {
        let inner = self.0.clone().lock_owned().await;
        Ok(Box::new(InMemoryTransaction {
            inner,
            pending: BTreeMap::new(),
        }))
    }
}

/// Holds the store lock for its whole lifetime; writes are buffered in `pending`
/// and only applied on commit.
struct InMemoryTransaction {
    inner: OwnedMutexGuard<StoreInner>,
    /// (table, key) -> Some(value) for puts, None for removals
    pending: BTreeMap<(String, String), Option<String>>,
}

#[async_trait::async_trait]
impl EngineTransaction for InMemoryTransaction {
    async fn get(&mut self, table: &str, key: &str) -> Result<Option<String>, StoreError> {
        if let Some(pending) = self.pending.get(&(table.to_owned(), key.to_owned())) {
            return Ok(pending.clone());
        }
        Ok(self
            .inner
            .tables
            .get(table)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    async fn put(&mut self, table: &str, key: &str, value: &str) -> Result<(), StoreError> {
        self.pending
            .insert((table.to_owned(), key.to_owned()), Some(value.to_owned()));
        Ok(())
    }

    async fn remove(&mut self, table: &str, key: &str) -> Result<(), StoreError> {
        self.pending.insert((table.to_owned(), key.to_owned()), None);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let InMemoryTransaction { mut inner, pending } = *self;
        for ((table, key), value) in pending {
            match value {
                Some(value) => {
                    inner.tables.entry(table).or_default().insert(key, value);
                }
                None => {
                    if let Some(entries) = inner.tables.get_mut(&table) {
                        entries.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }
}
