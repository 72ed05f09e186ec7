use std::{path::Path, sync::Arc};

use crate::api::{EngineTransaction, StoreEngine};
use crate::error::StoreError;
use crate::store_db::in_memory::Store as InMemoryStore;
#[cfg(feature = "sql")]
use crate::store_db::sql::SQLStore;
use tracing::info;

/// Transactional string dictionary used both for checkpoints and as the migration target.
#[derive(Debug, Clone)]
pub struct Store {
    engine: Arc<dyn StoreEngine>,
}

impl Default for Store {
    fn default() -> Self {
        Self {
            engine: Arc::new(InMemoryStore::new()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineType {
    InMemory,
    #[cfg(feature = "sql")]
    SQL,
}

impl Store {
    pub async fn new(_path: &Path, engine_type: EngineType) -> Result<Self, StoreError> {
        info!("Starting migration storage engine ({engine_type:?})");
        let store = match engine_type {
            EngineType::InMemory => Self::default(),
            #[cfg(feature = "sql")]
            EngineType::SQL => Self {
                engine: Arc::new(SQLStore::new(_path).await?),
            },
        };
        info!("Started migration storage engine");
        Ok(store)
    }

    pub fn from_engine(engine: Arc<dyn StoreEngine>) -> Self {
        Self { engine }
    }

    pub async fn transaction(&self) -> Result<Transaction, StoreError> {
        Ok(Transaction {
            inner: self.engine.begin().await?,
        })
    }

    /// Reads a single value in its own transaction.
    pub async fn get(&self, table: &str, key: &str) -> Result<Option<String>, StoreError> {
        self.transaction().await?.get(table, key).await
    }
}

/// Transaction handle exposing the dictionary operations the migration relies on.
pub struct Transaction {
    inner: Box<dyn EngineTransaction>,
}

impl Transaction {
    pub async fn get(&mut self, table: &str, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(table, key).await
    }

    /// Returns the existing value for `key`, or stores `value` and returns it.
    /// Never overwrites.
    pub async fn get_or_add(
        &mut self,
        table: &str,
        key: &str,
        value: &str,
    ) -> Result<String, StoreError> {
        if let Some(existing) = self.inner.get(table, key).await? {
            return Ok(existing);
        }
        self.inner.put(table, key, value).await?;
        Ok(value.to_owned())
    }

    pub async fn set(&mut self, table: &str, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner.put(table, key, value).await
    }

    /// Stores `add_value` when the key is absent, otherwise replaces the current value
    /// with `merge(current)`. Returns the value written.
    pub async fn add_or_update<E, F>(
        &mut self,
        table: &str,
        key: &str,
        add_value: &str,
        merge: F,
    ) -> Result<String, E>
    where
        E: From<StoreError>,
        F: FnOnce(&str) -> Result<String, E>,
    {
        let value = match self.inner.get(table, key).await? {
            Some(current) => merge(&current)?,
            None => add_value.to_owned(),
        };
        self.inner.put(table, key, &value).await?;
        Ok(value)
    }

    pub async fn remove(&mut self, table: &str, key: &str) -> Result<(), StoreError> {
        self.inner.remove(table, key).await
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        self.inner.commit().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_add_never_overwrites() {
        let store = Store::default();

        let mut tx = store.transaction().await.unwrap();
        assert_eq!(tx.get_or_add("t", "k", "first").await.unwrap(), "first");
        tx.commit().await.unwrap();

        let mut tx = store.transaction().await.unwrap();
        assert_eq!(tx.get_or_add("t", "k", "second").await.unwrap(), "first");
        tx.commit().await.unwrap();

        assert_eq!(store.get("t", "k").await.unwrap().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn add_or_update_merges_existing_value() {
        let store = Store::default();
        let sum = |current: &str| -> Result<String, StoreError> {
            let current: i64 = current
                .parse()
                .map_err(|_| StoreError::Custom(format!("not a number: {current}")))?;
            Ok((current + 5).to_string())
        };

        let mut tx = store.transaction().await.unwrap();
        let written = tx.add_or_update("t", "count", "5", sum).await.unwrap();
        assert_eq!(written, "5");
        let written = tx.add_or_update("t", "count", "5", sum).await.unwrap();
        assert_eq!(written, "10");
        tx.commit().await.unwrap();

        assert_eq!(store.get("t", "count").await.unwrap().as_deref(), Some("10"));
    }

    #[tokio::test]
    async fn failed_merge_leaves_value_untouched() {
        let store = Store::default();

        let mut tx = store.transaction().await.unwrap();
        tx.set("t", "count", "abc").await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.transaction().await.unwrap();
        let result = tx
            .add_or_update("t", "count", "1", |current| {
                current
                    .parse::<i64>()
                    .map(|value| (value + 1).to_string())
                    .map_err(|_| StoreError::Custom(format!("not a number: {current}")))
            })
            .await;
        assert!(result.is_err());
        drop(tx);

        assert_eq!(store.get("t", "count").await.unwrap().as_deref(), Some("abc"));
    }
}
