// Storage API for the migration checkpoint and target stores

use std::fmt::Debug;

use crate::error::StoreError;

// We need async_trait because the stabilized feature lacks support for object safety
// (i.e. dyn StoreEngine)
#[async_trait::async_trait]
pub trait StoreEngine: Debug + Send + Sync {
    /// Opens a serializable transaction. Only one transaction is active at a time
    /// per engine; callers wait here until the previous one commits or is dropped.
    async fn begin(&self) -> Result<Box<dyn EngineTransaction>, StoreError>;
}

/// A transaction over string-keyed tables.
///
/// Writes become visible to other transactions only after [`EngineTransaction::commit`].
/// Dropping the transaction without committing discards every write.
#[async_trait::async_trait]
pub trait EngineTransaction: Send {
    /// Reads a value, observing writes already made in this transaction.
    async fn get(&mut self, table: &str, key: &str) -> Result<Option<String>, StoreError>;

    async fn put(&mut self, table: &str, key: &str, value: &str) -> Result<(), StoreError>;

    async fn remove(&mut self, table: &str, key: &str) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
