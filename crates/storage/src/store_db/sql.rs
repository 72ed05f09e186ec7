use std::{fmt::Debug, path::Path, sync::Arc, time::Duration};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    StoreError,
    api::{EngineTransaction, StoreEngine},
};

use libsql::{Builder, Connection, Transaction, params::IntoParams};

/// ### SQLStore
/// - `write_conn`: a connection to the database protected by a Mutex to enforce a maximum of 1 writer.
///   Every engine transaction, including read-only ones, goes through it so that a transaction
///   observes a consistent view while it decides what to write.
pub struct SQLStore {
    write_conn: Arc<Mutex<Connection>>,
}

impl Debug for SQLStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SQLStore")
    }
}

const DB_SCHEMA: [&str; 1] = [
    "CREATE TABLE IF NOT EXISTS entries (table_name TEXT NOT NULL, key TEXT NOT NULL, value TEXT NOT NULL, PRIMARY KEY (table_name, key))",
];

impl SQLStore {
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Builder::new_local(path).build().await?;
        let write_conn = db.connect()?;
        // From libsql documentation:
        // Newly created connections currently have a default busy timeout of
        // 5000ms, but this may be subject to change.
        write_conn.busy_timeout(Duration::from_millis(5000))?;
        let store = SQLStore {
            write_conn: Arc::new(Mutex::new(write_conn)),
        };
        store.init_db().await?;
        Ok(store)
    }

    async fn init_db(&self) -> Result<(), StoreError> {
        let conn = self.write_conn.lock().await;
        // Readers may open the database while a migration is writing
        conn.query("PRAGMA journal_mode=WAL;", ()).await?;

        let tx = conn.transaction().await?;
        for query in DB_SCHEMA {
            tx.execute(query, ()).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl StoreEngine for SQLStore {
    async fn begin(&self) -> Result<Box<dyn EngineTransaction>, StoreError> {
        let conn = self.write_conn.clone().lock_owned().await;
        let tx = conn.transaction().await?;
        Ok(Box::new(SQLTransaction { _conn: conn, tx }))
    }
}

/// A libsql transaction rolls back when dropped without commit.
struct SQLTransaction {
    // Keeps other writers out until this transaction is finished
    _conn: OwnedMutexGuard<Connection>,
    tx: Transaction,
}

#[async_trait::async_trait]
impl EngineTransaction for SQLTransaction {
    async fn get(&mut self, table: &str, key: &str) -> Result<Option<String>, StoreError> {
        let mut rows = self
            .tx
            .query(
                "SELECT value FROM entries WHERE table_name = ?1 AND key = ?2",
                (table.to_owned(), key.to_owned()).into_params()?,
            )
            .await?;
        if let Some(row) = rows.next().await? {
            let value = row
                .get::<String>(0)
                .map_err(|error| StoreError::SQLInvalidValue(error.to_string()))?;
            return Ok(Some(value));
        }
        Ok(None)
    }

    async fn put(&mut self, table: &str, key: &str, value: &str) -> Result<(), StoreError> {
        self.tx
            .execute(
                "INSERT INTO entries (table_name, key, value) VALUES (?1, ?2, ?3) ON CONFLICT(table_name, key) DO UPDATE SET value = excluded.value",
                (table.to_owned(), key.to_owned(), value.to_owned()).into_params()?,
            )
            .await?;
        Ok(())
    }

    async fn remove(&mut self, table: &str, key: &str) -> Result<(), StoreError> {
        self.tx
            .execute(
                "DELETE FROM entries WHERE table_name = ?1 AND key = ?2",
                (table.to_owned(), key.to_owned()).into_params()?,
            )
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let SQLTransaction { _conn, tx } = *self;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.db");

        let store = SQLStore::new(&path).await.unwrap();
        let mut tx = store.begin().await.unwrap();
        tx.put("t", "a", "1").await.unwrap();
        tx.put("t", "a", "2").await.unwrap();
        tx.commit().await.unwrap();
        drop(store);

        let store = SQLStore::new(&path).await.unwrap();
        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.get("t", "a").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = SQLStore::new(dir.path().join("checkpoints.db"))
            .await
            .unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.put("t", "a", "1").await.unwrap();
        drop(tx);

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.get("t", "a").await.unwrap(), None);
    }
}
