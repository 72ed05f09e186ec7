//! Health of a migration run.
//!
//! Records the migration cannot interpret are skipped rather than failing the run. Each skip
//! degrades the run's health. Skips are counted in the run checkpoints, in the same
//! transaction that checkpoints the chunk they belong to, so the counters survive restarts and
//! a replayed chunk is never counted twice.

use serde::Serialize;
use tracing::warn;

use crate::{
    checkpoint::{CheckpointTransaction, Field, run_key},
    error::MigrationError,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub skipped_records: u64,
    pub degraded: bool,
    pub last_reason: Option<String>,
}

impl HealthSnapshot {
    pub async fn read(tx: &mut CheckpointTransaction) -> Result<Self, MigrationError> {
        let skipped_records: u64 = tx
            .read(&run_key(Field::NoOfKeysSkipped))
            .await?
            .unwrap_or_default();
        let last_reason = tx.read(&run_key(Field::LastSkipReason)).await?;
        Ok(Self {
            skipped_records,
            degraded: skipped_records > 0,
            last_reason,
        })
    }
}

/// Records skipped while applying one chunk.
#[derive(Debug, Default)]
pub struct SkippedRecords {
    count: u64,
    last_reason: Option<String>,
}

impl SkippedRecords {
    pub fn record(&mut self, key: &str, sequence_number: i64, reason: &str) {
        warn!(key, sequence_number, reason, "Skipping unparseable record");
        self.count += 1;
        self.last_reason = Some(format!("{reason}: {key}"));
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Adds the chunk's skips to the run counters.
    pub async fn checkpoint(self, tx: &mut CheckpointTransaction) -> Result<(), MigrationError> {
        let Some(reason) = self.last_reason else {
            return Ok(());
        };
        let count = self.count;
        tx.add_or_update(&run_key(Field::NoOfKeysSkipped), &count, |current: u64| {
            current + count
        })
        .await?;
        tx.set(&run_key(Field::LastSkipReason), &reason).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actor_migration_storage::Store;

    #[tokio::test]
    async fn skips_accumulate_across_chunks() {
        let store = Store::default();
        let mut tx = CheckpointTransaction::begin(&store).await.unwrap();
        assert_eq!(
            HealthSnapshot::read(&mut tx).await.unwrap(),
            HealthSnapshot::default()
        );

        let mut first = SkippedRecords::default();
        first.record("Foo_1", 7, "unknown key prefix");
        first.checkpoint(&mut tx).await.unwrap();
        SkippedRecords::default().checkpoint(&mut tx).await.unwrap();
        let mut second = SkippedRecords::default();
        second.record("Actor_x", 8, "malformed actor key");
        assert_eq!(second.count(), 1);
        second.checkpoint(&mut tx).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = CheckpointTransaction::begin(&store).await.unwrap();
        let health = HealthSnapshot::read(&mut tx).await.unwrap();
        assert!(health.degraded);
        assert_eq!(health.skipped_records, 2);
        assert_eq!(
            health.last_reason.as_deref(),
            Some("malformed actor key: Actor_x")
        );
    }

    #[tokio::test]
    async fn uncommitted_skips_are_not_counted() {
        let store = Store::default();
        let mut tx = CheckpointTransaction::begin(&store).await.unwrap();
        let mut skipped = SkippedRecords::default();
        skipped.record("Foo_1", 7, "unknown key prefix");
        skipped.checkpoint(&mut tx).await.unwrap();
        drop(tx);

        let mut tx = CheckpointTransaction::begin(&store).await.unwrap();
        assert_eq!(HealthSnapshot::read(&mut tx).await.unwrap().skipped_records, 0);
    }
}
