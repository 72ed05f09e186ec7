use actor_migration_remote::{
    ClientFactory, MigrationRecord, ServicePartitionClient, SourceReplica,
};
use tokio_util::sync::CancellationToken;

use crate::error::MigrationError;

/// The source store as seen by the migration: every call is cancellable and already
/// shielded from routing and transport failures.
#[async_trait::async_trait]
pub trait MigrationSource: Send + Sync {
    async fn first_sequence_number(&self, cancel: &CancellationToken)
    -> Result<i64, MigrationError>;

    async fn last_sequence_number(&self, cancel: &CancellationToken)
    -> Result<i64, MigrationError>;

    async fn enumerate(
        &self,
        start: i64,
        chunk_size: usize,
        item_count: usize,
        include_deletes: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<MigrationRecord>, MigrationError>;

    async fn reject_writes(&self, cancel: &CancellationToken) -> Result<bool, MigrationError>;

    async fn resume_writes(&self, cancel: &CancellationToken) -> Result<bool, MigrationError>;
}

#[async_trait::async_trait]
impl<F> MigrationSource for ServicePartitionClient<F>
where
    F: ClientFactory,
    F::Client: SourceReplica,
{
    async fn first_sequence_number(
        &self,
        cancel: &CancellationToken,
    ) -> Result<i64, MigrationError> {
        let first = self
            .invoke_with_retry(
                |replica| async move { replica.first_sequence_number().await },
                cancel,
            )
            .await?;
        Ok(first)
    }

    async fn last_sequence_number(
        &self,
        cancel: &CancellationToken,
    ) -> Result<i64, MigrationError> {
        let last = self
            .invoke_with_retry(
                |replica| async move { replica.last_sequence_number().await },
                cancel,
            )
            .await?;
        Ok(last)
    }

    async fn enumerate(
        &self,
        start: i64,
        chunk_size: usize,
        item_count: usize,
        include_deletes: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<MigrationRecord>, MigrationError> {
        let records = self
            .invoke_with_retry(
                |replica| async move {
                    replica
                        .enumerate_by_sequence_number(start, chunk_size, item_count, include_deletes)
                        .await
                },
                cancel,
            )
            .await?;
        Ok(records)
    }

    async fn reject_writes(&self, cancel: &CancellationToken) -> Result<bool, MigrationError> {
        let rejected = self
            .invoke_with_retry(|replica| async move { replica.reject_writes().await }, cancel)
            .await?;
        Ok(rejected)
    }

    async fn resume_writes(&self, cancel: &CancellationToken) -> Result<bool, MigrationError> {
        let resumed = self
            .invoke_with_retry(|replica| async move { replica.resume_writes().await }, cancel)
            .await?;
        Ok(resumed)
    }
}
