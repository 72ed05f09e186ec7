use actor_migration_remote::MigrationRecord;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    MigrationContext,
    checkpoint::{CheckpointTransaction, Field, now_millis, worker_key},
    error::MigrationError,
    health::SkippedRecords,
    transform::{TargetWrite, transform},
    types::{MigrationState, Phase, WorkerInput, WorkerResult},
};

/// Migrates one contiguous sequence number range of a phase.
pub struct Worker {
    ctx: MigrationContext,
    phase: Phase,
    iteration: u32,
    input: WorkerInput,
}

impl Worker {
    pub fn new(ctx: MigrationContext, phase: Phase, iteration: u32, input: WorkerInput) -> Self {
        Self {
            ctx,
            phase,
            iteration,
            input,
        }
    }

    /// Runs until the range is exhausted, resuming after the last applied sequence number.
    ///
    /// Every chunk is written to the target in one transaction and then checkpointed in
    /// another, so a crash between the two replays at most one chunk. Cancellation is
    /// observed between chunks.
    pub async fn run(self, cancel: &CancellationToken) -> Result<WorkerResult, MigrationError> {
        let settings = &self.ctx.settings;
        let include_deletes = self.phase.includes_deletes();
        let end = self.input.end_seq_num;
        let mut last_applied = self.input.last_applied_seq_num;
        let mut keys_migrated = self.input.keys_migrated;
        let mut cursor = self.input.start_seq_num.max(last_applied + 1);

        info!(
            phase = %self.phase,
            iteration = self.iteration,
            worker = self.input.worker_id,
            start = cursor,
            end,
            "Starting worker"
        );

        while cursor <= end {
            if cancel.is_cancelled() {
                return Err(MigrationError::Cancelled);
            }

            let records = self
                .ctx
                .source
                .enumerate(
                    cursor,
                    settings.items_per_chunk,
                    settings.items_per_enumeration,
                    include_deletes,
                    cancel,
                )
                .await?;
            let received = records.len();
            let batch: Vec<MigrationRecord> = records
                .into_iter()
                .filter(|record| (cursor..=end).contains(&record.sequence_number))
                .collect();
            let Some(chunk_last) = batch.iter().map(|record| record.sequence_number).max() else {
                break;
            };

            let (written, skipped) = self.apply(&batch).await?;
            keys_migrated += written;
            last_applied = chunk_last;
            let skipped_count = skipped.count();
            self.checkpoint_progress(last_applied, keys_migrated, skipped)
                .await?;
            debug!(
                phase = %self.phase,
                worker = self.input.worker_id,
                last_applied,
                keys_migrated,
                skipped = skipped_count,
                "Checkpointed chunk"
            );

            cursor = last_applied + 1;
            // A short enumeration means the source has nothing more for now, and records
            // past the range mean the range is done
            if received < settings.items_per_enumeration || batch.len() < received {
                break;
            }
        }

        let end_time = self.complete().await?;
        info!(
            phase = %self.phase,
            iteration = self.iteration,
            worker = self.input.worker_id,
            last_applied,
            keys_migrated,
            "Worker completed"
        );
        Ok(WorkerResult {
            worker_id: self.input.worker_id,
            start_seq_num: self.input.start_seq_num,
            end_seq_num: end,
            last_applied_seq_num: last_applied,
            keys_migrated,
            end_time,
            status: MigrationState::Completed,
        })
    }

    /// Writes a chunk to the target in one transaction, returning the number of keys written
    /// and the records that were skipped.
    async fn apply(
        &self,
        batch: &[MigrationRecord],
    ) -> Result<(u64, SkippedRecords), MigrationError> {
        let mut tx = self.ctx.target.transaction().await?;
        let mut written = 0;
        let mut skipped = SkippedRecords::default();
        for record in batch {
            match transform(record)? {
                TargetWrite::Put { table, key, value } => {
                    tx.set(&table, &key, &value).await?;
                    written += 1;
                }
                TargetWrite::Remove { table, key } => {
                    tx.remove(&table, &key).await?;
                    written += 1;
                }
                TargetWrite::Skip { reason } => {
                    skipped.record(&record.key, record.sequence_number, reason);
                }
            }
        }
        tx.commit().await?;
        Ok((written, skipped))
    }

    async fn checkpoint_progress(
        &self,
        last_applied: i64,
        keys_migrated: u64,
        skipped: SkippedRecords,
    ) -> Result<(), MigrationError> {
        let mut tx = CheckpointTransaction::begin(&self.ctx.checkpoints).await?;
        tx.set(&self.key(Field::LastAppliedSeqNum), &last_applied)
            .await?;
        tx.set(&self.key(Field::NoOfKeysMigrated), &keys_migrated)
            .await?;
        skipped.checkpoint(&mut tx).await?;
        tx.commit().await
    }

    async fn complete(&self) -> Result<u64, MigrationError> {
        let end_time = now_millis();
        let mut tx = CheckpointTransaction::begin(&self.ctx.checkpoints).await?;
        tx.set(&self.key(Field::EndDateTimeUtc), &end_time).await?;
        tx.set(&self.key(Field::CurrentStatus), &MigrationState::Completed)
            .await?;
        tx.commit().await?;
        Ok(end_time)
    }

    fn key(&self, field: Field) -> String {
        worker_key(self.phase, self.iteration, self.input.worker_id, field)
    }
}
