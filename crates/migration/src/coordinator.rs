//! Runs one phase iteration across a set of workers.
//!
//! The phase's range is split once, when the phase is first seen, and the split is stored in
//! checkpoints together with every worker's bookkeeping. Later invocations for the same phase
//! iteration read the stored split back, so a phase always resumes with the workers it
//! started with even if the requested worker count changed in the meantime.

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    MigrationContext,
    checkpoint::{
        CheckpointTransaction, Field, iteration_count_key, now_millis, phase_key, run_key,
        worker_key,
    },
    error::MigrationError,
    types::{
        MigrationState, Phase, PhaseInput, PhaseResult, PhaseSnapshot, WorkerInput, WorkerResult,
    },
    worker::Worker,
};

#[derive(Clone)]
pub struct PhaseWorkloadCoordinator {
    ctx: MigrationContext,
}

impl PhaseWorkloadCoordinator {
    pub fn new(ctx: MigrationContext) -> Self {
        Self { ctx }
    }

    /// Runs the phase iteration over `[start, end]` to completion, or returns its stored result
    /// if it already completed.
    pub async fn start_or_resume(
        &self,
        phase: Phase,
        iteration: u32,
        start: i64,
        end: i64,
        worker_count: u32,
        cancel: &CancellationToken,
    ) -> Result<PhaseResult, MigrationError> {
        if cancel.is_cancelled() {
            return Err(MigrationError::Cancelled);
        }

        let input = self
            .get_or_add_input(phase, iteration, start, end, worker_count)
            .await?;
        if input.status == MigrationState::Completed {
            info!(%phase, iteration, "Phase already completed, reading its result");
            return self.get_result(phase, iteration).await;
        }

        info!(
            %phase,
            iteration,
            start = input.start_seq_num,
            end = input.end_seq_num,
            workers = input.worker_count,
            "Running phase"
        );

        // Siblings of a failed worker stop at their next chunk boundary
        let workers_cancel = cancel.child_token();
        let mut workers = JoinSet::new();
        for worker_input in input
            .workers
            .iter()
            .filter(|worker| worker.status != MigrationState::Completed)
        {
            let worker = Worker::new(self.ctx.clone(), phase, iteration, worker_input.clone());
            let token = workers_cancel.clone();
            workers.spawn(async move { worker.run(&token).await });
        }

        let mut first_error = None;
        while let Some(joined) = workers.join_next().await {
            let outcome = joined.map_err(MigrationError::from).and_then(|result| result);
            if let Err(err) = outcome
                && first_error.is_none()
            {
                warn!(%phase, iteration, error = %err, "Worker failed, stopping phase");
                workers_cancel.cancel();
                first_error = Some(err);
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        self.add_or_update_result(phase, iteration).await
    }

    /// Reads the phase input from checkpoints, creating it first if this is the phase's first
    /// run. Stored values always win over the arguments.
    pub async fn get_or_add_input(
        &self,
        phase: Phase,
        iteration: u32,
        start: i64,
        end: i64,
        worker_count: u32,
    ) -> Result<PhaseInput, MigrationError> {
        let now = now_millis();
        let mut tx = CheckpointTransaction::begin(&self.ctx.checkpoints).await?;
        let key = |field| phase_key(phase, iteration, field);

        let start_time = tx.get_or_add(&key(Field::StartDateTimeUtc), &now).await?;
        let start_seq_num = tx.get_or_add(&key(Field::StartSeqNum), &start).await?;
        let end_seq_num = tx.get_or_add(&key(Field::EndSeqNum), &end).await?;
        let last_applied_seq_num = tx
            .get_or_add(&key(Field::LastAppliedSeqNum), &(start_seq_num - 1))
            .await?;
        let status = tx
            .get_or_add(&key(Field::CurrentStatus), &MigrationState::InProgress)
            .await?;
        let stored_worker_count = tx
            .get_or_add(&key(Field::WorkerCount), &worker_count.max(1))
            .await?;
        tx.add_or_update(&iteration_count_key(phase), &iteration, |current: u32| {
            current.max(iteration)
        })
        .await?;

        if stored_worker_count != worker_count || (start_seq_num, end_seq_num) != (start, end) {
            info!(
                %phase,
                iteration,
                start_seq_num,
                end_seq_num,
                worker_count = stored_worker_count,
                "Resuming phase with its checkpointed layout"
            );
        }

        let ranges = partition(start_seq_num, end_seq_num, stored_worker_count);
        let mut workers = Vec::with_capacity(ranges.len());
        for (worker_id, (worker_start, worker_end)) in (1..).zip(ranges) {
            let key = |field| worker_key(phase, iteration, worker_id, field);
            let start_seq_num = tx.get_or_add(&key(Field::StartSeqNum), &worker_start).await?;
            let end_seq_num = tx.get_or_add(&key(Field::EndSeqNum), &worker_end).await?;
            let last_applied_seq_num = tx
                .get_or_add(&key(Field::LastAppliedSeqNum), &(start_seq_num - 1))
                .await?;
            let keys_migrated = tx.get_or_add(&key(Field::NoOfKeysMigrated), &0u64).await?;
            let status = tx
                .get_or_add(&key(Field::CurrentStatus), &MigrationState::InProgress)
                .await?;
            let start_time = tx.get_or_add(&key(Field::StartDateTimeUtc), &now).await?;
            workers.push(WorkerInput {
                worker_id,
                start_seq_num,
                end_seq_num,
                last_applied_seq_num,
                keys_migrated,
                status,
                start_time,
            });
        }
        tx.commit().await?;

        Ok(PhaseInput {
            phase,
            iteration,
            start_time,
            status,
            start_seq_num,
            end_seq_num,
            last_applied_seq_num,
            worker_count: stored_worker_count,
            workers,
        })
    }

    /// Marks the phase completed and folds its totals into the run counters, all in one
    /// transaction. A phase that is already completed is left untouched.
    async fn add_or_update_result(
        &self,
        phase: Phase,
        iteration: u32,
    ) -> Result<PhaseResult, MigrationError> {
        let mut tx = CheckpointTransaction::begin(&self.ctx.checkpoints).await?;
        let key = |field| phase_key(phase, iteration, field);

        let status: MigrationState = tx.require(&key(Field::CurrentStatus)).await?;
        if status == MigrationState::Completed {
            drop(tx);
            return self.get_result(phase, iteration).await;
        }

        let worker_count: u32 = tx.require(&key(Field::WorkerCount)).await?;
        let end_seq_num: i64 = tx.require(&key(Field::EndSeqNum)).await?;
        let mut workers = Vec::with_capacity(worker_count as usize);
        for worker_id in 1..=worker_count {
            workers.push(read_worker_result(&mut tx, phase, iteration, worker_id).await?);
        }

        let keys_migrated: u64 = workers.iter().map(|worker| worker.keys_migrated).sum();
        let last_applied = workers
            .iter()
            .map(|worker| worker.last_applied_seq_num)
            .max()
            .unwrap_or(end_seq_num);
        let end_time = now_millis();

        tx.set(&key(Field::NoOfKeysMigrated), &keys_migrated).await?;
        tx.set(&key(Field::LastAppliedSeqNum), &last_applied).await?;
        tx.set(&key(Field::EndDateTimeUtc), &end_time).await?;
        tx.set(&key(Field::CurrentStatus), &MigrationState::Completed)
            .await?;
        tx.add_or_update(
            &run_key(Field::NoOfKeysMigrated),
            &keys_migrated,
            |current: u64| current + keys_migrated,
        )
        .await?;
        tx.add_or_update(
            &run_key(Field::LastAppliedSeqNum),
            &last_applied,
            |current: i64| current.max(last_applied),
        )
        .await?;
        tx.commit().await?;

        info!(%phase, iteration, keys_migrated, last_applied, "Phase completed");
        self.get_result(phase, iteration).await
    }

    /// Rebuilds a completed phase's result from checkpoints alone.
    pub async fn get_result(
        &self,
        phase: Phase,
        iteration: u32,
    ) -> Result<PhaseResult, MigrationError> {
        let mut tx = CheckpointTransaction::begin(&self.ctx.checkpoints).await?;
        let key = |field| phase_key(phase, iteration, field);

        let status = tx.require(&key(Field::CurrentStatus)).await?;
        let start_seq_num = tx.require(&key(Field::StartSeqNum)).await?;
        let end_seq_num = tx.require(&key(Field::EndSeqNum)).await?;
        let last_applied_seq_num = tx.require(&key(Field::LastAppliedSeqNum)).await?;
        let keys_migrated = tx.require(&key(Field::NoOfKeysMigrated)).await?;
        let start_time = tx.require(&key(Field::StartDateTimeUtc)).await?;
        let end_time = tx.require(&key(Field::EndDateTimeUtc)).await?;
        let worker_count: u32 = tx.require(&key(Field::WorkerCount)).await?;

        let mut workers = Vec::with_capacity(worker_count as usize);
        for worker_id in 1..=worker_count {
            workers.push(read_worker_result(&mut tx, phase, iteration, worker_id).await?);
        }

        Ok(PhaseResult {
            phase,
            iteration,
            start_seq_num,
            end_seq_num,
            last_applied_seq_num,
            keys_migrated,
            start_time,
            end_time,
            status,
            workers,
        })
    }

    /// Progress of a phase iteration, or `None` if it never started.
    pub async fn snapshot(
        &self,
        phase: Phase,
        iteration: u32,
    ) -> Result<Option<PhaseSnapshot>, MigrationError> {
        let mut tx = CheckpointTransaction::begin(&self.ctx.checkpoints).await?;
        let key = |field| phase_key(phase, iteration, field);

        let Some(status) = tx.read::<MigrationState>(&key(Field::CurrentStatus)).await? else {
            return Ok(None);
        };
        let worker_count: u32 = tx.require(&key(Field::WorkerCount)).await?;
        let mut keys_migrated: Option<u64> = tx.read(&key(Field::NoOfKeysMigrated)).await?;
        let mut last_applied_seq_num: i64 = tx.require(&key(Field::LastAppliedSeqNum)).await?;
        if status != MigrationState::Completed {
            let mut running_keys: u64 = 0;
            for worker_id in 1..=worker_count {
                let worker = |field| worker_key(phase, iteration, worker_id, field);
                running_keys += tx
                    .read::<u64>(&worker(Field::NoOfKeysMigrated))
                    .await?
                    .unwrap_or_default();
                if let Some(last) = tx.read::<i64>(&worker(Field::LastAppliedSeqNum)).await? {
                    last_applied_seq_num = last_applied_seq_num.max(last);
                }
            }
            keys_migrated = Some(running_keys);
        }

        Ok(Some(PhaseSnapshot {
            phase,
            iteration,
            status,
            start_seq_num: tx.require(&key(Field::StartSeqNum)).await?,
            end_seq_num: tx.require(&key(Field::EndSeqNum)).await?,
            last_applied_seq_num,
            worker_count,
            keys_migrated: keys_migrated.unwrap_or_default(),
            start_time: tx.require(&key(Field::StartDateTimeUtc)).await?,
            end_time: tx.read(&key(Field::EndDateTimeUtc)).await?,
        }))
    }
}

async fn read_worker_result(
    tx: &mut CheckpointTransaction,
    phase: Phase,
    iteration: u32,
    worker_id: u32,
) -> Result<WorkerResult, MigrationError> {
    let key = |field| worker_key(phase, iteration, worker_id, field);
    Ok(WorkerResult {
        worker_id,
        start_seq_num: tx.require(&key(Field::StartSeqNum)).await?,
        end_seq_num: tx.require(&key(Field::EndSeqNum)).await?,
        last_applied_seq_num: tx.require(&key(Field::LastAppliedSeqNum)).await?,
        keys_migrated: tx.require(&key(Field::NoOfKeysMigrated)).await?,
        end_time: tx.read(&key(Field::EndDateTimeUtc)).await?.unwrap_or_default(),
        status: tx.require(&key(Field::CurrentStatus)).await?,
    })
}

/// Splits `[start, end]` into `workers` contiguous ranges. Every worker but the last gets
/// `count / workers` sequence numbers and the last one absorbs the remainder. Workers with
/// nothing to do get an empty range (`end < start`).
pub fn partition(start: i64, end: i64, workers: u32) -> Vec<(i64, i64)> {
    let workers = i64::from(workers.max(1));
    let count = (end - start + 1).max(0);
    let per_worker = count / workers;
    (1..=workers)
        .map(|i| {
            let worker_start = start + (i - 1) * per_worker;
            let worker_end = if i == workers {
                end
            } else {
                start + i * per_worker - 1
            };
            (worker_start, worker_end)
        })
        .collect()
}
