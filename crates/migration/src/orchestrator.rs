//! Top-level state machine of a migration run.
//!
//! ```text
//! None -> Copy -> Catchup(1) -> ... -> Catchup(k) -> Downtime -> Complete
//! ```
//!
//! Catchup repeats while the source is still at least `downtime_threshold` sequence numbers
//! ahead of what was migrated. Once it is closer than that, writes to the source are rejected
//! and the downtime phase migrates the rest. Every transition is checkpointed before the next
//! phase starts, so a restarted orchestrator continues where the previous one stopped.

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    MigrationContext,
    checkpoint::{CheckpointTransaction, Field, iteration_count_key, now_millis, run_key},
    coordinator::PhaseWorkloadCoordinator,
    error::MigrationError,
    health::HealthSnapshot,
    types::{MigrationState, MigrationStatus, Phase, PhaseResult},
};

pub struct MigrationOrchestrator {
    ctx: MigrationContext,
    coordinator: PhaseWorkloadCoordinator,
}

impl MigrationOrchestrator {
    pub fn new(ctx: MigrationContext) -> Self {
        Self {
            coordinator: PhaseWorkloadCoordinator::new(ctx.clone()),
            ctx,
        }
    }

    pub fn coordinator(&self) -> &PhaseWorkloadCoordinator {
        &self.coordinator
    }

    /// Drives the run to completion, resuming from checkpoints.
    ///
    /// On failure the run is marked `Failed` and the error is returned. Invoking this again
    /// resumes the run from its last checkpoint.
    pub async fn start_or_resume(
        &self,
        cancel: &CancellationToken,
    ) -> Result<MigrationStatus, MigrationError> {
        match self.run(cancel).await {
            Ok(()) => self.migration_status().await,
            Err(MigrationError::Cancelled) => {
                info!("Migration cancelled, it resumes from its checkpoints on restart");
                Err(MigrationError::Cancelled)
            }
            Err(MigrationError::Aborted) => {
                error!("Migration was aborted, refusing to resume it");
                Err(MigrationError::Aborted)
            }
            Err(err) => {
                error!(error = %err, "Migration failed");
                if let Err(mark_err) = self.set_status(MigrationState::Failed).await {
                    warn!(error = %mark_err, "Could not mark migration as failed");
                }
                Err(err)
            }
        }
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<(), MigrationError> {
        self.initialize().await?;

        loop {
            if cancel.is_cancelled() {
                return Err(MigrationError::Cancelled);
            }

            let (phase, iteration) = self.current_phase().await?;
            match phase {
                Phase::None => {
                    self.transition(Phase::Copy, 1).await?;
                }
                Phase::Copy => {
                    let start = self.ctx.source.first_sequence_number(cancel).await?;
                    let end = self.ctx.source.last_sequence_number(cancel).await?;
                    let result = self
                        .coordinator
                        .start_or_resume(
                            Phase::Copy,
                            1,
                            start,
                            end,
                            self.ctx.settings.copy_phase_parallelism,
                            cancel,
                        )
                        .await?;

                    let mut tx = CheckpointTransaction::begin(&self.ctx.checkpoints).await?;
                    tx.get_or_add(&run_key(Field::StartSeqNum), &result.start_seq_num)
                        .await?;
                    tx.commit().await?;
                    self.transition(Phase::Catchup, 1).await?;
                }
                Phase::Catchup => {
                    let result = self.run_tail_phase(Phase::Catchup, iteration, cancel).await?;
                    let remote_end = self.ctx.source.last_sequence_number(cancel).await?;
                    let delta = remote_end - result.end_seq_num;
                    if delta >= self.ctx.settings.downtime_threshold {
                        info!(iteration, delta, "Source still ahead, running another catchup");
                        self.transition(Phase::Catchup, iteration + 1).await?;
                    } else {
                        info!(iteration, delta, "Source caught up, entering downtime");
                        self.enter_downtime().await?;
                    }
                }
                Phase::Downtime => {
                    // Idempotent, issued again on every resume
                    info!("Rejecting writes on the source");
                    if !self.ctx.source.reject_writes(cancel).await? {
                        return Err(MigrationError::RejectWritesRefused);
                    }
                    let result = self.run_tail_phase(Phase::Downtime, 1, cancel).await?;

                    let mut tx = CheckpointTransaction::begin(&self.ctx.checkpoints).await?;
                    tx.set(&run_key(Field::EndSeqNum), &result.end_seq_num)
                        .await?;
                    tx.set(&run_key(Field::EndDateTimeUtc), &now_millis())
                        .await?;
                    tx.set(&run_key(Field::CurrentStatus), &MigrationState::Completed)
                        .await?;
                    tx.set(&run_key(Field::CurrentPhase), &Phase::Complete)
                        .await?;
                    tx.commit().await?;
                    info!(end = result.end_seq_num, "Migration completed");
                }
                Phase::Complete => return Ok(()),
            }
        }
    }

    /// Runs a single-worker phase over everything the source holds past the previous phase.
    async fn run_tail_phase(
        &self,
        phase: Phase,
        iteration: u32,
        cancel: &CancellationToken,
    ) -> Result<PhaseResult, MigrationError> {
        let (previous_phase, previous_iteration) = self.previous_phase(phase, iteration).await?;
        let previous = self
            .coordinator
            .get_result(previous_phase, previous_iteration)
            .await?;
        let end = self.ctx.source.last_sequence_number(cancel).await?;
        self.coordinator
            .start_or_resume(phase, iteration, previous.end_seq_num + 1, end, 1, cancel)
            .await
    }

    async fn previous_phase(
        &self,
        phase: Phase,
        iteration: u32,
    ) -> Result<(Phase, u32), MigrationError> {
        match (phase, iteration) {
            (Phase::Catchup, 1) => Ok((Phase::Copy, 1)),
            (Phase::Catchup, iteration) => Ok((Phase::Catchup, iteration - 1)),
            _ => {
                let mut tx = CheckpointTransaction::begin(&self.ctx.checkpoints).await?;
                let catchups: u32 = tx.require(&iteration_count_key(Phase::Catchup)).await?;
                Ok((Phase::Catchup, catchups))
            }
        }
    }

    /// Creates the run keys on first invocation and marks the run in progress. An aborted run
    /// is never resumed.
    async fn initialize(&self) -> Result<(), MigrationError> {
        let mut tx = CheckpointTransaction::begin(&self.ctx.checkpoints).await?;
        if tx.read::<bool>(&run_key(Field::Aborted)).await? == Some(true) {
            return Err(MigrationError::Aborted);
        }
        let phase = tx
            .get_or_add(&run_key(Field::CurrentPhase), &Phase::None)
            .await?;
        tx.get_or_add(&run_key(Field::CurrentIteration), &0u32)
            .await?;
        tx.get_or_add(&run_key(Field::StartDateTimeUtc), &now_millis())
            .await?;
        tx.get_or_add(&run_key(Field::NoOfKeysMigrated), &0u64)
            .await?;
        if phase != Phase::Complete {
            tx.set(&run_key(Field::CurrentStatus), &MigrationState::InProgress)
                .await?;
        }
        tx.commit().await?;
        info!(%phase, "Migration initialized");
        Ok(())
    }

    async fn current_phase(&self) -> Result<(Phase, u32), MigrationError> {
        let mut tx = CheckpointTransaction::begin(&self.ctx.checkpoints).await?;
        let phase = tx.require(&run_key(Field::CurrentPhase)).await?;
        let iteration = tx.require(&run_key(Field::CurrentIteration)).await?;
        Ok((phase, iteration))
    }

    async fn transition(&self, phase: Phase, iteration: u32) -> Result<(), MigrationError> {
        let mut tx = CheckpointTransaction::begin(&self.ctx.checkpoints).await?;
        tx.set(&run_key(Field::CurrentPhase), &phase).await?;
        tx.set(&run_key(Field::CurrentIteration), &iteration).await?;
        tx.commit().await?;
        info!(%phase, iteration, "Entering phase");
        Ok(())
    }

    /// Moves to downtime and marks writes as rejected in the same transaction.
    async fn enter_downtime(&self) -> Result<(), MigrationError> {
        let mut tx = CheckpointTransaction::begin(&self.ctx.checkpoints).await?;
        tx.set(&run_key(Field::WritesRejected), &true).await?;
        tx.set(&run_key(Field::CurrentPhase), &Phase::Downtime)
            .await?;
        tx.set(&run_key(Field::CurrentIteration), &1u32).await?;
        tx.commit().await?;
        info!(phase = %Phase::Downtime, iteration = 1, "Entering phase");
        Ok(())
    }

    async fn set_status(&self, status: MigrationState) -> Result<(), MigrationError> {
        let mut tx = CheckpointTransaction::begin(&self.ctx.checkpoints).await?;
        tx.set(&run_key(Field::CurrentStatus), &status).await?;
        tx.commit().await
    }

    /// Snapshot of the run read from checkpoints. Safe to call at any time, including while
    /// a run is in progress or after it failed.
    pub async fn migration_status(&self) -> Result<MigrationStatus, MigrationError> {
        let mut tx = CheckpointTransaction::begin(&self.ctx.checkpoints).await?;
        let current_phase = tx
            .read(&run_key(Field::CurrentPhase))
            .await?
            .unwrap_or(Phase::None);
        let current_iteration = tx
            .read(&run_key(Field::CurrentIteration))
            .await?
            .unwrap_or_default();
        let status = tx.read(&run_key(Field::CurrentStatus)).await?;
        let start_time = tx.read(&run_key(Field::StartDateTimeUtc)).await?;
        let end_time = tx.read(&run_key(Field::EndDateTimeUtc)).await?;
        let start_seq_num = tx.read(&run_key(Field::StartSeqNum)).await?;
        let end_seq_num = tx.read(&run_key(Field::EndSeqNum)).await?;
        let last_applied_seq_num = tx.read(&run_key(Field::LastAppliedSeqNum)).await?;
        let keys_migrated = tx
            .read(&run_key(Field::NoOfKeysMigrated))
            .await?
            .unwrap_or_default();
        let catchups: u32 = tx
            .read(&iteration_count_key(Phase::Catchup))
            .await?
            .unwrap_or_default();
        let writes_rejected: bool = tx
            .read(&run_key(Field::WritesRejected))
            .await?
            .unwrap_or_default();
        let aborted: bool = tx
            .read(&run_key(Field::Aborted))
            .await?
            .unwrap_or_default();
        let health = HealthSnapshot::read(&mut tx).await?;
        drop(tx);

        let iterations = std::iter::once((Phase::Copy, 1))
            .chain((1..=catchups).map(|iteration| (Phase::Catchup, iteration)))
            .chain(std::iter::once((Phase::Downtime, 1)));
        let mut phases = Vec::new();
        for (phase, iteration) in iterations {
            if let Some(snapshot) = self.coordinator.snapshot(phase, iteration).await? {
                phases.push(snapshot);
            }
        }

        Ok(MigrationStatus {
            current_phase,
            current_iteration,
            status,
            start_time,
            end_time,
            start_seq_num,
            end_seq_num,
            last_applied_seq_num,
            keys_migrated,
            writes_rejected,
            aborted,
            phases,
            health,
        })
    }

    /// Operator abort. Marks the run failed and aborted, so it can never be resumed, then gives
    /// writes back to the source if the run had taken them away. A completed run or one that
    /// never started is left as is.
    pub async fn abort(&self, cancel: &CancellationToken) -> Result<(), MigrationError> {
        let mut tx = CheckpointTransaction::begin(&self.ctx.checkpoints).await?;
        let Some(phase) = tx.read::<Phase>(&run_key(Field::CurrentPhase)).await? else {
            info!("Nothing to abort, migration never started");
            return Ok(());
        };
        if phase == Phase::Complete {
            warn!("Migration already completed, ignoring abort");
            return Ok(());
        }
        let writes_rejected = tx
            .read::<bool>(&run_key(Field::WritesRejected))
            .await?
            .unwrap_or_default();
        tx.set(&run_key(Field::Aborted), &true).await?;
        tx.set(&run_key(Field::CurrentStatus), &MigrationState::Failed)
            .await?;
        tx.commit().await?;
        warn!(%phase, "Migration aborted");

        if writes_rejected {
            info!("Resuming writes on the source");
            if !self.ctx.source.resume_writes(cancel).await? {
                warn!("Source did not confirm that writes resumed");
            }
            let mut tx = CheckpointTransaction::begin(&self.ctx.checkpoints).await?;
            tx.set(&run_key(Field::WritesRejected), &false).await?;
            tx.commit().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::test_utils::{FakeSource, context, put};

    fn records(range: std::ops::RangeInclusive<i64>) -> Vec<actor_migration_remote::MigrationRecord> {
        range.map(|sn| put(sn, &format!("@@a{sn}"))).collect()
    }

    #[tokio::test]
    async fn catchup_within_threshold_rejects_writes_once_and_enters_downtime() {
        let source = FakeSource::with_records(records(1..=100));
        // copy end, catchup end, source position after catchup
        source.script_last_sequence_numbers([100, 100, 1100]);
        let orchestrator = MigrationOrchestrator::new(context(source.clone(), 50));

        let status = orchestrator
            .start_or_resume(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(source.reject_calls(), 1);
        assert_eq!(status.current_phase, Phase::Complete);
        assert_eq!(status.status, Some(MigrationState::Completed));
        let phases: Vec<(Phase, u32)> = status
            .phases
            .iter()
            .map(|snapshot| (snapshot.phase, snapshot.iteration))
            .collect();
        assert_eq!(
            phases,
            vec![(Phase::Copy, 1), (Phase::Catchup, 1), (Phase::Downtime, 1)]
        );
        assert_eq!(status.keys_migrated, 100);
    }

    #[tokio::test]
    async fn catchup_repeats_while_source_is_far_ahead() {
        let source = FakeSource::with_records(records(1..=3000));
        // copy end, catchup 1 end, delta check (2000 >= 1024), catchup 2 end, delta check
        source.script_last_sequence_numbers([1000, 1000, 3000, 3000, 3000]);
        let orchestrator = MigrationOrchestrator::new(context(source.clone(), 500));

        let status = orchestrator
            .start_or_resume(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(source.reject_calls(), 1);
        let catchups = status
            .phases
            .iter()
            .filter(|snapshot| snapshot.phase == Phase::Catchup)
            .count();
        assert_eq!(catchups, 2);
        assert_eq!(status.keys_migrated, 3000);
        assert_eq!(status.end_seq_num, Some(3000));
    }

    #[tokio::test]
    async fn failure_marks_run_failed_and_restart_resumes() {
        let source = FakeSource::with_records(records(1..=40));
        source.fail_enumerations_from(21);
        let ctx = context(source.clone(), 10);
        let orchestrator = MigrationOrchestrator::new(ctx.clone());
        let cancel = CancellationToken::new();

        let err = orchestrator.start_or_resume(&cancel).await.unwrap_err();
        assert!(matches!(err, MigrationError::Client(_)));
        let status = orchestrator.migration_status().await.unwrap();
        assert_eq!(status.status, Some(MigrationState::Failed));
        assert_eq!(status.current_phase, Phase::Copy);

        source.clear_failures();
        let status = MigrationOrchestrator::new(ctx)
            .start_or_resume(&cancel)
            .await
            .unwrap();
        assert_eq!(status.status, Some(MigrationState::Completed));
        assert_eq!(status.keys_migrated, 40);
    }

    #[tokio::test]
    async fn completed_run_is_not_repeated() {
        let source = FakeSource::with_records(records(1..=10));
        let orchestrator = MigrationOrchestrator::new(context(source.clone(), 10));
        let cancel = CancellationToken::new();

        let first = orchestrator.start_or_resume(&cancel).await.unwrap();
        let calls = source.enumerate_starts().len();
        let second = orchestrator.start_or_resume(&cancel).await.unwrap();

        assert_eq!(source.enumerate_starts().len(), calls);
        assert_eq!(source.reject_calls(), 1);
        assert_eq!(first.keys_migrated, second.keys_migrated);
    }

    /// Copies 1..=10, then the source receives 11..=12 during catchup and the downtime phase
    /// fails on its first enumeration.
    async fn run_failing_in_downtime() -> (Arc<FakeSource>, MigrationContext) {
        let source = FakeSource::with_records(records(1..=12));
        // copy end, catchup end, delta check, downtime end
        source.script_last_sequence_numbers([10, 10, 10, 12]);
        source.fail_enumerations_from(11);
        let ctx = context(source.clone(), 10);

        let err = MigrationOrchestrator::new(ctx.clone())
            .start_or_resume(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::Client(_)));
        (source, ctx)
    }

    #[tokio::test]
    async fn resuming_into_downtime_rejects_writes_again() {
        let (source, ctx) = run_failing_in_downtime().await;
        let orchestrator = MigrationOrchestrator::new(ctx);
        let status = orchestrator.migration_status().await.unwrap();
        assert_eq!(status.current_phase, Phase::Downtime);
        assert_eq!(status.status, Some(MigrationState::Failed));
        assert!(status.writes_rejected);
        assert_eq!(source.reject_calls(), 1);

        source.clear_failures();
        let status = orchestrator
            .start_or_resume(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(source.reject_calls(), 2);
        assert_eq!(status.status, Some(MigrationState::Completed));
        assert_eq!(status.keys_migrated, 12);
    }

    #[tokio::test]
    async fn aborted_run_is_never_resumed() {
        let (source, ctx) = run_failing_in_downtime().await;
        let orchestrator = MigrationOrchestrator::new(ctx.clone());
        let cancel = CancellationToken::new();

        orchestrator.abort(&cancel).await.unwrap();
        assert_eq!(source.resume_calls(), 1);

        source.clear_failures();
        let err = MigrationOrchestrator::new(ctx)
            .start_or_resume(&cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::Aborted));
        assert_eq!(source.reject_calls(), 1);
        assert_eq!(source.resume_calls(), 1);

        let status = orchestrator.migration_status().await.unwrap();
        assert_eq!(status.status, Some(MigrationState::Failed));
        assert_eq!(status.current_phase, Phase::Downtime);
        assert!(status.aborted);
        assert!(!status.writes_rejected);
    }

    #[tokio::test]
    async fn abort_follows_the_writes_rejected_marker() {
        let source = FakeSource::with_records(records(1..=10));
        let ctx = context(source.clone(), 10);
        let orchestrator = MigrationOrchestrator::new(ctx.clone());

        // Moved to downtime, but stopped before the source confirmed the rejection
        orchestrator.initialize().await.unwrap();
        orchestrator.enter_downtime().await.unwrap();

        orchestrator.abort(&CancellationToken::new()).await.unwrap();
        assert_eq!(source.reject_calls(), 0);
        assert_eq!(source.resume_calls(), 1);
    }

    #[tokio::test]
    async fn abort_during_catchup_leaves_writes_alone() {
        let source = FakeSource::with_records(records(1..=10));
        let ctx = context(source.clone(), 10);
        let orchestrator = MigrationOrchestrator::new(ctx.clone());
        orchestrator.initialize().await.unwrap();
        orchestrator.transition(Phase::Catchup, 1).await.unwrap();

        orchestrator.abort(&CancellationToken::new()).await.unwrap();
        assert_eq!(source.resume_calls(), 0);
        let status = orchestrator.migration_status().await.unwrap();
        assert_eq!(status.status, Some(MigrationState::Failed));
        assert!(status.aborted);
    }

    #[tokio::test]
    async fn abort_before_downtime_leaves_writes_alone() {
        let source = FakeSource::with_records(records(1..=10));
        let orchestrator = MigrationOrchestrator::new(context(source.clone(), 10));

        orchestrator.abort(&CancellationToken::new()).await.unwrap();
        assert_eq!(source.resume_calls(), 0);
    }

    #[tokio::test]
    async fn status_of_fresh_store_is_empty() {
        let orchestrator =
            MigrationOrchestrator::new(context(FakeSource::with_records(Vec::new()), 10));
        let status = orchestrator.migration_status().await.unwrap();
        assert_eq!(status.current_phase, Phase::None);
        assert_eq!(status.status, None);
        assert!(status.phases.is_empty());
    }
}
