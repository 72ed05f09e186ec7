use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use actor_migration_remote::{ClientError, MigrationRecord, RemoteError, RemoteErrorKind};
use actor_migration_storage::{Store, tables::MIGRATION_CHECKPOINTS};
use tokio_util::sync::CancellationToken;

use crate::{MigrationContext, MigrationError, MigrationSettings, MigrationSource};

pub(crate) fn put(sequence_number: i64, key: &str) -> MigrationRecord {
    MigrationRecord {
        sequence_number,
        key: key.to_owned(),
        value: Some(format!("v{sequence_number}")),
        is_deleted: false,
    }
}

pub(crate) fn context(source: Arc<FakeSource>, items_per_enumeration: usize) -> MigrationContext {
    let settings = MigrationSettings {
        copy_phase_parallelism: 2,
        items_per_enumeration,
        items_per_chunk: items_per_enumeration,
        ..Default::default()
    };
    MigrationContext::new(source, Store::default(), Store::default(), settings)
}

/// In-memory source holding a fixed, ordered change log.
#[derive(Default)]
pub(crate) struct FakeSource {
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    records: Vec<MigrationRecord>,
    last_sequence_numbers: VecDeque<i64>,
    fail_from: Option<i64>,
    enumerate_starts: Vec<i64>,
    reject_calls: usize,
    resume_calls: usize,
    observer: Option<(Store, String)>,
    observed: Vec<Option<i64>>,
}

impl FakeSource {
    pub(crate) fn with_records(records: impl IntoIterator<Item = MigrationRecord>) -> Arc<Self> {
        let mut records: Vec<MigrationRecord> = records.into_iter().collect();
        records.sort_by_key(|record| record.sequence_number);
        Arc::new(Self {
            state: Mutex::new(FakeState {
                records,
                ..Default::default()
            }),
        })
    }

    /// Values returned by the next `last_sequence_number` calls, afterwards the highest
    /// sequence number held is returned.
    pub(crate) fn script_last_sequence_numbers(&self, values: impl IntoIterator<Item = i64>) {
        self.state.lock().unwrap().last_sequence_numbers = values.into_iter().collect();
    }

    pub(crate) fn fail_enumerations_from(&self, sequence_number: i64) {
        self.state.lock().unwrap().fail_from = Some(sequence_number);
    }

    pub(crate) fn clear_failures(&self) {
        self.state.lock().unwrap().fail_from = None;
    }

    pub(crate) fn enumerate_starts(&self) -> Vec<i64> {
        self.state.lock().unwrap().enumerate_starts.clone()
    }

    /// Reads `key` from `checkpoints` at the start of every enumeration.
    pub(crate) fn observe_checkpoint(&self, checkpoints: Store, key: String) {
        self.state.lock().unwrap().observer = Some((checkpoints, key));
    }

    pub(crate) fn observed_checkpoints(&self) -> Vec<Option<i64>> {
        self.state.lock().unwrap().observed.clone()
    }

    pub(crate) fn reject_calls(&self) -> usize {
        self.state.lock().unwrap().reject_calls
    }

    pub(crate) fn resume_calls(&self) -> usize {
        self.state.lock().unwrap().resume_calls
    }
}

#[async_trait::async_trait]
impl MigrationSource for FakeSource {
    async fn first_sequence_number(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<i64, MigrationError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .records
            .first()
            .map_or(0, |record| record.sequence_number))
    }

    async fn last_sequence_number(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<i64, MigrationError> {
        let mut state = self.state.lock().unwrap();
        if let Some(scripted) = state.last_sequence_numbers.pop_front() {
            return Ok(scripted);
        }
        Ok(state
            .records
            .last()
            .map_or(0, |record| record.sequence_number))
    }

    async fn enumerate(
        &self,
        start: i64,
        _chunk_size: usize,
        item_count: usize,
        include_deletes: bool,
        _cancel: &CancellationToken,
    ) -> Result<Vec<MigrationRecord>, MigrationError> {
        let observer = self.state.lock().unwrap().observer.clone();
        if let Some((checkpoints, key)) = observer {
            let value = checkpoints
                .get(MIGRATION_CHECKPOINTS, &key)
                .await?
                .and_then(|raw| raw.parse().ok());
            self.state.lock().unwrap().observed.push(value);
        }

        let mut state = self.state.lock().unwrap();
        state.enumerate_starts.push(start);
        if state.fail_from.is_some_and(|from| start >= from) {
            return Err(MigrationError::from(ClientError::Remote(RemoteError::new(
                RemoteErrorKind::Server,
                "injected failure",
            ))));
        }
        Ok(state
            .records
            .iter()
            .filter(|record| record.sequence_number >= start)
            .filter(|record| include_deletes || !record.is_deleted)
            .take(item_count)
            .cloned()
            .collect())
    }

    async fn reject_writes(&self, _cancel: &CancellationToken) -> Result<bool, MigrationError> {
        self.state.lock().unwrap().reject_calls += 1;
        Ok(true)
    }

    async fn resume_writes(&self, _cancel: &CancellationToken) -> Result<bool, MigrationError> {
        self.state.lock().unwrap().resume_calls += 1;
        Ok(true)
    }
}
