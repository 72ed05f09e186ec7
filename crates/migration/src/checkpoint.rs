//! Checkpoint keys and typed access to the checkpoint table.
//!
//! Checkpoints are the only durable state of a migration. Keys follow three fixed templates:
//! - run: `_Migration{Field}_`
//! - phase: `_{Phase}Phase_Iteration-{n}_{Field}_`, plus `_{Phase}Phase_IterationCount_`
//! - worker: `_{Phase}Phase_Iteration-{n}_Worker{w}_{Field}_`
//!
//! Integers are stored in decimal, timestamps as unix milliseconds, phases and statuses by name.

use std::time::{SystemTime, UNIX_EPOCH};

use actor_migration_storage::{Store, Transaction, tables::MIGRATION_CHECKPOINTS};

use crate::{
    error::MigrationError,
    types::{MigrationState, Phase},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    CurrentPhase,
    CurrentIteration,
    CurrentStatus,
    StartDateTimeUtc,
    EndDateTimeUtc,
    StartSeqNum,
    EndSeqNum,
    LastAppliedSeqNum,
    NoOfKeysMigrated,
    NoOfKeysSkipped,
    LastSkipReason,
    WorkerCount,
    WritesRejected,
    Aborted,
}

impl Field {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CurrentPhase => "CurrentPhase",
            Self::CurrentIteration => "CurrentIteration",
            Self::CurrentStatus => "CurrentStatus",
            Self::StartDateTimeUtc => "StartDateTimeUTC",
            Self::EndDateTimeUtc => "EndDateTimeUTC",
            Self::StartSeqNum => "StartSeqNum",
            Self::EndSeqNum => "EndSeqNum",
            Self::LastAppliedSeqNum => "LastAppliedSeqNum",
            Self::NoOfKeysMigrated => "NoOfKeysMigrated",
            Self::NoOfKeysSkipped => "NoOfKeysSkipped",
            Self::LastSkipReason => "LastSkipReason",
            Self::WorkerCount => "WorkerCount",
            Self::WritesRejected => "WritesRejected",
            Self::Aborted => "Aborted",
        }
    }
}

pub fn run_key(field: Field) -> String {
    format!("_Migration{}_", field.as_str())
}

pub fn phase_key(phase: Phase, iteration: u32, field: Field) -> String {
    format!("_{phase}Phase_Iteration-{iteration}_{}_", field.as_str())
}

pub fn iteration_count_key(phase: Phase) -> String {
    format!("_{phase}Phase_IterationCount_")
}

pub fn worker_key(phase: Phase, iteration: u32, worker_id: u32, field: Field) -> String {
    format!(
        "_{phase}Phase_Iteration-{iteration}_Worker{worker_id}_{}_",
        field.as_str()
    )
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

/// A value that can be stored under a checkpoint key.
pub trait CheckpointValue: Sized {
    const EXPECTED: &'static str;

    fn encode(&self) -> String;

    fn decode(raw: &str) -> Option<Self>;
}

impl CheckpointValue for i64 {
    const EXPECTED: &'static str = "a signed integer";

    fn encode(&self) -> String {
        self.to_string()
    }

    fn decode(raw: &str) -> Option<Self> {
        raw.parse().ok()
    }
}

impl CheckpointValue for u64 {
    const EXPECTED: &'static str = "an unsigned integer";

    fn encode(&self) -> String {
        self.to_string()
    }

    fn decode(raw: &str) -> Option<Self> {
        raw.parse().ok()
    }
}

impl CheckpointValue for u32 {
    const EXPECTED: &'static str = "an unsigned integer";

    fn encode(&self) -> String {
        self.to_string()
    }

    fn decode(raw: &str) -> Option<Self> {
        raw.parse().ok()
    }
}

impl CheckpointValue for bool {
    const EXPECTED: &'static str = "true or false";

    fn encode(&self) -> String {
        self.to_string()
    }

    fn decode(raw: &str) -> Option<Self> {
        raw.parse().ok()
    }
}

impl CheckpointValue for String {
    const EXPECTED: &'static str = "a string";

    fn encode(&self) -> String {
        self.clone()
    }

    fn decode(raw: &str) -> Option<Self> {
        Some(raw.to_owned())
    }
}

impl CheckpointValue for Phase {
    const EXPECTED: &'static str = "a phase name";

    fn encode(&self) -> String {
        self.as_str().to_owned()
    }

    fn decode(raw: &str) -> Option<Self> {
        Phase::from_name(raw)
    }
}

impl CheckpointValue for MigrationState {
    const EXPECTED: &'static str = "a migration status";

    fn encode(&self) -> String {
        self.as_str().to_owned()
    }

    fn decode(raw: &str) -> Option<Self> {
        MigrationState::from_name(raw)
    }
}

fn decode<T: CheckpointValue>(key: &str, raw: String) -> Result<T, MigrationError> {
    T::decode(&raw).ok_or_else(|| MigrationError::Parse {
        key: key.to_owned(),
        value: raw,
        expected: T::EXPECTED,
    })
}

/// A transaction over the checkpoint table with typed values.
pub struct CheckpointTransaction {
    tx: Transaction,
}

impl CheckpointTransaction {
    pub async fn begin(store: &Store) -> Result<Self, MigrationError> {
        Ok(Self {
            tx: store.transaction().await?,
        })
    }

    pub async fn read<T: CheckpointValue>(&mut self, key: &str) -> Result<Option<T>, MigrationError> {
        match self.tx.get(MIGRATION_CHECKPOINTS, key).await? {
            Some(raw) => decode(key, raw).map(Some),
            None => Ok(None),
        }
    }

    pub async fn require<T: CheckpointValue>(&mut self, key: &str) -> Result<T, MigrationError> {
        self.read(key)
            .await?
            .ok_or_else(|| MigrationError::MissingCheckpoint(key.to_owned()))
    }

    /// Returns the stored value, storing `value` first if the key is absent.
    pub async fn get_or_add<T: CheckpointValue>(
        &mut self,
        key: &str,
        value: &T,
    ) -> Result<T, MigrationError> {
        let raw = self
            .tx
            .get_or_add(MIGRATION_CHECKPOINTS, key, &value.encode())
            .await?;
        decode(key, raw)
    }

    pub async fn set<T: CheckpointValue>(&mut self, key: &str, value: &T) -> Result<(), MigrationError> {
        self.tx
            .set(MIGRATION_CHECKPOINTS, key, &value.encode())
            .await?;
        Ok(())
    }

    /// Stores `add_value` if the key is absent, `merge(current)` otherwise.
    pub async fn add_or_update<T, F>(
        &mut self,
        key: &str,
        add_value: &T,
        merge: F,
    ) -> Result<T, MigrationError>
    where
        T: CheckpointValue,
        F: FnOnce(T) -> T,
    {
        let raw = self
            .tx
            .add_or_update(MIGRATION_CHECKPOINTS, key, &add_value.encode(), |current| {
                decode::<T>(key, current.to_owned()).map(|current| merge(current).encode())
            })
            .await?;
        decode(key, raw)
    }

    pub async fn commit(self) -> Result<(), MigrationError> {
        self.tx.commit().await?;
        Ok(())
    }
}
