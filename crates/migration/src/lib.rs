//! Live migration of actor state from a sequence-numbered source store into a target store.
//!
//! A run copies everything the source holds, catches up with the writes made meanwhile until
//! the remaining gap is small, then stops writes on the source for a short downtime phase that
//! migrates the rest. All progress lives in a checkpoint table so a run can be restarted at any
//! point.

use std::sync::Arc;

use actor_migration_storage::Store;

pub mod checkpoint;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod orchestrator;
pub mod settings;
pub mod source;
pub mod transform;
pub mod types;
pub mod worker;

#[cfg(test)]
mod test_utils;

pub use coordinator::PhaseWorkloadCoordinator;
pub use error::MigrationError;
pub use health::{HealthSnapshot, SkippedRecords};
pub use orchestrator::MigrationOrchestrator;
pub use settings::MigrationSettings;
pub use source::MigrationSource;
pub use types::{
    MigrationState, MigrationStatus, Phase, PhaseInput, PhaseResult, PhaseSnapshot, WorkerInput,
    WorkerResult,
};

/// Everything a migration component needs, cheap to clone.
#[derive(Clone)]
pub struct MigrationContext {
    pub source: Arc<dyn MigrationSource>,
    pub checkpoints: Store,
    pub target: Store,
    pub settings: Arc<MigrationSettings>,
}

impl MigrationContext {
    pub fn new(
        source: Arc<dyn MigrationSource>,
        checkpoints: Store,
        target: Store,
        settings: MigrationSettings,
    ) -> Self {
        Self {
            source,
            checkpoints,
            target,
            settings: Arc::new(settings),
        }
    }
}
