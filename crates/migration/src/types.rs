use std::fmt;

use serde::Serialize;

use crate::health::HealthSnapshot;

/// Stage of a migration run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Phase {
    None,
    Copy,
    Catchup,
    Downtime,
    Complete,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Copy => "Copy",
            Self::Catchup => "Catchup",
            Self::Downtime => "Downtime",
            Self::Complete => "Complete",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "None" => Self::None,
            "Copy" => Self::Copy,
            "Catchup" => Self::Catchup,
            "Downtime" => Self::Downtime,
            "Complete" => Self::Complete,
            _ => return None,
        })
    }

    /// Phases after the bulk copy also replay deletions so the target converges.
    pub fn includes_deletes(self) -> bool {
        matches!(self, Self::Catchup | Self::Downtime)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MigrationState {
    InProgress,
    Completed,
    Failed,
    // Reserved for post-migration validation, never written by the orchestrator
    Validating,
}

impl MigrationState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "InProgress",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Validating => "Validating",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "InProgress" => Self::InProgress,
            "Completed" => Self::Completed,
            "Failed" => Self::Failed,
            "Validating" => Self::Validating,
            _ => return None,
        })
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Assignment of one worker within a phase, as recorded in checkpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInput {
    /// 1-based
    pub worker_id: u32,
    pub start_seq_num: i64,
    pub end_seq_num: i64,
    /// `start_seq_num - 1` until the first chunk is applied
    pub last_applied_seq_num: i64,
    pub keys_migrated: u64,
    pub status: MigrationState,
    pub start_time: u64,
}

impl WorkerInput {
    pub fn is_empty(&self) -> bool {
        self.end_seq_num < self.start_seq_num
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseInput {
    pub phase: Phase,
    pub iteration: u32,
    pub start_time: u64,
    pub status: MigrationState,
    pub start_seq_num: i64,
    pub end_seq_num: i64,
    pub last_applied_seq_num: i64,
    pub worker_count: u32,
    pub workers: Vec<WorkerInput>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResult {
    pub worker_id: u32,
    pub start_seq_num: i64,
    pub end_seq_num: i64,
    pub last_applied_seq_num: i64,
    pub keys_migrated: u64,
    pub end_time: u64,
    pub status: MigrationState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseResult {
    pub phase: Phase,
    pub iteration: u32,
    pub start_seq_num: i64,
    pub end_seq_num: i64,
    pub last_applied_seq_num: i64,
    pub keys_migrated: u64,
    pub start_time: u64,
    pub end_time: u64,
    pub status: MigrationState,
    pub workers: Vec<WorkerResult>,
}

/// Progress of one phase iteration, complete or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseSnapshot {
    pub phase: Phase,
    pub iteration: u32,
    pub status: MigrationState,
    pub start_seq_num: i64,
    pub end_seq_num: i64,
    pub last_applied_seq_num: i64,
    pub worker_count: u32,
    /// Sum over workers while the phase is running
    pub keys_migrated: u64,
    pub start_time: u64,
    pub end_time: Option<u64>,
}

/// Point-in-time view of a migration run, rebuilt from checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStatus {
    pub current_phase: Phase,
    pub current_iteration: u32,
    pub status: Option<MigrationState>,
    pub start_time: Option<u64>,
    pub end_time: Option<u64>,
    pub start_seq_num: Option<i64>,
    pub end_seq_num: Option<i64>,
    pub last_applied_seq_num: Option<i64>,
    pub keys_migrated: u64,
    /// Set when the run moves to downtime, cleared once an abort gives writes back
    pub writes_rejected: bool,
    pub aborted: bool,
    pub phases: Vec<PhaseSnapshot>,
    pub health: HealthSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_and_reject_unknown() {
        for phase in [
            Phase::None,
            Phase::Copy,
            Phase::Catchup,
            Phase::Downtime,
            Phase::Complete,
        ] {
            assert_eq!(Phase::from_name(phase.as_str()), Some(phase));
        }
        assert_eq!(
            MigrationState::from_name("Validating"),
            Some(MigrationState::Validating)
        );
        assert_eq!(Phase::from_name("copy"), None);
        assert_eq!(MigrationState::from_name("Done"), None);
    }

    #[test]
    fn phases_are_ordered() {
        assert!(Phase::None < Phase::Copy);
        assert!(Phase::Copy < Phase::Catchup);
        assert!(Phase::Catchup < Phase::Downtime);
        assert!(Phase::Downtime < Phase::Complete);
        assert!(!Phase::Copy.includes_deletes());
        assert!(Phase::Catchup.includes_deletes());
    }
}
