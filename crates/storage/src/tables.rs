//! Table names used by the migration stores.

/// Migration checkpoints: `String` => `String`
/// - key = checkpoint key, e.g. `_CopyPhase_Iteration-1_Worker2_LastAppliedSeqNum_`
/// - value = decimal integer, unix milliseconds, phase or status name
pub const MIGRATION_CHECKPOINTS: &str = "migration_checkpoints";

/// Actor presence markers, stored with the source key verbatim: `@@<actor>` => value
pub const ACTOR_PRESENCE: &str = "actor_presence";

/// Reminder completion records: `RC@@...` => serialized reminder completion data
pub const REMINDER_COMPLETIONS: &str = "reminder_completions";

/// Logical clock records: `Timestamp_VLTM` => serialized logical timestamp
pub const LOGICAL_TIME: &str = "logical_time";

/// Per-actor state table: state name => state value
pub fn actor_state(actor_id: &str) -> String {
    format!("actor_state/{actor_id}")
}

/// Per-actor reminders table: reminder name => serialized reminder data
pub fn reminders(actor_id: &str) -> String {
    format!("reminders/{actor_id}")
}
