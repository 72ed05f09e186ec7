//! Re-keying of source records into target tables.
//!
//! | source key              | target table                | target key  |
//! |-------------------------|-----------------------------|-------------|
//! | `@@...`                 | `actor_presence`            | verbatim    |
//! | `Actor_<kind>_<id>_<s>` | `actor_state/<kind>_<id>`   | `<s>`       |
//! | `RC@@...`               | `reminder_completions`      | verbatim    |
//! | `Timestamp_VLTM`        | `logical_time`              | verbatim    |
//! | `Reminder_<kind>_<id>_<n>` | `reminders/<kind>_<id>`  | `<n>`       |
//!
//! Reminder, reminder completion and logical time values are decoded and encoded again so
//! that malformed values are caught here instead of when the actor runtime reads them.

use actor_migration_remote::MigrationRecord;
use actor_migration_storage::tables;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::MigrationError;

const PRESENCE_PREFIX: &str = "@@";
const ACTOR_STATE_PREFIX: &str = "Actor_";
const REMINDER_COMPLETION_PREFIX: &str = "RC@@";
const LOGICAL_TIME_KEY: &str = "Timestamp_VLTM";
const REMINDER_PREFIX: &str = "Reminder_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderCompletedData {
    pub logical_time: i64,
    pub utc_time_millis: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalTimestamp {
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderData {
    pub actor_id: String,
    pub name: String,
    pub due_time_millis: u64,
    pub period_millis: u64,
    #[serde(default)]
    pub state: Option<String>,
    pub logical_creation_time: i64,
}

/// What applying a record does to the target store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetWrite {
    Put {
        table: String,
        key: String,
        value: String,
    },
    Remove {
        table: String,
        key: String,
    },
    /// The record cannot be mapped to a target table
    Skip { reason: &'static str },
}

#[derive(Debug, Clone, Copy)]
enum ValueKind {
    Verbatim,
    ReminderCompletion,
    LogicalTime,
    Reminder,
}

/// Maps a source record onto the target write it stands for.
///
/// Records whose key is not recognized are skipped; values that fail to decode are an error.
pub fn transform(record: &MigrationRecord) -> Result<TargetWrite, MigrationError> {
    let Some((table, key, kind)) = route(&record.key) else {
        return Ok(TargetWrite::Skip {
            reason: skip_reason(&record.key),
        });
    };

    if record.is_deleted {
        return Ok(TargetWrite::Remove { table, key });
    }

    let raw = record.value.as_deref().unwrap_or_default();
    let value = match kind {
        ValueKind::Verbatim => raw.to_owned(),
        ValueKind::ReminderCompletion => {
            reencode::<ReminderCompletedData>(&record.key, raw, "reminder completion")?
        }
        ValueKind::LogicalTime => reencode::<LogicalTimestamp>(&record.key, raw, "logical timestamp")?,
        ValueKind::Reminder => reencode::<ReminderData>(&record.key, raw, "reminder")?,
    };
    Ok(TargetWrite::Put { table, key, value })
}

fn route(source_key: &str) -> Option<(String, String, ValueKind)> {
    if source_key.starts_with(REMINDER_COMPLETION_PREFIX) {
        return Some((
            tables::REMINDER_COMPLETIONS.to_owned(),
            source_key.to_owned(),
            ValueKind::ReminderCompletion,
        ));
    }
    if source_key.starts_with(PRESENCE_PREFIX) {
        return Some((
            tables::ACTOR_PRESENCE.to_owned(),
            source_key.to_owned(),
            ValueKind::Verbatim,
        ));
    }
    if source_key == LOGICAL_TIME_KEY {
        return Some((
            tables::LOGICAL_TIME.to_owned(),
            source_key.to_owned(),
            ValueKind::LogicalTime,
        ));
    }
    if source_key.starts_with(ACTOR_STATE_PREFIX) {
        let (actor_id, state_name) = split_actor_key(source_key)?;
        return Some((
            tables::actor_state(&actor_id),
            state_name.to_owned(),
            ValueKind::Verbatim,
        ));
    }
    if source_key.starts_with(REMINDER_PREFIX) {
        let (actor_id, reminder_name) = split_actor_key(source_key)?;
        return Some((
            tables::reminders(&actor_id),
            reminder_name.to_owned(),
            ValueKind::Reminder,
        ));
    }
    None
}

/// Splits `<Prefix>_<kind>_<id>_<name>` into (`<kind>_<id>`, `<name>`). The name keeps any
/// further underscores.
fn split_actor_key(source_key: &str) -> Option<(String, &str)> {
    let mut segments = source_key.splitn(4, '_');
    let _prefix = segments.next()?;
    let kind = segments.next().filter(|segment| !segment.is_empty())?;
    let id = segments.next().filter(|segment| !segment.is_empty())?;
    let name = segments.next().filter(|segment| !segment.is_empty())?;
    Some((format!("{kind}_{id}"), name))
}

fn skip_reason(source_key: &str) -> &'static str {
    if source_key.starts_with(ACTOR_STATE_PREFIX) {
        "malformed actor state key"
    } else if source_key.starts_with(REMINDER_PREFIX) {
        "malformed reminder key"
    } else {
        "unknown key prefix"
    }
}

fn reencode<T>(key: &str, raw: &str, expected: &'static str) -> Result<String, MigrationError>
where
    T: Serialize + DeserializeOwned,
{
    let transform_error = |err: serde_json::Error| MigrationError::Transform {
        key: key.to_owned(),
        expected,
        message: err.to_string(),
    };
    let value: T = serde_json::from_str(raw).map_err(transform_error)?;
    serde_json::to_string(&value).map_err(transform_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(sequence_number: i64, key: &str, value: &str) -> MigrationRecord {
        MigrationRecord {
            sequence_number,
            key: key.to_owned(),
            value: Some(value.to_owned()),
            is_deleted: false,
        }
    }

    #[test]
    fn presence_markers_are_copied_verbatim() {
        let write = transform(&put(1, "@@Counter_42", "1")).unwrap();
        assert_eq!(
            write,
            TargetWrite::Put {
                table: "actor_presence".to_owned(),
                key: "@@Counter_42".to_owned(),
                value: "1".to_owned(),
            }
        );
    }

    #[test]
    fn actor_state_is_keyed_by_actor_and_state_name() {
        let write = transform(&put(2, "Actor_Counter_42_count_total", "17")).unwrap();
        assert_eq!(
            write,
            TargetWrite::Put {
                table: "actor_state/Counter_42".to_owned(),
                key: "count_total".to_owned(),
                value: "17".to_owned(),
            }
        );
    }

    #[test]
    fn short_actor_keys_are_skipped() {
        let write = transform(&put(3, "Actor_Counter_42", "17")).unwrap();
        assert_eq!(
            write,
            TargetWrite::Skip {
                reason: "malformed actor state key"
            }
        );
        let write = transform(&put(4, "Something_else", "x")).unwrap();
        assert_eq!(
            write,
            TargetWrite::Skip {
                reason: "unknown key prefix"
            }
        );
    }

    #[test]
    fn reminders_are_reencoded_into_per_actor_tables() {
        let value = r#"{"actorId":"Counter_42","name":"tick","dueTimeMillis":1000,"periodMillis":5000,"logicalCreationTime":9}"#;
        let TargetWrite::Put { table, key, value } =
            transform(&put(5, "Reminder_Counter_42_tick", value)).unwrap()
        else {
            panic!("reminder should be written");
        };
        assert_eq!(table, "reminders/Counter_42");
        assert_eq!(key, "tick");
        let decoded: ReminderData = serde_json::from_str(&value).unwrap();
        assert_eq!(decoded.due_time_millis, 1000);
        assert_eq!(decoded.state, None);
    }

    #[test]
    fn logical_time_and_completions_are_routed() {
        let write = transform(&put(6, "Timestamp_VLTM", r#"{"timestamp":77}"#)).unwrap();
        assert_eq!(
            write,
            TargetWrite::Put {
                table: "logical_time".to_owned(),
                key: "Timestamp_VLTM".to_owned(),
                value: r#"{"timestamp":77}"#.to_owned(),
            }
        );

        let write = transform(&put(
            7,
            "RC@@Counter_42_tick",
            r#"{"logicalTime":3,"utcTimeMillis":1700000000000}"#,
        ))
        .unwrap();
        assert!(matches!(write, TargetWrite::Put { table, .. } if table == "reminder_completions"));
    }

    #[test]
    fn malformed_values_are_fatal() {
        let err = transform(&put(8, "Timestamp_VLTM", "not json")).unwrap_err();
        let MigrationError::Transform { key, expected, .. } = err else {
            panic!("expected a transform error, got {err:?}");
        };
        assert_eq!(key, "Timestamp_VLTM");
        assert_eq!(expected, "logical timestamp");
    }

    #[test]
    fn deletions_remove_the_target_key_without_decoding() {
        let record = MigrationRecord {
            sequence_number: 9,
            key: "Reminder_Counter_42_tick".to_owned(),
            value: None,
            is_deleted: true,
        };
        assert_eq!(
            transform(&record).unwrap(),
            TargetWrite::Remove {
                table: "reminders/Counter_42".to_owned(),
                key: "tick".to_owned(),
            }
        );
    }
}
