use serde::{Deserialize, Serialize};

use crate::error::RemoteError;

/// One mutation read from the source store's change log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecord {
    pub sequence_number: i64,
    pub key: String,
    /// Absent when the record is a deletion
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub is_deleted: bool,
}

/// Operations the migration needs from the source replica.
#[async_trait::async_trait]
pub trait SourceReplica: Send + Sync {
    async fn first_sequence_number(&self) -> Result<i64, RemoteError>;

    async fn last_sequence_number(&self) -> Result<i64, RemoteError>;

    /// Returns up to `item_count` records with sequence number `>= start`, in sequence order.
    /// The replica streams them in chunks of `chunk_size`. Deletions are only returned when
    /// `include_deletes` is set.
    async fn enumerate_by_sequence_number(
        &self,
        start: i64,
        chunk_size: usize,
        item_count: usize,
        include_deletes: bool,
    ) -> Result<Vec<MigrationRecord>, RemoteError>;

    /// Makes the source reject further writes, starting the downtime window. Idempotent,
    /// returns whether the source is now refusing writes.
    async fn reject_writes(&self) -> Result<bool, RemoteError>;

    /// Returns whether the source accepts writes again.
    async fn resume_writes(&self) -> Result<bool, RemoteError>;
}
