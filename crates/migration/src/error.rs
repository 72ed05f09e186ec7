use actor_migration_remote::ClientError;
use actor_migration_storage::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("source call failed: {0}")]
    Client(ClientError),
    #[error("checkpoint {key} holds {value:?}, expected {expected}")]
    Parse {
        key: String,
        value: String,
        expected: &'static str,
    },
    #[error("checkpoint {0} is missing")]
    MissingCheckpoint(String),
    #[error("record {key} does not hold a valid {expected}: {message}")]
    Transform {
        key: String,
        expected: &'static str,
        message: String,
    },
    #[error("source refused to reject writes")]
    RejectWritesRefused,
    #[error("migration was aborted and cannot be resumed, start over with fresh checkpoints")]
    Aborted,
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("migration cancelled")]
    Cancelled,
}

impl From<ClientError> for MigrationError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Cancelled => Self::Cancelled,
            other => Self::Client(other),
        }
    }
}
