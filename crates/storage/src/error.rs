use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[cfg(feature = "sql")]
    #[error("SQL error: {0}")]
    SQLError(#[from] libsql::Error),
    #[error("Failed to convert value from row: {0}")]
    SQLInvalidValue(String),
    #[error("{0}")]
    Custom(String),
}
