pub mod in_memory;
#[cfg(feature = "sql")]
pub mod sql;
