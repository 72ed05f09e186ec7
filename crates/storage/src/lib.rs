pub mod api;
pub mod error;
mod store;
mod store_db;
pub mod tables;

pub use error::StoreError;
pub use store::{EngineType, Store, Transaction};
