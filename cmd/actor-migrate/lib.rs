pub mod cli;
pub mod initializers;

pub use cli::{CLI, LogColor, Options, RetryPolicyKind, Subcommand};
