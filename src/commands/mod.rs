//! Subcommand implementations

pub mod limit;
pub mod probe;
