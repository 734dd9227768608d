//! Process wiring for the `agent` and `server` subcommands.

pub mod agent;
pub mod server;
pub mod tasks;

pub use tasks::Tasks;
