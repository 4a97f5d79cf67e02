//! Job execution infrastructure: store, command executor, engine, config.

pub mod command_executor;
pub mod config;
pub mod jobs;

pub use command_executor::{Command, CommandContext, CommandError, CommandExecutor};
pub use config::{ConfigError, EngineConfig};
