pub mod app;
pub mod commands;

pub use app::{App, Config};
pub use commands::{Cli, Commands, ConfigCommand, TargetArgs};
