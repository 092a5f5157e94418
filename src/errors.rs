//! Crate-wide error type.
//!
//! Lifecycle failures of a running command never surface here: they are
//! reported through the command status and `LifecycleEvent`s. This enum covers
//! configuration and setup problems that the caller has to act on.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShellrackError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("commands {first:?} and {second:?} both resolve to id {id:?}")]
    DuplicateCommand {
        first: String,
        second: String,
        id: String,
    },

    #[error("failed to open output: {0}")]
    Output(#[source] std::io::Error),

    #[error("failed to spawn process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("invalid prompt pattern: {0}")]
    Pattern(#[from] regex::Error),
}

pub type Result<T> = std::result::Result<T, ShellrackError>;
