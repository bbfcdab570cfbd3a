//! Application-wide error types.

use thiserror::Error;

use crate::channel::ChannelId;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Identity conflict: channel {id} is configured more than once")]
    IdentityConflict { id: ChannelId },

    #[error("Unknown source type '{kind}' for channel {id}")]
    UnknownSource { id: ChannelId, kind: String },

    #[error("Failed to spawn process for channel {id}: {reason}")]
    ProcessSpawn { id: ChannelId, reason: String },

    #[error("Unknown channel: {id}")]
    UnknownChannel { id: ChannelId },

    #[error("Reload already in progress for channel {id}")]
    ReloadInProgress { id: ChannelId },

    #[error("Required program not found: {program}")]
    DependencyMissing { program: String },

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn spawn(id: ChannelId, reason: impl std::fmt::Display) -> Self {
        Self::ProcessSpawn {
            id,
            reason: reason.to_string(),
        }
    }
}
