//! Configuration files: process-wide settings and per-channel files.

pub mod channel;
pub mod loader;
pub mod settings;

pub use channel::{Bitrate, ChannelConfig, SourceSection};
pub use loader::{ChannelSet, ConfigLoader, ConfigSource, RejectedChannel};
pub use settings::{
    BackoffSettings, EncoderSettings, LoggingSettings, MergeSettings, Settings,
    SupervisorSettings,
};
