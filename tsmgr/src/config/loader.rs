//! Loading settings and channel files from disk.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::channel::ChannelConfig;
use super::settings::Settings;
use crate::channel::{ChannelId, TableVersion};
use crate::{Error, Result};

/// Source of configuration consulted at reload time.
///
/// The supervisor only needs two things after startup: the current
/// process-wide table version, and the current configuration of one channel.
pub trait ConfigSource: Send + Sync {
    /// Re-read the process-wide table version.
    fn table_version(&self) -> Result<TableVersion>;

    /// Re-read the configuration of a single channel.
    fn channel(&self, id: ChannelId) -> Result<ChannelConfig>;
}

/// A channel file that could not be turned into a configuration.
#[derive(Debug)]
pub struct RejectedChannel {
    pub path: PathBuf,
    pub error: Error,
}

/// Result of scanning the channel directory.
#[derive(Debug, Default)]
pub struct ChannelSet {
    /// Valid configurations, in file-name order.
    pub channels: Vec<ChannelConfig>,
    /// Files that failed to parse or validate.
    pub rejected: Vec<RejectedChannel>,
}

/// Reads `tsmgr.toml` and the `channels/*.toml` directory.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    settings_path: PathBuf,
    channels_dir: PathBuf,
}

impl ConfigLoader {
    pub fn new(settings_path: impl Into<PathBuf>, channels_dir: impl Into<PathBuf>) -> Self {
        Self {
            settings_path: settings_path.into(),
            channels_dir: channels_dir.into(),
        }
    }

    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }

    pub fn channels_dir(&self) -> &Path {
        &self.channels_dir
    }

    /// Load the settings file.
    pub fn load_settings(&self) -> Result<Settings> {
        let contents = read(&self.settings_path)?;
        Settings::parse(&contents).map_err(|e| with_path(&self.settings_path, e))
    }

    /// Load every channel file in the channel directory.
    ///
    /// Individual files that fail are collected in [`ChannelSet::rejected`];
    /// only an unreadable directory is an error.
    pub fn load_channels(&self) -> Result<ChannelSet> {
        let mut set = ChannelSet::default();

        for path in self.channel_files()? {
            match load_channel_file(&path) {
                Ok(config) => {
                    debug!(
                        "Loaded channel {} ({}) from {}",
                        config.id,
                        config.name,
                        path.display()
                    );
                    set.channels.push(config);
                }
                Err(error) => set.rejected.push(RejectedChannel { path, error }),
            }
        }

        Ok(set)
    }

    /// Sorted list of `*.toml` files in the channel directory.
    fn channel_files(&self) -> Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(&self.channels_dir).map_err(|e| {
            Error::config(format!(
                "cannot read channel directory {}: {}",
                self.channels_dir.display(),
                e
            ))
        })?;

        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "toml") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

impl ConfigSource for ConfigLoader {
    fn table_version(&self) -> Result<TableVersion> {
        self.load_settings()?.table_version()
    }

    fn channel(&self, id: ChannelId) -> Result<ChannelConfig> {
        let mut found: Option<ChannelConfig> = None;

        for path in self.channel_files()? {
            match load_channel_file(&path) {
                Ok(config) if config.id == id => {
                    if found.is_some() {
                        return Err(Error::IdentityConflict { id });
                    }
                    found = Some(config);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Skipping channel file {}: {}", path.display(), e);
                }
            }
        }

        found.ok_or_else(|| {
            Error::config(format!(
                "no configuration for channel {} in {}",
                id,
                self.channels_dir.display()
            ))
        })
    }
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))
}

fn load_channel_file(path: &Path) -> Result<ChannelConfig> {
    let contents = read(path)?;
    ChannelConfig::parse(&contents, Some(path)).map_err(|e| with_path(path, e))
}

/// Attach the file path to parse and validation errors.
fn with_path(path: &Path, error: Error) -> Error {
    match error {
        Error::Configuration(msg) => Error::config(format!("{}: {}", path.display(), msg)),
        Error::Toml(e) => Error::config(format!("{}: {}", path.display(), e)),
        other => other,
    }
}
