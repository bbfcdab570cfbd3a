//! Process-wide settings (`tsmgr.toml`).

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::channel::{MuxLayout, TableVersion};
use crate::config::Bitrate;
use crate::supervisor::RestartTrackerConfig;
use crate::Result;

/// Top-level settings file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// PSI table version shared by every channel.
    pub table_version: u8,
    /// Multiplex layout used to derive per-channel parameters.
    pub mux: MuxLayout,
    pub encoder: EncoderSettings,
    pub merge: MergeSettings,
    pub supervisor: SupervisorSettings,
    pub logging: LoggingSettings,
}

impl Settings {
    /// Parse settings from TOML.
    pub fn parse(contents: &str) -> Result<Self> {
        let settings: Self = toml::from_str(contents)?;
        settings.table_version()?;
        settings.mux.validate()?;
        Ok(settings)
    }

    /// The configured table version, validated.
    pub fn table_version(&self) -> Result<TableVersion> {
        TableVersion::new(self.table_version)
    }
}

/// Encoder (ffmpeg) settings.
#[derive(Debug, Clone, Deserialize)]
pub struct EncoderSettings {
    /// Path to ffmpeg binary
    #[serde(default = "default_ffmpeg_path")]
    pub binary_path: String,
    /// Video codec passed to `-c:v`
    #[serde(default = "default_video_codec")]
    pub video_codec: String,
    /// Audio codec passed to `-c:a`
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,
    /// Value passed to `-loglevel`
    #[serde(default = "default_encoder_log_level")]
    pub log_level: String,
    /// Video bitrate; left to the encoder when unset
    #[serde(default)]
    pub video_bitrate: Option<Bitrate>,
    /// Audio bitrate; left to the encoder when unset
    #[serde(default)]
    pub audio_bitrate: Option<Bitrate>,
    /// Additional input arguments
    #[serde(default)]
    pub input_args: Vec<String>,
    /// Additional output arguments
    #[serde(default)]
    pub output_args: Vec<String>,
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_video_codec() -> String {
    "mpeg2video".to_string()
}

fn default_audio_codec() -> String {
    "mp2".to_string()
}

fn default_encoder_log_level() -> String {
    "warning".to_string()
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            binary_path: default_ffmpeg_path(),
            video_codec: default_video_codec(),
            audio_codec: default_audio_codec(),
            log_level: default_encoder_log_level(),
            video_bitrate: None,
            audio_bitrate: None,
            input_args: Vec::new(),
            output_args: Vec::new(),
        }
    }
}

/// Combiner (TSDuck `tsp`) settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MergeSettings {
    #[serde(default)]
    pub enabled: bool,
    /// Path to tsp binary
    #[serde(default = "default_tsp_path")]
    pub binary_path: String,
    /// Additional arguments placed before the input plugin
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_tsp_path() -> String {
    "tsp".to_string()
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            binary_path: default_tsp_path(),
            extra_args: Vec::new(),
        }
    }
}

/// Supervision timing.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorSettings {
    /// Liveness polling interval in seconds.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// How long to wait for a stopped process before killing it.
    /// Unset means wait forever.
    #[serde(default)]
    pub stop_timeout_secs: Option<u64>,
    #[serde(default)]
    pub restart_backoff: BackoffSettings,
}

fn default_poll_interval_secs() -> u64 {
    5
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            stop_timeout_secs: None,
            restart_backoff: BackoffSettings::default(),
        }
    }
}

impl SupervisorSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn stop_timeout(&self) -> Option<Duration> {
        self.stop_timeout_secs.map(Duration::from_secs)
    }
}

/// Restart backoff. Disabled by default: crashed encoders are restarted
/// immediately, every time.
#[derive(Debug, Clone, Deserialize)]
pub struct BackoffSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,
}

fn default_base_ms() -> u64 {
    1000
}

fn default_max_ms() -> u64 {
    300_000
}

fn default_failure_window_secs() -> u64 {
    60
}

fn default_failure_threshold() -> usize {
    3
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            base_ms: default_base_ms(),
            max_ms: default_max_ms(),
            failure_window_secs: default_failure_window_secs(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

impl From<&BackoffSettings> for RestartTrackerConfig {
    fn from(s: &BackoffSettings) -> Self {
        Self {
            backoff_enabled: s.enabled,
            base_backoff: Duration::from_millis(s.base_ms),
            max_backoff: Duration::from_millis(s.max_ms),
            failure_window: Duration::from_secs(s.failure_window_secs),
            failure_threshold: s.failure_threshold,
        }
    }
}

/// Logging output.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    /// `EnvFilter` directive, e.g. `tsmgr=debug`.
    #[serde(default)]
    pub filter: Option<String>,
    /// Directory for daily-rolling log files. Console only when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    /// Rolled log files older than this are deleted.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_retention_days() -> u32 {
    7
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: None,
            directory: None,
            retention_days: default_retention_days(),
        }
    }
}
