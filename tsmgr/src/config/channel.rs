//! Per-channel configuration.
//!
//! A channel file has two sections:
//!
//! ```toml
//! [channel]
//! num = 1
//! name = "Test Card"
//! provider = "tsmgr"
//! muxrate = "5M"
//! quiet = true
//!
//! [source]
//! type = "test"
//! preset = "HD"
//! timecode = true
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::channel::ChannelId;
use crate::{Error, Result};

/// A bitrate in bits per second.
///
/// Accepts plain integers (`5000000`) or strings with an SI suffix
/// (`"5M"`, `"4500k"`, `"4.5M"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawBitrate", into = "u64")]
pub struct Bitrate(u64);

impl Bitrate {
    pub fn from_bps(bps: u64) -> Self {
        Self(bps)
    }

    pub fn bps(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Bitrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Bitrate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (number, multiplier) = match s.chars().last() {
            Some('k' | 'K') => (&s[..s.len() - 1], 1_000.0),
            Some('m' | 'M') => (&s[..s.len() - 1], 1_000_000.0),
            Some('g' | 'G') => (&s[..s.len() - 1], 1_000_000_000.0),
            _ => (s, 1.0),
        };

        let value: f64 = number
            .trim()
            .parse()
            .map_err(|_| Error::config(format!("invalid bitrate '{}'", s)))?;
        if !value.is_finite() || value <= 0.0 {
            return Err(Error::config(format!("bitrate must be positive, got '{}'", s)));
        }

        let bps = (value * multiplier).round();
        if bps < 1.0 {
            return Err(Error::config(format!("bitrate '{}' is below 1 bit/s", s)));
        }

        Ok(Self(bps as u64))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawBitrate {
    Number(u64),
    Text(String),
}

impl TryFrom<RawBitrate> for Bitrate {
    type Error = Error;

    fn try_from(raw: RawBitrate) -> Result<Self> {
        match raw {
            RawBitrate::Number(0) => Err(Error::config("bitrate must be positive")),
            RawBitrate::Number(bps) => Ok(Self(bps)),
            RawBitrate::Text(text) => text.parse(),
        }
    }
}

impl From<Bitrate> for u64 {
    fn from(b: Bitrate) -> Self {
        b.0
    }
}

/// Channel number as written in the file: either an integer or a string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawChannelNumber {
    Number(i64),
    Text(String),
}

impl RawChannelNumber {
    fn resolve(&self) -> Result<ChannelId> {
        match self {
            Self::Number(n) => ChannelId::try_from(*n),
            Self::Text(s) => s.parse(),
        }
    }
}

/// The `[channel]` section as written on disk.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelSection {
    pub num: Option<RawChannelNumber>,
    pub name: Option<String>,
    pub provider: Option<String>,
    pub muxrate: Option<Bitrate>,
    #[serde(default)]
    pub quiet: bool,
}

/// The `[source]` section: a type tag plus type-specific options.
///
/// Options are kept untyped here; the pipeline descriptor builder turns them
/// into a typed source once the type tag is known.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourceSection {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub options: toml::Table,
}

/// A channel file as parsed from TOML, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelFile {
    pub channel: Option<ChannelSection>,
    pub source: Option<SourceSection>,
}

/// Validated, immutable per-channel configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    pub id: ChannelId,
    pub name: String,
    pub provider: String,
    pub muxrate: Bitrate,
    pub quiet: bool,
    pub source: SourceSection,
    /// File this configuration was read from, if any.
    pub origin: Option<PathBuf>,
}

impl ChannelConfig {
    /// Parse and validate a channel file's contents.
    pub fn parse(contents: &str, origin: Option<&Path>) -> Result<Self> {
        let file: ChannelFile = toml::from_str(contents)?;
        Self::from_file(file, origin)
    }

    /// Validate a parsed channel file.
    pub fn from_file(file: ChannelFile, origin: Option<&Path>) -> Result<Self> {
        let channel = file
            .channel
            .ok_or_else(|| Error::config("missing [channel] section"))?;
        let source = file
            .source
            .ok_or_else(|| Error::config("missing [source] section"))?;

        let id = channel
            .num
            .as_ref()
            .ok_or_else(|| Error::config("missing channel.num"))?
            .resolve()?;
        let name = required(channel.name, "channel.name")?;
        let provider = required(channel.provider, "channel.provider")?;
        let muxrate = channel
            .muxrate
            .ok_or_else(|| Error::config("missing channel.muxrate"))?;

        if source.kind.trim().is_empty() {
            return Err(Error::config("source.type must not be empty"));
        }

        Ok(Self {
            id,
            name,
            provider,
            muxrate,
            quiet: channel.quiet,
            source,
            origin: origin.map(Path::to_path_buf),
        })
    }
}

fn required(value: Option<String>, field: &str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(Error::config(format!("missing {}", field))),
    }
}
