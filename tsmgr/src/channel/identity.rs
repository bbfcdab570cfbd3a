//! Channel identity value object.

use std::fmt;
use std::num::NonZeroU16;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// A validated channel identity.
///
/// Identities are small positive integers; zero is never valid because the
/// identity is used as an offset for ports, service ids and PIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct ChannelId(NonZeroU16);

impl ChannelId {
    /// Create a channel identity, rejecting zero.
    pub fn new(value: u16) -> Option<Self> {
        NonZeroU16::new(value).map(Self)
    }

    /// Get the raw value.
    pub fn get(self) -> u16 {
        self.0.get()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ChannelId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let value: i64 = trimmed
            .parse()
            .map_err(|_| Error::config(format!("channel number '{}' is not numeric", trimmed)))?;
        Self::try_from(value)
    }
}

impl TryFrom<i64> for ChannelId {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u16::try_from(value)
            .ok()
            .and_then(Self::new)
            .ok_or_else(|| {
                Error::config(format!(
                    "channel number {} must be between 1 and {}",
                    value,
                    u16::MAX
                ))
            })
    }
}

impl TryFrom<u16> for ChannelId {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::try_from(i64::from(value))
    }
}

impl From<ChannelId> for u16 {
    fn from(id: ChannelId) -> Self {
        id.get()
    }
}
