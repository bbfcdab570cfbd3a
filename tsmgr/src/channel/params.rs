//! Multiplex parameter allocation.
//!
//! Every channel's transport-stream identifiers are derived from its identity
//! alone, so that channels can never collide on the wire:
//!
//! - destination port = `base_port + id`
//! - service id = `id`
//! - PMT PID = `pmt_base + id`
//! - first elementary-stream PID = `stream_base + stream_stride * id + 1`
//!
//! The transport stream id and original network id are shared by all
//! channels so that the combined output reads as a single network.

use std::collections::BTreeSet;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use serde::{Deserialize, Serialize};

use super::ChannelId;
use crate::config::ChannelConfig;
use crate::{Error, Result};

/// Lowest PID usable for program data (0x0000-0x000F are reserved).
pub const MIN_PID: u16 = 0x0010;

/// Highest PID usable for program data (0x1FFF is the null packet PID).
pub const MAX_PID: u16 = 0x1FFE;

/// Seven 188-byte TS packets per datagram.
pub const DEFAULT_PACKET_SIZE: u16 = 1316;

/// Size of a single transport-stream packet.
pub const TS_PACKET_SIZE: u16 = 188;

/// Elementary streams carried per channel (video + audio).
pub const STREAMS_PER_CHANNEL: u16 = 2;

/// PSI table version (5 bits in PAT/PMT/SDT).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct TableVersion(u8);

impl TableVersion {
    pub const MAX: u8 = 31;

    pub fn new(version: u8) -> Result<Self> {
        if version > Self::MAX {
            return Err(Error::config(format!(
                "table version {} out of range (0-{})",
                version,
                Self::MAX
            )));
        }
        Ok(Self(version))
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for TableVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u8> for TableVersion {
    type Error = Error;

    fn try_from(version: u8) -> Result<Self> {
        Self::new(version)
    }
}

impl From<TableVersion> for u8 {
    fn from(v: TableVersion) -> Self {
        v.0
    }
}

/// Fixed multiplex layout shared by every channel of a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxLayout {
    /// Multicast group all channels publish to.
    pub group: Ipv4Addr,
    /// Channel `n` publishes on `base_port + n`; the combined output uses
    /// `base_port` itself.
    pub base_port: u16,
    pub transport_stream_id: u16,
    pub original_network_id: u16,
    pub pmt_base: u16,
    pub stream_base: u16,
    pub stream_stride: u16,
    /// UDP payload size in bytes.
    pub packet_size: u16,
}

impl Default for MuxLayout {
    fn default() -> Self {
        Self {
            group: Ipv4Addr::new(239, 0, 0, 1),
            base_port: 2000,
            transport_stream_id: 1,
            original_network_id: 1,
            pmt_base: 0x0020,
            stream_base: 0x0100,
            stream_stride: 0x0010,
            packet_size: DEFAULT_PACKET_SIZE,
        }
    }
}

impl MuxLayout {
    /// Validate the layout itself, independent of any identity.
    pub fn validate(&self) -> Result<()> {
        if !self.group.is_multicast() {
            return Err(Error::config(format!(
                "mux.group {} is not a multicast address",
                self.group
            )));
        }
        if self.packet_size == 0 || self.packet_size % TS_PACKET_SIZE != 0 {
            return Err(Error::config(format!(
                "mux.packet_size {} is not a multiple of {}",
                self.packet_size, TS_PACKET_SIZE
            )));
        }
        if self.stream_stride < STREAMS_PER_CHANNEL + 1 {
            return Err(Error::config(format!(
                "mux.stream_stride {} leaves no room for {} streams",
                self.stream_stride, STREAMS_PER_CHANNEL
            )));
        }
        if self.pmt_base < MIN_PID || self.pmt_base >= self.stream_base {
            return Err(Error::config(format!(
                "mux.pmt_base {:#06x} must lie in {:#06x}..{:#06x}",
                self.pmt_base, MIN_PID, self.stream_base
            )));
        }
        Ok(())
    }

    /// Address of the combined (merged) output.
    pub fn output_address(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.group, self.base_port)
    }

    /// Output address of a single channel.
    pub fn channel_address(&self, id: ChannelId) -> Result<SocketAddrV4> {
        let port = u32::from(self.base_port) + u32::from(id.get());
        let port = u16::try_from(port)
            .map_err(|_| Error::config(format!("channel {}: port {} out of range", id, port)))?;
        Ok(SocketAddrV4::new(self.group, port))
    }

    /// Derive the parameters for one identity.
    ///
    /// Pure: the same identity and table version always produce the same
    /// parameters.
    pub fn params_for(&self, id: ChannelId, table_version: TableVersion) -> Result<MuxParams> {
        let n = u32::from(id.get());
        let destination = self.channel_address(id)?;

        let pmt_pid = u32::from(self.pmt_base) + n;
        if pmt_pid >= u32::from(self.stream_base) {
            return Err(Error::config(format!(
                "channel {}: PMT PID {:#06x} overlaps the stream PID range starting at {:#06x}",
                id, pmt_pid, self.stream_base
            )));
        }

        let start_pid = u32::from(self.stream_base) + u32::from(self.stream_stride) * n + 1;
        let last_pid = start_pid + u32::from(self.stream_stride) - 2;
        if last_pid > u32::from(MAX_PID) {
            return Err(Error::config(format!(
                "channel {}: stream PIDs {:#06x}-{:#06x} exceed {:#06x}",
                id, start_pid, last_pid, MAX_PID
            )));
        }

        Ok(MuxParams {
            id,
            destination,
            packet_size: self.packet_size,
            transport_stream_id: self.transport_stream_id,
            original_network_id: self.original_network_id,
            service_id: id.get(),
            // Both bounded above by the checks against stream_base and MAX_PID.
            pmt_pid: pmt_pid as u16,
            start_pid: start_pid as u16,
            table_version,
        })
    }
}

/// Transport and multiplex parameters of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct MuxParams {
    pub id: ChannelId,
    pub destination: SocketAddrV4,
    pub packet_size: u16,
    pub transport_stream_id: u16,
    pub original_network_id: u16,
    pub service_id: u16,
    pub pmt_pid: u16,
    pub start_pid: u16,
    pub table_version: TableVersion,
}

impl MuxParams {
    /// UDP output URL understood by the encoder.
    pub fn udp_url(&self) -> String {
        format!("udp://{}?pkt_size={}", self.destination, self.packet_size)
    }
}

/// Hands out parameters while guaranteeing identity uniqueness.
#[derive(Debug)]
pub struct ParameterAllocator {
    layout: MuxLayout,
    allocated: BTreeSet<ChannelId>,
}

impl ParameterAllocator {
    pub fn new(layout: MuxLayout) -> Result<Self> {
        layout.validate()?;
        Ok(Self {
            layout,
            allocated: BTreeSet::new(),
        })
    }

    pub fn layout(&self) -> &MuxLayout {
        &self.layout
    }

    pub fn is_allocated(&self, id: ChannelId) -> bool {
        self.allocated.contains(&id)
    }

    /// Allocate parameters for a channel.
    ///
    /// Fails with `IdentityConflict` if `id` is already allocated, and with
    /// `Configuration` if the configuration does not belong to `id` or the
    /// identity does not fit the layout. Nothing is recorded on failure.
    pub fn allocate(
        &mut self,
        id: ChannelId,
        table_version: TableVersion,
        config: &ChannelConfig,
    ) -> Result<MuxParams> {
        if config.id != id {
            return Err(Error::config(format!(
                "configuration for channel {} offered for channel {}",
                config.id, id
            )));
        }
        if self.allocated.contains(&id) {
            return Err(Error::IdentityConflict { id });
        }

        let params = self.layout.params_for(id, table_version)?;
        self.allocated.insert(id);
        Ok(params)
    }

    /// Release an identity so it can be allocated again.
    pub fn release(&mut self, id: ChannelId) -> bool {
        self.allocated.remove(&id)
    }

    /// Release `id` and allocate it again for a new configuration.
    ///
    /// On failure the previous allocation, if any, is kept.
    pub fn reallocate(
        &mut self,
        id: ChannelId,
        table_version: TableVersion,
        config: &ChannelConfig,
    ) -> Result<MuxParams> {
        let was_allocated = self.release(id);
        let result = self.allocate(id, table_version, config);
        if result.is_err() && was_allocated {
            self.allocated.insert(id);
        }
        result
    }
}
