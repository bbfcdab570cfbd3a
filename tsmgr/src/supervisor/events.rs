//! Supervisor events.

use crate::channel::{ChannelId, LifecycleState, TableVersion};
use crate::encoder::ExitReport;

/// Capacity of the event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something observable happened to a channel or the combiner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// A channel unit changed lifecycle state.
    StateChanged {
        id: ChannelId,
        instance: u32,
        from: LifecycleState,
        to: LifecycleState,
    },
    /// The process-wide table version changed.
    TableVersionChanged { from: TableVersion, to: TableVersion },
    MergeStarted { inputs: usize },
    MergeExited { report: ExitReport },
}
