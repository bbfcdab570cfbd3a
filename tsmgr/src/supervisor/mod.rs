//! Channel supervision.
//!
//! - [`ChannelSupervisor`] owns every channel unit and its encoder process.
//! - [`ReloadCoordinator`] serializes per-channel reloads and owns the
//!   table version.
//! - [`SupervisorService`] is the task that drives both.

mod events;
mod reload;
mod restart_tracker;
mod service;
#[allow(clippy::module_inception)]
mod supervisor;

pub use events::SupervisorEvent;
pub use reload::{PendingReload, ReloadCoordinator, ReloadOutcome};
pub use restart_tracker::{RestartTracker, RestartTrackerConfig};
pub use service::{AdminRequest, ServiceHandle, SupervisorService};
pub use supervisor::{
    ChannelStatus, ChannelSupervisor, MonitorReport, ShutdownReport, SupervisorConfig,
};
