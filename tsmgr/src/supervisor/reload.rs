//! Reload coordinator.
//!
//! A reload tears down one channel and rebuilds it from its on-disk
//! configuration. It is split in three steps so the supervisor never blocks
//! on a process exit:
//!
//! 1. [`ReloadCoordinator::begin`] (on the service task): validates the
//!    request, refreshes the table version and stops the unit.
//! 2. [`PendingReload::run`] (on its own task): waits for the old process to
//!    exit and re-reads the channel configuration.
//! 3. [`ReloadCoordinator::complete`] (on the service task): builds and
//!    starts the replacement.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use super::events::SupervisorEvent;
use super::supervisor::ChannelSupervisor;
use crate::channel::{ChannelId, TableVersion};
use crate::config::{ChannelConfig, ConfigSource};
use crate::encoder::{ExitReport, wait_for_exit};
use crate::{Error, Result};

/// Serializes reloads per channel and owns the process-wide table version.
pub struct ReloadCoordinator {
    source: Arc<dyn ConfigSource>,
    table_version: watch::Sender<TableVersion>,
    in_flight: HashSet<ChannelId>,
    events: broadcast::Sender<SupervisorEvent>,
}

impl ReloadCoordinator {
    pub fn new(
        source: Arc<dyn ConfigSource>,
        table_version: TableVersion,
        events: broadcast::Sender<SupervisorEvent>,
    ) -> Self {
        let (table_version, _) = watch::channel(table_version);
        Self {
            source,
            table_version,
            in_flight: HashSet::new(),
            events,
        }
    }

    /// Current table version.
    pub fn table_version(&self) -> TableVersion {
        *self.table_version.borrow()
    }

    pub fn watch_table_version(&self) -> watch::Receiver<TableVersion> {
        self.table_version.subscribe()
    }

    pub fn is_in_flight(&self, id: ChannelId) -> bool {
        self.in_flight.contains(&id)
    }

    /// Start reloading `id`.
    ///
    /// Fails with `UnknownChannel` if the supervisor has no such unit and
    /// with `ReloadInProgress` if a reload for it has not completed yet.
    pub fn begin(
        &mut self,
        supervisor: &mut ChannelSupervisor,
        id: ChannelId,
    ) -> Result<PendingReload> {
        if !supervisor.contains(id) {
            return Err(Error::UnknownChannel { id });
        }
        if self.in_flight.contains(&id) {
            return Err(Error::ReloadInProgress { id });
        }

        self.refresh_table_version();

        let exit = supervisor.begin_reload(id)?;
        self.in_flight.insert(id);

        Ok(PendingReload {
            id,
            exit,
            source: Arc::clone(&self.source),
        })
    }

    /// Finish a reload: build and start the replacement.
    ///
    /// If the configuration could not be loaded the old unit stays
    /// `Stopped`; a later reload may retry. Returns the new instance number.
    pub fn complete(
        &mut self,
        supervisor: &mut ChannelSupervisor,
        outcome: ReloadOutcome,
    ) -> Result<u32> {
        self.in_flight.remove(&outcome.id);

        let config = outcome.config?;
        let instance = supervisor.replace_unit(config, self.table_version())?;

        info!(channel = %outcome.id, instance, "Reload complete");
        Ok(instance)
    }

    /// Forget a reload whose task died before producing an outcome. The
    /// unit stays `Stopped`; a later reload may retry.
    pub fn abandon(&mut self, id: ChannelId) {
        self.in_flight.remove(&id);
    }

    /// Re-read the table version and publish it if it changed.
    ///
    /// An unreadable settings file keeps the cached version.
    fn refresh_table_version(&mut self) {
        let latest = match self.source.table_version() {
            Ok(version) => version,
            Err(e) => {
                warn!("Keeping table version {}: {}", self.table_version(), e);
                return;
            }
        };

        let previous = self.table_version.send_replace(latest);
        if previous != latest {
            info!("Table version changed: {} -> {}", previous, latest);
            let _ = self.events.send(SupervisorEvent::TableVersionChanged {
                from: previous,
                to: latest,
            });
        }
    }
}

/// The part of a reload that runs off the service task.
pub struct PendingReload {
    id: ChannelId,
    exit: Option<watch::Receiver<Option<ExitReport>>>,
    source: Arc<dyn ConfigSource>,
}

impl PendingReload {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Wait for the old process to exit, then re-read the configuration.
    pub async fn run(self) -> ReloadOutcome {
        let exit = match self.exit {
            Some(rx) => Some(wait_for_exit(rx).await),
            None => None,
        };

        let id = self.id;
        let source = self.source;
        let config = tokio::task::spawn_blocking(move || source.channel(id))
            .await
            .unwrap_or_else(|e| Err(Error::Other(format!("configuration read failed: {}", e))));

        ReloadOutcome { id, exit, config }
    }
}

/// Result of [`PendingReload::run`].
#[derive(Debug)]
pub struct ReloadOutcome {
    pub id: ChannelId,
    /// How the old process ended, if there was one.
    pub exit: Option<ExitReport>,
    pub config: Result<ChannelConfig>,
}
