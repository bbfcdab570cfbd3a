//! Channel supervisor: owns every channel unit and its process.
//!
//! The supervisor is responsible for:
//! - Building channel units from configuration
//! - Spawning encoders and detecting their exit
//! - Restarting exited encoders
//! - Tearing units down for reload and shutdown
//!
//! It is owned by a single task (the supervisor service) and is the only
//! writer of lifecycle state.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use super::events::{EVENT_CHANNEL_CAPACITY, SupervisorEvent};
use super::restart_tracker::{RestartTracker, RestartTrackerConfig};
use crate::channel::{
    ChannelId, ChannelUnit, LifecycleState, MuxLayout, MuxParams, ParameterAllocator,
    TableVersion,
};
use crate::config::{ChannelConfig, SupervisorSettings};
use crate::encoder::{EncoderProcess, ExitReport, ProcessLauncher, SpawnOptions, wait_for_exit};
use crate::merge::{MergeSupervisor, MergeTopology};
use crate::{Error, Result};

/// Configuration for the supervisor.
#[derive(Debug, Clone, Default)]
pub struct SupervisorConfig {
    pub restart: RestartTrackerConfig,
    /// Kill a stopped process after this long. `None` waits forever.
    pub stop_timeout: Option<Duration>,
}

impl From<&SupervisorSettings> for SupervisorConfig {
    fn from(settings: &SupervisorSettings) -> Self {
        Self {
            restart: (&settings.restart_backoff).into(),
            stop_timeout: settings.stop_timeout(),
        }
    }
}

/// Point-in-time view of one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStatus {
    pub id: ChannelId,
    pub name: String,
    pub instance: u32,
    pub state: LifecycleState,
    pub params: MuxParams,
    pub pid: Option<u32>,
}

/// What one monitor pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorReport {
    /// Channels found dead during this pass.
    pub exited: Vec<ChannelId>,
    /// Channels respawned during this pass.
    pub restarted: Vec<ChannelId>,
}

/// Report from [`ChannelSupervisor::stop_all`].
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    pub channels: usize,
    /// Encoder processes that were waited for, including any that were
    /// still exiting for a reload.
    pub processes: usize,
    pub merge: Option<ExitReport>,
}

/// Owns every channel unit.
pub struct ChannelSupervisor {
    allocator: ParameterAllocator,
    launcher: Arc<dyn ProcessLauncher<ChannelUnit>>,
    units: BTreeMap<ChannelId, ChannelUnit>,
    /// Exit watches of encoders stopped for a reload whose unit has not
    /// been replaced yet.
    detached: HashMap<ChannelId, watch::Receiver<Option<ExitReport>>>,
    restart_tracker: RestartTracker,
    merge: Option<MergeSupervisor>,
    config: SupervisorConfig,
    events: broadcast::Sender<SupervisorEvent>,
}

impl ChannelSupervisor {
    pub fn new(
        layout: MuxLayout,
        launcher: Arc<dyn ProcessLauncher<ChannelUnit>>,
        config: SupervisorConfig,
    ) -> Result<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            allocator: ParameterAllocator::new(layout)?,
            launcher,
            units: BTreeMap::new(),
            detached: HashMap::new(),
            restart_tracker: RestartTracker::with_config(config.restart.clone()),
            merge: None,
            config,
            events,
        })
    }

    /// Attach the merge supervisor; it is polled on every monitor pass.
    pub fn enable_merge(&mut self, merge: MergeSupervisor) {
        self.merge = Some(merge);
    }

    pub fn merge(&self) -> Option<&MergeSupervisor> {
        self.merge.as_ref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    /// Sender for events raised outside the supervisor (table version).
    pub fn event_sender(&self) -> broadcast::Sender<SupervisorEvent> {
        self.events.clone()
    }

    pub fn restart_tracker(&self) -> &RestartTracker {
        &self.restart_tracker
    }

    pub fn contains(&self, id: ChannelId) -> bool {
        self.units.contains_key(&id)
    }

    pub fn unit(&self, id: ChannelId) -> Option<&ChannelUnit> {
        self.units.get(&id)
    }

    pub fn state(&self, id: ChannelId) -> Option<LifecycleState> {
        self.units.get(&id).map(ChannelUnit::state)
    }

    /// Combiner inputs for every created channel.
    ///
    /// Addresses are fixed per identity, so a channel that cannot start yet
    /// is still subscribed and joins the multiplex once a reload fixes it.
    pub fn merge_topology(&self) -> Result<MergeTopology> {
        MergeTopology::new(self.allocator.layout(), self.units.keys().copied())
    }

    pub fn snapshot(&self) -> Vec<ChannelStatus> {
        self.units
            .values()
            .map(|unit| ChannelStatus {
                id: unit.id(),
                name: unit.name().to_string(),
                instance: unit.instance(),
                state: unit.state(),
                params: unit.params().clone(),
                pid: unit.process().and_then(EncoderProcess::pid),
            })
            .collect()
    }

    /// Build one unit per configuration.
    ///
    /// A repeated identity fails the whole call and creates nothing. Channels
    /// whose parameters cannot be derived are logged and excluded; channels
    /// whose source cannot be built stay in `Created`.
    pub fn create(
        &mut self,
        configs: Vec<ChannelConfig>,
        table_version: TableVersion,
    ) -> Result<Vec<ChannelId>> {
        let mut seen = HashSet::new();
        for config in &configs {
            if !seen.insert(config.id) || self.units.contains_key(&config.id) {
                return Err(Error::IdentityConflict { id: config.id });
            }
        }

        let mut created = Vec::new();
        for config in configs {
            let id = config.id;
            let config = Arc::new(config);

            let params = match self.allocator.allocate(id, table_version, &config) {
                Ok(params) => params,
                Err(e) => {
                    error!(channel = %id, name = %config.name, "Excluding channel: {}", e);
                    continue;
                }
            };

            let mut unit = ChannelUnit::new(1, config, params);
            match unit.configure() {
                Ok(()) => emit(&self.events, &unit, LifecycleState::Created),
                Err(e) => {
                    error!(
                        channel = %id,
                        name = %unit.name(),
                        "Channel will not be started: {}",
                        e
                    );
                }
            }

            debug!(
                channel = %id,
                port = unit.params().destination.port(),
                pmt_pid = unit.params().pmt_pid,
                start_pid = unit.params().start_pid,
                "Channel created"
            );
            self.units.insert(id, unit);
            created.push(id);
        }

        Ok(created)
    }

    /// Spawn every `Configured` unit. Returns the number started.
    pub fn start_all(&mut self) -> usize {
        let ids: Vec<_> = self
            .units
            .values()
            .filter(|u| u.state() == LifecycleState::Configured)
            .map(ChannelUnit::id)
            .collect();

        let mut started = 0;
        for id in ids {
            match self.spawn_unit(id) {
                Ok(()) => started += 1,
                Err(_) => {
                    self.restart_tracker.record_failure(id);
                }
            }
        }
        started
    }

    /// Spawn the encoder of a `Configured` or `Restarting` unit.
    ///
    /// On failure the unit goes to `Exited` and becomes a restart candidate.
    /// The caller records the failure.
    fn spawn_unit(&mut self, id: ChannelId) -> Result<()> {
        let unit = self
            .units
            .get_mut(&id)
            .ok_or(Error::UnknownChannel { id })?;

        let options = SpawnOptions {
            stop_timeout: self.config.stop_timeout,
            forward_stderr: !unit.config().quiet,
        };
        let spawned = self
            .launcher
            .build_command(unit)
            .map_err(|e| Error::spawn(id, e))
            .and_then(|command| {
                EncoderProcess::spawn(format!("channel {}", id), command, options)
                    .map_err(|e| Error::spawn(id, e))
            });

        match spawned {
            Ok(process) => {
                info!(
                    channel = %id,
                    name = %unit.name(),
                    pid = ?process.pid(),
                    "Encoder started -> {}",
                    unit.params().udp_url()
                );
                unit.attach(process);
                transition(&self.events, unit, LifecycleState::Running);
                Ok(())
            }
            Err(e) => {
                error!(channel = %id, name = %unit.name(), "{}", e);
                transition(&self.events, unit, LifecycleState::Exited);
                Err(e)
            }
        }
    }

    /// One monitoring pass.
    ///
    /// Running units whose process has gone are moved to `Exited`; exited
    /// units whose backoff has elapsed are respawned with the same
    /// configuration and parameters. `Stopped` units (including those being
    /// reloaded) are never touched. Finally the merge supervisor is polled.
    pub fn monitor_once(&mut self) -> MonitorReport {
        let mut report = MonitorReport::default();
        let ids: Vec<_> = self.units.keys().copied().collect();

        for id in ids {
            let Some(unit) = self.units.get_mut(&id) else {
                continue;
            };

            let just_exited = match unit.state() {
                LifecycleState::Running => {
                    if let Some(process) = unit.process().filter(|p| p.is_running()) {
                        self.restart_tracker.note_uptime(id, process.uptime());
                        continue;
                    }

                    let exit = unit
                        .take_process()
                        .and_then(|p| p.exit_report())
                        .unwrap_or_default();
                    warn!(channel = %id, name = %unit.name(), "Encoder {}", exit);
                    transition(&self.events, unit, LifecycleState::Exited);
                    self.restart_tracker.record_failure(id);
                    report.exited.push(id);
                    true
                }
                LifecycleState::Exited => false,
                _ => continue,
            };

            if !self.restart_tracker.is_ready(id) {
                continue;
            }

            let restart = self.restart_tracker.record_restart(id);
            if let Some(unit) = self.units.get_mut(&id) {
                info!(
                    channel = %id,
                    name = %unit.name(),
                    "Restarting encoder (restart {})",
                    restart
                );
                transition(&self.events, unit, LifecycleState::Restarting);
            }
            match self.spawn_unit(id) {
                Ok(()) => report.restarted.push(id),
                // At most one failure per channel per pass.
                Err(_) if just_exited => {}
                Err(_) => {
                    self.restart_tracker.record_failure(id);
                }
            }
        }

        let any_live = self
            .units
            .values()
            .any(|u| u.state() == LifecycleState::Running);
        if let Some(merge) = self.merge.as_mut() {
            for event in merge.poll(any_live) {
                let _ = self.events.send(event);
            }
        }

        report
    }

    /// Stop a unit ahead of a reload.
    ///
    /// The unit is marked `Stopped` (so the monitor leaves it alone) and its
    /// process is signalled. Returns a watch on the process exit, if a
    /// process was attached.
    pub fn begin_reload(
        &mut self,
        id: ChannelId,
    ) -> Result<Option<watch::Receiver<Option<ExitReport>>>> {
        let unit = self
            .units
            .get_mut(&id)
            .ok_or(Error::UnknownChannel { id })?;

        if !unit.state().is_terminal() {
            transition(&self.events, unit, LifecycleState::Stopped);
        }
        info!(channel = %id, name = %unit.name(), "Stopping for reload");

        let exit = unit.take_process().map(|process| {
            process.terminate();
            process.exit_watch()
        });
        if let Some(exit) = &exit {
            self.detached.insert(id, exit.clone());
        }
        Ok(exit)
    }

    /// Replace a unit with one built from a fresh configuration, and start it.
    ///
    /// On failure the old unit is kept as it is. Returns the new instance
    /// number.
    pub fn replace_unit(
        &mut self,
        config: ChannelConfig,
        table_version: TableVersion,
    ) -> Result<u32> {
        let id = config.id;
        let instance = self
            .units
            .get(&id)
            .map(ChannelUnit::instance)
            .ok_or(Error::UnknownChannel { id })?
            + 1;

        let config = Arc::new(config);
        let params = self.allocator.reallocate(id, table_version, &config)?;
        let mut unit = ChannelUnit::new(instance, config, params);
        unit.configure()?;

        self.restart_tracker.remove(id);
        self.detached.remove(&id);
        emit(&self.events, &unit, LifecycleState::Created);
        self.units.insert(id, unit);

        // A failed spawn is retried by the monitor like any other exit.
        if let Err(e) = self.spawn_unit(id) {
            debug!(channel = %id, "Replacement not started yet: {}", e);
            self.restart_tracker.record_failure(id);
        }
        Ok(instance)
    }

    /// Signal every process, then wait until every one has exited.
    pub async fn stop_all(&mut self) -> ShutdownReport {
        info!("Stopping {} channels", self.units.len());

        let mut processes = Vec::new();
        for unit in self.units.values_mut() {
            if !unit.state().is_terminal() {
                transition(&self.events, unit, LifecycleState::Stopped);
            }
            if let Some(process) = unit.take_process() {
                process.terminate();
                processes.push((unit.id(), process));
            }
        }

        // Encoders already signalled for a reload that are still exiting.
        let detached: Vec<_> = self
            .detached
            .drain()
            .filter(|(_, exit)| exit.borrow().is_none())
            .collect();

        let merge = match self.merge.as_mut() {
            Some(merge) => merge.stop().await,
            None => None,
        };

        for (id, process) in &processes {
            let report = process.wait().await;
            debug!(channel = %id, "Encoder {}", report);
        }

        for (id, exit) in &detached {
            let report = wait_for_exit(exit.clone()).await;
            debug!(channel = %id, "Encoder stopped for reload {}", report);
        }

        let report = ShutdownReport {
            channels: self.units.len(),
            processes: processes.len() + detached.len(),
            merge,
        };
        info!(
            "Shutdown complete: {} channels, {} encoders stopped",
            report.channels, report.processes
        );
        report
    }
}

/// Apply a lifecycle transition and broadcast it.
fn transition(
    events: &broadcast::Sender<SupervisorEvent>,
    unit: &mut ChannelUnit,
    target: LifecycleState,
) {
    match unit.transition(target) {
        Ok(from) => emit(events, unit, from),
        Err(e) => error!(channel = %unit.id(), "{}", e),
    }
}

fn emit(events: &broadcast::Sender<SupervisorEvent>, unit: &ChannelUnit, from: LifecycleState) {
    debug!(channel = %unit.id(), "{} -> {}", from, unit.state());
    let _ = events.send(SupervisorEvent::StateChanged {
        id: unit.id(),
        instance: unit.instance(),
        from,
        to: unit.state(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::process::Command;

    /// Ignores the unit and runs a fixed shell script.
    struct ShellLauncher(&'static str);

    impl ProcessLauncher<ChannelUnit> for ShellLauncher {
        fn program(&self) -> &str {
            "sh"
        }

        fn build_command(&self, _: &ChannelUnit) -> Result<Command> {
            let mut cmd = process_utils::tokio_command("sh");
            cmd.arg("-c").arg(self.0);
            Ok(cmd)
        }
    }

    /// Always fails to spawn.
    struct MissingLauncher;

    impl ProcessLauncher<ChannelUnit> for MissingLauncher {
        fn program(&self) -> &str {
            "/nonexistent/ffmpeg"
        }

        fn build_command(&self, _: &ChannelUnit) -> Result<Command> {
            Ok(process_utils::tokio_command("/nonexistent/ffmpeg"))
        }
    }

    /// Runs once, then fails every later spawn.
    #[derive(Default)]
    struct OneShotLauncher {
        spawned: AtomicBool,
    }

    impl ProcessLauncher<ChannelUnit> for OneShotLauncher {
        fn program(&self) -> &str {
            "sh"
        }

        fn build_command(&self, _: &ChannelUnit) -> Result<Command> {
            if self.spawned.swap(true, Ordering::SeqCst) {
                return Ok(process_utils::tokio_command("/nonexistent/ffmpeg"));
            }
            let mut cmd = process_utils::tokio_command("sh");
            cmd.arg("-c").arg("exit 1");
            Ok(cmd)
        }
    }

    /// Combiner stand-in that runs until signalled.
    struct SleepCombiner;

    impl ProcessLauncher<MergeTopology> for SleepCombiner {
        fn program(&self) -> &str {
            "sh"
        }

        fn build_command(&self, _: &MergeTopology) -> Result<Command> {
            let mut cmd = process_utils::tokio_command("sh");
            cmd.arg("-c").arg("exec sleep 30");
            Ok(cmd)
        }
    }

    fn config(n: u16, source: &str) -> ChannelConfig {
        ChannelConfig::parse(
            &format!(
                "[channel]\nnum = {}\nname = \"Channel {}\"\nprovider = \"tsmgr\"\nmuxrate = \"5M\"\nquiet = true\n[source]\n{}\n",
                n, n, source
            ),
            None,
        )
        .unwrap()
    }

    fn supervisor(launcher: Arc<dyn ProcessLauncher<ChannelUnit>>) -> ChannelSupervisor {
        ChannelSupervisor::new(MuxLayout::default(), launcher, SupervisorConfig::default()).unwrap()
    }

    fn id(n: u16) -> ChannelId {
        ChannelId::new(n).unwrap()
    }

    #[test]
    fn test_create_rejects_duplicate_identity() {
        let mut sup = supervisor(Arc::new(MissingLauncher));
        let result = sup.create(
            vec![config(1, "type = \"test\""), config(1, "type = \"test\"")],
            TableVersion::default(),
        );
        assert!(matches!(result, Err(Error::IdentityConflict { .. })));
        assert!(sup.snapshot().is_empty());
    }

    #[test]
    fn test_create_contains_bad_channels() {
        let mut sup = supervisor(Arc::new(MissingLauncher));
        let created = sup
            .create(
                vec![
                    config(1, "type = \"test\""),
                    config(2, "type = \"satellite\""),
                    config(500, "type = \"test\""),
                ],
                TableVersion::default(),
            )
            .unwrap();

        assert_eq!(created, vec![id(1), id(2)]);
        assert_eq!(sup.state(id(1)), Some(LifecycleState::Configured));
        assert_eq!(sup.state(id(2)), Some(LifecycleState::Created));
        assert!(!sup.contains(id(500)));

        // The unconfigurable channel is still a combiner input.
        let topology = sup.merge_topology().unwrap();
        let inputs: Vec<_> = topology.inputs().iter().map(|(id, _)| *id).collect();
        assert_eq!(inputs, vec![id(1), id(2)]);
        assert_eq!(topology.inputs()[1].1.port(), 2002);
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_unit_exited() {
        let mut sup = supervisor(Arc::new(MissingLauncher));
        sup.create(
            vec![config(1, "type = \"test\""), config(2, "type = \"test\"")],
            TableVersion::default(),
        )
        .unwrap();

        assert_eq!(sup.start_all(), 0);
        assert_eq!(sup.state(id(1)), Some(LifecycleState::Exited));
        assert_eq!(sup.state(id(2)), Some(LifecycleState::Exited));

        assert_eq!(sup.restart_tracker().recent_failures(id(1)), 1);

        // Retried on every pass
        let report = sup.monitor_once();
        assert!(report.restarted.is_empty());
        assert_eq!(sup.state(id(1)), Some(LifecycleState::Exited));
        assert_eq!(sup.restart_tracker().total_restarts(id(1)), 1);
        assert_eq!(sup.restart_tracker().recent_failures(id(1)), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_and_failed_respawn_count_once() {
        let mut sup = supervisor(Arc::new(OneShotLauncher::default()));
        sup.create(vec![config(1, "type = \"test\"")], TableVersion::default())
            .unwrap();
        assert_eq!(sup.start_all(), 1);
        tokio::time::sleep(Duration::from_millis(300)).await;

        let report = sup.monitor_once();
        assert_eq!(report.exited, vec![id(1)]);
        assert!(report.restarted.is_empty());
        assert_eq!(sup.state(id(1)), Some(LifecycleState::Exited));
        assert_eq!(sup.restart_tracker().recent_failures(id(1)), 1);
        assert_eq!(sup.restart_tracker().total_restarts(id(1)), 1);

        sup.monitor_once();
        assert_eq!(sup.restart_tracker().recent_failures(id(1)), 2);
        assert_eq!(sup.restart_tracker().total_restarts(id(1)), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_channel_restart_leaves_merge_running() {
        let mut sup = supervisor(Arc::new(ShellLauncher("exec sleep 30")));
        sup.create(
            vec![config(1, "type = \"test\""), config(2, "type = \"test\"")],
            TableVersion::default(),
        )
        .unwrap();
        let topology = sup.merge_topology().unwrap();
        sup.enable_merge(MergeSupervisor::new(Arc::new(SleepCombiner), topology, None));
        let mut events = sup.subscribe();

        sup.start_all();
        sup.monitor_once();
        assert!(sup.merge().unwrap().is_running());
        assert_eq!(sup.merge().unwrap().starts(), 1);

        let pid = sup
            .unit(id(1))
            .and_then(ChannelUnit::process)
            .and_then(EncoderProcess::pid)
            .unwrap();
        process_utils::send_terminate(pid).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let report = sup.monitor_once();
        assert_eq!(report.exited, vec![id(1)]);
        assert_eq!(report.restarted, vec![id(1)]);
        assert!(sup.merge().unwrap().is_running());
        assert_eq!(sup.merge().unwrap().starts(), 1);

        let mut merge_events = Vec::new();
        while let Ok(event) = events.try_recv() {
            if !matches!(event, SupervisorEvent::StateChanged { .. }) {
                merge_events.push(event);
            }
        }
        assert_eq!(merge_events, vec![SupervisorEvent::MergeStarted { inputs: 2 }]);

        sup.stop_all().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_all_waits_for_reloading_encoder() {
        let mut sup = supervisor(Arc::new(ShellLauncher(
            "trap 'sleep 0.5; exit 0' TERM; while :; do sleep 0.05; done",
        )));
        sup.create(
            vec![config(1, "type = \"test\""), config(2, "type = \"test\"")],
            TableVersion::default(),
        )
        .unwrap();
        sup.start_all();
        // Give the shells time to install the trap.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let exit = sup.begin_reload(id(1)).unwrap().expect("process attached");
        let report = sup.stop_all().await;

        assert!(exit.borrow().is_some());
        assert_eq!(report.processes, 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_monitor_restarts_exited_unit() {
        let mut sup = supervisor(Arc::new(ShellLauncher("exit 0")));
        sup.create(vec![config(1, "type = \"test\"")], TableVersion::default())
            .unwrap();
        let mut events = sup.subscribe();

        assert_eq!(sup.start_all(), 1);
        tokio::time::sleep(Duration::from_millis(300)).await;

        let report = sup.monitor_once();
        assert_eq!(report.exited, vec![id(1)]);
        assert_eq!(report.restarted, vec![id(1)]);
        assert_eq!(sup.state(id(1)), Some(LifecycleState::Running));

        let mut transitions = Vec::new();
        while let Ok(SupervisorEvent::StateChanged { from, to, .. }) = events.try_recv() {
            transitions.push((from, to));
        }
        assert_eq!(
            transitions,
            vec![
                (LifecycleState::Configured, LifecycleState::Running),
                (LifecycleState::Running, LifecycleState::Exited),
                (LifecycleState::Exited, LifecycleState::Restarting),
                (LifecycleState::Restarting, LifecycleState::Running),
            ]
        );

        sup.stop_all().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reload_replaces_unit() {
        let mut sup = supervisor(Arc::new(ShellLauncher("exec sleep 30")));
        sup.create(
            vec![config(1, "type = \"test\""), config(2, "type = \"test\"")],
            TableVersion::default(),
        )
        .unwrap();
        sup.start_all();

        let exit = sup.begin_reload(id(2)).unwrap().expect("process attached");
        assert_eq!(sup.state(id(2)), Some(LifecycleState::Stopped));

        // The monitor leaves a stopped unit alone
        let report = sup.monitor_once();
        assert!(report.restarted.is_empty());
        assert_eq!(sup.state(id(2)), Some(LifecycleState::Stopped));

        let report = crate::encoder::wait_for_exit(exit).await;
        assert!(report.terminated);

        let instance = sup
            .replace_unit(config(2, "type = \"test\"\npreset = \"SD\""), TableVersion::new(3).unwrap())
            .unwrap();
        assert_eq!(instance, 2);
        assert_eq!(sup.state(id(2)), Some(LifecycleState::Running));
        assert_eq!(sup.unit(id(2)).unwrap().params().table_version.get(), 3);
        assert_eq!(sup.unit(id(1)).unwrap().params().table_version.get(), 0);
        assert_eq!(sup.state(id(1)), Some(LifecycleState::Running));

        let shutdown = sup.stop_all().await;
        assert_eq!(shutdown.processes, 2);
    }

    #[test]
    fn test_reload_unknown_channel() {
        let mut sup = supervisor(Arc::new(MissingLauncher));
        assert!(matches!(
            sup.begin_reload(id(9)),
            Err(Error::UnknownChannel { .. })
        ));
    }

    #[test]
    fn test_replace_with_bad_config_keeps_old_unit() {
        let mut sup = supervisor(Arc::new(MissingLauncher));
        sup.create(vec![config(1, "type = \"test\"")], TableVersion::default())
            .unwrap();
        sup.begin_reload(id(1)).unwrap();

        let result = sup.replace_unit(config(1, "type = \"satellite\""), TableVersion::default());
        assert!(matches!(result, Err(Error::UnknownSource { .. })));
        assert_eq!(sup.state(id(1)), Some(LifecycleState::Stopped));
        assert_eq!(sup.unit(id(1)).unwrap().instance(), 1);
    }
}
