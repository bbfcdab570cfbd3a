//! Merge supervisor: combines every channel's output into one stream.
//!
//! The combiner is a single TSDuck `tsp` process. The lowest channel is read
//! by the `ip` input plugin; every other channel is attached through a
//! `merge` processor running its own `tsp -I ip`. The result is republished
//! on `group:base_port`.

use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tracing::{error, info, warn};

use crate::channel::{ChannelId, MuxLayout};
use crate::config::MergeSettings;
use crate::encoder::{EncoderProcess, ExitReport, ProcessLauncher, SpawnOptions};
use crate::supervisor::SupervisorEvent;
use crate::{Error, Result};

/// Packets sent per output datagram.
const PACKET_BURST: u32 = 7;

/// Inputs and output of the combiner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeTopology {
    output: SocketAddrV4,
    inputs: Vec<(ChannelId, SocketAddrV4)>,
}

impl MergeTopology {
    /// Build the topology for a set of channels. Inputs are ordered by
    /// identity; the first one is the primary.
    pub fn new(layout: &MuxLayout, ids: impl IntoIterator<Item = ChannelId>) -> Result<Self> {
        let mut ids: Vec<_> = ids.into_iter().collect();
        ids.sort();
        ids.dedup();

        let inputs = ids
            .into_iter()
            .map(|id| Ok((id, layout.channel_address(id)?)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            output: layout.output_address(),
            inputs,
        })
    }

    pub fn output(&self) -> SocketAddrV4 {
        self.output
    }

    pub fn inputs(&self) -> &[(ChannelId, SocketAddrV4)] {
        &self.inputs
    }

    pub fn primary(&self) -> Option<ChannelId> {
        self.inputs.first().map(|(id, _)| *id)
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

/// Launches the `tsp` combiner.
#[derive(Debug, Clone)]
pub struct TspCombiner {
    settings: MergeSettings,
}

impl TspCombiner {
    pub fn new(settings: MergeSettings) -> Self {
        Self { settings }
    }

    /// Build tsp command arguments.
    pub fn build_args(&self, topology: &MergeTopology) -> Result<Vec<String>> {
        let ((_, primary), rest) = topology
            .inputs
            .split_first()
            .ok_or_else(|| Error::config("merge has no channel inputs"))?;

        let mut args: Vec<String> = self.settings.extra_args.clone();
        args.extend(["-I".into(), "ip".into(), primary.to_string()]);

        for (_, addr) in rest {
            args.extend([
                "-P".into(),
                "merge".into(),
                format!("{} -I ip {}", self.settings.binary_path, addr),
            ]);
        }

        args.extend([
            "-O".into(),
            "ip".into(),
            topology.output.to_string(),
            "--packet-burst".into(),
            PACKET_BURST.to_string(),
        ]);

        Ok(args)
    }
}

impl ProcessLauncher<MergeTopology> for TspCombiner {
    fn program(&self) -> &str {
        &self.settings.binary_path
    }

    fn build_command(&self, topology: &MergeTopology) -> Result<Command> {
        let mut command = process_utils::tokio_command(&self.settings.binary_path);
        command.args(self.build_args(topology)?);
        Ok(command)
    }
}

/// Owns the combiner process.
///
/// The combiner is started once any channel is live and respawned whenever
/// it exits; channel restarts do not affect it.
pub struct MergeSupervisor {
    launcher: Arc<dyn ProcessLauncher<MergeTopology>>,
    topology: MergeTopology,
    process: Option<EncoderProcess>,
    options: SpawnOptions,
    starts: u64,
}

impl MergeSupervisor {
    pub fn new(
        launcher: Arc<dyn ProcessLauncher<MergeTopology>>,
        topology: MergeTopology,
        stop_timeout: Option<Duration>,
    ) -> Self {
        Self {
            launcher,
            topology,
            process: None,
            options: SpawnOptions {
                stop_timeout,
                forward_stderr: true,
            },
            starts: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.process.as_ref().is_some_and(EncoderProcess::is_running)
    }

    /// Number of times the combiner has been spawned.
    pub fn starts(&self) -> u64 {
        self.starts
    }

    /// One supervision pass. `any_live` is whether at least one channel is
    /// currently running.
    pub fn poll(&mut self, any_live: bool) -> Vec<SupervisorEvent> {
        let mut events = Vec::new();

        if self.is_running() {
            return events;
        }

        if let Some(process) = self.process.take() {
            let report = process.exit_report().unwrap_or_default();
            warn!("Merge process {}", report);
            events.push(SupervisorEvent::MergeExited { report });
        }

        if !any_live || self.topology.is_empty() {
            return events;
        }

        match self.spawn() {
            Ok(process) => {
                self.starts += 1;
                info!(
                    "Merge process started: {} inputs -> {}",
                    self.topology.inputs.len(),
                    self.topology.output
                );
                self.process = Some(process);
                events.push(SupervisorEvent::MergeStarted {
                    inputs: self.topology.inputs.len(),
                });
            }
            Err(e) => error!("Failed to start merge process: {}", e),
        }

        events
    }

    fn spawn(&self) -> Result<EncoderProcess> {
        let command = self.launcher.build_command(&self.topology)?;
        EncoderProcess::spawn("merge", command, self.options).map_err(|e| {
            Error::Other(format!(
                "failed to spawn {}: {}",
                self.launcher.program(),
                e
            ))
        })
    }

    /// Stop the combiner and wait for it to exit.
    pub async fn stop(&mut self) -> Option<ExitReport> {
        let process = self.process.take()?;
        let report = process.stop().await;
        info!("Merge process {}", report);
        Some(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(ns: &[u16]) -> Vec<ChannelId> {
        ns.iter().map(|&n| ChannelId::new(n).unwrap()).collect()
    }

    #[test]
    fn test_topology_orders_inputs() {
        let topology = MergeTopology::new(&MuxLayout::default(), ids(&[3, 1, 2, 3])).unwrap();
        assert_eq!(topology.primary().map(ChannelId::get), Some(1));
        let ports: Vec<_> = topology.inputs().iter().map(|(_, a)| a.port()).collect();
        assert_eq!(ports, vec![2001, 2002, 2003]);
        assert_eq!(topology.output().to_string(), "239.0.0.1:2000");
    }

    #[test]
    fn test_tsp_arguments() {
        let combiner = TspCombiner::new(MergeSettings::default());
        let topology = MergeTopology::new(&MuxLayout::default(), ids(&[1, 2, 3])).unwrap();
        let args = combiner.build_args(&topology).unwrap();

        assert_eq!(
            args,
            vec![
                "-I",
                "ip",
                "239.0.0.1:2001",
                "-P",
                "merge",
                "tsp -I ip 239.0.0.1:2002",
                "-P",
                "merge",
                "tsp -I ip 239.0.0.1:2003",
                "-O",
                "ip",
                "239.0.0.1:2000",
                "--packet-burst",
                "7",
            ]
        );
    }

    #[test]
    fn test_single_channel_has_no_merge_stage() {
        let combiner = TspCombiner::new(MergeSettings::default());
        let topology = MergeTopology::new(&MuxLayout::default(), ids(&[5])).unwrap();
        let args = combiner.build_args(&topology).unwrap();
        assert!(!args.contains(&"merge".to_string()));
        assert_eq!(&args[..3], ["-I", "ip", "239.0.0.1:2005"]);
    }

    #[test]
    fn test_empty_topology_rejected() {
        let combiner = TspCombiner::new(MergeSettings::default());
        let topology = MergeTopology::new(&MuxLayout::default(), Vec::new()).unwrap();
        assert!(combiner.build_args(&topology).is_err());
    }

    #[cfg(unix)]
    mod supervision {
        use super::*;

        /// Runs `sh -c <script>` regardless of topology.
        struct ShellCombiner(&'static str);

        impl ProcessLauncher<MergeTopology> for ShellCombiner {
            fn program(&self) -> &str {
                "sh"
            }

            fn build_command(&self, _: &MergeTopology) -> Result<Command> {
                let mut cmd = process_utils::tokio_command("sh");
                cmd.arg("-c").arg(self.0);
                Ok(cmd)
            }
        }

        fn merge(script: &'static str) -> MergeSupervisor {
            let topology = MergeTopology::new(&MuxLayout::default(), ids(&[1, 2])).unwrap();
            MergeSupervisor::new(Arc::new(ShellCombiner(script)), topology, None)
        }

        #[tokio::test]
        async fn test_waits_for_live_channel() {
            let mut merge = merge("exec sleep 30");
            assert!(merge.poll(false).is_empty());
            assert!(!merge.is_running());

            let events = merge.poll(true);
            assert_eq!(events, vec![SupervisorEvent::MergeStarted { inputs: 2 }]);
            assert!(merge.is_running());

            // Already running: nothing to do
            assert!(merge.poll(true).is_empty());

            assert!(merge.stop().await.is_some());
            assert!(!merge.is_running());
        }

        #[tokio::test]
        async fn test_respawns_after_exit() {
            let mut merge = merge("exit 1");
            merge.poll(true);
            tokio::time::sleep(Duration::from_millis(300)).await;

            let events = merge.poll(true);
            assert!(matches!(
                events.as_slice(),
                [
                    SupervisorEvent::MergeExited { .. },
                    SupervisorEvent::MergeStarted { inputs: 2 }
                ]
            ));
            assert_eq!(merge.starts(), 2);
        }
    }
}
