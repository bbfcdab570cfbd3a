//! Supervisor service: the single task that owns the channel supervisor.
//!
//! Multiplexes the monitor tick, administrative requests, reload
//! completions and shutdown.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{self, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::reload::{ReloadCoordinator, ReloadOutcome};
use super::supervisor::{ChannelStatus, ChannelSupervisor, ShutdownReport};
use crate::channel::ChannelId;
use crate::{Error, Result};

/// Capacity of the request channel.
const REQUEST_CHANNEL_CAPACITY: usize = 32;

/// Request sent to the service.
#[derive(Debug)]
pub enum AdminRequest {
    /// Reload one channel; answered once the replacement has been started
    /// or the reload has failed.
    Reload {
        id: ChannelId,
        reply: oneshot::Sender<Result<u32>>,
    },
    /// Report the state of every channel.
    Status {
        reply: oneshot::Sender<Vec<ChannelStatus>>,
    },
}

/// Cloneable handle for talking to a running service.
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    tx: mpsc::Sender<AdminRequest>,
    cancellation_token: CancellationToken,
}

impl ServiceHandle {
    /// Reload a channel and wait for the result.
    pub async fn reload(&self, id: ChannelId) -> Result<u32> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(AdminRequest::Reload { id, reply })
            .await
            .map_err(|_| Error::Other("supervisor service is not running".to_string()))?;
        rx.await
            .map_err(|_| Error::Other("supervisor service stopped before replying".to_string()))?
    }

    pub async fn status(&self) -> Result<Vec<ChannelStatus>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(AdminRequest::Status { reply })
            .await
            .map_err(|_| Error::Other("supervisor service is not running".to_string()))?;
        rx.await
            .map_err(|_| Error::Other("supervisor service stopped before replying".to_string()))
    }

    /// Ask the service to stop all channels and exit.
    pub fn shutdown(&self) {
        self.cancellation_token.cancel();
    }
}

/// Owns the supervisor and the reload coordinator.
pub struct SupervisorService {
    supervisor: ChannelSupervisor,
    coordinator: ReloadCoordinator,
    poll_interval: Duration,
    requests: mpsc::Receiver<AdminRequest>,
    cancellation_token: CancellationToken,
}

impl SupervisorService {
    pub fn new(
        supervisor: ChannelSupervisor,
        coordinator: ReloadCoordinator,
        poll_interval: Duration,
        cancellation_token: CancellationToken,
    ) -> (Self, ServiceHandle) {
        let (tx, requests) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let handle = ServiceHandle {
            tx,
            cancellation_token: cancellation_token.clone(),
        };
        let service = Self {
            supervisor,
            coordinator,
            poll_interval,
            requests,
            cancellation_token,
        };
        (service, handle)
    }

    /// Start every channel and supervise until cancelled, then stop
    /// everything.
    pub async fn run(mut self) -> ShutdownReport {
        let started = self.supervisor.start_all();
        info!(
            "Started {} channels, polling every {:?}",
            started, self.poll_interval
        );

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        let mut reloads = ReloadTasks::default();

        loop {
            tokio::select! {
                _ = self.cancellation_token.cancelled() => {
                    info!("Supervisor service received cancellation signal");
                    break;
                }

                _ = interval.tick() => {
                    let report = self.supervisor.monitor_once();
                    if !report.exited.is_empty() {
                        debug!("Monitor pass: exited {:?}, restarted {:?}", report.exited, report.restarted);
                    }
                }

                Some(request) = self.requests.recv() => {
                    self.handle_request(request, &mut reloads);
                }

                // Only poll join_next if there are pending reloads to avoid busy-looping
                (id, result) = reloads.join_next_if_pending() => {
                    self.handle_reload_result(id, result, &mut reloads);
                }
            }
        }

        reloads.shutdown();
        self.supervisor.stop_all().await
    }

    fn handle_request(&mut self, request: AdminRequest, reloads: &mut ReloadTasks) {
        match request {
            AdminRequest::Reload { id, reply } => {
                match self.coordinator.begin(&mut self.supervisor, id) {
                    Ok(pending) => {
                        info!(channel = %id, "Reload started");
                        reloads.spawn(id, pending.run(), reply);
                    }
                    Err(e) => {
                        warn!(channel = %id, "Reload rejected: {}", e);
                        let _ = reply.send(Err(e));
                    }
                }
            }
            AdminRequest::Status { reply } => {
                let _ = reply.send(self.supervisor.snapshot());
            }
        }
    }

    fn handle_reload_result(
        &mut self,
        id: ChannelId,
        result: std::result::Result<ReloadOutcome, JoinError>,
        reloads: &mut ReloadTasks,
    ) {
        let result = match result {
            Ok(outcome) => {
                if let Some(exit) = outcome.exit {
                    debug!(channel = %id, "Old encoder {}", exit);
                }
                self.coordinator.complete(&mut self.supervisor, outcome)
            }
            Err(e) => {
                self.coordinator.abandon(id);
                Err(Error::Other(format!("reload task failed: {}", e)))
            }
        };

        if let Err(e) = &result {
            error!(channel = %id, "Reload failed, channel stays stopped: {}", e);
        }
        reloads.reply(id, result);
    }
}

/// Reloads waiting for their old encoder to exit and their configuration
/// to be read.
#[derive(Default)]
struct ReloadTasks {
    tasks: JoinSet<ReloadOutcome>,
    channels: HashMap<task::Id, ChannelId>,
    replies: HashMap<ChannelId, oneshot::Sender<Result<u32>>>,
}

impl ReloadTasks {
    fn spawn<F>(&mut self, id: ChannelId, reload: F, reply: oneshot::Sender<Result<u32>>)
    where
        F: Future<Output = ReloadOutcome> + Send + 'static,
    {
        let handle = self.tasks.spawn(reload);
        self.channels.insert(handle.id(), id);
        self.replies.insert(id, reply);
    }

    /// The next finished reload, with the channel it belongs to even if the
    /// task panicked.
    async fn join_next_if_pending(
        &mut self,
    ) -> (ChannelId, std::result::Result<ReloadOutcome, JoinError>) {
        loop {
            if self.tasks.is_empty() {
                // Nothing to wait for - wait until other events occur
                return std::future::pending().await;
            }

            match self.tasks.join_next_with_id().await {
                Some(Ok((task, outcome))) => {
                    self.channels.remove(&task);
                    return (outcome.id, Ok(outcome));
                }
                Some(Err(e)) => {
                    if let Some(id) = self.channels.remove(&e.id()) {
                        return (id, Err(e));
                    }
                }
                None => {}
            }
        }
    }

    fn reply(&mut self, id: ChannelId, result: Result<u32>) {
        if let Some(reply) = self.replies.remove(&id) {
            let _ = reply.send(result);
        }
    }

    /// Abort every reload and tell the waiters. The encoders being replaced
    /// were already signalled; the supervisor waits for them on shutdown.
    fn shutdown(&mut self) {
        self.tasks.abort_all();
        self.channels.clear();
        for (id, reply) in self.replies.drain() {
            let _ = reply.send(Err(Error::Other(format!(
                "reload of channel {} interrupted by shutdown",
                id
            ))));
        }
    }
}
