//! End-to-end supervision tests.
//!
//! Channel files are written to a temporary directory and read back through
//! [`ConfigLoader`]; encoders are replaced by `sleep` so no ffmpeg is needed.

#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::process::Command;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tsmgr::channel::{ChannelId, ChannelUnit, LifecycleState, MuxLayout};
use tsmgr::config::{ConfigLoader, SupervisorSettings};
use tsmgr::encoder::ProcessLauncher;
use tsmgr::supervisor::{
    ChannelStatus, ChannelSupervisor, ReloadCoordinator, ServiceHandle, ShutdownReport,
    SupervisorConfig, SupervisorEvent, SupervisorService,
};
use tsmgr::{Error, Result, admin};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Stands in for ffmpeg: runs until signalled.
struct SleepLauncher;

impl ProcessLauncher<ChannelUnit> for SleepLauncher {
    fn program(&self) -> &str {
        "sh"
    }

    fn build_command(&self, _: &ChannelUnit) -> Result<Command> {
        let mut cmd = process_utils::tokio_command("sh");
        cmd.arg("-c").arg("exec sleep 30");
        Ok(cmd)
    }
}

fn id(n: u16) -> ChannelId {
    ChannelId::new(n).unwrap()
}

fn write_settings(dir: &Path, table_version: u8) {
    std::fs::write(
        dir.join("tsmgr.toml"),
        format!("table_version = {}\n", table_version),
    )
    .unwrap();
}

fn write_channel(dir: &Path, file: &str, n: u16, name: &str) {
    std::fs::write(
        dir.join("channels").join(file),
        format!(
            "[channel]\nnum = {}\nname = \"{}\"\nprovider = \"tsmgr\"\nmuxrate = \"4M\"\nquiet = true\n\n[source]\ntype = \"test\"\n",
            n, name
        ),
    )
    .unwrap();
}

/// Temporary configuration with channels 1..=count.
fn setup(count: u16) -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir(dir.path().join("channels")).unwrap();
    write_settings(dir.path(), 1);
    for n in 1..=count {
        write_channel(dir.path(), &format!("ch{}.toml", n), n, &format!("Channel {}", n));
    }
    dir
}

fn loader(dir: &TempDir) -> ConfigLoader {
    ConfigLoader::new(dir.path().join("tsmgr.toml"), dir.path().join("channels"))
}

fn build_supervisor(dir: &TempDir) -> Result<ChannelSupervisor> {
    let loader = loader(dir);
    let settings = loader.load_settings()?;
    let set = loader.load_channels()?;
    assert!(set.rejected.is_empty());

    let mut supervisor = ChannelSupervisor::new(
        MuxLayout::default(),
        Arc::new(SleepLauncher),
        SupervisorConfig::from(&SupervisorSettings::default()),
    )?;
    supervisor.create(set.channels, settings.table_version()?)?;
    Ok(supervisor)
}

struct Running {
    handle: ServiceHandle,
    events: broadcast::Receiver<SupervisorEvent>,
    task: JoinHandle<ShutdownReport>,
}

fn start(dir: &TempDir) -> Running {
    let supervisor = build_supervisor(dir).unwrap();
    let events = supervisor.subscribe();
    let version = loader(dir).load_settings().unwrap().table_version().unwrap();
    let coordinator =
        ReloadCoordinator::new(Arc::new(loader(dir)), version, supervisor.event_sender());
    let (service, handle) = SupervisorService::new(
        supervisor,
        coordinator,
        POLL_INTERVAL,
        CancellationToken::new(),
    );
    Running {
        handle,
        events,
        task: tokio::spawn(service.run()),
    }
}

async fn status_of(handle: &ServiceHandle, n: u16) -> ChannelStatus {
    handle
        .status()
        .await
        .unwrap()
        .into_iter()
        .find(|s| s.id == id(n))
        .unwrap()
}

/// Wait until every channel reports a running process.
async fn wait_all_running(handle: &ServiceHandle) -> Vec<ChannelStatus> {
    for _ in 0..50 {
        let status = handle.status().await.unwrap();
        if status
            .iter()
            .all(|s| s.state == LifecycleState::Running && s.pid.is_some())
        {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("channels did not reach RUNNING");
}

fn drain(events: &mut broadcast::Receiver<SupervisorEvent>) -> Vec<SupervisorEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn test_killed_encoder_is_restarted() {
    let dir = setup(3);
    let running = start(&dir);
    let before = wait_all_running(&running.handle).await;
    let victim = before.iter().find(|s| s.id == id(2)).unwrap().pid.unwrap();

    process_utils::send_terminate(victim).unwrap();
    tokio::time::sleep(POLL_INTERVAL * 5).await;

    let after = wait_all_running(&running.handle).await;
    for (old, new) in before.iter().zip(&after) {
        assert_eq!(old.id, new.id);
        assert_eq!(old.params, new.params);
        if old.id == id(2) {
            assert_ne!(old.pid, new.pid);
        } else {
            assert_eq!(old.pid, new.pid);
        }
    }

    running.handle.shutdown();
    let report = running.task.await.unwrap();
    assert_eq!(report.channels, 3);
    assert_eq!(report.processes, 3);
}

#[tokio::test]
async fn test_reload_leaves_siblings_alone() {
    let dir = setup(3);
    let mut running = start(&dir);
    let before = wait_all_running(&running.handle).await;
    drain(&mut running.events);

    write_channel(dir.path(), "ch1.toml", 1, "Renamed");
    let instance = running.handle.reload(id(1)).await.unwrap();
    assert_eq!(instance, 2);

    let reloaded = status_of(&running.handle, 1).await;
    assert_eq!(reloaded.name, "Renamed");
    assert_eq!(reloaded.instance, 2);
    assert_eq!(reloaded.params, before[0].params);

    for event in drain(&mut running.events) {
        if let SupervisorEvent::StateChanged { id: changed, .. } = event {
            assert_eq!(changed, id(1), "unexpected transition on {}", changed);
        }
    }
    for n in [2, 3] {
        let status = status_of(&running.handle, n).await;
        assert_eq!(status.instance, 1);
        assert_eq!(status.pid, before[usize::from(n) - 1].pid);
    }

    running.handle.shutdown();
    running.task.await.unwrap();
}

#[tokio::test]
async fn test_reload_unknown_channel() {
    let dir = setup(2);
    let running = start(&dir);
    let before = wait_all_running(&running.handle).await;

    let result = running.handle.reload(id(9)).await;
    assert!(matches!(result, Err(Error::UnknownChannel { id: unknown }) if unknown == id(9)));

    let after = wait_all_running(&running.handle).await;
    assert_eq!(
        before.iter().map(|s| s.pid).collect::<Vec<_>>(),
        after.iter().map(|s| s.pid).collect::<Vec<_>>()
    );

    running.handle.shutdown();
    running.task.await.unwrap();
}

#[tokio::test]
async fn test_reload_picks_up_table_version() {
    let dir = setup(2);
    let mut running = start(&dir);
    wait_all_running(&running.handle).await;
    drain(&mut running.events);

    write_settings(dir.path(), 2);
    running.handle.reload(id(2)).await.unwrap();

    assert_eq!(status_of(&running.handle, 2).await.params.table_version.get(), 2);
    // Not reloaded, keeps the version it was started with.
    assert_eq!(status_of(&running.handle, 1).await.params.table_version.get(), 1);

    let changed = drain(&mut running.events)
        .into_iter()
        .filter(|e| matches!(e, SupervisorEvent::TableVersionChanged { .. }))
        .count();
    assert_eq!(changed, 1);

    running.handle.shutdown();
    running.task.await.unwrap();
}

#[tokio::test]
async fn test_duplicate_identity_aborts_startup() {
    let dir = setup(2);
    write_channel(dir.path(), "copy.toml", 2, "Copy of 2");

    let result = build_supervisor(&dir);
    assert!(matches!(result, Err(Error::IdentityConflict { id: dup }) if dup == id(2)));
}

#[tokio::test]
async fn test_admin_listener_survives_undecodable_input() {
    let dir = setup(2);
    let running = start(&dir);
    let before = wait_all_running(&running.handle).await;

    let input: &[u8] = b"\xff\xfe garbage\nr 1\n";
    admin::run_listener(input, running.handle.clone(), CancellationToken::new()).await;

    let mut reloaded = None;
    for _ in 0..50 {
        let status = status_of(&running.handle, 1).await;
        if status.instance == 2 && status.state == LifecycleState::Running {
            reloaded = Some(status);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(reloaded.is_some(), "'r 1' after invalid input was not processed");

    let sibling = status_of(&running.handle, 2).await;
    assert_eq!(sibling.instance, 1);
    assert_eq!(sibling.pid, before[1].pid);

    running.handle.shutdown();
    running.task.await.unwrap();
}

#[tokio::test]
async fn test_admin_invalid_commands_change_nothing() {
    let dir = setup(2);
    let mut running = start(&dir);
    let before = wait_all_running(&running.handle).await;
    drain(&mut running.events);

    let input: &[u8] = b"bogus\nr\nr 0\nr x\nr 1 2\nr 9\n\n";
    admin::run_listener(input, running.handle.clone(), CancellationToken::new()).await;
    tokio::time::sleep(POLL_INTERVAL * 3).await;

    let after = wait_all_running(&running.handle).await;
    assert_eq!(before, after);
    assert!(drain(&mut running.events).is_empty());

    running.handle.shutdown();
    running.task.await.unwrap();
}
