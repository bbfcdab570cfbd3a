use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tsmgr::channel::ChannelUnit;
use tsmgr::config::{ConfigLoader, Settings};
use tsmgr::encoder::{FfmpegEncoder, ProcessLauncher};
use tsmgr::merge::{MergeSupervisor, TspCombiner};
use tsmgr::supervisor::{ChannelSupervisor, ReloadCoordinator, SupervisorConfig, SupervisorService};
use tsmgr::{Error, admin, logging};

/// Supervise ffmpeg MPEG-TS encoders and their multiplex.
#[derive(Parser, Debug)]
#[command(name = "tsmgr", version, about)]
struct Args {
    /// Settings file
    #[arg(short, long, default_value = "tsmgr.toml")]
    config: PathBuf,

    /// Directory containing one `*.toml` file per channel
    #[arg(long, default_value = "channels")]
    channels: PathBuf,

    /// Do not start the tsp combiner even if enabled in the settings
    #[arg(long)]
    no_merge: bool,

    /// Do not read administrative commands from stdin
    #[arg(long)]
    no_admin: bool,

    /// Log filter directive, overrides RUST_LOG and the settings file
    #[arg(long, value_name = "FILTER")]
    log_filter: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = run(args).await {
        error!("Application error: {:#}", e);
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let loader = ConfigLoader::new(&args.config, &args.channels);
    let settings = loader.load_settings()?;

    let _log_guard = logging::init_logging(
        args.log_filter.as_deref(),
        settings.logging.filter.as_deref(),
        settings.logging.directory.as_deref(),
    )?;

    let cancellation_token = CancellationToken::new();
    if let Some(dir) = &settings.logging.directory {
        logging::start_retention_cleanup(
            dir.clone(),
            settings.logging.retention_days,
            cancellation_token.clone(),
        );
    }

    info!(
        "tsmgr {} starting with {}",
        env!("CARGO_PKG_VERSION"),
        args.config.display()
    );

    let merge_enabled = settings.merge.enabled && !args.no_merge;
    check_dependencies(&settings, merge_enabled)?;

    let table_version = settings.table_version()?;
    let channel_set = loader.load_channels()?;
    for rejected in &channel_set.rejected {
        error!("Ignoring {}: {}", rejected.path.display(), rejected.error);
    }
    if channel_set.channels.is_empty() {
        warn!("No channels configured in {}", args.channels.display());
    }

    let encoder = FfmpegEncoder::new(settings.encoder.clone());
    match encoder.detect_version() {
        Some(version) => info!("Using {}", version),
        None => warn!("Could not determine ffmpeg version"),
    }
    let launcher: Arc<dyn ProcessLauncher<ChannelUnit>> = Arc::new(encoder);

    let supervisor_config = SupervisorConfig::from(&settings.supervisor);
    let stop_timeout = supervisor_config.stop_timeout;
    let mut supervisor =
        ChannelSupervisor::new(settings.mux.clone(), launcher, supervisor_config)?;

    let created = supervisor.create(channel_set.channels, table_version)?;
    info!(
        "Created {} channels (table version {})",
        created.len(),
        table_version
    );

    if merge_enabled {
        let topology = supervisor.merge_topology()?;
        if topology.is_empty() {
            warn!("Merge enabled but no channels are configured, combiner disabled");
        } else {
            info!(
                "Merging {} channels into {}",
                topology.inputs().len(),
                topology.output()
            );
            let combiner = Arc::new(TspCombiner::new(settings.merge.clone()));
            supervisor.enable_merge(MergeSupervisor::new(combiner, topology, stop_timeout));
        }
    }

    let coordinator = ReloadCoordinator::new(
        Arc::new(loader),
        table_version,
        supervisor.event_sender(),
    );

    let (service, handle) = SupervisorService::new(
        supervisor,
        coordinator,
        settings.supervisor.poll_interval(),
        cancellation_token.clone(),
    );
    let service_task = tokio::spawn(service.run());

    if !args.no_admin {
        admin::spawn_stdin_listener(handle.clone(), cancellation_token.clone());
        info!("Admin commands: 'r <channel>' reloads a channel, 's' prints status");
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Received Ctrl+C, shutting down"),
                Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
            }
        }
        _ = cancellation_token.cancelled() => {}
    }
    handle.shutdown();

    let report = service_task.await?;
    info!(
        channels = report.channels,
        encoders = report.processes,
        merge = ?report.merge,
        "Exiting"
    );
    Ok(())
}

/// Make sure every external program can be found before anything starts.
fn check_dependencies(settings: &Settings, merge_enabled: bool) -> tsmgr::Result<()> {
    let mut programs = vec![settings.encoder.binary_path.as_str()];
    if merge_enabled {
        programs.push(settings.merge.binary_path.as_str());
    }

    for program in programs {
        match process_utils::find_program(program) {
            Some(path) => info!("Found {} at {}", program, path.display()),
            None => {
                return Err(Error::DependencyMissing {
                    program: program.to_string(),
                });
            }
        }
    }
    Ok(())
}
