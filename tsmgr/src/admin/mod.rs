//! Administrative command surface.
//!
//! Commands are read one per line:
//!
//! - `r <id>`: reload channel `<id>`
//! - `s`: log the state of every channel
//!
//! Anything else is rejected without touching any channel. Results are
//! reported through the log.

use std::str::FromStr;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::channel::ChannelId;
use crate::supervisor::ServiceHandle;
use crate::{Error, Result};

/// A parsed administrative command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminCommand {
    Reload(ChannelId),
    Status,
}

impl FromStr for AdminCommand {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let command = match (parts.next(), parts.next()) {
            (Some("r"), Some(id)) => {
                let id = id
                    .parse()
                    .map_err(|_| Error::InvalidCommand(format!("invalid channel number '{}'", id)))?;
                Self::Reload(id)
            }
            (Some("s"), None) => Self::Status,
            _ => return Err(Error::InvalidCommand(line.trim().to_string())),
        };

        if parts.next().is_some() {
            return Err(Error::InvalidCommand(line.trim().to_string()));
        }
        Ok(command)
    }
}

/// Read commands from `input` until EOF or cancellation.
///
/// Lines are decoded lossily, so garbage on the input is rejected like any
/// other invalid command and the listener keeps going.
pub async fn run_listener<R>(mut input: R, handle: ServiceHandle, cancellation_token: CancellationToken)
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = tokio::select! {
            _ = cancellation_token.cancelled() => break,
            read = input.read_until(b'\n', &mut buf) => read,
        };

        match read {
            Ok(0) => {
                info!("Admin input closed");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("Error reading admin input: {}", e);
                break;
            }
        }

        let line = String::from_utf8_lossy(&buf);
        if line.trim().is_empty() {
            continue;
        }

        match line.parse::<AdminCommand>() {
            Ok(command) => dispatch(command, handle.clone()),
            Err(e) => warn!("{}", e),
        }
    }
}

/// Listen on stdin.
pub fn spawn_stdin_listener(
    handle: ServiceHandle,
    cancellation_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(run_listener(
        BufReader::new(tokio::io::stdin()),
        handle,
        cancellation_token,
    ))
}

/// Run a command without blocking the listener; reloads can take as long
/// as an encoder takes to exit.
fn dispatch(command: AdminCommand, handle: ServiceHandle) {
    tokio::spawn(async move {
        match command {
            AdminCommand::Reload(id) => match handle.reload(id).await {
                Ok(instance) => info!(channel = %id, instance, "Reloaded"),
                Err(e) => warn!(channel = %id, "Reload failed: {}", e),
            },
            AdminCommand::Status => match handle.status().await {
                Ok(channels) => {
                    for status in channels {
                        info!(
                            channel = %status.id,
                            instance = status.instance,
                            pid = ?status.pid,
                            "{} {} {}",
                            status.name,
                            status.state,
                            status.params.udp_url()
                        );
                    }
                }
                Err(e) => warn!("Status unavailable: {}", e),
            },
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("r 2", AdminCommand::Reload(ChannelId::new(2).unwrap()))]
    #[case("  r   17  ", AdminCommand::Reload(ChannelId::new(17).unwrap()))]
    #[case("s", AdminCommand::Status)]
    fn test_parse_command(#[case] input: &str, #[case] expected: AdminCommand) {
        assert_eq!(input.parse::<AdminCommand>().unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("r")]
    #[case("r x")]
    #[case("r 0")]
    #[case("r 1 2")]
    #[case("reload 1")]
    #[case("q")]
    fn test_parse_invalid_command(#[case] input: &str) {
        assert!(matches!(
            input.parse::<AdminCommand>(),
            Err(Error::InvalidCommand(_))
        ));
    }
}
