//! Process launcher trait.

use tokio::process::Command;

use crate::Result;

/// Builds the command line for an external process from some target.
///
/// The supervisor owns spawning and waiting; a launcher only decides what to
/// run. `T` is the thing being launched, a channel unit for encoders or a
/// merge topology for the combiner.
pub trait ProcessLauncher<T: ?Sized>: Send + Sync {
    /// Program the launcher runs, used for dependency checks and logging.
    fn program(&self) -> &str;

    /// Build the command for `target`.
    fn build_command(&self, target: &T) -> Result<Command>;
}
