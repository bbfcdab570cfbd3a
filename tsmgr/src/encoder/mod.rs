//! External process invocation.
//!
//! This module defines the `ProcessLauncher` trait, the ffmpeg launcher used
//! for channel encoders, and the `EncoderProcess` handle wrapping a spawned
//! child.

mod ffmpeg;
mod process;
mod traits;

pub use ffmpeg::FfmpegEncoder;
pub use process::{EncoderProcess, ExitReport, SpawnOptions, wait_for_exit};
pub use traits::ProcessLauncher;
