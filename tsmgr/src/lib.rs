//! tsmgr library crate.
//!
//! Supervises a set of ffmpeg broadcast encoders, each producing one MPEG-TS
//! service over UDP multicast, and optionally a `tsp` process that merges
//! them into a single multiplex.

pub mod admin;
pub mod channel;
pub mod config;
pub mod encoder;
pub mod error;
pub mod logging;
pub mod merge;
pub mod supervisor;

pub use error::{Error, Result};
