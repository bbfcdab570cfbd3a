//! Channels: identity, multiplex parameters, sources and lifecycle.

pub mod identity;
pub mod params;
pub mod source;
pub mod state;
pub mod unit;

pub use identity::ChannelId;
pub use params::{MuxLayout, MuxParams, ParameterAllocator, TableVersion};
pub use source::{
    CaptureBackend, CaptureInput, Overlay, PipelineDescriptor, SourceKind, SourceType,
    VideoFormat, VideoPreset, build_descriptor,
};
pub use state::LifecycleState;
pub use unit::ChannelUnit;
