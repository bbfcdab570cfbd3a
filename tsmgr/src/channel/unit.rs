//! Channel unit: one channel's configuration, parameters and process.

use std::sync::Arc;

use super::params::MuxParams;
use super::source::{PipelineDescriptor, build_descriptor};
use super::state::LifecycleState;
use super::ChannelId;
use crate::Result;
use crate::config::ChannelConfig;
use crate::encoder::EncoderProcess;

/// A supervised channel instance.
///
/// A reload replaces the whole unit; the replacement carries the next
/// instance number.
#[derive(Debug)]
pub struct ChannelUnit {
    instance: u32,
    config: Arc<ChannelConfig>,
    params: MuxParams,
    descriptor: Option<Arc<PipelineDescriptor>>,
    process: Option<EncoderProcess>,
    state: LifecycleState,
}

impl ChannelUnit {
    /// Create a unit in `Created` state.
    pub fn new(instance: u32, config: Arc<ChannelConfig>, params: MuxParams) -> Self {
        Self {
            instance,
            config,
            params,
            descriptor: None,
            process: None,
            state: LifecycleState::Created,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.config.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn instance(&self) -> u32 {
        self.instance
    }

    pub fn config(&self) -> &Arc<ChannelConfig> {
        &self.config
    }

    pub fn params(&self) -> &MuxParams {
        &self.params
    }

    pub fn descriptor(&self) -> Option<&Arc<PipelineDescriptor>> {
        self.descriptor.as_ref()
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn process(&self) -> Option<&EncoderProcess> {
        self.process.as_ref()
    }

    /// Build the pipeline descriptor and move to `Configured`.
    ///
    /// On failure the unit stays in `Created`.
    pub fn configure(&mut self) -> Result<()> {
        let descriptor = build_descriptor(&self.config)?;
        self.state = self.state.transition_to(LifecycleState::Configured)?;
        self.descriptor = Some(Arc::new(descriptor));
        Ok(())
    }

    /// Move to `target`, returning the previous state.
    pub fn transition(&mut self, target: LifecycleState) -> Result<LifecycleState> {
        let from = self.state;
        self.state = from.transition_to(target)?;
        Ok(from)
    }

    /// Attach a freshly spawned process, replacing any previous handle.
    pub fn attach(&mut self, process: EncoderProcess) {
        self.process = Some(process);
    }

    /// Detach the process handle.
    pub fn take_process(&mut self) -> Option<EncoderProcess> {
        self.process.take()
    }
}
