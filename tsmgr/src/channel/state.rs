//! Channel lifecycle state machine.

use serde::{Deserialize, Serialize};

use crate::Error;

/// Lifecycle of one channel unit instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    /// Parameters allocated, pipeline descriptor not (yet) built.
    #[default]
    Created,
    /// Descriptor built, ready to spawn.
    Configured,
    /// Encoder process is alive.
    Running,
    /// Encoder process is gone (or never spawned) and should be restarted.
    Exited,
    /// Supervisor is respawning the encoder.
    Restarting,
    /// Stopped administratively. Terminal for this instance.
    Stopped,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Configured => "CONFIGURED",
            Self::Running => "RUNNING",
            Self::Exited => "EXITED",
            Self::Restarting => "RESTARTING",
            Self::Stopped => "STOPPED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// Validate a state transition.
    pub fn can_transition_to(&self, target: LifecycleState) -> bool {
        use LifecycleState::*;

        match (self, target) {
            (Created, Configured) => true,
            (Configured, Running) => true,
            // First spawn failed
            (Configured, Exited) => true,
            (Running, Exited) => true,
            (Exited, Restarting) => true,
            (Restarting, Running) => true,
            // Restart spawn failed
            (Restarting, Exited) => true,

            (Stopped, _) => false,
            (_, Stopped) => true,

            _ => false,
        }
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&self, target: LifecycleState) -> Result<LifecycleState, Error> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(Error::InvalidStateTransition {
                from: self.as_str().to_string(),
                to: target.as_str().to_string(),
            })
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
