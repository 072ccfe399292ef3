//! Channel lifecycle state

use std::time::Instant;

/// Channel state machine
///
/// A channel is created `Idle`, runs between `start` and `stop`, may be
/// restarted after a stop (flush then start), and ends `Released`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Created, not configured yet
    Idle,

    /// Accepting input and delivering output
    Running {
        /// When the channel was started
        started_at: Instant,
    },

    /// Stopped; queueing is rejected until the next start
    Stopped,

    /// A fatal error was reported; only reset, stop or release are useful
    Errored,

    /// Resources released; terminal
    Released,
}

impl ChannelState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &ChannelState) -> bool {
        use ChannelState::*;

        match (self, target) {
            (Released, _) => false,
            (_, Released) => true,

            (Idle, Running { .. }) => true,
            (Idle, Stopped) => true,

            (Running { .. }, Stopped) => true,
            (Running { .. }, Errored) => true,

            (Stopped, Running { .. }) => true,
            (Stopped, Errored) => true,

            // Reset brings an errored channel back to stopped
            (Errored, Stopped) => true,

            (a, b) if a == b => true,

            _ => false,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ChannelState::Idle => "Idle",
            ChannelState::Running { .. } => "Running",
            ChannelState::Stopped => "Stopped",
            ChannelState::Errored => "Errored",
            ChannelState::Released => "Released",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ChannelState::Running { .. })
    }

    pub fn is_errored(&self) -> bool {
        matches!(self, ChannelState::Errored)
    }

    pub fn is_released(&self) -> bool {
        matches!(self, ChannelState::Released)
    }

    /// Get the duration since the channel started (if running)
    pub fn running_duration(&self) -> Option<std::time::Duration> {
        if let ChannelState::Running { started_at } = self {
            Some(started_at.elapsed())
        } else {
            None
        }
    }
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}
