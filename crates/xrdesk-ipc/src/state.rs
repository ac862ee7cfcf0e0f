//! Capture worker state machine types.

use serde::{Deserialize, Serialize};

/// The state of one monitor's capture thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureState {
    /// The OS duplication handle has not been opened yet.
    #[default]
    AwaitingDuplicationHandle,

    /// Waiting on the OS for the next frame.
    Polling,

    /// A frame was delivered and the thread waits for the host to consume it.
    FrameReady,

    /// The last poll timed out or produced nothing to deliver.
    NoChange,

    /// Capture failed; terminal.
    Failed,

    /// Shut down on request; terminal.
    Terminated,
}

impl CaptureState {
    /// Returns true if the worker will not produce any more frames.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Terminated)
    }

    /// Returns true if the state can be entered from `self`.
    pub fn can_transition_to(self, next: Self) -> bool {
        use CaptureState::*;

        if self.is_terminal() {
            return false;
        }
        match next {
            AwaitingDuplicationHandle => false,
            Polling => true,
            FrameReady | NoChange => self == Polling,
            Failed | Terminated => true,
        }
    }

    /// Returns a simple string representation of the state.
    pub fn name(self) -> &'static str {
        match self {
            Self::AwaitingDuplicationHandle => "AwaitingDuplicationHandle",
            Self::Polling => "Polling",
            Self::FrameReady => "FrameReady",
            Self::NoChange => "NoChange",
            Self::Failed => "Failed",
            Self::Terminated => "Terminated",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_are_sticky() {
        assert!(!CaptureState::Failed.can_transition_to(CaptureState::Polling));
        assert!(!CaptureState::Terminated.can_transition_to(CaptureState::Failed));
    }

    #[test]
    fn test_frames_only_come_from_polling() {
        assert!(CaptureState::Polling.can_transition_to(CaptureState::FrameReady));
        assert!(!CaptureState::AwaitingDuplicationHandle.can_transition_to(CaptureState::FrameReady));
        assert!(CaptureState::AwaitingDuplicationHandle.can_transition_to(CaptureState::Polling));
        assert!(CaptureState::NoChange.can_transition_to(CaptureState::Polling));
    }
}
