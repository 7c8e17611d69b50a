// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Sandbox state machine with typed state transitions.
//!
//! Implements the sandbox lifecycle: Starting → Running ⇄ Paused → Dying → Dead.
//! Invalid transitions result in StateTransitionError.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::StateTransitionError;
use crate::types::SandboxId;

/// Sandbox lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SandboxState {
    /// Backend create in progress.
    Starting,

    /// Unfrozen and able to serve requests.
    Running,

    /// Frozen; idle connections closed.
    Paused,

    /// Destroy requested while descendants are still alive.
    Dying,

    /// Backend resources released. Terminal.
    Dead,
}

impl SandboxState {
    /// Get the state name for error messages.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::Dying => "Dying",
            Self::Dead => "Dead",
        }
    }

    /// Check if transition to the target state is valid.
    pub fn can_transition_to(&self, target: SandboxState) -> bool {
        matches!(
            (self, target),
            // From Starting
            (Self::Starting, Self::Running) |
            (Self::Starting, Self::Dead) |
            // From Running
            (Self::Running, Self::Paused) |
            (Self::Running, Self::Dying) |
            (Self::Running, Self::Dead) |
            // From Paused
            (Self::Paused, Self::Running) |
            (Self::Paused, Self::Dying) |
            (Self::Paused, Self::Dead) |
            // From Dying
            (Self::Dying, Self::Dead)
        )
    }

    /// Whether the sandbox may still serve a request.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// State machine for a sandbox's lifecycle.
#[derive(Debug)]
pub struct SandboxStateMachine {
    sandbox: SandboxId,
    current_state: SandboxState,
    last_transition: Instant,
}

impl SandboxStateMachine {
    pub fn new(sandbox: SandboxId) -> Self {
        Self {
            sandbox,
            current_state: SandboxState::Starting,
            last_transition: Instant::now(),
        }
    }

    pub fn state(&self) -> SandboxState {
        self.current_state
    }

    pub fn time_in_current_state(&self) -> std::time::Duration {
        self.last_transition.elapsed()
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&mut self, target: SandboxState) -> Result<(), StateTransitionError> {
        if !self.current_state.can_transition_to(target) {
            return Err(StateTransitionError::InvalidTransition {
                sandbox: self.sandbox,
                from: self.current_state.name(),
                to: target.name(),
            });
        }

        tracing::trace!(
            sandbox = %self.sandbox,
            from = self.current_state.name(),
            to = target.name(),
            "State transition"
        );

        self.current_state = target;
        self.last_transition = Instant::now();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let sm = SandboxStateMachine::new(SandboxId::new(1));
        assert_eq!(sm.state(), SandboxState::Starting);
        assert!(!sm.state().is_live());
    }

    #[test]
    fn test_valid_transitions() {
        let mut sm = SandboxStateMachine::new(SandboxId::new(1));

        assert!(sm.transition_to(SandboxState::Running).is_ok());
        assert!(sm.transition_to(SandboxState::Paused).is_ok());
        assert!(sm.transition_to(SandboxState::Running).is_ok());
        assert!(sm.transition_to(SandboxState::Dying).is_ok());
        assert!(sm.transition_to(SandboxState::Dead).is_ok());
        assert_eq!(sm.state(), SandboxState::Dead);
    }

    #[test]
    fn test_dead_is_terminal() {
        let mut sm = SandboxStateMachine::new(SandboxId::new(7));
        sm.transition_to(SandboxState::Dead).unwrap();

        for target in [
            SandboxState::Running,
            SandboxState::Paused,
            SandboxState::Dying,
            SandboxState::Starting,
        ] {
            assert!(sm.transition_to(target).is_err());
        }
    }

    #[test]
    fn test_dying_cannot_resume() {
        let mut sm = SandboxStateMachine::new(SandboxId::new(2));
        sm.transition_to(SandboxState::Running).unwrap();
        sm.transition_to(SandboxState::Dying).unwrap();

        let err = sm.transition_to(SandboxState::Running).unwrap_err();
        assert!(err.to_string().contains("SB-2"));
        assert_eq!(sm.state(), SandboxState::Dying);
    }
}
