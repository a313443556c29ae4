//! Sequencer state machine
//!
//! Authoritative record of where an installer sequence is. Transitions only
//! move forward one state at a time; `Failed` is reachable from any
//! non-terminal state and is terminal.
//!
//! ```text
//! Created
//!     ↓
//! Bootstrapping
//!     ↓
//! ModulesApplying
//!     ↓
//! PackagesApplying
//!     ↓
//! CustomStepsApplying
//!     ↓
//! Finalizing
//!     ↓
//! Done
//!
//! (Any non-terminal state can transition to Failed)
//! ```

use crate::error::StepError;
use std::fmt;
use thiserror::Error;

/// Phase of an installer sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum SequencePhase {
    Created = 0,
    Bootstrapping = 1,
    ModulesApplying = 2,
    PackagesApplying = 3,
    CustomStepsApplying = 4,
    Finalizing = 5,
    Done = 6,
}

impl SequencePhase {
    #[inline]
    pub const fn order(self) -> u8 {
        self as u8
    }

    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Created => Some(Self::Bootstrapping),
            Self::Bootstrapping => Some(Self::ModulesApplying),
            Self::ModulesApplying => Some(Self::PackagesApplying),
            Self::PackagesApplying => Some(Self::CustomStepsApplying),
            Self::CustomStepsApplying => Some(Self::Finalizing),
            Self::Finalizing => Some(Self::Done),
            Self::Done => None,
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Bootstrapping => "Bootstrapping",
            Self::ModulesApplying => "Applying modules",
            Self::PackagesApplying => "Applying packages",
            Self::CustomStepsApplying => "Applying custom steps",
            Self::Finalizing => "Finalizing",
            Self::Done => "Done",
        }
    }

    pub const fn all() -> &'static [Self] {
        &[
            Self::Created,
            Self::Bootstrapping,
            Self::ModulesApplying,
            Self::PackagesApplying,
            Self::CustomStepsApplying,
            Self::Finalizing,
            Self::Done,
        ]
    }
}

impl fmt::Display for SequencePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Current state, including the failure record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceState {
    Running(SequencePhase),
    Failed {
        /// Phase the sequence was in when the step failed.
        phase: SequencePhase,
        step: String,
        cause: StepError,
    },
}

impl SequenceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::Running(SequencePhase::Done))
    }
}

impl fmt::Display for SequenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running(phase) => write!(f, "{}", phase),
            Self::Failed { step, cause, .. } => write!(f, "Failed at {}: {}", step, cause),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SequenceTransitionError {
    #[error("cannot skip from {from} to {to}")]
    SkippedPhase { from: SequencePhase, to: SequencePhase },

    #[error("cannot go backwards from {from} to {to}")]
    BackwardTransition { from: SequencePhase, to: SequencePhase },

    #[error("sequence already finished ({0})")]
    FromTerminalState(String),

    #[error("already at {0}")]
    AlreadyAtPhase(SequencePhase),
}

impl From<SequenceTransitionError> for crate::error::LiveforgeError {
    fn from(err: SequenceTransitionError) -> Self {
        crate::error::LiveforgeError::Transition(err.to_string())
    }
}

/// Tracks the state of one sequence run.
#[derive(Debug, Clone)]
pub struct SequenceTracker {
    state: SequenceState,
    history: Vec<SequencePhase>,
}

impl Default for SequenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self {
            state: SequenceState::Running(SequencePhase::Created),
            history: Vec::with_capacity(SequencePhase::all().len()),
        }
    }

    pub fn state(&self) -> &SequenceState {
        &self.state
    }

    /// Current phase, or the phase a failure happened in.
    pub fn phase(&self) -> SequencePhase {
        match &self.state {
            SequenceState::Running(phase) => *phase,
            SequenceState::Failed { phase, .. } => *phase,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == SequenceState::Running(SequencePhase::Done)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, SequenceState::Failed { .. })
    }

    /// Phases entered so far, in order.
    pub fn history(&self) -> &[SequencePhase] {
        &self.history
    }

    /// Move to `target`, which must be the immediate next phase.
    pub fn transition_to(&mut self, target: SequencePhase) -> Result<(), SequenceTransitionError> {
        let current = match &self.state {
            SequenceState::Running(phase) if *phase != SequencePhase::Done => *phase,
            other => return Err(SequenceTransitionError::FromTerminalState(other.to_string())),
        };
        if target == current {
            return Err(SequenceTransitionError::AlreadyAtPhase(target));
        }
        if target.order() < current.order() {
            return Err(SequenceTransitionError::BackwardTransition { from: current, to: target });
        }
        if current.next() != Some(target) {
            return Err(SequenceTransitionError::SkippedPhase { from: current, to: target });
        }
        tracing::debug!("Sequence phase: {} -> {}", current, target);
        self.history.push(target);
        self.state = SequenceState::Running(target);
        Ok(())
    }

    /// Record a fatal step failure.
    pub fn fail(&mut self, step: &str, cause: StepError) -> Result<(), SequenceTransitionError> {
        if self.state.is_terminal() {
            return Err(SequenceTransitionError::FromTerminalState(self.state.to_string()));
        }
        self.state = SequenceState::Failed {
            phase: self.phase(),
            step: step.to_string(),
            cause,
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_chain_reaches_done() {
        let mut current = SequencePhase::Created;
        let mut count = 0;
        while let Some(next) = current.next() {
            assert_eq!(next.order(), current.order() + 1);
            current = next;
            count += 1;
        }
        assert_eq!(current, SequencePhase::Done);
        assert_eq!(count, 6);
    }

    #[test]
    fn test_walk_all_phases() {
        let mut tracker = SequenceTracker::new();
        for phase in &SequencePhase::all()[1..] {
            tracker.transition_to(*phase).unwrap();
        }
        assert!(tracker.is_done());
        assert_eq!(tracker.history().len(), 6);
    }

    #[test]
    fn test_cannot_skip_phase() {
        let mut tracker = SequenceTracker::new();
        let err = tracker.transition_to(SequencePhase::ModulesApplying).unwrap_err();
        assert!(matches!(err, SequenceTransitionError::SkippedPhase { .. }));
    }

    #[test]
    fn test_cannot_go_backwards_or_repeat() {
        let mut tracker = SequenceTracker::new();
        tracker.transition_to(SequencePhase::Bootstrapping).unwrap();
        tracker.transition_to(SequencePhase::ModulesApplying).unwrap();
        assert!(matches!(
            tracker.transition_to(SequencePhase::Bootstrapping),
            Err(SequenceTransitionError::BackwardTransition { .. })
        ));
        assert!(matches!(
            tracker.transition_to(SequencePhase::ModulesApplying),
            Err(SequenceTransitionError::AlreadyAtPhase(_))
        ));
    }

    #[test]
    fn test_failed_is_terminal() {
        let mut tracker = SequenceTracker::new();
        tracker.transition_to(SequencePhase::Bootstrapping).unwrap();
        tracker.fail("welcome", StepError::Cancelled).unwrap();
        assert!(tracker.is_failed());
        assert_eq!(tracker.phase(), SequencePhase::Bootstrapping);
        assert!(tracker.transition_to(SequencePhase::ModulesApplying).is_err());
        assert!(tracker.fail("welcome", StepError::Cancelled).is_err());
    }

    #[test]
    fn test_cannot_fail_after_done() {
        let mut tracker = SequenceTracker::new();
        for phase in &SequencePhase::all()[1..] {
            tracker.transition_to(*phase).unwrap();
        }
        assert!(tracker.fail("finished", StepError::Cancelled).is_err());
    }
}
