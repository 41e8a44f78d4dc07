//! Error Types - Pipeplan Error Handling
//!
//! Provides the error taxonomy for schedule construction, lowering,
//! simulation, and validation. All errors are fatal to the step that raised
//! them; schedule construction is deterministic, so nothing here is retried
//! internally.
//!
//! @version 0.1.0

use thiserror::Error;

use crate::action::Action;

/// Result type for pipeplan operations.
pub type Result<T> = std::result::Result<T, ScheduleError>;

// =============================================================================
// Error Types
// =============================================================================

/// The main error type for schedule construction and analysis.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// Illegal shape parameters. Raised before any schedule is built.
    #[error("invalid pipeline configuration: {reason}")]
    Configuration {
        /// Human-readable description of the illegal shape.
        reason: String,
    },

    /// An action token did not match the `<stage><KIND><microbatch?>` grammar.
    #[error("malformed action token: {token:?}")]
    MalformedAction {
        /// The offending token.
        token: String,
    },

    /// A completed schedule violated an ordering or completeness invariant.
    #[error("schedule invariant violated on rank {rank}{}: {detail}", fmt_action(action))]
    Invariant {
        /// Rank whose timeline holds the offending action.
        rank: usize,
        /// The offending action, when one can be singled out.
        action: Option<Action>,
        /// Description of the violated invariant.
        detail: String,
    },

    /// The simulator found a state where no rank can progress.
    #[error("pipeline deadlock: {}", fmt_stalls(stalled))]
    Deadlock {
        /// Each stalled rank with the action it is blocked on.
        stalled: Vec<(usize, Action)>,
    },

    /// Failure while reading or writing the serialized schedule format.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ScheduleError {
    /// Builds a configuration error from a formatted reason.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Builds an invariant error for a specific rank and action.
    pub fn invariant(rank: usize, action: Option<Action>, detail: impl Into<String>) -> Self {
        Self::Invariant {
            rank,
            action,
            detail: detail.into(),
        }
    }
}

fn fmt_action(action: &Option<Action>) -> String {
    match action {
        Some(a) => format!(" at {a}"),
        None => String::new(),
    }
}

fn fmt_stalls(stalled: &[(usize, Action)]) -> String {
    let parts: Vec<String> = stalled
        .iter()
        .map(|(rank, action)| format!("rank {rank} blocked on {action}"))
        .collect();
    parts.join(", ")
}

// =============================================================================
// Tests
// =============================================================================
