//! Action Model - Atomic Schedule Instructions
//!
//! An [`Action`] is one atomic unit on a rank's timeline: a compute step
//! (forward, backward, weight update, or the fused form), a sharding step
//! (unshard/reshard of a stage's parameters), or a point-to-point
//! communication step (send/recv of activations or gradients).
//!
//! Actions serialize to compact string tokens such as `"2B1"` (backward,
//! stage 2, microbatch 1) or `"1UNSHARD"`. Formatting and parsing are mutual
//! inverses over the legal action space, which makes the token form suitable
//! for tests, logs, and the CSV exchange format.
//!
//! Idle slots in a timeline are represented as `None` in a
//! [`Vec<Option<Action>>`] row, never as a pseudo-action, so "no microbatch"
//! on `UNSHARD`/`RESHARD` can never be confused with "no action".
//!
//! @version 0.1.0

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, ScheduleError};

// =============================================================================
// Action Kind
// =============================================================================

/// The operation performed by an [`Action`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ActionKind {
    /// Forward compute for one microbatch.
    Forward,
    /// Backward compute for one microbatch.
    Backward,
    /// Weight update (optimizer step) for one microbatch's gradients.
    WeightUpdate,
    /// Fused backward + weight update, produced by the BW-merge pass.
    BackwardWeight,
    /// Gather a stage's sharded parameters before first use.
    Unshard,
    /// Release a stage's gathered parameters after last use.
    Reshard,
    /// Send forward activations to the next stage's rank.
    SendForward,
    /// Receive forward activations from the previous stage's rank.
    RecvForward,
    /// Send backward gradients to the previous stage's rank.
    SendBackward,
    /// Receive backward gradients from the next stage's rank.
    RecvBackward,
}

/// Kind tokens ordered longest-first so parsing is a longest-match scan
/// (`BW` before `B`, `SEND_F` before any bare letter).
const KIND_TOKENS: [(&str, ActionKind); 10] = [
    ("UNSHARD", ActionKind::Unshard),
    ("RESHARD", ActionKind::Reshard),
    ("SEND_F", ActionKind::SendForward),
    ("RECV_F", ActionKind::RecvForward),
    ("SEND_B", ActionKind::SendBackward),
    ("RECV_B", ActionKind::RecvBackward),
    ("BW", ActionKind::BackwardWeight),
    ("F", ActionKind::Forward),
    ("B", ActionKind::Backward),
    ("W", ActionKind::WeightUpdate),
];

impl ActionKind {
    /// All action kinds.
    pub const ALL: [ActionKind; 10] = [
        ActionKind::Forward,
        ActionKind::Backward,
        ActionKind::WeightUpdate,
        ActionKind::BackwardWeight,
        ActionKind::Unshard,
        ActionKind::Reshard,
        ActionKind::SendForward,
        ActionKind::RecvForward,
        ActionKind::SendBackward,
        ActionKind::RecvBackward,
    ];

    /// Returns the canonical token for this kind.
    #[must_use]
    pub const fn token(self) -> &'static str {
        match self {
            ActionKind::Forward => "F",
            ActionKind::Backward => "B",
            ActionKind::WeightUpdate => "W",
            ActionKind::BackwardWeight => "BW",
            ActionKind::Unshard => "UNSHARD",
            ActionKind::Reshard => "RESHARD",
            ActionKind::SendForward => "SEND_F",
            ActionKind::RecvForward => "RECV_F",
            ActionKind::SendBackward => "SEND_B",
            ActionKind::RecvBackward => "RECV_B",
        }
    }

    /// Returns true for forward/backward/weight-update compute kinds.
    #[must_use]
    pub const fn is_compute(self) -> bool {
        matches!(
            self,
            ActionKind::Forward
                | ActionKind::Backward
                | ActionKind::WeightUpdate
                | ActionKind::BackwardWeight
        )
    }

    /// Returns true for send/recv kinds.
    #[must_use]
    pub const fn is_comm(self) -> bool {
        matches!(
            self,
            ActionKind::SendForward
                | ActionKind::RecvForward
                | ActionKind::SendBackward
                | ActionKind::RecvBackward
        )
    }

    /// Returns true for unshard/reshard kinds.
    #[must_use]
    pub const fn is_sharding(self) -> bool {
        matches!(self, ActionKind::Unshard | ActionKind::Reshard)
    }

    /// Returns true for kinds that run backward compute (plain or fused).
    #[must_use]
    pub const fn runs_backward(self) -> bool {
        matches!(self, ActionKind::Backward | ActionKind::BackwardWeight)
    }

    /// Whether actions of this kind carry a microbatch index.
    /// Sharding kinds are stage-scoped; everything else is microbatch-scoped.
    #[must_use]
    pub const fn takes_microbatch(self) -> bool {
        !self.is_sharding()
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

// =============================================================================
// Action
// =============================================================================

/// One atomic scheduled unit on a rank's timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Action {
    /// The pipeline stage (not rank) this action belongs to.
    pub stage_index: usize,
    /// The operation to perform.
    pub kind: ActionKind,
    /// The microbatch operated on; `None` for unshard/reshard.
    pub microbatch_index: Option<usize>,
}

impl Action {
    /// Creates an action. The microbatch invariant is enforced at parse time
    /// and by the kind-specific constructors below.
    #[must_use]
    pub const fn new(stage_index: usize, kind: ActionKind, microbatch_index: Option<usize>) -> Self {
        Self {
            stage_index,
            kind,
            microbatch_index,
        }
    }

    /// Forward compute for `(stage, microbatch)`.
    #[must_use]
    pub const fn forward(stage_index: usize, microbatch_index: usize) -> Self {
        Self::new(stage_index, ActionKind::Forward, Some(microbatch_index))
    }

    /// Backward compute for `(stage, microbatch)`.
    #[must_use]
    pub const fn backward(stage_index: usize, microbatch_index: usize) -> Self {
        Self::new(stage_index, ActionKind::Backward, Some(microbatch_index))
    }

    /// Weight update for `(stage, microbatch)`.
    #[must_use]
    pub const fn weight_update(stage_index: usize, microbatch_index: usize) -> Self {
        Self::new(stage_index, ActionKind::WeightUpdate, Some(microbatch_index))
    }

    /// Fused backward + weight update for `(stage, microbatch)`.
    #[must_use]
    pub const fn fused_backward(stage_index: usize, microbatch_index: usize) -> Self {
        Self::new(stage_index, ActionKind::BackwardWeight, Some(microbatch_index))
    }

    /// Unshard of a stage's parameters.
    #[must_use]
    pub const fn unshard(stage_index: usize) -> Self {
        Self::new(stage_index, ActionKind::Unshard, None)
    }

    /// Reshard of a stage's parameters.
    #[must_use]
    pub const fn reshard(stage_index: usize) -> Self {
        Self::new(stage_index, ActionKind::Reshard, None)
    }

    /// Send of forward activations produced by `(stage, microbatch)`.
    #[must_use]
    pub const fn send_forward(stage_index: usize, microbatch_index: usize) -> Self {
        Self::new(stage_index, ActionKind::SendForward, Some(microbatch_index))
    }

    /// Receive of forward activations consumed by `(stage, microbatch)`.
    #[must_use]
    pub const fn recv_forward(stage_index: usize, microbatch_index: usize) -> Self {
        Self::new(stage_index, ActionKind::RecvForward, Some(microbatch_index))
    }

    /// Send of backward gradients produced by `(stage, microbatch)`.
    #[must_use]
    pub const fn send_backward(stage_index: usize, microbatch_index: usize) -> Self {
        Self::new(stage_index, ActionKind::SendBackward, Some(microbatch_index))
    }

    /// Receive of backward gradients consumed by `(stage, microbatch)`.
    #[must_use]
    pub const fn recv_backward(stage_index: usize, microbatch_index: usize) -> Self {
        Self::new(stage_index, ActionKind::RecvBackward, Some(microbatch_index))
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.stage_index, self.kind.token())?;
        if let Some(mb) = self.microbatch_index {
            write!(f, "{mb}")?;
        }
        Ok(())
    }
}

impl FromStr for Action {
    type Err = ScheduleError;

    /// Parses the canonical token form `<stage><KIND><microbatch?>`.
    ///
    /// Kind tokens are matched longest-first so that `BW` is never read as
    /// `B` followed by garbage, and `SEND_F`/`SEND_B` stay unambiguous.
    fn from_str(s: &str) -> Result<Self> {
        let malformed = || ScheduleError::MalformedAction {
            token: s.to_string(),
        };
        let token = s.trim();
        if token.is_empty() {
            return Err(malformed());
        }

        let digits_end = token
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(malformed)?;
        if digits_end == 0 {
            return Err(malformed());
        }
        let stage_index: usize = token[..digits_end].parse().map_err(|_| malformed())?;
        let rest = &token[digits_end..];

        for (kind_token, kind) in KIND_TOKENS {
            if let Some(tail) = rest.strip_prefix(kind_token) {
                let microbatch_index = if tail.is_empty() {
                    None
                } else {
                    Some(tail.parse().map_err(|_| malformed())?)
                };
                if kind.takes_microbatch() != microbatch_index.is_some() {
                    return Err(malformed());
                }
                return Ok(Self::new(stage_index, kind, microbatch_index));
            }
        }
        Err(malformed())
    }
}

// =============================================================================
// Schedule Containers
// =============================================================================

/// Per-rank schedule rows, timestep-aligned: `row[t]` is what the rank runs at
/// step `t`, with `None` marking an idle slot (a bubble).
pub type ComputeSchedule = BTreeMap<usize, Vec<Option<Action>>>;

/// Per-rank lowered schedule: a dense program with communication spliced in.
/// Lowering abandons timestep alignment, so idle slots are gone.
pub type CommSchedule = BTreeMap<usize, Vec<Action>>;

/// Parses one timeline cell: blank or whitespace-only tokens are idle slots.
pub fn parse_slot(s: &str) -> Result<Option<Action>> {
    if s.trim().is_empty() {
        return Ok(None);
    }
    s.parse().map(Some)
}

/// Wraps a dense schedule into slot rows, for passes and formatters that
/// operate on the aligned representation.
#[must_use]
pub fn to_slots(schedule: &CommSchedule) -> ComputeSchedule {
    schedule
        .iter()
        .map(|(rank, actions)| (*rank, actions.iter().copied().map(Some).collect()))
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_action_parse_reference_tokens() {
        let cases = [
            ("1F0", Action::forward(1, 0)),
            ("2B1", Action::backward(2, 1)),
            ("0W3", Action::weight_update(0, 3)),
            ("1UNSHARD", Action::unshard(1)),
            ("3RESHARD", Action::reshard(3)),
            ("2SEND_B2", Action::send_backward(2, 2)),
            ("1RECV_F1", Action::recv_forward(1, 1)),
        ];
        for (token, expected) in cases {
            let parsed: Action = token.parse().unwrap();
            assert_eq!(parsed, expected, "parsing {token}");
            assert_eq!(parsed.to_string(), token, "round trip of {token}");
        }
    }

    #[test]
    fn test_action_parse_fused_kind() {
        let parsed: Action = "0BW2".parse().unwrap();
        assert_eq!(parsed, Action::fused_backward(0, 2));
        assert_eq!(parsed.to_string(), "0BW2");
    }

    #[test]
    fn test_action_parse_rejects_malformed() {
        let bad = [
            "",
            "F0",         // missing stage index
            "1Z0",        // unknown kind
            "1F",         // compute kind without microbatch
            "1UNSHARD5",  // sharding kind with microbatch
            "12",         // no kind at all
            "1SEND_X0",   // unknown comm direction
            "1BWx",       // trailing garbage
        ];
        for token in bad {
            assert!(
                matches!(
                    token.parse::<Action>(),
                    Err(ScheduleError::MalformedAction { .. })
                ),
                "expected {token:?} to be rejected"
            );
        }
    }

    #[test]
    fn test_parse_slot_blank_is_idle() {
        assert_eq!(parse_slot("   ").unwrap(), None);
        assert_eq!(parse_slot("").unwrap(), None);
        assert_eq!(parse_slot("2F0").unwrap(), Some(Action::forward(2, 0)));
        assert!(parse_slot("2Q0").is_err());
    }

    #[test]
    fn test_kind_predicates() {
        assert!(ActionKind::Forward.is_compute());
        assert!(ActionKind::BackwardWeight.runs_backward());
        assert!(ActionKind::RecvBackward.is_comm());
        assert!(ActionKind::Unshard.is_sharding());
        assert!(!ActionKind::Unshard.takes_microbatch());
        assert!(ActionKind::SendForward.takes_microbatch());
    }

    proptest! {
        #[test]
        fn prop_action_round_trip(
            stage in 0usize..128,
            mb in 0usize..1024,
            kind_idx in 0usize..ActionKind::ALL.len(),
        ) {
            let kind = ActionKind::ALL[kind_idx];
            let microbatch = kind.takes_microbatch().then_some(mb);
            let action = Action::new(stage, kind, microbatch);
            let token = action.to_string();
            prop_assert_eq!(token.parse::<Action>().unwrap(), action);
        }
    }
}
