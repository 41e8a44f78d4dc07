//! Lowering Passes - Compute Schedules to Executable Schedules
//!
//! Rewrites compute-only schedules into fully executable per-rank programs:
//!
//! 1. [`add_unshard_reshard`] - single-rank insertion of parameter
//!    unshard/reshard actions around each stage's window of use.
//! 2. [`merge_bw`] - single-rank fusion of adjacent backward + weight-update
//!    pairs into one fused action.
//! 3. [`add_send_recv`] - the cross-rank pass splicing matching send/recv
//!    pairs into producer and consumer timelines.
//!
//! Lowering abandons the timestep-aligned form: idle slots are dropped and
//! each rank's output is a dense program. No pass ever reorders two compute
//! actions of the same rank relative to each other.
//!
//! @version 0.1.0

use std::collections::{BTreeMap, VecDeque};

use tracing::debug;

use crate::action::{Action, ActionKind, CommSchedule, ComputeSchedule};
use crate::error::{Result, ScheduleError};

/// Default cap on concurrently-unsharded stages per rank.
pub const DEFAULT_MAX_ACTIVE_STAGES: usize = 3;

// =============================================================================
// Sharding Insertion
// =============================================================================

/// Inserts `UNSHARD`/`RESHARD` actions into one rank's compute schedule.
///
/// A stage's parameters are active from its `UNSHARD` to the matching
/// `RESHARD`. The pass looks ahead for the next `max_active_stages` distinct
/// stages the rank will touch, resharding stages that fell out of that window
/// and unsharding upcoming ones, so each unshard overlaps preceding compute.
/// At most one unshard is in flight per stage, and every unshard is closed by
/// exactly one reshard.
#[must_use]
pub fn add_unshard_reshard(
    compute_actions: &[Option<Action>],
    max_active_stages: usize,
) -> Vec<Action> {
    let window = max_active_stages.max(1);
    // Insertion-ordered so eviction is deterministic.
    let mut active: Vec<usize> = Vec::new();
    let mut out: Vec<Action> = Vec::new();

    for (i, action) in compute_actions.iter().enumerate() {
        let Some(action) = action else { continue };

        let mut upcoming: Vec<usize> = Vec::new();
        for next in compute_actions[i..].iter().flatten() {
            if !upcoming.contains(&next.stage_index) {
                upcoming.push(next.stage_index);
                if upcoming.len() == window {
                    break;
                }
            }
        }

        let evict: Vec<usize> = active
            .iter()
            .copied()
            .filter(|stage| !upcoming.contains(stage))
            .collect();
        for stage in evict {
            active.retain(|s| *s != stage);
            out.push(Action::reshard(stage));
        }
        for &stage in &upcoming {
            if !active.contains(&stage) {
                active.push(stage);
                out.push(Action::unshard(stage));
            }
        }
        out.push(*action);
    }

    for stage in active {
        out.push(Action::reshard(stage));
    }
    out
}

// =============================================================================
// Backward/Weight-Update Merge
// =============================================================================

/// Fuses adjacent `B`/`W` pairs for the same `(stage, microbatch)` into a
/// single `BW` action. Idle slots between the two do not block the fusion;
/// any other intervening action does. Applying the pass twice yields the
/// same result as applying it once.
#[must_use]
pub fn merge_bw(compute_actions: &[Option<Action>]) -> Vec<Action> {
    let mut out: Vec<Action> = Vec::new();
    let mut iter = compute_actions.iter().flatten().copied().peekable();
    while let Some(action) = iter.next() {
        if action.kind == ActionKind::Backward {
            let fusable = iter.peek().is_some_and(|next| {
                next.kind == ActionKind::WeightUpdate
                    && next.stage_index == action.stage_index
                    && next.microbatch_index == action.microbatch_index
            });
            if fusable {
                iter.next();
                out.push(Action::new(
                    action.stage_index,
                    ActionKind::BackwardWeight,
                    action.microbatch_index,
                ));
                continue;
            }
        }
        out.push(action);
    }
    out
}

// =============================================================================
// Send/Recv Insertion
// =============================================================================

/// Whether this action produces an activation or gradient that leaves its
/// stage.
fn has_comms(action: &Action, num_stages: usize) -> bool {
    match action.kind {
        ActionKind::Forward => action.stage_index + 1 != num_stages,
        ActionKind::Backward | ActionKind::BackwardWeight => action.stage_index != 0,
        _ => false,
    }
}

/// The send/recv pair generated by a producing action.
fn comm_pair(action: &Action) -> (Action, Action) {
    let stage = action.stage_index;
    let mb = action.microbatch_index;
    if action.kind == ActionKind::Forward {
        (
            Action::new(stage, ActionKind::SendForward, mb),
            Action::new(stage + 1, ActionKind::RecvForward, mb),
        )
    } else {
        (
            Action::new(stage, ActionKind::SendBackward, mb),
            Action::new(stage - 1, ActionKind::RecvBackward, mb),
        )
    }
}

/// Whether a rank may append `action` to its lowered program, given what is
/// already placed there. A forward on a non-first stage needs its recv (or,
/// for a same-rank hand-off, the producing forward) placed first; symmetric
/// for backwards. Recvs are placed by the producing rank, so readiness here
/// is what serializes the cross-rank splice.
fn ready_to_schedule<F>(
    action: &Action,
    rank: usize,
    placed: &CommSchedule,
    stage_to_rank: &F,
    num_stages: usize,
) -> bool
where
    F: Fn(usize) -> usize,
{
    let own = placed.get(&rank).map(Vec::as_slice).unwrap_or(&[]);
    let contains = |needle: Action| own.contains(&needle);
    let Some(mb) = action.microbatch_index else {
        return true;
    };
    let stage = action.stage_index;
    match action.kind {
        ActionKind::Forward if stage != 0 => {
            if stage_to_rank(stage - 1) == rank {
                contains(Action::forward(stage - 1, mb))
            } else {
                contains(Action::recv_forward(stage, mb))
            }
        }
        ActionKind::Backward | ActionKind::BackwardWeight if stage + 1 != num_stages => {
            if stage_to_rank(stage + 1) == rank {
                contains(Action::backward(stage + 1, mb))
                    || contains(Action::fused_backward(stage + 1, mb))
            } else {
                contains(Action::recv_backward(stage, mb))
            }
        }
        _ => true,
    }
}

/// Splices send/recv actions into a multi-rank compute schedule.
///
/// Ranks are visited round-robin; whenever a rank places a producing forward
/// or backward, the matching send is appended to the producer's timeline and
/// the recv to the consumer's, in the same breath. Same-rank hand-offs get no
/// communication actions. Each rank's original compute order is preserved.
pub fn add_send_recv<F>(
    compute: &ComputeSchedule,
    stage_to_rank: F,
    num_stages: usize,
) -> Result<CommSchedule>
where
    F: Fn(usize) -> usize,
{
    let mut pending: BTreeMap<usize, VecDeque<Option<Action>>> = compute
        .iter()
        .map(|(rank, row)| (*rank, row.iter().copied().collect()))
        .collect();
    let mut out: CommSchedule = compute.keys().map(|rank| (*rank, Vec::new())).collect();

    while !pending.is_empty() {
        let mut progress = false;
        let ranks: Vec<usize> = pending.keys().copied().collect();
        for rank in ranks {
            let Some(queue) = pending.get_mut(&rank) else {
                continue;
            };
            match queue.front().copied() {
                // Idle slots are alignment padding; lowering drops them.
                Some(None) => {
                    queue.pop_front();
                    progress = true;
                }
                Some(Some(action)) => {
                    if !ready_to_schedule(&action, rank, &out, &stage_to_rank, num_stages) {
                        continue;
                    }
                    queue.pop_front();
                    progress = true;
                    out.entry(rank).or_default().push(action);
                    if has_comms(&action, num_stages) {
                        let (send, recv) = comm_pair(&action);
                        let src = stage_to_rank(send.stage_index);
                        let dst = stage_to_rank(recv.stage_index);
                        if src != dst {
                            out.entry(src).or_default().push(send);
                            out.entry(dst).or_default().push(recv);
                        }
                    }
                }
                None => {}
            }
            if pending.get(&rank).is_some_and(VecDeque::is_empty) {
                pending.remove(&rank);
            }
        }
        if !progress {
            let (rank, queue) = pending
                .iter()
                .next()
                .ok_or_else(|| ScheduleError::invariant(0, None, "no pending rank"))?;
            let action = queue.front().copied().flatten();
            return Err(ScheduleError::invariant(
                *rank,
                action,
                "malformed compute schedule: cannot place sends/recvs without reordering",
            ));
        }
    }
    Ok(out)
}

// =============================================================================
// Lowering Pipeline
// =============================================================================

/// Options controlling the lowering pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LowerOptions {
    /// Insert unshard/reshard actions for sharded parameters.
    pub insert_sharding: bool,
    /// Fuse adjacent backward + weight-update pairs.
    pub merge_backward: bool,
    /// Cap on concurrently-unsharded stages per rank.
    pub max_active_stages: usize,
}

impl Default for LowerOptions {
    fn default() -> Self {
        Self {
            insert_sharding: true,
            merge_backward: true,
            max_active_stages: DEFAULT_MAX_ACTIVE_STAGES,
        }
    }
}

/// Runs the full lowering pipeline: sharding insertion, then backward
/// merging, then send/recv insertion.
pub fn lower<F>(
    compute: &ComputeSchedule,
    options: &LowerOptions,
    stage_to_rank: F,
    num_stages: usize,
) -> Result<CommSchedule>
where
    F: Fn(usize) -> usize,
{
    debug!("lowering schedule for {} rank(s): {options:?}", compute.len());
    let mut staged: ComputeSchedule = BTreeMap::new();
    for (rank, row) in compute {
        let mut slots: Vec<Option<Action>> = if options.insert_sharding {
            add_unshard_reshard(row, options.max_active_stages)
                .into_iter()
                .map(Some)
                .collect()
        } else {
            row.clone()
        };
        if options.merge_backward {
            slots = merge_bw(&slots).into_iter().map(Some).collect();
        }
        staged.insert(*rank, slots);
    }
    add_send_recv(&staged, stage_to_rank, num_stages)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::parse_slot;

    fn parse_row(tokens: &[&str]) -> Vec<Option<Action>> {
        tokens.iter().map(|t| parse_slot(t).unwrap()).collect()
    }

    fn parse_dense(tokens: &[&str]) -> Vec<Action> {
        tokens.iter().map(|t| t.parse().unwrap()).collect()
    }

    #[test]
    fn test_unshard_reshard_single_stage() {
        let compute = parse_row(&["0F0", "0F1", "   ", "0B0", "0B1"]);
        let lowered = add_unshard_reshard(&compute, DEFAULT_MAX_ACTIVE_STAGES);
        assert_eq!(
            lowered,
            parse_dense(&["0UNSHARD", "0F0", "0F1", "0B0", "0B1", "0RESHARD"])
        );
    }

    #[test]
    fn test_unshard_reshard_evicts_beyond_window() {
        // Four stages but a window of two: stage 0 must be resharded before
        // stage 2 is fetched, and re-unsharded for its backward.
        let compute = parse_row(&["0F0", "1F0", "2F0", "3F0", "3B0", "2B0", "1B0", "0B0"]);
        let lowered = add_unshard_reshard(&compute, 2);

        // Balanced: each unshard is closed by exactly one reshard.
        let mut active: Vec<usize> = Vec::new();
        for action in &lowered {
            match action.kind {
                ActionKind::Unshard => {
                    assert!(!active.contains(&action.stage_index), "double unshard");
                    active.push(action.stage_index);
                }
                ActionKind::Reshard => {
                    assert!(active.contains(&action.stage_index), "unmatched reshard");
                    active.retain(|s| *s != action.stage_index);
                }
                _ => {
                    assert!(
                        active.contains(&action.stage_index),
                        "{action} ran while its stage was sharded"
                    );
                    assert!(active.len() <= 2, "window exceeded: {active:?}");
                }
            }
        }
        assert!(active.is_empty(), "dangling unshard(s): {active:?}");
        assert!(lowered.iter().any(|a| a.kind == ActionKind::Reshard));
    }

    #[test]
    fn test_merge_bw_reference_sequence() {
        let compute = parse_row(&[
            "0F0", "0F1", "0F2", "0B0", "0B1", "0W0", "0B2", "0W2", "0W1",
        ]);
        let merged = merge_bw(&compute);
        assert_eq!(
            merged,
            parse_dense(&["0F0", "0F1", "0F2", "0B0", "0B1", "0W0", "0BW2", "0W1"])
        );
    }

    #[test]
    fn test_merge_bw_is_idempotent() {
        let compute = parse_row(&[
            "0F0", "0F1", "0F2", "0B0", "0B1", "0W0", "0B2", "0W2", "0W1",
        ]);
        let once = merge_bw(&compute);
        let slots: Vec<Option<Action>> = once.iter().copied().map(Some).collect();
        assert_eq!(merge_bw(&slots), once);
    }

    #[test]
    fn test_merge_bw_skips_idle_between_pair() {
        let compute = parse_row(&["0B0", "   ", "0W0"]);
        assert_eq!(merge_bw(&compute), parse_dense(&["0BW0"]));
    }

    #[test]
    fn test_merge_bw_requires_matching_pair() {
        // Different microbatch: no fusion.
        let compute = parse_row(&["0B0", "0W1"]);
        assert_eq!(merge_bw(&compute), parse_dense(&["0B0", "0W1"]));
    }

    #[test]
    fn test_send_recv_two_ranks() {
        let compute: ComputeSchedule = [
            (0, parse_row(&["0F0", "0F1", "   ", "0B0", "   ", "0B1"])),
            (1, parse_row(&["   ", "1F0", "1B0", "1F1", "1B1", "   "])),
        ]
        .into_iter()
        .collect();

        let comms = add_send_recv(&compute, |stage| stage, 2).unwrap();
        assert_eq!(
            comms[&0],
            parse_dense(&[
                "0F0", "0SEND_F0", "0F1", "0SEND_F1", "0RECV_B0", "0B0", "0RECV_B1", "0B1",
            ])
        );
        assert_eq!(
            comms[&1],
            parse_dense(&[
                "1RECV_F0", "1RECV_F1", "1F0", "1B0", "1SEND_B0", "1F1", "1B1", "1SEND_B1",
            ])
        );
    }

    #[test]
    fn test_send_recv_same_rank_handoff_inserts_nothing() {
        // Both stages on rank 0: a direct hand-off, no comm actions.
        let compute: ComputeSchedule =
            [(0, parse_row(&["0F0", "1F0", "1B0", "0B0"]))].into_iter().collect();
        let comms = add_send_recv(&compute, |_| 0, 2).unwrap();
        assert_eq!(comms[&0], parse_dense(&["0F0", "1F0", "1B0", "0B0"]));
    }

    #[test]
    fn test_send_recv_rejects_unorderable_schedule() {
        // Rank 1 wants its backward before its forward ever runs; the splice
        // cannot make progress without reordering rank 1's program.
        let compute: ComputeSchedule = [
            (0, parse_row(&["0B0", "0F0"])),
            (1, parse_row(&["1B0", "1F0"])),
        ]
        .into_iter()
        .collect();
        let err = add_send_recv(&compute, |stage| stage, 3).unwrap_err();
        assert!(matches!(err, ScheduleError::Invariant { .. }));
    }

    #[test]
    fn test_lower_pipeline_orders_passes() {
        let compute: ComputeSchedule = [
            (0, parse_row(&["0F0", "0F1", "   ", "0B0", "   ", "0B1"])),
            (1, parse_row(&["   ", "1F0", "1B0", "1F1", "1B1", "   "])),
        ]
        .into_iter()
        .collect();
        let lowered = lower(&compute, &LowerOptions::default(), |stage| stage, 2).unwrap();

        // Sharding bookends survive the later passes.
        assert_eq!(lowered[&0].first().map(|a| a.kind), Some(ActionKind::Unshard));
        assert_eq!(lowered[&0].last().map(|a| a.kind), Some(ActionKind::Reshard));
        // Comms were spliced in.
        assert!(lowered[&1].iter().any(|a| a.kind == ActionKind::SendBackward));
    }
}
