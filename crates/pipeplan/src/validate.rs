//! Schedule Validation
//!
//! Checks completed schedules against the correctness invariants: every
//! (stage, microbatch) pair computed exactly once in each direction, forwards
//! before backwards, and cross-rank dependencies satisfied. Compute schedules
//! are checked by replaying the timestep grid; lowered schedules additionally
//! get static send/recv pairing checks and a unit-duration simulation, so a
//! dangling send or recv surfaces as a deadlock rather than a hang at
//! runtime.
//!
//! @version 0.1.0

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::action::{Action, ActionKind, CommSchedule, ComputeSchedule};
use crate::error::{Result, ScheduleError};
use crate::generate::compute_deps_satisfied;
use crate::simulate::{simulate, DurationModel};

// =============================================================================
// Compute-Schedule Validation
// =============================================================================

/// Validates a compute schedule against the ordering and completeness
/// invariants. Fails on the first violation with the offending rank and
/// action.
pub fn validate_pipeline_order(
    order: &ComputeSchedule,
    num_microbatches: usize,
    num_stages: usize,
) -> Result<()> {
    debug!(
        "validating pipeline order: {} rank(s), {num_stages} stage(s), {num_microbatches} microbatch(es)",
        order.len()
    );

    // Pass 1: per-action sanity and duplicate/completeness accounting.
    let mut forward_seen: HashMap<(usize, usize), usize> = HashMap::new();
    let mut backward_seen: HashMap<(usize, usize), usize> = HashMap::new();
    let mut weight_seen: HashMap<(usize, usize), usize> = HashMap::new();
    let mut any_weight = false;

    for (rank, row) in order {
        for action in row.iter().flatten() {
            if action.stage_index >= num_stages {
                return Err(ScheduleError::invariant(
                    *rank,
                    Some(*action),
                    format!("stage index out of range (num_stages={num_stages})"),
                ));
            }
            let Some(mb) = action.microbatch_index else {
                continue;
            };
            if mb >= num_microbatches {
                return Err(ScheduleError::invariant(
                    *rank,
                    Some(*action),
                    format!("microbatch index out of range (num_microbatches={num_microbatches})"),
                ));
            }
            let key = (action.stage_index, mb);
            match action.kind {
                ActionKind::Forward => *forward_seen.entry(key).or_insert(0) += 1,
                ActionKind::Backward => *backward_seen.entry(key).or_insert(0) += 1,
                ActionKind::BackwardWeight => {
                    *backward_seen.entry(key).or_insert(0) += 1;
                    *weight_seen.entry(key).or_insert(0) += 1;
                    any_weight = true;
                }
                ActionKind::WeightUpdate => {
                    *weight_seen.entry(key).or_insert(0) += 1;
                    any_weight = true;
                }
                _ => {}
            }
        }
    }

    for stage in 0..num_stages {
        for mb in 0..num_microbatches {
            let key = (stage, mb);
            if forward_seen.get(&key) != Some(&1) {
                return Err(ScheduleError::invariant(
                    0,
                    Some(Action::forward(stage, mb)),
                    format!(
                        "expected exactly one forward for stage {stage} microbatch {mb}, found {}",
                        forward_seen.get(&key).copied().unwrap_or(0)
                    ),
                ));
            }
            if backward_seen.get(&key) != Some(&1) {
                return Err(ScheduleError::invariant(
                    0,
                    Some(Action::backward(stage, mb)),
                    format!(
                        "expected exactly one backward for stage {stage} microbatch {mb}, found {}",
                        backward_seen.get(&key).copied().unwrap_or(0)
                    ),
                ));
            }
            if any_weight && weight_seen.get(&key) != Some(&1) {
                return Err(ScheduleError::invariant(
                    0,
                    Some(Action::weight_update(stage, mb)),
                    format!(
                        "expected exactly one weight update for stage {stage} microbatch {mb}, found {}",
                        weight_seen.get(&key).copied().unwrap_or(0)
                    ),
                ));
            }
        }
    }

    // Pass 2: timestep replay. An action placed at step t must have all of
    // its dependencies completed at a strictly earlier step; this covers
    // forward-before-backward and the cross-rank causal ordering at once.
    let max_len = order.values().map(Vec::len).max().unwrap_or(0);
    let mut completed: HashSet<Action> = HashSet::new();
    for t in 0..max_len {
        let mut step: Vec<(usize, Action)> = Vec::new();
        for (rank, row) in order {
            if let Some(action) = row.get(t).copied().flatten() {
                step.push((*rank, action));
            }
        }
        for (rank, action) in &step {
            if completed.contains(action) {
                return Err(ScheduleError::invariant(
                    *rank,
                    Some(*action),
                    format!("duplicate action at step {t}"),
                ));
            }
            if !compute_deps_satisfied(action, &completed, num_stages) {
                return Err(ScheduleError::invariant(
                    *rank,
                    Some(*action),
                    format!("dependencies not satisfied at step {t}"),
                ));
            }
        }
        completed.extend(step.into_iter().map(|(_, action)| action));
    }

    Ok(())
}

// =============================================================================
// Lowered-Schedule Validation
// =============================================================================

/// Validates a lowered schedule: static send/recv pairing plus a
/// unit-duration simulation run. A recv whose matching send never completes
/// propagates as the simulator's deadlock error.
pub fn validate_comm_schedule<F>(
    schedule: &CommSchedule,
    stage_to_rank: F,
    num_stages: usize,
) -> Result<()>
where
    F: Fn(usize) -> usize,
{
    check_comm_pairing(schedule, &stage_to_rank)?;
    simulate(schedule, stage_to_rank, num_stages, &DurationModel::default()).map(|_| ())
}

/// Every send must pair uniquely with one recv by (stage, microbatch,
/// direction), each placed on the rank that owns its stage.
fn check_comm_pairing<F>(schedule: &CommSchedule, stage_to_rank: &F) -> Result<()>
where
    F: Fn(usize) -> usize,
{
    // Keyed by the producing stage's (stage, mb, is_forward).
    let mut sends: HashMap<(usize, usize, bool), usize> = HashMap::new();
    let mut recvs: HashMap<(usize, usize, bool), usize> = HashMap::new();

    for (rank, program) in schedule {
        for action in program {
            if !action.kind.is_comm() {
                continue;
            }
            let Some(mb) = action.microbatch_index else {
                return Err(ScheduleError::invariant(
                    *rank,
                    Some(*action),
                    "communication action without a microbatch index",
                ));
            };
            if stage_to_rank(action.stage_index) != *rank {
                return Err(ScheduleError::invariant(
                    *rank,
                    Some(*action),
                    "communication action placed on a rank that does not own its stage",
                ));
            }
            let key = match action.kind {
                ActionKind::SendForward => (action.stage_index, mb, true),
                ActionKind::RecvForward => {
                    let Some(producer) = action.stage_index.checked_sub(1) else {
                        return Err(ScheduleError::invariant(
                            *rank,
                            Some(*action),
                            "first stage cannot receive forward activations",
                        ));
                    };
                    (producer, mb, true)
                }
                ActionKind::SendBackward => (action.stage_index, mb, false),
                ActionKind::RecvBackward => (action.stage_index + 1, mb, false),
                _ => unreachable!(),
            };
            let counter = if matches!(action.kind, ActionKind::SendForward | ActionKind::SendBackward)
            {
                &mut sends
            } else {
                &mut recvs
            };
            let count = counter.entry(key).or_insert(0);
            *count += 1;
            if *count > 1 {
                return Err(ScheduleError::invariant(
                    *rank,
                    Some(*action),
                    "duplicate communication action for this (stage, microbatch)",
                ));
            }
        }
    }

    for key in sends.keys() {
        if !recvs.contains_key(key) {
            let (stage, mb, forward) = *key;
            let send = if forward {
                Action::send_forward(stage, mb)
            } else {
                Action::send_backward(stage, mb)
            };
            return Err(ScheduleError::invariant(
                stage_to_rank(stage),
                Some(send),
                "send without a matching recv",
            ));
        }
    }
    for key in recvs.keys() {
        if !sends.contains_key(key) {
            let (stage, mb, forward) = *key;
            let recv = if forward {
                Action::recv_forward(stage + 1, mb)
            } else {
                Action::recv_backward(stage - 1, mb)
            };
            return Err(ScheduleError::invariant(
                stage_to_rank(if forward { stage + 1 } else { stage - 1 }),
                Some(recv),
                "recv without a matching send",
            ));
        }
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::parse_slot;
    use crate::config::{PipelineConfig, SchedulePolicy};
    use crate::generate::generate;
    use crate::lower::{lower, LowerOptions};

    fn parse_row(tokens: &[&str]) -> Vec<Option<Action>> {
        tokens.iter().map(|t| parse_slot(t).unwrap()).collect()
    }

    fn parse_dense(tokens: &[&str]) -> Vec<Action> {
        tokens.iter().map(|t| t.parse().unwrap()).collect()
    }

    #[test]
    fn test_valid_two_rank_order_passes() {
        let order: ComputeSchedule = [
            (0, parse_row(&["0F0", "0F1", "   ", "0B0", "   ", "0B1"])),
            (1, parse_row(&["   ", "1F0", "1B0", "1F1", "1B1"])),
        ]
        .into_iter()
        .collect();
        validate_pipeline_order(&order, 2, 2).unwrap();
    }

    #[test]
    fn test_missing_backward_fails_completeness() {
        let order: ComputeSchedule = [
            (0, parse_row(&["0F0", "0F1", "   ", "0B0", "   ", "0B1"])),
            (1, parse_row(&["   ", "1F0", "1B0", "1F1"])),
        ]
        .into_iter()
        .collect();
        let err = validate_pipeline_order(&order, 2, 2).unwrap_err();
        assert!(matches!(err, ScheduleError::Invariant { .. }));
        assert!(err.to_string().contains("backward"));
    }

    #[test]
    fn test_backward_before_forward_fails_replay() {
        let order: ComputeSchedule = [
            (0, parse_row(&["0B0", "0F0"])),
            (1, parse_row(&["1F0", "1B0"])),
        ]
        .into_iter()
        .collect();
        let err = validate_pipeline_order(&order, 1, 2).unwrap_err();
        assert!(matches!(err, ScheduleError::Invariant { .. }));
    }

    #[test]
    fn test_same_step_dependency_is_too_early() {
        // Rank 1's forward is aligned to the same step as the producing
        // forward on rank 0; dependencies must finish strictly earlier.
        let order: ComputeSchedule = [
            (0, parse_row(&["0F0", "0B0"])),
            (1, parse_row(&["1F0", "1B0"])),
        ]
        .into_iter()
        .collect();
        assert!(validate_pipeline_order(&order, 1, 2).is_err());
    }

    #[test]
    fn test_generated_schedules_validate() {
        let cases = [
            (PipelineConfig::new(1, 4, 4).unwrap(), SchedulePolicy::OneFOneB),
            (PipelineConfig::new(2, 8, 4).unwrap(), SchedulePolicy::Interleaved1F1B),
            (PipelineConfig::new(3, 8, 2).unwrap(), SchedulePolicy::LoopedBfs),
            (
                PipelineConfig::new(2, 10, 4).unwrap(),
                SchedulePolicy::FlexibleInterleaved1F1B { zero_bubble: true },
            ),
        ];
        for (config, policy) in cases {
            let order = generate(&config, policy).unwrap();
            validate_pipeline_order(&order, config.num_microbatches, config.num_stages())
                .unwrap_or_else(|e| panic!("{policy:?} on {config:?}: {e}"));
        }
    }

    #[test]
    fn test_lowered_schedules_validate() {
        let config = PipelineConfig::new(2, 4, 2).unwrap();
        let order = generate(&config, SchedulePolicy::Interleaved1F1B).unwrap();
        let lowered = lower(
            &order,
            &LowerOptions::default(),
            |stage| config.stage_to_rank(stage),
            config.num_stages(),
        )
        .unwrap();
        validate_comm_schedule(&lowered, |stage| config.stage_to_rank(stage), config.num_stages())
            .unwrap();
    }

    #[test]
    fn test_dangling_recv_rejected_statically() {
        let schedule: CommSchedule = [
            (0, parse_dense(&["0F0", "0RECV_B0", "0B0"])),
            (1, parse_dense(&["1RECV_F0"])),
        ]
        .into_iter()
        .collect();
        let err = check_comm_pairing(&schedule, &|stage: usize| stage).unwrap_err();
        assert!(err.to_string().contains("matching send"));
    }

    #[test]
    fn test_misplaced_comm_action_rejected() {
        // A send sitting on the wrong rank.
        let schedule: CommSchedule = [
            (0, parse_dense(&["1SEND_F0"])),
            (1, parse_dense(&["2RECV_F0"])),
        ]
        .into_iter()
        .collect();
        let err = check_comm_pairing(&schedule, &|stage: usize| stage).unwrap_err();
        assert!(err.to_string().contains("does not own"));
    }
}
