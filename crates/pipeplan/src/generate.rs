//! Compute-Schedule Generators
//!
//! Builds per-rank, compute-only schedules (forward/backward/weight-update)
//! for each [`SchedulePolicy`]. Generation has two halves:
//!
//! 1. An **agenda** per rank: the policy-specific order in which that rank
//!    runs its compute ops, ignoring timing.
//! 2. A shared **alignment** step that lays the agendas onto a global
//!    timestep grid, placing an op only once everything it depends on
//!    finished at a strictly earlier step and padding with idle slots
//!    otherwise.
//!
//! The produced rows therefore satisfy the cross-rank dependency replay in
//! [`crate::validate`] by construction; alignment failure indicates an agenda
//! whose rank orders contradict each other and is reported as an invariant
//! error rather than a hang.
//!
//! @version 0.1.0

use std::collections::HashSet;

use tracing::{debug, trace};

use crate::action::{Action, ComputeSchedule};
use crate::config::{PipelineConfig, SchedulePolicy};
use crate::error::{Result, ScheduleError};

// =============================================================================
// Entry Point
// =============================================================================

/// Generates the per-rank compute schedule for a policy.
///
/// The result maps every rank in `[0, group_size)` to its timestep-aligned
/// row. Policy preconditions are checked first; a violation is a
/// configuration error and no schedule is built.
pub fn generate(config: &PipelineConfig, policy: SchedulePolicy) -> Result<ComputeSchedule> {
    config.validate_for(policy)?;
    debug!(
        "generating compute schedule: policy={policy:?} local_stages={} microbatches={} group_size={}",
        config.num_local_stages, config.num_microbatches, config.group_size
    );

    let agendas = match policy {
        SchedulePolicy::OneFOneB => one_f_one_b_agendas(config),
        SchedulePolicy::LoopedBfs => looped_bfs_agendas(config),
        SchedulePolicy::Interleaved1F1B => {
            interleaved_agendas(config, config.group_size, false)
        }
        SchedulePolicy::FlexibleInterleaved1F1B { zero_bubble } => {
            interleaved_agendas(config, flexible_round_size(config), zero_bubble)
        }
    };
    align(config, agendas)
}

// =============================================================================
// Agendas
// =============================================================================

/// Classic 1F1B, one stage per rank: rank `r` warms up with
/// `num_stages - r - 1` forwards, alternates forward/backward in the steady
/// state, then drains the remaining backwards. With fewer microbatches than
/// stages there is no steady state to reach: every rank issues all of its
/// forwards up front and the schedule degenerates to pure fill-drain.
fn one_f_one_b_agendas(config: &PipelineConfig) -> Vec<Vec<Action>> {
    let num_stages = config.num_stages();
    let n = config.num_microbatches;
    (0..config.group_size)
        .map(|rank| {
            let warmup = if n < num_stages {
                n
            } else {
                num_stages - rank - 1
            };
            let steady = n - warmup;
            let mut ops = Vec::with_capacity(2 * n);
            for mb in 0..warmup {
                ops.push(Action::forward(rank, mb));
            }
            for mb in 0..steady {
                ops.push(Action::forward(rank, warmup + mb));
                ops.push(Action::backward(rank, mb));
            }
            for mb in steady..n {
                ops.push(Action::backward(rank, mb));
            }
            ops
        })
        .collect()
}

/// Looped breadth-first: all forwards for every owned stage (ascending stage
/// order), then all backwards (descending stage order). Microbatches run in
/// index order within each stage.
fn looped_bfs_agendas(config: &PipelineConfig) -> Vec<Vec<Action>> {
    let n = config.num_microbatches;
    (0..config.group_size)
        .map(|rank| {
            let stages = config.local_stages(rank);
            let mut ops = Vec::with_capacity(2 * stages.len() * n);
            for &stage in &stages {
                for mb in 0..n {
                    ops.push(Action::forward(stage, mb));
                }
            }
            for &stage in stages.iter().rev() {
                for mb in 0..n {
                    ops.push(Action::backward(stage, mb));
                }
            }
            ops
        })
        .collect()
}

/// Round size for the flexible variant: as many full rounds of `group_size`
/// microbatches as fit, then shrunk to the nearest divisor of the microbatch
/// count so every round has the same size. Divisible shapes reproduce the
/// strict interleaved layout; everything else still gets equal rounds.
fn flexible_round_size(config: &PipelineConfig) -> usize {
    let n = config.num_microbatches;
    let mut rounds = (n / config.group_size).max(1);
    while n % rounds != 0 {
        rounds -= 1;
    }
    n / rounds
}

/// Interleaved 1F1B over `num_local_stages` chunks per rank, visiting chunks
/// round-robin in rounds of `round_size` microbatches. Ranks closer to the
/// pipeline tail warm up less: the warmup count shrinks by two per hop, since
/// each hop adds one forward and one backward of latency before gradients
/// return. With `zero_bubble`, each backward also enqueues a weight update;
/// pending updates drain most-recent-first after the backward drain so the
/// final backward stays adjacent to its own update.
fn interleaved_agendas(
    config: &PipelineConfig,
    round_size: usize,
    zero_bubble: bool,
) -> Vec<Vec<Action>> {
    let l = config.num_local_stages;
    let g = config.group_size;
    let total_forwards = l * config.num_microbatches;

    (0..g)
        .map(|rank| {
            let warmup = ((l - 1) * round_size + 2 * (g - 1 - rank)).min(total_forwards);
            let steady = total_forwards - warmup;
            trace!("rank {rank}: warmup={warmup} steady={steady} round_size={round_size}");

            let mut fwd_counts = vec![0usize; l];
            let mut bwd_counts = vec![0usize; l];
            let mut pending_updates: Vec<Action> = Vec::new();
            let mut ops = Vec::with_capacity(2 * total_forwards);

            fn emit_forward(
                ops: &mut Vec<Action>,
                counts: &mut [usize],
                step: usize,
                round_size: usize,
                l: usize,
                g: usize,
                rank: usize,
            ) {
                let chunk = (step / round_size) % l;
                let stage = chunk * g + rank;
                ops.push(Action::forward(stage, counts[chunk]));
                counts[chunk] += 1;
            }

            fn emit_backward(
                ops: &mut Vec<Action>,
                counts: &mut [usize],
                pending: &mut Vec<Action>,
                step: usize,
                round_size: usize,
                l: usize,
                g: usize,
                rank: usize,
                zero_bubble: bool,
            ) {
                let chunk = l - 1 - (step / round_size) % l;
                let stage = chunk * g + rank;
                let mb = counts[chunk];
                counts[chunk] += 1;
                ops.push(Action::backward(stage, mb));
                if zero_bubble {
                    pending.push(Action::weight_update(stage, mb));
                }
            }

            for step in 0..warmup {
                emit_forward(&mut ops, &mut fwd_counts, step, round_size, l, g, rank);
            }
            for bwd_step in 0..steady {
                emit_forward(
                    &mut ops,
                    &mut fwd_counts,
                    warmup + bwd_step,
                    round_size,
                    l,
                    g,
                    rank,
                );
                emit_backward(
                    &mut ops,
                    &mut bwd_counts,
                    &mut pending_updates,
                    bwd_step,
                    round_size,
                    l,
                    g,
                    rank,
                    zero_bubble,
                );
            }
            for bwd_step in steady..total_forwards {
                emit_backward(
                    &mut ops,
                    &mut bwd_counts,
                    &mut pending_updates,
                    bwd_step,
                    round_size,
                    l,
                    g,
                    rank,
                    zero_bubble,
                );
            }
            while let Some(update) = pending_updates.pop() {
                ops.push(update);
            }
            ops
        })
        .collect()
}

// =============================================================================
// Alignment
// =============================================================================

/// Whether a compute action's data dependencies are all in `completed`.
/// Shared with the validator's timestep replay.
pub(crate) fn compute_deps_satisfied(
    action: &Action,
    completed: &HashSet<Action>,
    num_stages: usize,
) -> bool {
    use crate::action::ActionKind;

    let Some(mb) = action.microbatch_index else {
        return true;
    };
    let stage = action.stage_index;
    match action.kind {
        ActionKind::Forward => stage == 0 || completed.contains(&Action::forward(stage - 1, mb)),
        ActionKind::Backward | ActionKind::BackwardWeight => {
            completed.contains(&Action::forward(stage, mb))
                && (stage + 1 == num_stages
                    || completed.contains(&Action::backward(stage + 1, mb))
                    || completed.contains(&Action::fused_backward(stage + 1, mb)))
        }
        ActionKind::WeightUpdate => {
            completed.contains(&Action::backward(stage, mb))
                || completed.contains(&Action::fused_backward(stage, mb))
        }
        // Sharding and communication never appear in compute agendas.
        _ => true,
    }
}

/// Lays per-rank agendas onto the global timestep grid. Each rank runs at
/// most one op per step, and an op is placed only once its dependencies
/// completed at a strictly earlier step; otherwise the rank idles.
fn align(config: &PipelineConfig, agendas: Vec<Vec<Action>>) -> Result<ComputeSchedule> {
    let num_stages = config.num_stages();
    let num_ranks = agendas.len();
    let mut cursors = vec![0usize; num_ranks];
    let mut rows: Vec<Vec<Option<Action>>> = vec![Vec::new(); num_ranks];
    let mut completed: HashSet<Action> = HashSet::new();

    loop {
        let remaining: Vec<usize> = (0..num_ranks)
            .filter(|&r| cursors[r] < agendas[r].len())
            .collect();
        if remaining.is_empty() {
            break;
        }

        let mut placed: Vec<Action> = Vec::new();
        for rank in 0..num_ranks {
            let slot = if cursors[rank] < agendas[rank].len() {
                let action = agendas[rank][cursors[rank]];
                if compute_deps_satisfied(&action, &completed, num_stages) {
                    cursors[rank] += 1;
                    placed.push(action);
                    Some(action)
                } else {
                    None
                }
            } else {
                None
            };
            rows[rank].push(slot);
        }

        if placed.is_empty() {
            let rank = remaining[0];
            let action = agendas[rank][cursors[rank]];
            return Err(ScheduleError::invariant(
                rank,
                Some(action),
                "agenda orders contradict each other; no rank can place its next op",
            ));
        }
        completed.extend(placed);
    }

    for row in &mut rows {
        while row.last() == Some(&None) {
            row.pop();
        }
    }
    Ok(rows.into_iter().enumerate().collect())
}

// =============================================================================
// Tests
// =============================================================================
