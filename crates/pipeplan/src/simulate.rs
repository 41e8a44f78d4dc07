//! Discrete-Event Simulator
//!
//! Replays a fully lowered multi-rank schedule against a fixed duration
//! model. Each rank is a serial timeline; concurrency exists only across
//! ranks. Sends are fire-and-forget; a recv blocks its rank until the
//! matching send has completed at or before the current time. A state where
//! work remains but no rank can start anything is reported as a deadlock,
//! never a hang.
//!
//! The output is a per-rank list of timestamped events plus the makespan,
//! suitable for bubble analysis and for external timeline visualization.
//!
//! @version 0.1.0

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::action::{Action, ActionKind, CommSchedule, ComputeSchedule};
use crate::error::{Result, ScheduleError};

// =============================================================================
// Duration Model
// =============================================================================

/// Fixed per-op durations. Compute and sharding ops use `compute`;
/// send/recv ops use `comm`. Latency is pluggable but not load-bearing for
/// correctness: the rendezvous semantics are what matter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationModel {
    /// Duration of forward/backward/weight-update/unshard/reshard ops.
    pub compute: u64,
    /// Duration of send/recv ops.
    pub comm: u64,
}

impl Default for DurationModel {
    fn default() -> Self {
        Self { compute: 1, comm: 1 }
    }
}

impl DurationModel {
    /// Duration of one action kind, never zero.
    #[must_use]
    pub const fn duration_of(&self, kind: ActionKind) -> u64 {
        let d = if kind.is_comm() { self.comm } else { self.compute };
        if d == 0 {
            1
        } else {
            d
        }
    }
}

// =============================================================================
// Simulation Report
// =============================================================================

/// One executed action with its wall-clock span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimEvent {
    /// Rank that executed the action.
    pub rank: usize,
    /// Start time.
    pub start: u64,
    /// Completion time (exclusive).
    pub end: u64,
    /// The executed action.
    pub action: Action,
}

/// Result of replaying a schedule: per-rank timestamped events and the
/// total makespan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimReport {
    /// Events per rank, in execution order.
    pub events: BTreeMap<usize, Vec<SimEvent>>,
    /// Completion time of the last action across all ranks.
    pub makespan: u64,
}

impl SimReport {
    /// Renders the simulated timeline back into timestep-aligned rows (one
    /// cell per time unit; an action occupies its start cell). Useful with
    /// [`crate::format::format_pipeline_order`].
    #[must_use]
    pub fn step_table(&self) -> ComputeSchedule {
        self.events
            .iter()
            .map(|(rank, events)| {
                let len = events.last().map_or(0, |e| e.end) as usize;
                let mut row: Vec<Option<Action>> = vec![None; len];
                for event in events {
                    row[event.start as usize] = Some(event.action);
                }
                (*rank, row)
            })
            .collect()
    }

    /// Total idle time summed across ranks, between each rank's first start
    /// and the global makespan. This is the schedule's bubble overhead.
    #[must_use]
    pub fn bubbles(&self) -> u64 {
        self.events
            .values()
            .map(|events| {
                let busy: u64 = events.iter().map(|e| e.end - e.start).sum();
                let first = events.first().map_or(self.makespan, |e| e.start);
                (self.makespan - first).saturating_sub(busy)
            })
            .sum()
    }
}

// =============================================================================
// Simulation
// =============================================================================

/// Completion times of actions already executed, per rank.
type Completions = BTreeMap<usize, HashMap<Action, u64>>;

fn finished_by(completions: &Completions, rank: usize, action: &Action, now: u64) -> bool {
    completions
        .get(&rank)
        .and_then(|m| m.get(action))
        .is_some_and(|end| *end <= now)
}

/// Whether `action` may start on `rank` at time `now`. The executing rank's
/// serial order is enforced by the caller; this checks the data dependencies.
fn ready_at<F>(
    action: &Action,
    rank: usize,
    now: u64,
    completions: &Completions,
    stage_to_rank: &F,
    num_stages: usize,
) -> bool
where
    F: Fn(usize) -> usize,
{
    let Some(mb) = action.microbatch_index else {
        return true;
    };
    let stage = action.stage_index;
    match action.kind {
        ActionKind::Forward => {
            stage == 0
                || finished_by(completions, rank, &Action::recv_forward(stage, mb), now)
                || finished_by(completions, rank, &Action::forward(stage - 1, mb), now)
        }
        ActionKind::Backward | ActionKind::BackwardWeight => {
            finished_by(completions, rank, &Action::forward(stage, mb), now)
                && (stage + 1 == num_stages
                    || finished_by(completions, rank, &Action::recv_backward(stage, mb), now)
                    || finished_by(completions, rank, &Action::backward(stage + 1, mb), now)
                    || finished_by(completions, rank, &Action::fused_backward(stage + 1, mb), now))
        }
        ActionKind::WeightUpdate => {
            finished_by(completions, rank, &Action::backward(stage, mb), now)
                || finished_by(completions, rank, &Action::fused_backward(stage, mb), now)
        }
        ActionKind::SendForward => {
            finished_by(completions, rank, &Action::forward(stage, mb), now)
        }
        ActionKind::SendBackward => {
            finished_by(completions, rank, &Action::backward(stage, mb), now)
                || finished_by(completions, rank, &Action::fused_backward(stage, mb), now)
        }
        ActionKind::RecvForward => {
            // A first-stage recv has no producer and can never be released.
            let Some(producer) = stage.checked_sub(1) else {
                return false;
            };
            let peer = stage_to_rank(producer);
            finished_by(completions, peer, &Action::send_forward(producer, mb), now)
        }
        ActionKind::RecvBackward => {
            let peer = stage_to_rank(stage + 1);
            finished_by(completions, peer, &Action::send_backward(stage + 1, mb), now)
        }
        ActionKind::Unshard | ActionKind::Reshard => true,
    }
}

/// Replays a lowered schedule and returns the timestamped execution.
///
/// Deadlock (work remaining, nothing runnable, nothing in flight) is a hard
/// error listing every stalled rank and the action it is blocked on.
pub fn simulate<F>(
    schedule: &CommSchedule,
    stage_to_rank: F,
    num_stages: usize,
    durations: &DurationModel,
) -> Result<SimReport>
where
    F: Fn(usize) -> usize,
{
    let ranks: Vec<usize> = schedule.keys().copied().collect();
    let mut cursors: BTreeMap<usize, usize> = ranks.iter().map(|r| (*r, 0)).collect();
    let mut busy_until: BTreeMap<usize, u64> = ranks.iter().map(|r| (*r, 0)).collect();
    let mut completions: Completions = ranks.iter().map(|r| (*r, HashMap::new())).collect();
    let mut events: BTreeMap<usize, Vec<SimEvent>> = ranks.iter().map(|r| (*r, Vec::new())).collect();
    let mut now = 0u64;
    let mut makespan = 0u64;

    loop {
        // Start everything that can start at `now`, repeating until a
        // fixpoint so that a send completing exactly now releases its recv.
        loop {
            let mut started = false;
            for &rank in &ranks {
                let cursor = cursors[&rank];
                let program = &schedule[&rank];
                if cursor >= program.len() || busy_until[&rank] > now {
                    continue;
                }
                let action = program[cursor];
                if ready_at(&action, rank, now, &completions, &stage_to_rank, num_stages) {
                    let end = now + durations.duration_of(action.kind);
                    if let Some(row) = events.get_mut(&rank) {
                        row.push(SimEvent {
                            rank,
                            start: now,
                            end,
                            action,
                        });
                    }
                    if let Some(map) = completions.get_mut(&rank) {
                        map.insert(action, end);
                    }
                    busy_until.insert(rank, end);
                    cursors.insert(rank, cursor + 1);
                    makespan = makespan.max(end);
                    started = true;
                }
            }
            if !started {
                break;
            }
        }

        let exhausted = ranks.iter().all(|r| cursors[r] >= schedule[r].len());
        if exhausted {
            break;
        }

        // Advance to the next completion; if nothing is in flight the
        // remaining ranks can never progress.
        let next = ranks
            .iter()
            .map(|r| busy_until[r])
            .filter(|end| *end > now)
            .min();
        match next {
            Some(t) => now = t,
            None => {
                let stalled: Vec<(usize, Action)> = ranks
                    .iter()
                    .filter(|r| cursors[r] < schedule[r].len())
                    .map(|r| (*r, schedule[r][cursors[r]]))
                    .collect();
                debug!("deadlock at t={now}: {} rank(s) stalled", stalled.len());
                return Err(ScheduleError::Deadlock { stalled });
            }
        }
    }

    Ok(SimReport { events, makespan })
}

// =============================================================================
// Chrome Trace
// =============================================================================

/// Builds a chrome `traceEvents` document from a simulation report. Writing
/// it to disk is the caller's concern.
#[must_use]
pub fn chrome_trace(report: &SimReport) -> serde_json::Value {
    let trace_events: Vec<serde_json::Value> = report
        .events
        .values()
        .flatten()
        .map(|event| {
            json!({
                "name": event.action.to_string(),
                "cat": if event.action.kind.is_comm() { "communication" } else { "computation" },
                "ph": "X",
                "pid": event.rank,
                "tid": event.rank,
                "ts": event.start,
                "dur": event.end - event.start,
            })
        })
        .collect();
    json!({ "traceEvents": trace_events })
}

// =============================================================================
// Tests
// =============================================================================
