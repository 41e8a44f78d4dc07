//! Pipeline Configuration - Shapes and Scheduling Policies
//!
//! An immutable description of one pipeline-parallel run: how many model
//! chunks each rank owns, how many microbatches flow through the pipeline,
//! and how many ranks participate. Constructed once per training run;
//! schedules derived from it are static programs reused every iteration.
//!
//! @version 0.1.0

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScheduleError};

// =============================================================================
// Schedule Policy
// =============================================================================

/// The scheduling discipline used to build compute schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulePolicy {
    /// Classic single-stage-per-rank one-forward-one-backward schedule.
    OneFOneB,
    /// Interleaved 1F1B: each rank owns multiple model chunks, visited
    /// round-robin. Requires the microbatch count to divide evenly by the
    /// group size.
    Interleaved1F1B,
    /// Looped breadth-first: all forwards for a rank's chunks before any
    /// backward. More in-flight activations, simpler bubble structure.
    LoopedBfs,
    /// Interleaved 1F1B that also handles microbatch counts not divisible
    /// by the group size.
    FlexibleInterleaved1F1B {
        /// Split each backward into backward-input plus a deferrable weight
        /// update, letting weight updates fill drain-phase bubbles.
        zero_bubble: bool,
    },
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self::OneFOneB
    }
}

// =============================================================================
// Pipeline Configuration
// =============================================================================

/// Immutable shape parameters for one pipeline-parallel run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of model chunks (stages) owned by each rank.
    pub num_local_stages: usize,
    /// Number of microbatches per training iteration.
    pub num_microbatches: usize,
    /// Number of pipeline ranks.
    pub group_size: usize,
}

impl PipelineConfig {
    /// Creates a configuration, rejecting degenerate shapes.
    pub fn new(num_local_stages: usize, num_microbatches: usize, group_size: usize) -> Result<Self> {
        if num_local_stages == 0 || num_microbatches == 0 || group_size == 0 {
            return Err(ScheduleError::config(format!(
                "all shape parameters must be positive, got num_local_stages={num_local_stages} \
                 num_microbatches={num_microbatches} group_size={group_size}"
            )));
        }
        Ok(Self {
            num_local_stages,
            num_microbatches,
            group_size,
        })
    }

    /// Total number of pipeline stages across all ranks.
    #[must_use]
    pub const fn num_stages(&self) -> usize {
        self.num_local_stages * self.group_size
    }

    /// The stage layout used by every built-in generator: stages are striped
    /// across ranks, so rank `r` owns stages `r, r + group_size, ...`.
    #[must_use]
    pub const fn stage_to_rank(&self, stage_index: usize) -> usize {
        stage_index % self.group_size
    }

    /// Stage indices owned by a rank, in ascending order.
    #[must_use]
    pub fn local_stages(&self, rank: usize) -> Vec<usize> {
        (rank..self.num_stages())
            .step_by(self.group_size)
            .collect()
    }

    /// Checks the policy-specific preconditions. Raised before any schedule
    /// is built, so a violated precondition never yields a partial schedule.
    pub fn validate_for(&self, policy: SchedulePolicy) -> Result<()> {
        match policy {
            SchedulePolicy::OneFOneB => {
                if self.num_local_stages != 1 {
                    return Err(ScheduleError::config(format!(
                        "1F1B schedules one stage per rank, got num_local_stages={}",
                        self.num_local_stages
                    )));
                }
            }
            SchedulePolicy::Interleaved1F1B => {
                if self.num_microbatches % self.group_size != 0 {
                    return Err(ScheduleError::config(format!(
                        "interleaved 1F1B requires num_microbatches ({}) divisible by \
                         group_size ({}); use the flexible variant otherwise",
                        self.num_microbatches, self.group_size
                    )));
                }
            }
            SchedulePolicy::LoopedBfs | SchedulePolicy::FlexibleInterleaved1F1B { .. } => {}
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
