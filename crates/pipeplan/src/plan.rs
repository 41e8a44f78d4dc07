//! Schedule Plan Facade
//!
//! Bundles a pipeline shape, a policy, and lowering options into one object
//! that can generate, lower, validate, and simulate a schedule without the
//! caller threading shape parameters through every call.
//!
//! @version 0.1.0

use tracing::info;

use crate::action::{CommSchedule, ComputeSchedule};
use crate::config::{PipelineConfig, SchedulePolicy};
use crate::error::{Result, ScheduleError};
use crate::generate::generate;
use crate::lower::{lower, LowerOptions};
use crate::simulate::{simulate, DurationModel, SimReport};
use crate::stage::PipelineStage;
use crate::validate::{validate_comm_schedule, validate_pipeline_order};

// =============================================================================
// SchedulePlan
// =============================================================================

/// A configured schedule plan. Construction validates the shape against the
/// policy, so a plan that exists can always generate.
#[derive(Debug, Clone)]
pub struct SchedulePlan {
    config: PipelineConfig,
    policy: SchedulePolicy,
    options: LowerOptions,
}

impl SchedulePlan {
    /// Creates a plan from an explicit shape and policy.
    pub fn new(config: PipelineConfig, policy: SchedulePolicy) -> Result<Self> {
        config.validate_for(policy)?;
        Ok(Self {
            config,
            policy,
            options: LowerOptions::default(),
        })
    }

    /// Creates a plan from the local stage objects of one rank. All stages
    /// must agree on the pipeline shape.
    pub fn from_stages<S: PipelineStage>(
        stages: &[S],
        num_microbatches: usize,
        policy: SchedulePolicy,
    ) -> Result<Self> {
        let Some(first) = stages.first() else {
            return Err(ScheduleError::config("at least one local stage is required"));
        };
        let group_size = first.group_size();
        let num_stages = first.num_stages();
        for stage in stages {
            if stage.group_size() != group_size || stage.num_stages() != num_stages {
                return Err(ScheduleError::config(
                    "local stages disagree on the pipeline shape",
                ));
            }
            if stage.group_rank() != first.group_rank() {
                return Err(ScheduleError::config(
                    "local stages must belong to the same rank",
                ));
            }
        }
        if group_size == 0 || num_stages != stages.len() * group_size {
            return Err(ScheduleError::config(format!(
                "{} local stage(s) on a group of {group_size} cannot form a {num_stages}-stage pipeline",
                stages.len()
            )));
        }
        let config = PipelineConfig::new(stages.len(), num_microbatches, group_size)?;
        Self::new(config, policy)
    }

    /// Replaces the lowering options.
    #[must_use]
    pub fn options(mut self, options: LowerOptions) -> Self {
        self.options = options;
        self
    }

    /// The pipeline shape this plan schedules.
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// The scheduling policy this plan uses.
    #[must_use]
    pub const fn policy(&self) -> SchedulePolicy {
        self.policy
    }

    /// Generates the timestep-aligned compute schedule.
    pub fn compute_order(&self) -> Result<ComputeSchedule> {
        generate(&self.config, self.policy)
    }

    /// Generates and lowers the schedule to per-rank runtime programs.
    pub fn lowered(&self) -> Result<CommSchedule> {
        let order = self.compute_order()?;
        lower(
            &order,
            &self.options,
            |stage| self.config.stage_to_rank(stage),
            self.config.num_stages(),
        )
    }

    /// Generates, lowers, and validates the schedule end to end.
    pub fn validate(&self) -> Result<()> {
        let order = self.compute_order()?;
        validate_pipeline_order(
            &order,
            self.config.num_microbatches,
            self.config.num_stages(),
        )?;
        let lowered = lower(
            &order,
            &self.options,
            |stage| self.config.stage_to_rank(stage),
            self.config.num_stages(),
        )?;
        validate_comm_schedule(
            &lowered,
            |stage| self.config.stage_to_rank(stage),
            self.config.num_stages(),
        )?;
        info!(
            "schedule plan validated: policy={:?} stages={} microbatches={}",
            self.policy,
            self.config.num_stages(),
            self.config.num_microbatches
        );
        Ok(())
    }

    /// Lowers the schedule and runs it through the simulator.
    pub fn simulate(&self, durations: &DurationModel) -> Result<SimReport> {
        let lowered = self.lowered()?;
        simulate(
            &lowered,
            |stage| self.config.stage_to_rank(stage),
            self.config.num_stages(),
            durations,
        )
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::MockPipelineStage;

    #[test]
    fn test_plan_rejects_bad_shape() {
        let config = PipelineConfig::new(2, 4, 2).unwrap();
        // OneFOneB requires a single local stage.
        assert!(SchedulePlan::new(config, SchedulePolicy::OneFOneB).is_err());
    }

    #[test]
    fn test_plan_from_stages() {
        let stages = [MockPipelineStage::new(4, 2), MockPipelineStage::new(4, 2)];
        let plan =
            SchedulePlan::from_stages(&stages, 8, SchedulePolicy::Interleaved1F1B).unwrap();
        assert_eq!(plan.config().num_local_stages, 2);
        assert_eq!(plan.config().group_size, 2);
        plan.validate().unwrap();
    }

    #[test]
    fn test_plan_from_stages_shape_mismatch() {
        let stages = [MockPipelineStage::new(4, 2), MockPipelineStage::new(6, 2)];
        let err = SchedulePlan::from_stages(&stages, 8, SchedulePolicy::Interleaved1F1B)
            .unwrap_err();
        assert!(matches!(err, ScheduleError::Configuration { .. }));
    }

    #[test]
    fn test_plan_from_stages_count_mismatch() {
        // One local stage cannot cover a 4-stage pipeline on 2 ranks.
        let stages = [MockPipelineStage::new(4, 2)];
        assert!(
            SchedulePlan::from_stages(&stages, 8, SchedulePolicy::Interleaved1F1B).is_err()
        );
    }

    #[test]
    fn test_plan_end_to_end() {
        let config = PipelineConfig::new(1, 4, 4).unwrap();
        let plan = SchedulePlan::new(config, SchedulePolicy::OneFOneB).unwrap();
        plan.validate().unwrap();
        let report = plan.simulate(&DurationModel::default()).unwrap();
        assert!(report.makespan > 0);
    }
}
