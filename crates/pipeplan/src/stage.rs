//! Pipeline Stage Capability
//!
//! The minimal contract a stage object must expose to the scheduler. The
//! scheduler itself only reads the numeric shape fields; the lifecycle hooks
//! are invoked by the owning executor around an iteration, so their default
//! implementations are no-ops.
//!
//! @version 0.1.0

// =============================================================================
// PipelineStage Trait
// =============================================================================

/// Capability interface for one pipeline stage as seen by the scheduler.
pub trait PipelineStage {
    /// Total number of stages in the pipeline.
    fn num_stages(&self) -> usize;

    /// Number of ranks in the pipeline group.
    fn group_size(&self) -> usize;

    /// This stage's rank within the pipeline group.
    fn group_rank(&self) -> usize;

    /// Maps a stage index to the rank that owns it. Defaults to the striped
    /// layout used by the built-in generators.
    fn stage_index_to_group_rank(&self, stage_index: usize) -> usize {
        stage_index % self.group_size()
    }

    /// Hook: allocate forward buffers for an iteration.
    fn prepare_forward_infra(&mut self, _num_microbatches: usize) {}

    /// Hook: allocate backward buffers for an iteration.
    fn prepare_backward_infra(&mut self, _num_microbatches: usize) {}

    /// Hook: set up gradient receive metadata for one microbatch.
    fn create_grad_recv_info(&mut self, _microbatch_index: usize) {}
}

// =============================================================================
// Mock Stage
// =============================================================================

/// A shape-only stage for tests and schedule planning without real modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockPipelineStage {
    /// Total number of stages in the pipeline.
    pub num_stages: usize,
    /// Number of ranks in the pipeline group.
    pub group_size: usize,
    /// This stage's rank.
    pub group_rank: usize,
}

impl MockPipelineStage {
    /// Creates a mock stage on rank 0.
    #[must_use]
    pub const fn new(num_stages: usize, group_size: usize) -> Self {
        Self {
            num_stages,
            group_size,
            group_rank: 0,
        }
    }
}

impl PipelineStage for MockPipelineStage {
    fn num_stages(&self) -> usize {
        self.num_stages
    }

    fn group_size(&self) -> usize {
        self.group_size
    }

    fn group_rank(&self) -> usize {
        self.group_rank
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_stage_shape() {
        let mut stage = MockPipelineStage::new(8, 4);
        assert_eq!(stage.num_stages(), 8);
        assert_eq!(stage.group_size(), 4);
        assert_eq!(stage.group_rank(), 0);
        assert_eq!(stage.stage_index_to_group_rank(6), 2);
        // Hooks are no-ops but must be callable.
        stage.prepare_forward_infra(4);
        stage.prepare_backward_infra(4);
        stage.create_grad_recv_info(0);
    }
}
