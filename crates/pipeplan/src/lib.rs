//! Pipeplan - Pipeline-Parallel Schedule Construction
//!
//! Builds, lowers, validates, and simulates pipeline-parallel training
//! schedules as static per-rank programs. A schedule is data, not behavior:
//! generators produce a timestep-aligned grid of compute actions, lowering
//! passes rewrite it into dense runtime programs with communication and
//! sharding ops, and the validator and simulator check the result before any
//! real iteration runs it.
//!
//! # Features
//!
//! ## Schedule Generation
//! - **1F1B** - one-forward-one-backward with warmup/steady/drain phases
//! - **Interleaved 1F1B** - multiple model chunks per rank, depth-first
//! - **Looped BFS** - breadth-first chunk traversal, all forwards then all backwards
//! - **Flexible Interleaved 1F1B** - non-divisible microbatch counts, optional
//!   zero-bubble backward splitting
//!
//! ## Lowering Passes
//! - Unshard/reshard insertion with a bounded in-memory stage window
//! - Backward-input/backward-weight fusion for adjacent pairs
//! - Send/recv insertion with deadlock-free round-robin placement
//!
//! ## Analysis
//! - Positional and count validation of compute and lowered schedules
//! - Discrete-event simulation with a pluggable duration model
//! - Chrome trace export, text tables, CSV persistence
//!
//! # Example
//!
//! ```ignore
//! use pipeplan::prelude::*;
//!
//! let config = PipelineConfig::new(2, 8, 4)?;
//! let plan = SchedulePlan::new(config, SchedulePolicy::Interleaved1F1B)?;
//! plan.validate()?;
//!
//! let report = plan.simulate(&DurationModel::default())?;
//! println!("makespan: {}", report.makespan);
//! ```
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::similar_names)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::needless_range_loop)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::explicit_iter_loop)]
#![allow(clippy::default_trait_access)]
#![allow(clippy::redundant_closure_for_method_calls)]

pub mod action;
pub mod config;
pub mod error;
pub mod format;
pub mod generate;
pub mod lower;
pub mod plan;
pub mod simulate;
pub mod stage;
pub mod validate;

// =============================================================================
// Re-exports
// =============================================================================

pub use action::{parse_slot, to_slots, Action, ActionKind, CommSchedule, ComputeSchedule};
pub use config::{PipelineConfig, SchedulePolicy};
pub use error::{Result, ScheduleError};
pub use format::{format_pipeline_order, from_csv, to_csv};
pub use generate::generate;
pub use lower::{
    add_send_recv, add_unshard_reshard, lower, merge_bw, LowerOptions, DEFAULT_MAX_ACTIVE_STAGES,
};
pub use plan::SchedulePlan;
pub use simulate::{chrome_trace, simulate, DurationModel, SimEvent, SimReport};
pub use stage::{MockPipelineStage, PipelineStage};
pub use validate::{validate_comm_schedule, validate_pipeline_order};

// =============================================================================
// Prelude
// =============================================================================

/// Common imports for schedule construction.
pub mod prelude {
    pub use crate::{
        // Lowering
        lower,
        // Generation
        generate,
        // Analysis
        simulate,
        validate_pipeline_order,
        Action,
        ActionKind,
        CommSchedule,
        ComputeSchedule,
        DurationModel,
        LowerOptions,
        MockPipelineStage,
        PipelineConfig,
        PipelineStage,
        Result,
        ScheduleError,
        SchedulePlan,
        SchedulePolicy,
        SimReport,
    };
}

// =============================================================================
// Tests
// =============================================================================
