//! ramlet-jobs: Long-running jobs that keep a target balanced
//!
//! A job server process hosts a [`JobController`], which splits each job's
//! reservation into timed sub-requests. The [`optimizer`] decides how many
//! threads each part of a hack batch gets.

pub mod controller;
pub mod handlers;
pub mod optimizer;
pub mod programs;

pub use controller::{Job, JobController, JobServer};
pub use handlers::{aligned_delays, handler_for, CycleInput, JobHandler, SubTask};
pub use optimizer::{
    batch_count, estimate, find_best_split, plan_hack, GrowthModel, SearchLimits, TargetProfile,
};
pub use programs::{register_programs, PlanProgram};
