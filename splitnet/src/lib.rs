//! Splitting multi-task network
//!
//! A multi-task MLP that starts with every layer shared by all tasks and
//! grows task-specific branches where the tasks' gradients disagree.
//!
//! # Architecture
//!
//! ```text
//!   obs ──► region 0 ──► region 1 ──► region 2 ──► output
//!           [copy 0]     [copy 0]     [copy 0]
//!                        [copy 1]     [copy 1]
//!                                     [copy 2]
//!
//!   TaskAssignment:  task t uses copy assignment[r][t] at region r
//! ```
//!
//! ## Training step
//! - `forward_cached` routes each batch row through its task's copies
//! - `backward` returns per-copy gradients and per-task gradients per region
//! - `SplitStatistics::record_gradients` scores pairwise gradient distances
//! - `Adam::step` updates every live copy
//! - `SplitStatistics::check_for_split` applies at most one split
//!
//! ## Splitting
//! - A split clones one copy and moves part of its task group to the clone
//! - Only tasks that currently share a copy are ever compared
//! - A copy must be observed for `split_step_threshold` steps before it may split

pub mod assignment;
pub mod checkpoint;
pub mod error;
pub mod estimate;
pub mod gradients;
pub mod network;
pub mod optim;
pub mod region;
pub mod stats;

pub use assignment::TaskAssignment;
pub use checkpoint::Checkpoint;
pub use error::{Result, SplitError};
pub use estimate::{EstimatorConfig, RunningMean, RunningMeanStdev};
pub use gradients::{NetworkGradients, TaskGradients};
pub use network::{CopyHandle, ForwardCache, NetworkConfig, SplittingNetwork};
pub use optim::{Adam, AdamConfig};
pub use region::{Activation, Linear, Region};
pub use stats::{SplitConfig, SplitEvent, SplitPhase, SplitProposal, SplitStatistics, TaskScore};
