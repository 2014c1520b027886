//! Training experiments for the splitting network.
//!
//! Architecture:
//! - `tasks`: synthetic multi-task regression workload with drift
//! - `runner`: the update loop, logging and checkpoint/resume

pub mod runner;
pub mod tasks;
