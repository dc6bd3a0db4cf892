//! # Optimizer Module
//!
//! The pipeline engine, split by responsibility:
//! - `media_optimizer`: run orchestration and summary
//! - `task_optimizer`: the per-item job
//! - `worker_pool`: bounded-concurrency scheduling with cancellation
//! - `path_planner`: collision-free output paths
//! - `run_state`: shared counters for one run

pub mod media_optimizer;
pub mod path_planner;
pub mod run_state;
pub mod task_optimizer;
pub mod worker_pool;

pub use media_optimizer::CompressionOrchestrator;
pub use path_planner::OutputPathPlanner;
pub use run_state::RunState;
pub use task_optimizer::{ItemFailure, TaskOptimizer, TaskSettings};
pub use worker_pool::{PoolReport, TaskOutcome, WorkerPool};
