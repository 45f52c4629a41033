//! runforge: durable algorithm-run scheduler.
//!
//! Accepts algorithm execution requests, checkpoints them in a durable
//! buffer, and drives them through a rate-limited, retrying submission
//! pipeline onto sharded execution clusters. Requests stranded by a dead
//! scheduler instance are recovered from cluster lifecycle events.

pub mod app;
pub mod checkpoint;
pub mod cluster;
pub mod config;
pub mod pipeline;
pub mod resources;
pub mod scheduler;
pub mod shards;
pub mod storage;

pub use app::{AppError, Application, ApplicationServices};
pub use config::{ConfigError, SchedulerConfig};
