//! Shard clients and routing.

mod client;
mod directory;

pub use client::{
    DeleteOutcome, HttpShardApi, PropagationPolicy, ShardApi, ShardClient, ShardError,
};
pub use directory::ShardDirectory;
