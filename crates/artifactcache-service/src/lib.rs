//! Coordinates a cache of compiled artifacts shared by many concurrent clients.
//!
//! See [`ArtifactCacheService`] for the entry point.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod files;
pub mod types;

mod coordinator;

pub use coordinator::{
    ArtifactCacheService, ArtifactFuture, CacheStatus, ClearFuture, CoordinatorStats,
    ShutdownOutcome,
};
