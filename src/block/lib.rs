//! In-memory LRU cache of cluster-backed blocks, the background pool that
//! drives flush and readahead off the foreground path, and the access
//! pattern oracle that decides what to prefetch.

#[macro_use]
extern crate tracing;

pub mod block;
pub mod cache;
pub mod metrics;
pub mod prefetch;

pub use block::{Block, BlockMode};
pub use cache::{Cache, OwnerId};
pub use prefetch::{PredictionType, PrefetchOracle};
