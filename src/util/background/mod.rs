//! Background task plumbing shared by the block cache, the connection
//! supervisor's reconnect attempts, and the admin scan/repair loop.

pub mod pool;

pub use pool::BackgroundPool;
