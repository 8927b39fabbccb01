//! Per-drive connection supervision and the async operation vector used to
//! fan operations out across a cluster's drives.

#[macro_use]
extern crate tracing;

pub mod client;
pub mod connection;
pub mod metrics;
pub mod op_vector;
pub mod testing;

pub use client::{status_of, DriveClient, DriveLog, DriveResult, DriveStatus, Endpoint, GetReply, TcpDriveClient, WriteMode};
pub use connection::ConnectionSupervisor;
pub use metrics::ConnectionMetrics;
pub use op_vector::{OpOutcome, OperationVector, Quorum};
