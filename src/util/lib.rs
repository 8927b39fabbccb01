//! Shared utilities for the KIO workspace: error kinds, configuration
//! loading, background task plumbing, and the version/tag encoding used by
//! every fragment on every drive.

#[macro_use]
extern crate tracing;

pub mod background;
pub mod config;
pub mod data;
pub mod error;
pub mod time;
