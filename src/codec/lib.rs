//! Redundancy codec for KIO stripes: Reed-Solomon erasure coding over
//! `GF(2^8)`, with an `nData == 1` replication fast path.

pub mod redundancy;

pub use redundancy::{Codec, Fragment};
