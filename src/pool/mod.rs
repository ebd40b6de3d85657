//! Proxy pool module
//!
//! Owns the mutable set of proxy records, hands out exclusive leases to
//! workers, tracks per-record failures, and materializes tunnel-backed
//! records through ephemeral adapters.

mod pool;
mod record;
mod source;

pub use pool::{PoolConfig, PoolError, ProxyPool};
pub use record::{Lease, ProxyOrigin, RecordState};
pub use source::ProxySource;
