//! Session dispatcher module
//!
//! Bounded worker pool that drives sessions: lease a proxy, run the
//! session, settle the lease, back off according to the outcome.

mod config;
mod scheduler;

pub use config::DispatcherConfig;
pub use scheduler::Dispatcher;
