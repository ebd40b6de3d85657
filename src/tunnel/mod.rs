//! Tunnel adapter module
//!
//! Materializes outbound-protocol URIs (`vless://…`) as transient local
//! SOCKS5 endpoints by supervising one tunnel child process per lease.

mod adapter;
mod config;
mod spec;

pub use adapter::{AdapterConfig, AdapterError, TunnelAdapter};
pub use config::build_tunnel_config;
pub use spec::{is_tunnel_uri, TunnelSpec};
