//! Pool records and leases

use std::fmt;
use std::sync::Arc;

use crate::endpoint::{Endpoint, EndpointError};
use crate::tunnel::{is_tunnel_uri, TunnelAdapter, TunnelSpec};

/// Where a record's traffic ultimately goes: a directly reachable proxy,
/// or a tunnel spec that needs a local adapter per lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyOrigin {
    Raw(Endpoint),
    Tunnel(TunnelSpec),
}

impl ProxyOrigin {
    /// Route a candidate string to the right parser.
    pub fn parse(input: &str) -> Result<Self, EndpointError> {
        if is_tunnel_uri(input) {
            Ok(ProxyOrigin::Tunnel(TunnelSpec::parse(input)?))
        } else {
            Ok(ProxyOrigin::Raw(input.parse()?))
        }
    }

    /// Dedupe key, unique within the pool's working set and reserve.
    pub fn canonical(&self) -> String {
        match self {
            ProxyOrigin::Raw(endpoint) => endpoint.canonical(),
            ProxyOrigin::Tunnel(spec) => spec.canonical(),
        }
    }

    /// Line written back to the persisted list files.
    pub fn display_string(&self) -> String {
        match self {
            ProxyOrigin::Raw(endpoint) => endpoint.display_string(),
            ProxyOrigin::Tunnel(spec) => spec.to_uri(),
        }
    }

    pub fn is_tunnel(&self) -> bool {
        matches!(self, ProxyOrigin::Tunnel(_))
    }
}

/// Lease state of a working-set record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Idle,
    Leased,
    Retired,
}

/// One mutable pool entry.
pub(crate) struct ProxyRecord {
    pub origin: ProxyOrigin,
    pub state: RecordState,
    pub failure_count: u32,
    /// Generation counter; a lease is only honored while its token matches
    pub lease_token: u64,
    /// Live adapter while a tunnel record is leased
    pub adapter: Option<Arc<TunnelAdapter>>,
}

impl ProxyRecord {
    pub fn new(origin: ProxyOrigin) -> Self {
        Self {
            origin,
            state: RecordState::Idle,
            failure_count: 0,
            lease_token: 0,
            adapter: None,
        }
    }

    pub fn canonical(&self) -> String {
        self.origin.canonical()
    }
}

/// Exclusive grant of one record to one worker.
///
/// Carries the record identity directly, so release paths never have to
/// reverse-map an endpoint back to its record.
#[derive(Clone)]
pub struct Lease {
    pub(crate) key: String,
    pub(crate) token: u64,
    endpoint: Endpoint,
    pub(crate) adapter: Option<Arc<TunnelAdapter>>,
}

impl Lease {
    pub(crate) fn new(
        key: String,
        token: u64,
        endpoint: Endpoint,
        adapter: Option<Arc<TunnelAdapter>>,
    ) -> Self {
        Self { key, token, endpoint, adapter }
    }

    /// The endpoint the session should use for this lease
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// False when a tunnel-backed lease lost its child process mid-session
    pub fn is_usable(&self) -> bool {
        self.adapter.as_ref().map_or(true, |a| a.is_alive())
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("key", &self.key)
            .field("token", &self.token)
            .field("endpoint", &self.endpoint.canonical())
            .field("adapter", &self.adapter.as_ref().map(|a| a.port()))
            .finish()
    }
}
