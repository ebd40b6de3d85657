//! Tunnel URI parsing
//!
//! A `vless://` link carries the outbound destination in its authority and
//! the stream/security parameters in its query string. The parsed form is
//! everything the config generator needs to build a tunnel process config.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use url::Url;

use crate::endpoint::EndpointError;

/// URI schemes that route to the tunnel adapter instead of plain endpoints
const TUNNEL_SCHEMES: &[&str] = &["vless"];

/// Returns true when the string should be parsed as a tunnel URI
pub fn is_tunnel_uri(s: &str) -> bool {
    let s = s.trim();
    TUNNEL_SCHEMES.iter().any(|scheme| {
        s.get(..scheme.len() + 3)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(&format!("{scheme}://")))
    })
}

/// Parsed parameters of an outbound-protocol URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    pub uuid: String,
    pub address: String,
    pub port: u16,
    pub flow: String,
    pub security: String,
    pub sni: String,
    pub fingerprint: String,
    pub transport: String,
    pub path: String,
    pub host: String,
    pub pbk: String,
    pub sid: String,
    pub spider_x: String,
    /// Fragment label carried through re-serialization
    pub label: String,
}

impl TunnelSpec {
    /// Parse a `vless://uuid@address:port?params#label` URI.
    pub fn parse(uri: &str) -> Result<Self, EndpointError> {
        let uri = uri.trim();
        if !is_tunnel_uri(uri) {
            return Err(EndpointError::Malformed(format!("not a tunnel uri: {uri}")));
        }

        let url = Url::parse(uri).map_err(|e| EndpointError::Malformed(format!("{uri}: {e}")))?;

        let uuid = url.username().to_string();
        if uuid.is_empty() {
            return Err(EndpointError::Malformed(format!("{uri}: missing uuid")));
        }

        let address = url
            .host_str()
            .ok_or_else(|| EndpointError::Malformed(format!("{uri}: missing address")))?
            .to_string();
        let port = url
            .port()
            .ok_or_else(|| EndpointError::Malformed(format!("{uri}: missing port")))?;

        let query: HashMap<String, String> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let get = |key: &str| query.get(key).cloned().unwrap_or_default();

        let mut transport = get("type");
        if transport.is_empty() {
            transport = "tcp".to_string();
        }

        let security = get("security");
        let host = get("host");
        let mut sni = get("sni");
        // TLS handshakes need a server name; fall back to the declared
        // Host, then to the destination address itself.
        if (security == "tls" || security == "reality") && sni.is_empty() {
            sni = if host.is_empty() { address.clone() } else { host.clone() };
        }

        Ok(Self {
            uuid,
            address,
            port,
            flow: get("flow"),
            security,
            sni,
            fingerprint: get("fp"),
            transport,
            path: get("path"),
            host,
            pbk: get("pbk"),
            sid: get("sid"),
            spider_x: get("spider-x"),
            label: url.fragment().unwrap_or_default().to_string(),
        })
    }

    /// Canonical key used for pool dedupe
    pub fn canonical(&self) -> String {
        format!("vless://{}@{}:{}", self.uuid, self.address, self.port)
    }

    /// Re-serialize for persistence.
    ///
    /// Only non-empty parameters are emitted, so a round trip through
    /// parse/to_uri keeps the link minimal.
    pub fn to_uri(&self) -> String {
        let mut url = match Url::parse(&format!("vless://{}:{}", self.address, self.port)) {
            Ok(url) => url,
            // Unreachable: the authority came out of a successful parse
            Err(_) => return self.canonical(),
        };
        let _ = url.set_username(&self.uuid);

        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in [
                ("flow", &self.flow),
                ("security", &self.security),
                ("sni", &self.sni),
                ("fp", &self.fingerprint),
                ("type", &self.transport),
                ("path", &self.path),
                ("host", &self.host),
                ("pbk", &self.pbk),
                ("sid", &self.sid),
                ("spider-x", &self.spider_x),
            ] {
                if !value.is_empty() {
                    pairs.append_pair(key, value);
                }
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        if !self.label.is_empty() {
            url.set_fragment(Some(&self.label));
        }

        url.to_string()
    }
}

impl fmt::Display for TunnelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl FromStr for TunnelSpec {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_LINK: &str = "vless://11111111-2222-3333-4444-555555555555@example.com:443\
        ?flow=xtls-rprx-vision&security=reality&sni=cdn.example.org&fp=chrome\
        &type=grpc&path=svc&pbk=publickey&sid=0123&spider-x=%2F#node-1";

    #[test]
    fn test_is_tunnel_uri() {
        assert!(is_tunnel_uri("vless://uuid@host:443"));
        assert!(is_tunnel_uri("  VLESS://uuid@host:443"));
        assert!(!is_tunnel_uri("socks5://1.2.3.4:1080"));
        assert!(!is_tunnel_uri("1.2.3.4:8080"));
    }

    #[test]
    fn test_parse_full_link() {
        let spec = TunnelSpec::parse(FULL_LINK).unwrap();
        assert_eq!(spec.uuid, "11111111-2222-3333-4444-555555555555");
        assert_eq!(spec.address, "example.com");
        assert_eq!(spec.port, 443);
        assert_eq!(spec.flow, "xtls-rprx-vision");
        assert_eq!(spec.security, "reality");
        assert_eq!(spec.sni, "cdn.example.org");
        assert_eq!(spec.fingerprint, "chrome");
        assert_eq!(spec.transport, "grpc");
        assert_eq!(spec.path, "svc");
        assert_eq!(spec.pbk, "publickey");
        assert_eq!(spec.sid, "0123");
        assert_eq!(spec.spider_x, "/");
        assert_eq!(spec.label, "node-1");
    }

    #[test]
    fn test_parse_defaults() {
        let spec = TunnelSpec::parse("vless://uuid@1.2.3.4:8443").unwrap();
        assert_eq!(spec.transport, "tcp");
        assert_eq!(spec.security, "");
        assert_eq!(spec.sni, "");
        assert_eq!(spec.flow, "");
    }

    #[test]
    fn test_sni_falls_back_to_host_then_address() {
        let spec =
            TunnelSpec::parse("vless://uuid@1.2.3.4:443?security=tls&host=front.example.com")
                .unwrap();
        assert_eq!(spec.sni, "front.example.com");

        let spec = TunnelSpec::parse("vless://uuid@server.example.net:443?security=tls").unwrap();
        assert_eq!(spec.sni, "server.example.net");
    }

    #[test]
    fn test_round_trip() {
        let spec = TunnelSpec::parse(FULL_LINK).unwrap();
        let reparsed = TunnelSpec::parse(&spec.to_uri()).unwrap();
        assert_eq!(spec, reparsed);
    }

    #[test]
    fn test_rejects_missing_uuid() {
        assert!(TunnelSpec::parse("vless://example.com:443").is_err());
    }

    #[test]
    fn test_rejects_missing_port() {
        assert!(TunnelSpec::parse("vless://uuid@example.com").is_err());
    }
}
