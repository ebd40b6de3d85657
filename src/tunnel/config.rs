//! Tunnel process config generation
//!
//! Renders the JSON document handed to the tunnel binary: a local SOCKS5
//! inbound on a loopback port and a VLESS outbound built from a
//! [`TunnelSpec`], with the matching stream transport and security layers.

use serde_json::{json, Map, Value};

use super::TunnelSpec;

/// Build the full config document for one adapter instance.
pub fn build_tunnel_config(spec: &TunnelSpec, local_port: u16) -> Value {
    json!({
        "log": { "loglevel": "warning" },
        "inbounds": [{
            "tag": "socks_in",
            "listen": "127.0.0.1",
            "port": local_port,
            "protocol": "socks",
            "settings": { "auth": "noauth", "udp": true },
            "sniffing": {
                "enabled": true,
                "destOverride": ["http", "tls"]
            }
        }],
        "outbounds": [{
            "tag": "proxy_out",
            "protocol": "vless",
            "settings": {
                "vnext": [{
                    "address": spec.address,
                    "port": spec.port,
                    "users": [{
                        "id": spec.uuid,
                        "encryption": "none",
                        "flow": spec.flow
                    }]
                }]
            },
            "streamSettings": stream_settings(spec)
        }]
    })
}

/// Stream settings: network transport plus the TLS/Reality layer.
fn stream_settings(spec: &TunnelSpec) -> Value {
    let mut stream = Map::new();
    stream.insert("network".into(), json!(spec.transport));

    if !spec.security.is_empty() {
        stream.insert("security".into(), json!(spec.security));
    }

    if spec.security == "tls" || spec.security == "reality" {
        let mut tls = Map::new();
        tls.insert("serverName".into(), json!(spec.sni));
        if !spec.fingerprint.is_empty() {
            tls.insert("fingerprint".into(), json!(spec.fingerprint));
        }
        if spec.security == "reality" {
            tls.insert("publicKey".into(), json!(spec.pbk));
            tls.insert("shortId".into(), json!(spec.sid));
            tls.insert("spiderX".into(), json!(spec.spider_x));
            tls.insert("show".into(), json!(false));
        }
        stream.insert(format!("{}Settings", spec.security), Value::Object(tls));
    }

    match spec.transport.as_str() {
        "ws" => {
            let mut ws = Map::new();
            if !spec.path.is_empty() {
                ws.insert("path".into(), json!(spec.path));
            }
            if !spec.host.is_empty() {
                ws.insert("headers".into(), json!({ "Host": spec.host }));
            }
            stream.insert("wsSettings".into(), Value::Object(ws));
        }
        "grpc" => {
            let mut grpc = Map::new();
            if !spec.path.is_empty() {
                grpc.insert("serviceName".into(), json!(spec.path));
            }
            stream.insert("grpcSettings".into(), Value::Object(grpc));
        }
        _ => {}
    }

    Value::Object(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(uri: &str) -> TunnelSpec {
        TunnelSpec::parse(uri).unwrap()
    }

    #[test]
    fn test_inbound_is_local_socks5() {
        let config = build_tunnel_config(&spec("vless://uuid@1.2.3.4:443"), 43210);
        let inbound = &config["inbounds"][0];
        assert_eq!(inbound["listen"], "127.0.0.1");
        assert_eq!(inbound["port"], 43210);
        assert_eq!(inbound["protocol"], "socks");
        assert_eq!(inbound["settings"]["auth"], "noauth");
        assert_eq!(inbound["settings"]["udp"], true);
    }

    #[test]
    fn test_outbound_destination_and_user() {
        let config = build_tunnel_config(&spec("vless://my-uuid@example.com:8443"), 1);
        let vnext = &config["outbounds"][0]["settings"]["vnext"][0];
        assert_eq!(vnext["address"], "example.com");
        assert_eq!(vnext["port"], 8443);
        assert_eq!(vnext["users"][0]["id"], "my-uuid");
        assert_eq!(vnext["users"][0]["encryption"], "none");
    }

    #[test]
    fn test_plain_tcp_has_no_tls_section() {
        let config = build_tunnel_config(&spec("vless://uuid@1.2.3.4:443"), 1);
        let stream = &config["outbounds"][0]["streamSettings"];
        assert_eq!(stream["network"], "tcp");
        assert!(stream.get("security").is_none());
        assert!(stream.get("tlsSettings").is_none());
    }

    #[test]
    fn test_tls_ws_transport() {
        let config = build_tunnel_config(
            &spec("vless://uuid@1.2.3.4:443?security=tls&type=ws&path=%2Fws&host=front.example.com&fp=chrome"),
            1,
        );
        let stream = &config["outbounds"][0]["streamSettings"];
        assert_eq!(stream["network"], "ws");
        assert_eq!(stream["security"], "tls");
        assert_eq!(stream["tlsSettings"]["serverName"], "front.example.com");
        assert_eq!(stream["tlsSettings"]["fingerprint"], "chrome");
        assert_eq!(stream["wsSettings"]["path"], "/ws");
        assert_eq!(stream["wsSettings"]["headers"]["Host"], "front.example.com");
    }

    #[test]
    fn test_reality_grpc_transport() {
        let config = build_tunnel_config(
            &spec("vless://uuid@1.2.3.4:443?security=reality&sni=cdn.example.org&type=grpc&path=svc&pbk=key&sid=01ab"),
            1,
        );
        let stream = &config["outbounds"][0]["streamSettings"];
        assert_eq!(stream["realitySettings"]["serverName"], "cdn.example.org");
        assert_eq!(stream["realitySettings"]["publicKey"], "key");
        assert_eq!(stream["realitySettings"]["shortId"], "01ab");
        assert_eq!(stream["grpcSettings"]["serviceName"], "svc");
    }
}
