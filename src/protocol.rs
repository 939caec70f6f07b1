use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{error::ServerError, remote::Remotes};

// Control request types carried as exec requests on the client's session
// channel. The first whitespace-separated token of the exec payload is the
// request type; the remainder is the request payload. Positive replies are
// channel successes, negative replies write the error text to the channel
// before the channel failure. This must match the client implementation.
pub(crate) const REQUEST_CONFIG: &str = "config";
pub(crate) const REQUEST_PING: &str = "ping";

// Splits an exec payload into its request type and payload bytes.
pub(crate) fn split_request(data: &[u8]) -> (&str, &[u8]) {
    let kind_end = data
        .iter()
        .position(|byte| byte.is_ascii_whitespace())
        .unwrap_or(data.len());
    let kind = std::str::from_utf8(&data[..kind_end]).unwrap_or_default();
    let payload = data
        .get(kind_end + 1..)
        .unwrap_or_default();
    (kind, payload)
}

// The client's configuration request: advisory version string, encoded
// forwarding rules, and named option flags. Per-remote flags (reverse,
// socks, stdio, udp) are carried inside the remote encodings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct SessionConfig {
    #[serde(default)]
    pub(crate) version: String,
    #[serde(default)]
    pub(crate) remotes: Vec<String>,
    // Option flags are advisory; unknown names are preserved so clients can
    // offer them without breaking older servers. None alters behavior yet.
    #[serde(default)]
    pub(crate) options: BTreeMap<String, bool>,
}

impl SessionConfig {
    pub(crate) fn decode(payload: &[u8]) -> Result<Self, ServerError> {
        serde_json::from_slice(payload).map_err(|_| ServerError::InvalidConfig)
    }

    #[cfg(test)]
    pub(crate) fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("config serialization cannot fail")
    }

    pub(crate) fn parse_remotes(&self) -> Result<Remotes, ServerError> {
        // Undecodable remotes are indistinguishable from an undecodable
        // config as far as the peer is concerned.
        Remotes::parse(&self.remotes).map_err(|_| ServerError::InvalidConfig)
    }
}

// Builds the exec payload for a control request.
#[cfg(test)]
pub(crate) fn encode_request(kind: &str, payload: &[u8]) -> Vec<u8> {
    let mut data = kind.as_bytes().to_vec();
    if !payload.is_empty() {
        data.push(b' ');
        data.extend_from_slice(payload);
    }
    data
}

// Routing targets for incoming tunnel channels: `host:port`, with the
// `socks` sentinel routed to the embedded responder and a `/udp` host
// suffix selecting datagram relaying.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ChannelTarget {
    Tcp { host: String, port: u16 },
    Udp { host: String, port: u16 },
    Socks,
}

impl ChannelTarget {
    pub(crate) fn parse(host: &str, port: u32) -> Option<Self> {
        let port = u16::try_from(port).ok()?;
        let host = host.trim();
        if host == crate::remote::SOCKS_SENTINEL {
            return Some(ChannelTarget::Socks);
        }
        if let Some(host) = host.strip_suffix("/udp") {
            return Some(ChannelTarget::Udp { host: host.into(), port });
        }
        Some(ChannelTarget::Tcp { host: host.into(), port })
    }
}

#[cfg(test)]
mod protocol_tests {
    use super::{encode_request, split_request, ChannelTarget, SessionConfig};

    #[test]
    fn splits_request_type_and_payload() {
        assert_eq!(split_request(b"config {\"a\":1}"), ("config", br#"{"a":1}"# as &[u8]));
        assert_eq!(split_request(b"ping"), ("ping", b"" as &[u8]));
        assert_eq!(split_request(b""), ("", b"" as &[u8]));
        assert_eq!(split_request(&[0xff, 0x20, 0x41]), ("", b"A" as &[u8]));
    }

    #[test]
    fn round_trips_session_config() {
        let config = SessionConfig {
            version: "1.0.0".into(),
            remotes: vec!["R:8080:localhost:22".into(), "socks".into()],
            options: [("compress".to_string(), true)].into(),
        };
        let decoded = SessionConfig::decode(&config.encode()).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn decodes_config_with_missing_fields() {
        let config = SessionConfig::decode(b"{}").unwrap();
        assert_eq!(config.version, "");
        assert!(config.remotes.is_empty());
        assert!(config.options.is_empty());
    }

    #[test]
    fn decodes_unknown_option_flags() {
        let config = SessionConfig::decode(
            br#"{"version":"1.0.0","remotes":[],"options":{"compress":false,"fancy":true}}"#,
        )
        .unwrap();
        assert_eq!(config.options.get("compress"), Some(&false));
        assert_eq!(config.options.get("fancy"), Some(&true));
    }

    #[test]
    fn rejects_undecodable_payloads() {
        assert!(SessionConfig::decode(b"not json").is_err());
        assert!(SessionConfig::decode(b"").is_err());
    }

    #[test]
    fn rejects_config_with_bad_remote() {
        let config = SessionConfig {
            version: "1.0.0".into(),
            remotes: vec!["not-a-remote".into()],
            ..Default::default()
        };
        let decoded = SessionConfig::decode(&config.encode()).unwrap();
        assert!(decoded.parse_remotes().is_err());
    }

    #[test]
    fn encodes_requests_with_and_without_payload() {
        assert_eq!(encode_request("ping", b""), b"ping");
        assert_eq!(encode_request("config", b"{}"), b"config {}");
    }

    #[test]
    fn parses_channel_targets() {
        assert_eq!(
            ChannelTarget::parse("example.com", 80),
            Some(ChannelTarget::Tcp { host: "example.com".into(), port: 80 })
        );
        assert_eq!(
            ChannelTarget::parse("1.1.1.1/udp", 53),
            Some(ChannelTarget::Udp { host: "1.1.1.1".into(), port: 53 })
        );
        assert_eq!(ChannelTarget::parse("socks", 0), Some(ChannelTarget::Socks));
        assert_eq!(ChannelTarget::parse("example.com", 70_000), None);
    }
}
