use std::{fmt, str::FromStr};

use tokio::net::{TcpListener, UdpSocket};

use crate::error::ServerError;

// Default endpoints for shorthand remote specs.
const DEFAULT_LOCAL_HOST: &str = "0.0.0.0";
const DEFAULT_REMOTE_HOST: &str = "localhost";
const DEFAULT_SOCKS_HOST: &str = "127.0.0.1";
const DEFAULT_SOCKS_PORT: u16 = 1080;

// Target host sentinel routing a stream to the embedded SOCKS5 responder.
pub(crate) const SOCKS_SENTINEL: &str = "socks";
// Local host sentinel for client-side stdio remotes.
pub(crate) const STDIO_SENTINEL: &str = "stdio";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransportFamily {
    Tcp,
    Udp,
}

// A single forwarding rule, immutable after parse.
//
// The local side names a listener the server must bind when `reverse` is
// set; otherwise it is client-owned and only the remote side matters here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Remote {
    pub(crate) local_host: String,
    pub(crate) local_port: u16,
    pub(crate) remote_host: String,
    pub(crate) remote_port: u16,
    pub(crate) family: TransportFamily,
    pub(crate) reverse: bool,
    pub(crate) socks: bool,
    pub(crate) stdio: bool,
}

impl Remote {
    // The externally observable endpoint of this remote, matched against
    // user address patterns.
    pub(crate) fn user_addr(&self) -> String {
        if self.reverse {
            format!("R:{}:{}", self.local_host, self.local_port)
        } else {
            format!("{}:{}", self.remote_host, self.remote_port)
        }
    }

    // Pre-bind feasibility check for reverse remotes. The socket is bound
    // and immediately dropped; the real listener is created after the
    // config reply.
    pub(crate) async fn can_listen(&self) -> bool {
        let address = (self.local_host.as_str(), self.local_port);
        match self.family {
            TransportFamily::Tcp => TcpListener::bind(address).await.is_ok(),
            TransportFamily::Udp => UdpSocket::bind(address).await.is_ok(),
        }
    }
}

impl fmt::Display for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reverse {
            write!(f, "R:")?;
        }
        write!(f, "{}:{}=>", self.local_host, self.local_port)?;
        if self.socks {
            write!(f, "{SOCKS_SENTINEL}")?;
        } else {
            write!(f, "{}:{}", self.remote_host, self.remote_port)?;
        }
        if self.family == TransportFamily::Udp {
            write!(f, "/udp")?;
        }
        Ok(())
    }
}

impl FromStr for Remote {
    type Err = ServerError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let invalid = || ServerError::InvalidRemote(spec.into());
        let mut s = spec;
        let reverse = if let Some(rest) = s.strip_prefix("R:") {
            s = rest;
            true
        } else {
            false
        };
        let family = if let Some(rest) = s.strip_suffix("/udp") {
            s = rest;
            TransportFamily::Udp
        } else {
            TransportFamily::Tcp
        };
        if s.is_empty() {
            return Err(invalid());
        }
        let mut parts: Vec<&str> = s.split(':').collect();
        let stdio = parts.first() == Some(&STDIO_SENTINEL);
        if stdio {
            parts.remove(0);
        }
        let socks = parts.last() == Some(&SOCKS_SENTINEL);
        if socks {
            if reverse || stdio || family == TransportFamily::Udp {
                // A SOCKS endpoint is a plain stream destination.
                return Err(invalid());
            }
            parts.pop();
            let (local_host, local_port) = match parts.as_slice() {
                [] => (DEFAULT_SOCKS_HOST.into(), DEFAULT_SOCKS_PORT),
                [port] => (DEFAULT_SOCKS_HOST.into(), parse_port(port).ok_or_else(invalid)?),
                [host, port] => ((*host).into(), parse_port(port).ok_or_else(invalid)?),
                _ => return Err(invalid()),
            };
            return Ok(Remote {
                local_host,
                local_port,
                remote_host: SOCKS_SENTINEL.into(),
                remote_port: 0,
                family,
                reverse,
                socks,
                stdio,
            });
        }
        if stdio {
            // stdio:remote-host:remote-port; the local side is the client's
            // standard streams, so no listener endpoint applies.
            let [remote_host, remote_port] = parts.as_slice() else {
                return Err(invalid());
            };
            return Ok(Remote {
                local_host: STDIO_SENTINEL.into(),
                local_port: 0,
                remote_host: (*remote_host).into(),
                remote_port: parse_port(remote_port).ok_or_else(invalid)?,
                family,
                reverse,
                socks,
                stdio,
            });
        }
        let (local_host, local_port, remote_host, remote_port) = match parts.as_slice() {
            [port] => {
                let port = parse_port(port).ok_or_else(invalid)?;
                (DEFAULT_LOCAL_HOST.into(), port, DEFAULT_REMOTE_HOST.into(), port)
            }
            [local_port, remote_port] => (
                DEFAULT_LOCAL_HOST.into(),
                parse_port(local_port).ok_or_else(invalid)?,
                DEFAULT_REMOTE_HOST.into(),
                parse_port(remote_port).ok_or_else(invalid)?,
            ),
            [local_port, remote_host, remote_port] => (
                DEFAULT_LOCAL_HOST.into(),
                parse_port(local_port).ok_or_else(invalid)?,
                (*remote_host).into(),
                parse_port(remote_port).ok_or_else(invalid)?,
            ),
            [local_host, local_port, remote_host, remote_port] => (
                (*local_host).into(),
                parse_port(local_port).ok_or_else(invalid)?,
                (*remote_host).into(),
                parse_port(remote_port).ok_or_else(invalid)?,
            ),
            _ => return Err(invalid()),
        };
        Ok(Remote {
            local_host,
            local_port,
            remote_host,
            remote_port,
            family,
            reverse,
            socks,
            stdio,
        })
    }
}

fn parse_port(value: &str) -> Option<u16> {
    value.parse::<u16>().ok().filter(|port| *port != 0)
}

// An ordered sequence of forwarding rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Remotes(pub(crate) Vec<Remote>);

impl Remotes {
    pub(crate) fn parse(specs: &[String]) -> Result<Self, ServerError> {
        specs
            .iter()
            .map(|spec| spec.parse())
            .collect::<Result<Vec<_>, _>>()
            .map(Remotes)
    }

    // The reverse-marked subset, declaration order preserved.
    pub(crate) fn reversed(&self) -> Vec<Remote> {
        self.0.iter().filter(|remote| remote.reverse).cloned().collect()
    }
}

#[cfg(test)]
mod remote_tests {
    use super::{Remote, Remotes, TransportFamily};

    #[test]
    fn parses_full_reverse_spec() {
        let remote: Remote = "R:0.0.0.0:8080:localhost:22".parse().unwrap();
        assert_eq!(
            remote,
            Remote {
                local_host: "0.0.0.0".into(),
                local_port: 8080,
                remote_host: "localhost".into(),
                remote_port: 22,
                family: TransportFamily::Tcp,
                reverse: true,
                socks: false,
                stdio: false,
            }
        );
        assert_eq!(remote.to_string(), "R:0.0.0.0:8080=>localhost:22");
    }

    #[test]
    fn parses_three_part_spec_with_default_local_host() {
        let remote: Remote = "8080:example.com:80".parse().unwrap();
        assert_eq!(remote.local_host, "0.0.0.0");
        assert_eq!(remote.local_port, 8080);
        assert_eq!(remote.remote_host, "example.com");
        assert_eq!(remote.remote_port, 80);
        assert!(!remote.reverse);
    }

    #[test]
    fn parses_port_shorthands() {
        let remote: Remote = "3000".parse().unwrap();
        assert_eq!(remote.local_port, 3000);
        assert_eq!(remote.remote_host, "localhost");
        assert_eq!(remote.remote_port, 3000);
        let remote: Remote = "3000:4000".parse().unwrap();
        assert_eq!(remote.local_port, 3000);
        assert_eq!(remote.remote_host, "localhost");
        assert_eq!(remote.remote_port, 4000);
    }

    #[test]
    fn parses_udp_suffix() {
        let remote: Remote = "R:5353:1.1.1.1:53/udp".parse().unwrap();
        assert_eq!(remote.family, TransportFamily::Udp);
        assert!(remote.reverse);
        assert_eq!(remote.to_string(), "R:0.0.0.0:5353=>1.1.1.1:53/udp");
    }

    #[test]
    fn parses_socks_specs() {
        let remote: Remote = "socks".parse().unwrap();
        assert!(remote.socks);
        assert_eq!(remote.local_host, "127.0.0.1");
        assert_eq!(remote.local_port, 1080);
        assert_eq!(remote.remote_host, "socks");
        let remote: Remote = "8000:socks".parse().unwrap();
        assert_eq!(remote.local_port, 8000);
        assert!(remote.socks);
        let remote: Remote = "127.0.0.1:8000:socks".parse().unwrap();
        assert_eq!(remote.local_host, "127.0.0.1");
        assert!(remote.socks);
    }

    #[test]
    fn parses_stdio_spec() {
        let remote: Remote = "stdio:example.com:22".parse().unwrap();
        assert!(remote.stdio);
        assert_eq!(remote.remote_host, "example.com");
        assert_eq!(remote.remote_port, 22);
    }

    #[test]
    fn rejects_malformed_specs() {
        for spec in [
            "",
            "R:",
            "abc",
            "0:localhost:22",
            "70000:localhost:22",
            "8080:localhost:notaport",
            "a:b:c:d:e",
            "socks/udp",
            "R:socks",
            "stdio:example.com",
        ] {
            assert!(spec.parse::<Remote>().is_err(), "accepted {spec:?}");
        }
    }

    #[test]
    fn user_addr_depends_on_direction() {
        let reverse: Remote = "R:8080:localhost:22".parse().unwrap();
        assert_eq!(reverse.user_addr(), "R:0.0.0.0:8080");
        let forward: Remote = "8080:example.com:80".parse().unwrap();
        assert_eq!(forward.user_addr(), "example.com:80");
    }

    #[test]
    fn reversed_preserves_declaration_order() {
        let remotes = Remotes::parse(&[
            "R:8081:localhost:22".into(),
            "3000:example.com:80".into(),
            "R:8080:localhost:23".into(),
        ])
        .unwrap();
        let reversed = remotes.reversed();
        assert_eq!(reversed.len(), 2);
        assert_eq!(reversed[0].local_port, 8081);
        assert_eq!(reversed[1].local_port, 8080);
    }

    #[tokio::test]
    async fn can_listen_rejects_taken_port() {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let remote: Remote = format!("R:127.0.0.1:{port}:localhost:22").parse().unwrap();
        assert!(!remote.can_listen().await);
        drop(listener);
        // Port zero is rejected at parse time rather than treated as "any".
        let free: Result<Remote, _> = "R:127.0.0.1:0:localhost:22".parse();
        assert!(free.is_err());
    }
}
