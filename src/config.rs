use std::{
    net::{IpAddr, Ipv6Addr},
    num::NonZero,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use color_eyre::eyre::{eyre, Context};
use tracing::warn;
use url::Url;

// CLI configuration for the tunnel server.
#[doc(hidden)]
#[derive(Debug, Parser, PartialEq)]
#[command(version, about, long_about = None)]
pub struct ApplicationConfig {
    /// Address to listen for client connections.
    #[arg(
        long,
        default_value_t = IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        value_name = "ADDRESS"
    )]
    pub host: IpAddr,

    /// Port to listen for client connections.
    #[arg(long, default_value_t = NonZero::new(8080).unwrap(), value_name = "PORT")]
    pub port: NonZero<u16>,

    /// File path to the server's secret key. If missing, it will be created
    /// for you.
    #[arg(long, default_value_os = "./penguin_key", value_name = "FILE")]
    pub private_key_file: PathBuf,

    /// Credentials of the single allowed user, in user:pass form. Grants
    /// access to any remote address.
    #[arg(long, value_name = "USER:PASS", conflicts_with = "authfile")]
    pub auth: Option<String>,

    /// Path to a user database file: a JSON object mapping user:pass
    /// credentials to arrays of regular expressions for allowed addresses.
    #[arg(long, value_name = "FILE")]
    pub authfile: Option<PathBuf>,

    /// Pre-shared key that tunnel upgrade requests must present in the
    /// X-Penguin-Psk header. When unset, the header is not checked.
    #[arg(long, value_name = "KEY")]
    pub psk: Option<String>,

    /// Allow clients to request reverse port forwarding remotes.
    #[arg(long, default_value_t = false)]
    pub reverse: bool,

    /// Allow clients to reach the built-in SOCKS5 endpoint.
    #[arg(long, default_value_t = false)]
    pub socks5: bool,

    /// How long to wait between keep-alive messages sent to an unresponsive
    /// client. A value of `0s` disables them.
    #[arg(
        long,
        default_value = "25s",
        value_parser = validate_duration,
        value_name = "DURATION"
    )]
    pub keepalive: Duration,

    /// Pretend to be an ordinary web server: hide the health and version
    /// endpoints from non-tunnel requests.
    #[arg(long, default_value_t = false)]
    pub obfs: bool,

    /// Body served with 404 responses to non-tunnel requests.
    #[arg(
        long = "resp-404",
        default_value_t = String::from("Not found\n"),
        value_name = "TEXT"
    )]
    pub resp_404: String,

    /// Backend URL to serve non-tunnel HTTP requests through, e.g.
    /// http://localhost:3000. Useful for hiding the server in plain sight.
    #[arg(long, value_parser = validate_proxy_url, value_name = "URL")]
    pub proxy: Option<Url>,

    /// Size to use for bidirectional buffers.
    #[arg(long, default_value_t = 32_768, value_name = "SIZE")]
    pub buffer_size: usize,
}

fn validate_duration(value: &str) -> color_eyre::Result<Duration> {
    Ok(humantime::Duration::from_str(value)
        .with_context(|| "invalid duration")?
        .into())
}

fn validate_proxy_url(value: &str) -> color_eyre::Result<Url> {
    let url = Url::parse(value).with_context(|| "invalid URL")?;
    if url.scheme() != "http" {
        return Err(eyre!("proxy backend must be an http:// URL"));
    }
    if url.host_str().is_none() {
        return Err(eyre!("proxy backend URL must include a host"));
    }
    Ok(url)
}

// Duration taken from the environment, falling back to a default when the
// variable is unset or unparsable.
pub(crate) fn env_duration(name: &str, default: Duration) -> Duration {
    match std::env::var(name) {
        Ok(value) => match humantime::Duration::from_str(&value) {
            Ok(duration) => duration.into(),
            Err(error) => {
                warn!(%error, %name, "ignoring unparsable duration override");
                default
            }
        },
        Err(_) => default,
    }
}
