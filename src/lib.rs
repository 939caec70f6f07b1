use std::{
    convert::Infallible,
    path::Path,
    sync::{atomic::AtomicUsize, Arc},
    time::Duration,
};

use color_eyre::eyre::{eyre, Context};
use hyper::{body::Incoming, service::service_fn, Request};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use russh::keys::{
    decode_secret_key,
    ssh_key::{private::Ed25519Keypair, LineEnding},
};
use tokio::{fs, net::TcpListener};
use tracing::{debug, info, warn};

pub mod config;
mod error;
mod http;
mod protocol;
mod remote;
mod session;
mod socks;
mod ssh;
mod tickets;
pub mod transport;
mod tunnel;
mod udp;
mod users;

pub use config::ApplicationConfig;

use crate::{config::env_duration, tickets::TicketStore, users::UserStore};

pub(crate) const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");
// Sub-protocol token clients must negotiate; fixed at build time.
pub(crate) const PROTOCOL_VERSION: &str = concat!("penguin-v", env!("CARGO_PKG_VERSION_MAJOR"));

// Backend serving non-tunnel HTTP requests, when configured.
pub(crate) struct ProxyTarget {
    pub(crate) host: String,
    pub(crate) port: u16,
}

pub(crate) struct ServerPolicy {
    // Empty means the X-Penguin-Psk header goes unchecked.
    pub(crate) psk: Option<String>,
    pub(crate) reverse: bool,
    pub(crate) socks5: bool,
    pub(crate) obfuscate: bool,
    pub(crate) resp_404: String,
    pub(crate) proxy: Option<ProxyTarget>,
    // Zero disables the server-initiated keep-alive timer.
    pub(crate) keepalive: Duration,
    pub(crate) config_timeout: Duration,
    pub(crate) buffer_size: usize,
}

// Shared state for the whole server. One instance, cloned into every
// connection task behind an Arc.
pub(crate) struct PenguinServer {
    pub(crate) policy: ServerPolicy,
    pub(crate) users: UserStore,
    pub(crate) tickets: TicketStore,
    pub(crate) session_id: AtomicUsize,
    pub(crate) ssh_config: Arc<russh::server::Config>,
}

#[doc(hidden)]
// Main entrypoint of the application.
pub async fn entrypoint(config: ApplicationConfig) -> color_eyre::Result<()> {
    info!("Starting penguin-server...");
    let key = load_or_generate_key(config.private_key_file.as_path()).await?;
    let users = if let Some(authfile) = &config.authfile {
        UserStore::load(authfile)?
    } else if let Some(auth) = &config.auth {
        UserStore::single(auth)?
    } else {
        UserStore::default()
    };
    let proxy = match &config.proxy {
        Some(url) => Some(ProxyTarget {
            host: url
                .host_str()
                .ok_or_else(|| eyre!("proxy backend URL must include a host"))?
                .to_string(),
            port: url.port_or_known_default().unwrap_or(80),
        }),
        None => None,
    };
    let policy = ServerPolicy {
        // An empty key means the header goes unchecked.
        psk: config.psk.filter(|psk| !psk.is_empty()),
        reverse: config.reverse,
        socks5: config.socks5,
        obfuscate: config.obfs,
        resp_404: config.resp_404,
        proxy,
        keepalive: config.keepalive,
        config_timeout: env_duration("CONFIG_TIMEOUT", Duration::from_secs(10)),
        buffer_size: config.buffer_size,
    };
    let ssh_config = Arc::new(russh::server::Config {
        auth_rejection_time: Duration::from_secs(2),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        inactivity_timeout: Some(Duration::from_secs(3_600)),
        keepalive_interval: (!policy.keepalive.is_zero()).then_some(policy.keepalive),
        keepalive_max: 3,
        keys: vec![key],
        ..Default::default()
    });
    let server = Arc::new(PenguinServer {
        policy,
        users,
        tickets: TicketStore::default(),
        session_id: AtomicUsize::new(0),
        ssh_config,
    });

    let listener = TcpListener::bind((config.host, config.port.get()))
        .await
        .with_context(|| "Error listening to port and address")?;
    info!(
        address = %listener.local_addr()?,
        protocol = %PROTOCOL_VERSION,
        "Listening for tunnel connections.",
    );
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        warn!(%error, "Error accepting connection.");
                        continue;
                    }
                };
                let server = Arc::clone(&server);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |request: Request<Incoming>| {
                        let server = Arc::clone(&server);
                        async move {
                            Ok::<_, Infallible>(
                                crate::http::tunnel_handler(request, peer, server).await,
                            )
                        }
                    });
                    let builder = auto::Builder::new(TokioExecutor::new());
                    let connection = builder.serve_connection_with_upgrades(io, service);
                    if let Err(error) = connection.await {
                        debug!(%error, "Connection ended with error.");
                    }
                });
            }
            _ = wait_for_signal() => {
                info!("Shutting down.");
                break;
            }
        }
    }
    Ok(())
}

// Find the private SSH key for the server or create a new one.
async fn load_or_generate_key(path: &Path) -> color_eyre::Result<russh::keys::PrivateKey> {
    match fs::read_to_string(path).await {
        Ok(key) => decode_secret_key(&key, None).with_context(|| "Error decoding secret key"),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            info!("Key file not found. Creating...");
            let key = russh::keys::PrivateKey::from(Ed25519Keypair::from_seed(
                &ChaCha20Rng::from_os_rng().random(),
            ));
            let key_string = key.to_openssh(LineEnding::LF)?;
            let key = decode_secret_key(&key_string, None)
                .with_context(|| "Error decoding secret key")?;
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)
                        .await
                        .with_context(|| "Error creating secret key directory")?;
                }
            }
            fs::write(path, key_string)
                .await
                .with_context(|| "Error saving secret key to filesystem")?;
            Ok(key)
        }
        Err(error) => Err(error).with_context(|| "Error reading secret key"),
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut signal_terminate = signal(SignalKind::terminate()).unwrap();
    let mut signal_interrupt = signal(SignalKind::interrupt()).unwrap();

    tokio::select! {
        _ = signal_terminate.recv() => debug!("Received SIGTERM."),
        _ = signal_interrupt.recv() => debug!("Received SIGINT."),
    };
}

#[cfg(windows)]
async fn wait_for_signal() {
    use tokio::signal::windows;

    let mut signal_c = windows::ctrl_c().unwrap();
    let mut signal_break = windows::ctrl_break().unwrap();
    let mut signal_close = windows::ctrl_close().unwrap();
    let mut signal_shutdown = windows::ctrl_shutdown().unwrap();

    tokio::select! {
        _ = signal_c.recv() => debug!("Received CTRL_C."),
        _ = signal_break.recv() => debug!("Received CTRL_BREAK."),
        _ = signal_close.recv() => debug!("Received CTRL_CLOSE."),
        _ = signal_shutdown.recv() => debug!("Received CTRL_SHUTDOWN."),
    };
}
