use std::{net::SocketAddr, sync::Arc};

use russh::{
    server::{Auth, Handler, Msg, Session},
    Channel, ChannelId, CryptoVec, MethodKind, MethodSet,
};
use tokio::{net::TcpStream, sync::oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument};

use crate::{
    error::ServerError,
    protocol::{split_request, ChannelTarget, SessionConfig, REQUEST_CONFIG, REQUEST_PING},
    remote::Remotes,
    socks, udp,
    users::User,
    PenguinServer, BUILD_VERSION,
};

// Outcome of the configuration exchange, handed from the connection handler
// to the session supervisor.
pub(crate) enum ConfigOutcome {
    // Config validated; the positive reply has already been sent.
    Accepted(Remotes),
    // A negative reply has been sent; the session must close.
    Rejected,
}

// Per-connection SSH state.
pub(crate) struct ServerHandler {
    // The unique ID of this session, also the ticket-store key.
    id: usize,
    // The IP and port of this connection.
    peer: SocketAddr,
    // Shared server state: policy, users, tickets.
    server: Arc<PenguinServer>,
    // Session-wide cancellation root; stream tasks watch it.
    cancellation_token: CancellationToken,
    // Authenticated principal, consumed from the ticket store at config time.
    user: Option<Arc<User>>,
    // The client's control channel carrying config/ping requests.
    control_channel: Option<ChannelId>,
    // Present until the config exchange concludes one way or the other.
    config_tx: Option<oneshot::Sender<ConfigOutcome>>,
    // Set once the positive config reply has been sent; tunnel channels are
    // rejected before this point.
    validated: bool,
}

impl ServerHandler {
    pub(crate) fn new(
        server: Arc<PenguinServer>,
        id: usize,
        peer: SocketAddr,
        cancellation_token: CancellationToken,
    ) -> (Self, oneshot::Receiver<ConfigOutcome>) {
        let (config_tx, config_rx) = oneshot::channel();
        (
            ServerHandler {
                id,
                peer,
                server,
                cancellation_token,
                user: None,
                control_channel: None,
                config_tx: Some(config_tx),
                validated: false,
            },
            config_rx,
        )
    }

    // Decodes and validates the client's configuration request. Any error
    // returned here becomes the negative reply text.
    async fn validate_config(&mut self, payload: &[u8]) -> Result<Remotes, ServerError> {
        let config = SessionConfig::decode(payload)?;
        if config.version != BUILD_VERSION {
            let client_version = if config.version.is_empty() {
                "<unknown>"
            } else {
                config.version.as_str()
            };
            info!(
                client = %client_version,
                server = %BUILD_VERSION,
                "client version differs from server version",
            );
        }
        if !config.options.is_empty() {
            // Option flags are advisory; none alters behavior yet.
            debug!(options = ?config.options, "client offered option flags");
        }
        if !self.server.users.is_empty() {
            let Some(user) = self.server.tickets.take(self.id) else {
                // The auth callback must have stored a ticket for every
                // authenticated session; anything else is a logic bug.
                panic!("missing session ticket for authenticated session");
            };
            self.user = Some(user);
        }
        let remotes = config.parse_remotes()?;
        for remote in &remotes.0 {
            if let Some(user) = &self.user {
                let addr = remote.user_addr();
                if !user.has_access(&addr) {
                    return Err(ServerError::AccessDenied(addr));
                }
            }
            if remote.reverse {
                if !self.server.policy.reverse {
                    debug!("denied reverse port forwarding request, please enable --reverse");
                    return Err(ServerError::ReverseForwardingDisabled);
                }
                if !remote.can_listen().await {
                    return Err(ServerError::CannotListen(remote.to_string()));
                }
            }
        }
        Ok(remotes)
    }

    // Writes the error text and the negative reply for a control request.
    fn reply_failure(
        &self,
        session: &mut Session,
        channel: ChannelId,
        error: &ServerError,
    ) -> Result<(), russh::Error> {
        debug!(%error, "failed");
        session.data(channel, CryptoVec::from(error.to_string().into_bytes()))?;
        session.channel_failure(channel)
    }
}

impl Handler for ServerHandler {
    type Error = russh::Error;

    // Reject everything but password authentication up front.
    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        if self.server.users.is_empty() {
            return Ok(Auth::Accept);
        }
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::from([MethodKind::Password].as_slice())),
            partial_success: false,
        })
    }

    async fn auth_publickey(
        &mut self,
        _user: &str,
        _public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::from([MethodKind::Password].as_slice())),
            partial_success: false,
        })
    }

    // The authentication hook: validate the presented credentials against
    // the user table and leave a ticket for the supervisor. With no users
    // configured, authentication is permissive and no ticket is stored.
    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if self.server.users.is_empty() {
            return Ok(Auth::Accept);
        }
        if let Some(found) = self.server.users.get(user) {
            if found.secret == password {
                self.server.tickets.put(self.id, Arc::clone(&found));
                info!(peer = %self.peer, %user, "client authenticated");
                return Ok(Auth::Accept);
            }
        }
        debug!(peer = %self.peer, %user, "rejected credentials");
        Ok(Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        })
    }

    // The first session channel is the control channel for config and
    // keep-alive requests.
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.control_channel.is_some() {
            return Ok(false);
        }
        self.control_channel = Some(channel.id());
        Ok(true)
    }

    // Control requests ride exec requests on the control channel; the first
    // token of the payload is the request type.
    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let (kind, payload) = split_request(data);
        match kind {
            REQUEST_CONFIG if self.config_tx.is_some() => {
                let config_tx = self.config_tx.take().expect("checked above");
                match self.validate_config(payload).await {
                    Ok(remotes) => {
                        // The green light: sent before the supervisor may
                        // bind any listener.
                        session.channel_success(channel)?;
                        self.validated = true;
                        let _ = config_tx.send(ConfigOutcome::Accepted(remotes));
                        Ok(())
                    }
                    Err(error) => {
                        self.reply_failure(session, channel, &error)?;
                        let _ = config_tx.send(ConfigOutcome::Rejected);
                        Ok(())
                    }
                }
            }
            REQUEST_PING if self.validated => session.channel_success(channel),
            _ if self.config_tx.is_some() => {
                // Whatever arrived first was not a configuration request.
                let config_tx = self.config_tx.take().expect("checked above");
                self.reply_failure(session, channel, &ServerError::ExpectingConfigRequest)?;
                let _ = config_tx.send(ConfigOutcome::Rejected);
                Ok(())
            }
            kind => {
                debug!(%kind, "rejecting unknown request");
                session.channel_failure(channel)
            }
        }
    }

    // Incoming tunnel channels: dial out, relay datagrams, or hand the
    // stream to the SOCKS5 responder, depending on the requested target.
    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if port_to_connect > u16::MAX.into() || originator_port > u16::MAX.into() {
            return Err(russh::Error::Disconnect);
        }
        // No channel is served before the positive config reply.
        if !self.validated {
            debug!("rejecting channel before configuration");
            return Ok(false);
        }
        let Some(target) = ChannelTarget::parse(host_to_connect, port_to_connect) else {
            return Ok(false);
        };
        let token = self.cancellation_token.clone();
        let buffer_size = self.server.policy.buffer_size;
        match target {
            ChannelTarget::Socks => {
                if !self.server.policy.socks5 {
                    debug!("denied socks request, please enable --socks5");
                    return Ok(false);
                }
                tokio::spawn(
                    async move {
                        if let Err(error) =
                            socks::serve(channel.into_stream(), token, buffer_size).await
                        {
                            debug!(%error, "socks stream ended");
                        }
                    }
                    .instrument(tracing::Span::current()),
                );
            }
            ChannelTarget::Udp { host, port } => {
                tokio::spawn(
                    async move {
                        if let Err(error) =
                            udp::relay_outbound(channel.into_stream(), &host, port, token).await
                        {
                            debug!(%error, %host, port, "udp relay ended");
                        }
                    }
                    .instrument(tracing::Span::current()),
                );
            }
            ChannelTarget::Tcp { host, port } => {
                tokio::spawn(
                    async move {
                        let mut stream = channel.into_stream();
                        match TcpStream::connect((host.as_str(), port)).await {
                            Ok(mut outbound) => {
                                tokio::select! {
                                    _ = token.cancelled() => {}
                                    result = tokio::io::copy_bidirectional_with_sizes(
                                        &mut stream,
                                        &mut outbound,
                                        buffer_size,
                                        buffer_size,
                                    ) => {
                                        if let Err(error) = result {
                                            debug!(%error, "tunnel stream ended");
                                        }
                                    }
                                }
                            }
                            Err(error) => {
                                debug!(%error, %host, port, "failed to dial");
                            }
                        }
                    }
                    .instrument(tracing::Span::current()),
                );
            }
        }
        Ok(true)
    }

    // Reverse tunnels are negotiated through the configuration exchange,
    // not SSH remote forwarding.
    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(%address, port = *port, "rejecting tcpip-forward request");
        Ok(false)
    }
}

impl Drop for ServerHandler {
    fn drop(&mut self) {
        // Discard the ticket of a session that never reached configuration.
        self.server.tickets.remove(self.id);
    }
}
