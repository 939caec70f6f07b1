use std::{collections::HashMap, future::Future, net::SocketAddr, pin::Pin, sync::Arc};

use color_eyre::eyre::Context;
use russh::server::Handle;
use tokio::{
    net::{TcpListener, UdpSocket},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument};

use crate::{
    remote::{Remote, TransportFamily},
    udp,
};

// Serves the reverse side of a session: listeners owned by the server whose
// accepted traffic is carried to the client over new tunnel channels. One
// instance per session, borrowing the session's connection handle and
// cancellation root.
pub(crate) struct Tunnel {
    handle: Handle,
    token: CancellationToken,
    buffer_size: usize,
}

impl Tunnel {
    pub(crate) fn new(handle: Handle, token: CancellationToken, buffer_size: usize) -> Self {
        Tunnel {
            handle,
            token,
            buffer_size,
        }
    }

    // Binds every reverse remote in declared order, then serves them until
    // the session is cancelled. A bind or accept failure is a session
    // error; the supervisor cancels the root in response.
    pub(crate) async fn bind_remotes(&self, remotes: Vec<Remote>) -> color_eyre::Result<()> {
        if remotes.is_empty() {
            return Ok(());
        }
        let mut serve_loops: Vec<Pin<Box<dyn Future<Output = color_eyre::Result<()>> + Send + '_>>> =
            Vec::new();
        for remote in remotes {
            let address = (remote.local_host.as_str(), remote.local_port);
            match remote.family {
                TransportFamily::Tcp => {
                    let listener = TcpListener::bind(address)
                        .await
                        .with_context(|| format!("binding {remote}"))?;
                    info!(%remote, "listening");
                    serve_loops.push(Box::pin(self.serve_tcp(listener, remote)));
                }
                TransportFamily::Udp => {
                    let socket = UdpSocket::bind(address)
                        .await
                        .with_context(|| format!("binding {remote}"))?;
                    info!(%remote, "listening");
                    serve_loops.push(Box::pin(self.serve_udp(socket, remote)));
                }
            }
        }
        futures_util::future::try_join_all(serve_loops).await?;
        Ok(())
    }

    async fn serve_tcp(&self, listener: TcpListener, remote: Remote) -> color_eyre::Result<()> {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (mut stream, peer) = accepted
                        .with_context(|| format!("accepting on {remote}"))?;
                    debug!(%peer, %remote, "accepted connection");
                    let handle = self.handle.clone();
                    let token = self.token.clone();
                    let buffer_size = self.buffer_size;
                    let remote_host = remote.remote_host.clone();
                    let remote_port = remote.remote_port;
                    tokio::spawn(
                        async move {
                            // The address data names the requested remote so
                            // the client can route the stream.
                            match handle
                                .channel_open_forwarded_tcpip(
                                    remote_host,
                                    remote_port.into(),
                                    peer.ip().to_string(),
                                    peer.port().into(),
                                )
                                .await
                            {
                                Ok(channel) => {
                                    let mut channel_stream = channel.into_stream();
                                    tokio::select! {
                                        _ = token.cancelled() => {}
                                        result = tokio::io::copy_bidirectional_with_sizes(
                                            &mut stream,
                                            &mut channel_stream,
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
                                    debug!(%error, "failed to open channel to client");
                                }
                            }
                        }
                        .instrument(tracing::Span::current()),
                    );
                }
            }
        }
    }

    // One channel per datagram source, with idle expiry inside the relay.
    async fn serve_udp(&self, socket: UdpSocket, remote: Remote) -> color_eyre::Result<()> {
        let socket = Arc::new(socket);
        let mut peers: HashMap<SocketAddr, mpsc::Sender<Vec<u8>>> = HashMap::new();
        let mut buf = vec![0u8; udp::MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = self.token.cancelled() => return Ok(()),
                received = socket.recv_from(&mut buf) => {
                    let (len, peer) = received
                        .with_context(|| format!("receiving on {remote}"))?;
                    let datagram = buf[..len].to_vec();
                    if let Some(sender) = peers.get(&peer) {
                        if !sender.is_closed() {
                            // Dropping on a full relay queue is ordinary
                            // datagram loss.
                            let _ = sender.try_send(datagram);
                            continue;
                        }
                        peers.remove(&peer);
                    }
                    match self
                        .handle
                        .channel_open_forwarded_tcpip(
                            format!("{}/udp", remote.remote_host),
                            remote.remote_port.into(),
                            peer.ip().to_string(),
                            peer.port().into(),
                        )
                        .await
                    {
                        Ok(channel) => {
                            debug!(%peer, %remote, "new datagram source");
                            let (sender, receiver) = mpsc::channel(64);
                            let _ = sender.try_send(datagram);
                            peers.insert(peer, sender);
                            let socket = Arc::clone(&socket);
                            let token = self.token.clone();
                            tokio::spawn(
                                async move {
                                    let stream = channel.into_stream();
                                    if let Err(error) = udp::relay_reverse(
                                        stream, receiver, socket, peer, token,
                                    )
                                    .await
                                    {
                                        debug!(%error, %peer, "udp relay ended");
                                    }
                                }
                                .instrument(tracing::Span::current()),
                            );
                        }
                        Err(error) => {
                            debug!(%error, "failed to open channel to client");
                        }
                    }
                }
            }
        }
    }
}
