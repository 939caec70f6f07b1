use std::{io, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::UdpSocket,
    time::timeout,
};
use tokio_util::sync::CancellationToken;

pub(crate) const MAX_DATAGRAM: usize = 65_535;
// Relay tasks without traffic in either direction are torn down after this.
pub(crate) const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

// Datagrams ride tunnel channels with a big-endian u16 length prefix so
// message boundaries survive the stream transport.
pub(crate) async fn write_datagram<W>(writer: &mut W, datagram: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u16::try_from(datagram.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "datagram too large"))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(datagram).await?;
    writer.flush().await
}

// Reads one length-prefixed datagram; None on clean EOF at a frame boundary.
pub(crate) async fn read_datagram<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len = [0u8; 2];
    match reader.read_exact(&mut len).await {
        Ok(_) => {}
        Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(error) => return Err(error),
    }
    let mut datagram = vec![0u8; u16::from_be_bytes(len) as usize];
    reader.read_exact(&mut datagram).await?;
    Ok(Some(datagram))
}

// Relays between a tunnel channel and a freshly bound, connected UDP
// socket, until the channel closes, the relay idles out, or the session is
// cancelled. Serves outbound `host:port/udp` channels.
pub(crate) async fn relay_outbound<S>(
    mut stream: S,
    host: &str,
    port: u16,
    token: CancellationToken,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    socket.connect((host, port)).await?;
    let (mut read_half, mut write_half) = tokio::io::split(&mut stream);
    let to_socket = async {
        loop {
            match timeout(UDP_IDLE_TIMEOUT, read_datagram(&mut read_half)).await {
                Ok(Ok(Some(datagram))) => {
                    socket.send(&datagram).await?;
                }
                Ok(Ok(None)) => return Ok(()),
                Ok(Err(error)) => return Err(error),
                // Idle expiry is a clean teardown.
                Err(_) => return Ok(()),
            }
        }
    };
    let from_socket = async {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let len = socket.recv(&mut buf).await?;
            write_datagram(&mut write_half, &buf[..len]).await?;
        }
    };
    tokio::select! {
        _ = token.cancelled() => Ok(()),
        result = to_socket => result,
        result = from_socket => result,
    }
}

// Relays between a tunnel channel and one datagram source of a reverse
// remote's socket: frames read from the channel go back to the source,
// datagrams from the source (queued by the listener loop) go into the
// channel. Ends on channel close, idle expiry, or session cancellation.
pub(crate) async fn relay_reverse<S>(
    mut stream: S,
    mut datagrams: tokio::sync::mpsc::Receiver<Vec<u8>>,
    socket: std::sync::Arc<UdpSocket>,
    peer: std::net::SocketAddr,
    token: CancellationToken,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut read_half, mut write_half) = tokio::io::split(&mut stream);
    let to_peer = async {
        loop {
            match timeout(UDP_IDLE_TIMEOUT, read_datagram(&mut read_half)).await {
                Ok(Ok(Some(datagram))) => {
                    socket.send_to(&datagram, peer).await?;
                }
                Ok(Ok(None)) => return Ok(()),
                Ok(Err(error)) => return Err(error),
                Err(_) => return Ok(()),
            }
        }
    };
    let from_peer = async {
        loop {
            match timeout(UDP_IDLE_TIMEOUT, datagrams.recv()).await {
                Ok(Some(datagram)) => write_datagram(&mut write_half, &datagram).await?,
                // Listener gone or relay idle; either way we are done.
                Ok(None) => return Ok(()),
                Err(_) => return Ok(()),
            }
        }
    };
    tokio::select! {
        _ = token.cancelled() => Ok(()),
        result = to_peer => result,
        result = from_peer => result,
    }
}

#[cfg(test)]
mod udp_tests {
    use tokio::net::UdpSocket;
    use tokio_util::sync::CancellationToken;

    use super::{read_datagram, relay_outbound, write_datagram};

    #[tokio::test]
    async fn frames_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_datagram(&mut a, b"first").await.unwrap();
        write_datagram(&mut a, b"").await.unwrap();
        write_datagram(&mut a, b"second").await.unwrap();
        drop(a);
        assert_eq!(read_datagram(&mut b).await.unwrap().unwrap(), b"first");
        assert_eq!(read_datagram(&mut b).await.unwrap().unwrap(), b"");
        assert_eq!(read_datagram(&mut b).await.unwrap().unwrap(), b"second");
        assert!(read_datagram(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        tokio::io::AsyncWriteExt::write_all(&mut a, &[0x00, 0x10, 0xaa])
            .await
            .unwrap();
        drop(a);
        assert!(read_datagram(&mut b).await.is_err());
    }

    #[tokio::test]
    async fn reverse_relay_bridges_socket_and_channel() {
        use std::sync::Arc;

        let peer_socket = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let peer = peer_socket.local_addr().unwrap();
        let relay_socket = Arc::new(UdpSocket::bind(("127.0.0.1", 0)).await.unwrap());
        let relay_addr = relay_socket.local_addr().unwrap();

        let (mut near, far) = tokio::io::duplex(4096);
        let (sender, receiver) = tokio::sync::mpsc::channel(4);
        tokio::spawn(super::relay_reverse(
            far,
            receiver,
            relay_socket,
            peer,
            CancellationToken::new(),
        ));

        // Datagram queued by the listener loop comes out of the channel.
        sender.send(b"to client".to_vec()).await.unwrap();
        let framed = read_datagram(&mut near).await.unwrap().unwrap();
        assert_eq!(framed, b"to client");

        // A frame written into the channel reaches the datagram source.
        write_datagram(&mut near, b"to peer").await.unwrap();
        let mut buf = [0u8; 16];
        let (len, from) = peer_socket.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"to peer");
        assert_eq!(from, relay_addr);
    }

    #[tokio::test]
    async fn relays_datagrams_to_an_echo_socket() {
        let echo = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let port = echo.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let (len, peer) = echo.recv_from(&mut buf).await.unwrap();
            echo.send_to(&buf[..len], peer).await.unwrap();
        });

        let (mut near, far) = tokio::io::duplex(4096);
        let token = CancellationToken::new();
        let relay = tokio::spawn(async move {
            relay_outbound(far, "127.0.0.1", port, token).await
        });

        write_datagram(&mut near, b"ping?").await.unwrap();
        let echoed = read_datagram(&mut near).await.unwrap().unwrap();
        assert_eq!(echoed, b"ping?");
        drop(near);
        relay.await.unwrap().unwrap();
    }
}
