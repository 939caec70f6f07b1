use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NO_ACCEPTABLE: u8 = 0xff;
const COMMAND_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_GENERAL_FAILURE: u8 = 0x01;
const REPLY_HOST_UNREACHABLE: u8 = 0x04;
const REPLY_CONNECTION_REFUSED: u8 = 0x05;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ATYP_NOT_SUPPORTED: u8 = 0x08;

// Embedded SOCKS5 responder (RFC 1928, CONNECT only, no authentication)
// serving a single proxied stream. Used for channels whose destination is
// the `socks` sentinel.
pub(crate) async fn serve<S>(
    mut stream: S,
    token: CancellationToken,
    buffer_size: usize,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Method negotiation.
    let version = stream.read_u8().await?;
    if version != SOCKS_VERSION {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unsupported SOCKS version {version}"),
        ));
    }
    let method_count = stream.read_u8().await?;
    let mut methods = vec![0u8; method_count as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_NO_AUTH) {
        stream.write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE]).await?;
        return Ok(());
    }
    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    // Request: VER CMD RSV ATYP ADDR PORT.
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let [_, command, _, address_type] = header;
    let host = match address_type {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            Ipv4Addr::from(addr).to_string()
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            Ipv6Addr::from(addr).to_string()
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await?;
            let mut name = vec![0u8; len as usize];
            stream.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        _ => {
            reply(&mut stream, REPLY_ATYP_NOT_SUPPORTED).await?;
            return Ok(());
        }
    };
    let port = stream.read_u16().await?;
    if command != COMMAND_CONNECT {
        reply(&mut stream, REPLY_COMMAND_NOT_SUPPORTED).await?;
        return Ok(());
    }

    let mut outbound = match TcpStream::connect((host.as_str(), port)).await {
        Ok(outbound) => outbound,
        Err(error) => {
            debug!(%error, %host, %port, "SOCKS connect failed");
            let code = match error.kind() {
                std::io::ErrorKind::ConnectionRefused => REPLY_CONNECTION_REFUSED,
                std::io::ErrorKind::NotFound | std::io::ErrorKind::TimedOut => {
                    REPLY_HOST_UNREACHABLE
                }
                _ => REPLY_GENERAL_FAILURE,
            };
            reply(&mut stream, code).await?;
            return Ok(());
        }
    };
    reply(&mut stream, REPLY_SUCCEEDED).await?;

    tokio::select! {
        _ = token.cancelled() => {}
        result = tokio::io::copy_bidirectional_with_sizes(
            &mut stream,
            &mut outbound,
            buffer_size,
            buffer_size,
        ) => {
            result?;
        }
    }
    Ok(())
}

// Reply with an all-zero IPv4 bind address; clients only inspect the code.
async fn reply<S>(stream: &mut S, code: u8) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&[SOCKS_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await
}
