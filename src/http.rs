use std::{error::Error, net::SocketAddr, sync::atomic::Ordering, sync::Arc};

use bytes::Bytes;
use http::{header, HeaderName, StatusCode};
use http_body_util::{Either, Full};
use hyper::{body::Incoming, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tracing::{debug, info};

use crate::{session, ProxyTarget, PenguinServer, BUILD_VERSION, PROTOCOL_VERSION};

// Pre-shared-key header checked before a tunnel upgrade is honored.
pub(crate) const PSK_HEADER: HeaderName = HeaderName::from_static("x-penguin-psk");
// Sub-protocol prefix marking tunnel clients of any version.
const PROTOCOL_PREFIX: &str = "penguin-";

pub(crate) type DispatchBody = Either<Full<Bytes>, Incoming>;

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<DispatchBody> {
    Response::builder()
        .status(status)
        .body(Either::Left(Full::new(body.into())))
        .expect("static response must build")
}

// Single HTTP entry point. Classifies tunnel upgrades by the Upgrade and
// Sec-WebSocket-Protocol headers behind the PSK gate; everything else falls
// through to the proxy delegate, the health endpoints, or the 404 body.
pub(crate) async fn tunnel_handler<B>(
    mut request: Request<B>,
    peer: SocketAddr,
    server: Arc<PenguinServer>,
) -> Response<DispatchBody>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Error + Send + Sync + 'static,
{
    let upgrade = request
        .headers()
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let protocol = request
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    let psk = request
        .headers()
        .get(PSK_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    if upgrade == "websocket" && protocol.starts_with(PROTOCOL_PREFIX) {
        let psk_matches = match &server.policy.psk {
            None => true,
            Some(expected) => psk.as_deref() == Some(expected.as_str()),
        };
        if psk_matches {
            if protocol == PROTOCOL_VERSION {
                return upgrade_tunnel(&mut request, peer, server);
            }
            info!(
                "ignoring client connection using protocol '{protocol}', \
                 expected '{PROTOCOL_VERSION}'"
            );
        } else {
            info!(
                "ignoring client connection with incorrect or missing PSK '{}'",
                psk.unwrap_or_default()
            );
        }
    }
    if let Some(proxy) = &server.policy.proxy {
        return proxy_request(request, peer, proxy).await;
    }
    if !server.policy.obfuscate {
        match request.uri().path() {
            "/health" => return text_response(StatusCode::OK, "OK\n"),
            "/version" => return text_response(StatusCode::OK, BUILD_VERSION),
            _ => {}
        }
    }
    text_response(StatusCode::NOT_FOUND, server.policy.resp_404.clone())
}

// Accepts the WebSocket upgrade and hands the connection to a new session
// task. The sub-protocol echoed back always equals the expected version
// token; the dispatcher has already checked it.
fn upgrade_tunnel<B>(
    request: &mut Request<B>,
    peer: SocketAddr,
    server: Arc<PenguinServer>,
) -> Response<DispatchBody>
where
    B: hyper::body::Body + Send + 'static,
{
    let Some(key) = request.headers().get(header::SEC_WEBSOCKET_KEY) else {
        debug!("failed to upgrade (missing Sec-WebSocket-Key)");
        return text_response(StatusCode::BAD_REQUEST, "Bad Request\n");
    };
    let accept_key = derive_accept_key(key.as_bytes());
    let id = server.session_id.fetch_add(1, Ordering::AcqRel);
    let on_upgrade = hyper::upgrade::on(request);
    tokio::spawn(session::run(server, id, peer, on_upgrade));
    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept_key)
        .header(header::SEC_WEBSOCKET_PROTOCOL, PROTOCOL_VERSION)
        .body(Either::Left(Full::default()))
        .expect("upgrade response must build")
}

// Minimal pass-through to the configured backend, so non-tunnel requests
// are indistinguishable from the backend's own responses.
async fn proxy_request<B>(
    mut request: Request<B>,
    peer: SocketAddr,
    proxy: &ProxyTarget,
) -> Response<DispatchBody>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Error + Send + Sync + 'static,
{
    request.headers_mut().insert(
        HeaderName::from_static("x-forwarded-for"),
        peer.ip()
            .to_string()
            .parse()
            .expect("IP address is a valid header value"),
    );
    let stream = match TcpStream::connect((proxy.host.as_str(), proxy.port)).await {
        Ok(stream) => stream,
        Err(error) => {
            debug!(%error, "failed to reach proxy backend");
            return text_response(StatusCode::BAD_GATEWAY, "Bad Gateway\n");
        }
    };
    let io = TokioIo::new(stream);
    match hyper::client::conn::http1::handshake(io).await {
        Ok((mut sender, connection)) => {
            tokio::spawn(async move {
                if let Err(error) = connection.await {
                    debug!(%error, "proxy backend connection failed");
                }
            });
            match sender.send_request(request).await {
                Ok(response) => response.map(Either::Right),
                Err(error) => {
                    debug!(%error, "proxy backend request failed");
                    text_response(StatusCode::BAD_GATEWAY, "Bad Gateway\n")
                }
            }
        }
        Err(error) => {
            debug!(%error, "proxy backend handshake failed");
            text_response(StatusCode::BAD_GATEWAY, "Bad Gateway\n")
        }
    }
}
