use std::{net::SocketAddr, sync::Arc, time::Duration};

use color_eyre::eyre::Report;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{tungstenite::protocol::Role, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, Instrument};

use crate::{
    ssh::{ConfigOutcome, ServerHandler},
    transport::WebSocketTransport,
    tunnel::Tunnel,
    PenguinServer,
};

// Grace period for flushing a negative config reply before disconnecting.
const REPLY_DRAIN: Duration = Duration::from_millis(500);
// Bound on waiting for the SSH teardown after a disconnect was requested.
const CLOSE_GRACE: Duration = Duration::from_secs(3);

// Runs one tunnel session from accepted upgrade to teardown. Owns the
// cancellation root; every failure path collapses here.
pub(crate) async fn run(
    server: Arc<PenguinServer>,
    id: usize,
    peer: SocketAddr,
    on_upgrade: OnUpgrade,
) {
    let span = debug_span!("session", id);
    async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(error) => {
                debug!("failed to upgrade ({error})");
                return;
            }
        };
        let websocket =
            WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
        let stream = WebSocketTransport::new(websocket);
        debug!(%peer, "handshaking");
        let token = CancellationToken::new();
        let (handler, mut config_rx) =
            ServerHandler::new(Arc::clone(&server), id, peer, token.clone());
        let mut session =
            match russh::server::run_stream(Arc::clone(&server.ssh_config), stream, handler).await {
                Ok(session) => session,
                Err(error) => {
                    debug!("failed to handshake ({error})");
                    return;
                }
            };
        let handle = session.handle();

        // The configuration must arrive before anything else is serviced;
        // the handler replies on the request itself, we enforce the clock.
        let outcome = tokio::select! {
            result = &mut session => {
                log_close(close_result(result).err());
                return;
            }
            _ = sleep(server.policy.config_timeout) => {
                debug!("timeout waiting for configuration");
                let _ = handle
                    .disconnect(russh::Disconnect::ByApplication, "".into(), "English".into())
                    .await;
                let _ = timeout(CLOSE_GRACE, &mut session).await;
                return;
            }
            outcome = &mut config_rx => outcome,
        };
        let remotes = match outcome {
            Ok(ConfigOutcome::Accepted(remotes)) => remotes,
            Ok(ConfigOutcome::Rejected) => {
                // Let the negative reply reach the peer, then drop the link.
                if timeout(REPLY_DRAIN, &mut session).await.is_err() {
                    let _ = handle
                        .disconnect(russh::Disconnect::ByApplication, "".into(), "English".into())
                        .await;
                    let _ = timeout(CLOSE_GRACE, &mut session).await;
                }
                debug!("closed connection");
                return;
            }
            Err(_) => {
                // Handler gone without an outcome: the connection died.
                let result = timeout(CLOSE_GRACE, &mut session).await;
                log_close(result.map(close_result).unwrap_or(Ok(())).err());
                return;
            }
        };

        // RUNNING: reverse listeners join the connection under one root.
        let tunnel = Tunnel::new(handle.clone(), token.clone(), server.policy.buffer_size);
        let reverse = remotes.reversed();
        let remotes_token = token.clone();
        let remotes_task = tokio::spawn(
            async move {
                let result = tunnel.bind_remotes(reverse).await;
                if result.is_err() {
                    // First error cancels the shared root.
                    remotes_token.cancel();
                }
                result
            }
            .instrument(tracing::Span::current()),
        );
        let ssh_result = tokio::select! {
            result = &mut session => close_result(result),
            _ = token.cancelled() => {
                let _ = handle
                    .disconnect(russh::Disconnect::ByApplication, "".into(), "English".into())
                    .await;
                match timeout(CLOSE_GRACE, &mut session).await {
                    Ok(result) => close_result(result),
                    Err(_) => Ok(()),
                }
            }
        };
        token.cancel();
        let remotes_result = match remotes_task.await {
            Ok(result) => result,
            Err(join_error) => Err(Report::msg(format!(
                "reverse listener task failed: {join_error}"
            ))),
        };
        log_close(ssh_result.and(remotes_result).err());
    }
    .instrument(span)
    .await
}

// Maps ordinary connection endings to a clean close.
fn close_result(result: Result<(), russh::Error>) -> color_eyre::Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(russh::Error::Disconnect) => Ok(()),
        Err(russh::Error::IO(error))
            if error.kind() == std::io::ErrorKind::UnexpectedEof =>
        {
            Ok(())
        }
        Err(error) => Err(Report::from(error)),
    }
}

// Errors whose rendered text ends in "EOF" are clean closes; everything
// else is worth the parenthesized detail.
fn log_close(error: Option<Report>) {
    match error {
        Some(error) if !error.to_string().ends_with("EOF") => {
            debug!("closed connection ({error})");
        }
        _ => debug!("closed connection"),
    }
}

#[cfg(test)]
mod close_tests {
    use color_eyre::eyre::eyre;

    use super::close_result;

    #[test]
    fn clean_endings_produce_no_error() {
        assert!(close_result(Ok(())).is_ok());
        assert!(close_result(Err(russh::Error::Disconnect)).is_ok());
        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "EOF");
        assert!(close_result(Err(russh::Error::IO(eof))).is_ok());
    }

    #[test]
    fn other_errors_are_preserved() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let result = close_result(Err(russh::Error::IO(refused)));
        assert!(result.is_err());
    }

    #[test]
    fn eof_suffix_is_a_clean_close() {
        // Mirrors the logging classification.
        let clean = eyre!("connection lost: EOF");
        assert!(clean.to_string().ends_with("EOF"));
        let unclean = eyre!("connection reset");
        assert!(!unclean.to_string().ends_with("EOF"));
    }
}
