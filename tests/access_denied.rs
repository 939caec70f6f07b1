use std::time::Duration;

use clap::Parser;
use penguin_server::{entrypoint, transport::WebSocketTransport, ApplicationConfig};
use russh::ChannelMsg;
use tokio::{
    net::TcpStream,
    time::{sleep, timeout},
};
use tokio_tungstenite::{client_async, tungstenite::client::IntoClientRequest};

struct SshClient;

impl russh::client::Handler for SshClient {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

async fn wait_for_server(addr: &str) {
    if timeout(Duration::from_secs(5), async {
        while TcpStream::connect(addr).await.is_err() {
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .is_err()
    {
        panic!("Timeout waiting for penguin-server to start.")
    }
}

async fn connect_tunnel(addr: &str) -> WebSocketTransport<TcpStream> {
    let mut request = format!("ws://{addr}/").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("sec-websocket-protocol", "penguin-v1".parse().unwrap());
    let stream = TcpStream::connect(addr).await.expect("TCP connection failed");
    let (websocket, response) = client_async(request, stream)
        .await
        .expect("WebSocket upgrade failed");
    assert_eq!(response.status(), 101);
    WebSocketTransport::new(websocket)
}

async fn exec_reply(
    channel: &mut russh::Channel<russh::client::Msg>,
    command: String,
) -> (bool, String) {
    channel.exec(true, command).await.expect("exec failed");
    let mut text = String::new();
    loop {
        match timeout(Duration::from_secs(5), channel.wait())
            .await
            .expect("timeout waiting for control reply")
        {
            Some(ChannelMsg::Success) => return (true, text),
            Some(ChannelMsg::Failure) => return (false, text),
            Some(ChannelMsg::Data { data }) => {
                text.push_str(&String::from_utf8_lossy(&data));
            }
            Some(_) => continue,
            None => panic!("channel closed without a control reply"),
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn remotes_outside_the_user_acl_are_denied() {
    let dir = std::env::temp_dir().join("penguin-test-acl");
    std::fs::create_dir_all(&dir).unwrap();
    let authfile = dir.join("users.json");
    std::fs::write(
        &authfile,
        r#"{"restricted:secret": ["^localhost:22$"]}"#,
    )
    .unwrap();
    let key_file = dir.join("server.key");
    let config = ApplicationConfig::parse_from([
        "penguin-server",
        "--host=127.0.0.1",
        "--port=18781",
        "--private-key-file",
        key_file.to_str().unwrap(),
        "--authfile",
        authfile.to_str().unwrap(),
    ]);
    tokio::spawn(async move { entrypoint(config).await });
    wait_for_server("127.0.0.1:18781").await;

    // A remote inside the ACL passes validation.
    let transport = connect_tunnel("127.0.0.1:18781").await;
    let mut session = russh::client::connect_stream(Default::default(), transport, SshClient)
        .await
        .expect("SSH handshake failed");
    assert!(session
        .authenticate_password("restricted", "secret")
        .await
        .expect("SSH authentication failed")
        .success());
    let mut channel = session
        .channel_open_session()
        .await
        .expect("Failed to open control channel");
    let (accepted, text) = exec_reply(
        &mut channel,
        r#"config {"version":"1.0.0","remotes":["2222:localhost:22"]}"#.into(),
    )
    .await;
    assert!(accepted, "allowed remote was rejected: {text}");

    // A remote outside the ACL is denied with the canonical address.
    let transport = connect_tunnel("127.0.0.1:18781").await;
    let mut session = russh::client::connect_stream(Default::default(), transport, SshClient)
        .await
        .expect("SSH handshake failed");
    assert!(session
        .authenticate_password("restricted", "secret")
        .await
        .expect("SSH authentication failed")
        .success());
    let mut channel = session
        .channel_open_session()
        .await
        .expect("Failed to open control channel");
    let (accepted, text) = exec_reply(
        &mut channel,
        r#"config {"version":"1.0.0","remotes":["8080:example.com:80"]}"#.into(),
    )
    .await;
    assert!(!accepted, "remote outside the ACL must be denied");
    assert_eq!(text, "access to 'example.com:80' denied");
}
