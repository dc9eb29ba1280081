use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use code_web_console::SubprocessCommand;
use code_web_console::WebConsoleConfig;
use code_web_console::serve_with_listener;
use futures::SinkExt;
use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::Value;
use serde_json::json;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use super::support::DEFAULT_READ_TIMEOUT;

const TOKEN: &str = "s3cret";

/// Answers the handshake, prints a banner, then answers every `ping`.
const FAKE_APP_SERVER: &str = r#"
read handshake
printf '{"id":"1","result":{"userAgent":"fake"}}\n'
printf 'Loading model...\n'
printf 'warming up\n' >&2
while read line; do
  case "$line" in
    *'"method":"ping"'*) printf '{"id":"7","result":{"pong":true}}\n' ;;
  esac
done
"#;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Gateway {
    addr: SocketAddr,
    dir: TempDir,
}

impl Gateway {
    fn log_path(&self) -> PathBuf {
        self.dir.path().join("rpc.log")
    }
}

async fn start_gateway() -> Result<Gateway> {
    let dir = tempfile::tempdir()?;
    let public_dir = dir.path().join("public");
    std::fs::create_dir(&public_dir)?;
    std::fs::write(public_dir.join("index.html"), "<!doctype html><title>console</title>")?;

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let config = WebConsoleConfig {
        bind_addr: addr,
        auth_token: Some(TOKEN.to_string()),
        public_dir,
        command: SubprocessCommand {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), FAKE_APP_SERVER.to_string()],
            cwd: None,
            env: Vec::new(),
        },
        log_file: Some(dir.path().join("rpc.log")),
        client_info: json!({"name": "test", "title": "Test", "version": "0.0.0"}),
    };
    tokio::spawn(serve_with_listener(listener, config));
    Ok(Gateway { addr, dir })
}

async fn next_json(socket: &mut Socket) -> Result<Value> {
    loop {
        let message = tokio::time::timeout(DEFAULT_READ_TIMEOUT, socket.next())
            .await
            .context("timed out waiting for a frame")?
            .context("socket closed")??;
        if let Message::Text(text) = message {
            return Ok(serde_json::from_str(text.as_str())?);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_request_round_trips_through_subprocess() -> Result<()> {
    let gateway = start_gateway().await?;
    let url = format!("ws://{}/any/path?token={TOKEN}", gateway.addr);
    let (mut socket, _) = connect_async(url).await?;

    assert_eq!(
        next_json(&mut socket).await?,
        json!({"type": "status", "status": "connected"})
    );

    let request = json!({
        "type": "from-webview",
        "message": {"type": "mcp-request", "request": {"id": "7", "method": "ping", "params": {}}},
    });
    socket.send(Message::Text(request.to_string().into())).await?;

    let response = loop {
        let frame = next_json(&mut socket).await?;
        if frame["type"] == "to-webview" && frame["message"]["message"]["id"] == "7" {
            break frame;
        }
    };
    assert_eq!(
        response,
        json!({
            "type": "to-webview",
            "message": {"type": "mcp-response", "message": {"id": "7", "result": {"pong": true}}},
        })
    );

    socket
        .send(Message::Text(r#"{"type":"from-webview","message":{"type":"mcp-request"}}"#.into()))
        .await?;
    let error = loop {
        let frame = next_json(&mut socket).await?;
        if frame["type"] == "error" {
            break frame;
        }
    };
    assert_eq!(error["message"], "mcp-request is missing its payload");

    let log = tokio::fs::read_to_string(gateway.log_path()).await?;
    assert!(log.contains(r#"{"id":"7","method":"ping","params":{}}"#));
    assert!(log.contains(r#"{"id":"7","result":{"pong":true}}"#));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wrong_token_closes_socket_with_policy_violation() -> Result<()> {
    let gateway = start_gateway().await?;
    let url = format!("ws://{}/?token=wrong", gateway.addr);
    let (mut socket, _) = connect_async(url).await?;

    let message = tokio::time::timeout(DEFAULT_READ_TIMEOUT, socket.next())
        .await?
        .context("socket closed without a close frame")??;
    let Message::Close(Some(frame)) = &message else {
        anyhow::bail!("expected a close frame, got {message:?}");
    };
    assert_eq!(frame.code, CloseCode::Policy);
    assert_eq!(frame.reason, "Unauthorized");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_requests_are_authorized_and_served() -> Result<()> {
    let gateway = start_gateway().await?;
    let base = format!("http://{}", gateway.addr);
    let http = reqwest::Client::new();

    let unauthorized = http.get(format!("{base}/")).send().await?;
    assert_eq!(unauthorized.status().as_u16(), 401);

    let index = http.get(format!("{base}/?token={TOKEN}")).send().await?;
    assert_eq!(index.status().as_u16(), 200);
    assert_eq!(index.text().await?, "<!doctype html><title>console</title>");

    let missing = http.get(format!("{base}/nope.js?token={TOKEN}")).send().await?;
    assert_eq!(missing.status().as_u16(), 404);

    let post = http.post(format!("{base}/?token={TOKEN}")).send().await?;
    assert_eq!(post.status().as_u16(), 405);
    Ok(())
}
