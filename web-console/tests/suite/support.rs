use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use code_web_console::Relay;
use code_web_console::RelayConfig;
use serde_json::Value;
use serde_json::json;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::io::DuplexStream;
use tokio::io::Lines;
use tokio::sync::mpsc;

pub(crate) const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);
const PIPE_CAPACITY: usize = 64 * 1024;

/// Plays the app-server end of the pipes.
pub(crate) struct FakeAppServer {
    input: Lines<BufReader<DuplexStream>>,
    output: DuplexStream,
}

impl FakeAppServer {
    /// Next line the gateway wrote, parsed as JSON.
    pub(crate) async fn read_json(&mut self) -> Result<Value> {
        let line = tokio::time::timeout(DEFAULT_READ_TIMEOUT, self.input.next_line())
            .await
            .context("timed out waiting for gateway output")??
            .context("gateway closed app-server input")?;
        Ok(serde_json::from_str(&line)?)
    }

    /// True if the gateway writes nothing within `wait`.
    pub(crate) async fn is_quiet_for(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.input.next_line())
            .await
            .is_err()
    }

    pub(crate) async fn emit(&mut self, raw: &str) -> Result<()> {
        self.output.write_all(raw.as_bytes()).await?;
        self.output.flush().await?;
        Ok(())
    }

    pub(crate) async fn emit_line(&mut self, line: &str) -> Result<()> {
        self.emit(&format!("{line}\n")).await
    }
}

pub(crate) fn test_relay() -> Arc<Relay> {
    Relay::new(RelayConfig {
        client_info: json!({"name": "test", "title": "Test", "version": "0.0.0"}),
        log_file: None,
    })
}

/// A relay attached to in-memory pipes, with its stdout pump running.
pub(crate) async fn start_relay() -> Result<(Arc<Relay>, FakeAppServer)> {
    start_relay_with_stdin_capacity(PIPE_CAPACITY).await
}

/// Like `start_relay`, with the subprocess input pipe holding at most
/// `capacity` unread bytes.
pub(crate) async fn start_relay_with_stdin_capacity(
    capacity: usize,
) -> Result<(Arc<Relay>, FakeAppServer)> {
    let relay = test_relay();
    let (stdin_writer, stdin_reader) = tokio::io::duplex(capacity);
    let (stdout_writer, stdout_reader) = tokio::io::duplex(PIPE_CAPACITY);
    relay.attach(Box::new(stdin_writer)).await?;
    tokio::spawn({
        let relay = Arc::clone(&relay);
        async move { relay.pump_stdout(stdout_reader).await }
    });
    Ok((
        relay,
        FakeAppServer {
            input: BufReader::new(stdin_reader).lines(),
            output: stdout_writer,
        },
    ))
}

pub(crate) async fn next_frame(frames: &mut mpsc::Receiver<String>) -> Result<Value> {
    let payload = tokio::time::timeout(DEFAULT_READ_TIMEOUT, frames.recv())
        .await
        .context("timed out waiting for a client frame")?
        .context("client queue closed")?;
    Ok(serde_json::from_str(&payload)?)
}

/// Reads the handshake and answers it successfully.
pub(crate) async fn complete_handshake(app: &mut FakeAppServer) -> Result<()> {
    let handshake = app.read_json().await?;
    anyhow::ensure!(handshake["method"] == "initialize", "unexpected {handshake}");
    app.emit_line(r#"{"id":"1","result":{}}"#).await
}
