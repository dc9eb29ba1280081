//! The gateway context: one subprocess, many clients.
//!
//! Subprocess output is framed into lines, decoded and routed. Responses are
//! matched against the gateway's own pending calls first, then against the
//! calls clients asked to forward; anything unmatched is broadcast rather
//! than dropped, so a response may reach every client instead of none.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use code_web_console_protocol::Decoded;
use code_web_console_protocol::ForwardedNotification;
use code_web_console_protocol::RequestId;
use code_web_console_protocol::RpcMessage;
use code_web_console_protocol::RpcNotification;
use code_web_console_protocol::RpcRequest;
use code_web_console_protocol::RpcResponse;
use code_web_console_protocol::ServerFrame;
use code_web_console_protocol::StatusEvent;
use code_web_console_protocol::WebviewInbound;
use code_web_console_protocol::WebviewOutbound;
use code_web_console_protocol::decode_line;
use serde_json::Value;
use serde_json::json;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::atoms::AtomStore;
use crate::clients::ClientHub;
use crate::clients::ClientId;
use crate::error::CallError;
use crate::error::DispatchError;
use crate::fetch::FetchProxy;
use crate::line_framer::LineFramer;
use crate::outbound::BoxedWriter;
use crate::outbound::Delivery;
use crate::outbound::InitPhase;
use crate::outbound::Outbound;
use crate::pending::PendingCalls;
use crate::pending::RoutedCalls;
use crate::rpc_log::RpcLog;

/// Reserved id of the `initialize` request sent once per subprocess.
pub const HANDSHAKE_ID: &str = "1";
/// Deadline for requests the gateway issues on its own behalf.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);
const READ_CHUNK_BYTES: usize = 8 * 1024;

pub struct RelayConfig {
    /// `clientInfo` sent in the handshake.
    pub client_info: Value,
    /// Receives every raw line exchanged with the subprocess when set.
    pub log_file: Option<PathBuf>,
}

pub struct Relay {
    clients: Arc<ClientHub>,
    outbound: Outbound,
    pending: PendingCalls,
    routes: RoutedCalls,
    atoms: AtomStore,
    fetch: Arc<FetchProxy>,
    rpc_log: Arc<RpcLog>,
    next_id: AtomicU64,
    client_info: Value,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Arc<Self> {
        let clients = Arc::new(ClientHub::new());
        let rpc_log = Arc::new(RpcLog::new(config.log_file));
        Arc::new(Self {
            fetch: Arc::new(FetchProxy::new(Arc::clone(&clients))),
            clients,
            outbound: Outbound::new(Arc::clone(&rpc_log)),
            pending: PendingCalls::default(),
            routes: RoutedCalls::default(),
            atoms: AtomStore::default(),
            rpc_log,
            next_id: AtomicU64::new(2),
            client_info: config.client_info,
        })
    }

    pub fn clients(&self) -> &Arc<ClientHub> {
        &self.clients
    }

    pub async fn phase(&self) -> InitPhase {
        self.outbound.phase().await
    }

    /// Registers a client connection and greets it.
    pub async fn connect(&self) -> (ClientId, mpsc::Receiver<String>) {
        let (client, frames) = self.clients.register().await;
        self.clients.send(client, StatusEvent::Connected).await;
        info!("{client} connected ({} total)", self.clients.len().await);
        (client, frames)
    }

    /// Forgets a client and cancels its in-flight fetches. Its routed calls
    /// stay behind until answered or swept.
    pub async fn disconnect(&self, client: ClientId) {
        self.clients.unregister(client).await;
        let cancelled = self.fetch.cancel_client(client).await;
        if cancelled > 0 {
            debug!("cancelled {cancelled} fetches for {client}");
        }
        info!("{client} disconnected");
    }

    pub async fn broadcast_status(&self, status: StatusEvent) {
        self.clients.broadcast(status).await;
    }

    /// Adopts the input stream of a freshly spawned subprocess. State tied
    /// to the previous instance is discarded and the handshake is sent
    /// ahead of everything else. A failure of the input writer task is
    /// reported to every client.
    pub async fn attach(self: &Arc<Self>, writer: BoxedWriter) -> io::Result<()> {
        self.routes.clear().await;
        let stale = self.pending.fail_all(|| CallError::Closed).await;
        if stale > 0 {
            debug!("failed {stale} calls left over from the previous app-server");
        }
        let handshake = RpcMessage::Request(RpcRequest {
            id: RequestId::from(HANDSHAKE_ID),
            method: "initialize".to_string(),
            params: Some(json!({
                "clientInfo": self.client_info,
                "capabilities": { "experimentalApi": true },
            })),
        });
        let writer_task = self.outbound.attach(writer, &handshake).await?;
        let relay = Arc::clone(self);
        tokio::spawn(async move {
            match writer_task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => relay.report_write_failure(&err).await,
                Err(err) => warn!("app-server input writer failed: {err}"),
            }
        });
        Ok(())
    }

    /// Reads subprocess stdout until EOF, handling each complete line in
    /// order.
    pub async fn pump_stdout<R>(&self, mut reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut framer = LineFramer::new();
        let mut buf = vec![0u8; READ_CHUNK_BYTES];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    for line in framer.push(&buf[..n]) {
                        self.handle_line(&line).await;
                    }
                }
                Err(err) => {
                    warn!("failed to read app-server stdout: {err}");
                    break;
                }
            }
        }
        if !framer.pending().is_empty() {
            debug!(
                "discarding {} bytes of unterminated app-server output",
                framer.pending().len()
            );
        }
    }

    /// Relays subprocess stderr to every client as it arrives.
    pub async fn pump_stderr<R>(&self, mut reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; READ_CHUNK_BYTES];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                    self.clients.broadcast(ServerFrame::Stderr { text }).await;
                }
                Err(err) => {
                    warn!("failed to read app-server stderr: {err}");
                    break;
                }
            }
        }
    }

    /// Called once the subprocess has exited. Nothing is restarted.
    pub async fn on_subprocess_exit(&self, code: Option<i32>, signal: Option<String>) {
        info!("app-server exited (code {code:?}, signal {signal:?})");
        self.outbound.detach().await;
        self.rpc_log.close().await;
        let failed = self.pending.fail_all(|| CallError::Closed).await;
        if failed > 0 {
            debug!("failed {failed} pending calls after app-server exit");
        }
        self.clients
            .broadcast(StatusEvent::Exit { code, signal })
            .await;
    }

    /// Issues a request on the gateway's own behalf.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, CallError> {
        self.call_with_timeout(method, params, CALL_TIMEOUT).await
    }

    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        let id = RequestId::String(self.next_id.fetch_add(1, Ordering::Relaxed).to_string());
        let handle = self.pending.register(&id, method, timeout).await;
        let request = RpcRequest {
            id,
            method: method.to_string(),
            params,
        };
        match self.outbound.send(request.into()).await {
            Ok(Delivery::Written | Delivery::Queued) => handle.wait().await,
            Ok(Delivery::Dropped) => {
                drop(handle);
                match self.outbound.phase().await {
                    InitPhase::Failed => Err(CallError::InitializeFailed),
                    _ => Err(CallError::Closed),
                }
            }
            Err(err) => {
                drop(handle);
                self.report_write_failure(&err).await;
                Err(CallError::Transport(err))
            }
        }
    }

    /// Forwards a client's request; its response is routed back to that
    /// client only.
    pub async fn forward_request(&self, client: ClientId, request: RpcRequest) {
        let id = request.id.clone();
        self.routes.insert(&id, client).await;
        if !self.write(request.into()).await {
            self.routes.take(&id).await;
        }
    }

    pub async fn forward_notification(&self, notification: RpcNotification) {
        self.write(notification.into()).await;
    }

    /// Forwards a client's answer to a request the subprocess issued.
    pub async fn forward_response(&self, response: RpcResponse) {
        self.write(response.into()).await;
    }

    /// Drops routed calls whose client is gone and that are older than
    /// `max_age`.
    pub async fn prune_orphaned_routes(&self, max_age: Duration) -> usize {
        let connected = self.clients.connected_ids().await;
        let pruned = self.routes.prune_orphans(&connected, max_age).await;
        if pruned > 0 {
            debug!("pruned {pruned} routed calls with no client");
        }
        pruned
    }

    pub async fn routed_calls(&self) -> usize {
        self.routes.len().await
    }

    pub async fn pending_calls(&self) -> usize {
        self.pending.len().await
    }

    pub async fn fetches_in_flight(&self) -> usize {
        self.fetch.in_flight().await
    }

    /// Acts on one message from a client.
    pub async fn handle_webview_message(
        &self,
        client: ClientId,
        message: WebviewInbound,
    ) -> Result<(), DispatchError> {
        match message {
            WebviewInbound::Ready => {
                self.clients
                    .send(
                        client,
                        WebviewOutbound::ChatFontSettings {
                            chat_font_size: None,
                            chat_code_font_size: None,
                        },
                    )
                    .await;
                self.clients
                    .send(
                        client,
                        WebviewOutbound::CustomPromptsUpdated {
                            prompts: Vec::new(),
                        },
                    )
                    .await;
                self.send_atom_snapshot(client).await;
            }
            WebviewInbound::PersistedAtomSyncRequest => self.send_atom_snapshot(client).await,
            WebviewInbound::PersistedAtomUpdate {
                key,
                value,
                deleted,
            } => {
                let change = self.atoms.apply(key, value, deleted).await;
                self.clients
                    .broadcast(WebviewOutbound::PersistedAtomUpdated {
                        key: change.key,
                        value: change.value,
                        deleted: change.deleted,
                    })
                    .await;
            }
            WebviewInbound::PersistedAtomReset => {
                let state = self.atoms.reset().await;
                self.clients
                    .broadcast(WebviewOutbound::PersistedAtomSync { state })
                    .await;
            }
            WebviewInbound::McpRequest { request } => {
                let request = request.ok_or(DispatchError::MissingPayload("mcp-request"))?;
                self.forward_request(client, request.into()).await;
            }
            WebviewInbound::McpNotification { request } => {
                let ForwardedNotification { method, params } =
                    request.ok_or(DispatchError::MissingPayload("mcp-notification"))?;
                self.forward_notification(RpcNotification { method, params })
                    .await;
            }
            WebviewInbound::McpResponse { response, message } => {
                let response = response
                    .or(message)
                    .ok_or(DispatchError::MissingPayload("mcp-response"))?;
                self.forward_response(response).await;
            }
            WebviewInbound::Fetch(request) => self.fetch.fetch(client, request).await,
            WebviewInbound::FetchStream(request) => {
                self.fetch.fetch_stream(client, request).await;
            }
            WebviewInbound::CancelFetch { request_id }
            | WebviewInbound::CancelFetchStream { request_id } => {
                if !self.fetch.cancel(&request_id).await {
                    debug!("no fetch {request_id} to cancel");
                }
            }
            WebviewInbound::Unknown => {}
        }
        Ok(())
    }

    async fn send_atom_snapshot(&self, client: ClientId) {
        let state = self.atoms.snapshot().await;
        self.clients
            .send(client, WebviewOutbound::PersistedAtomSync { state })
            .await;
    }

    async fn handle_line(&self, line: &str) {
        self.rpc_log.write_line(line).await;
        match decode_line(line) {
            Decoded::Text => {
                self.clients
                    .broadcast(ServerFrame::Stdout {
                        text: line.to_string(),
                    })
                    .await;
            }
            Decoded::Unrecognized(message) => {
                debug!("app-server emitted a non JSON-RPC object");
                self.clients
                    .broadcast(ServerFrame::RpcMessage { message })
                    .await;
            }
            Decoded::Message(RpcMessage::Request(request)) => {
                self.clients
                    .broadcast(WebviewOutbound::McpRequest { request })
                    .await;
            }
            Decoded::Message(RpcMessage::Notification(RpcNotification { method, params })) => {
                self.clients
                    .broadcast(WebviewOutbound::McpNotification { method, params })
                    .await;
            }
            Decoded::Message(RpcMessage::Response(response)) => {
                self.handle_response(response).await;
            }
        }
    }

    async fn handle_response(&self, response: RpcResponse) {
        if response.id.key() == HANDSHAKE_ID
            && self.outbound.phase().await == InitPhase::Initializing
        {
            self.finish_handshake(&response).await;
        }

        if self
            .pending
            .resolve(&response.id, response.clone().into_outcome())
            .await
        {
            return;
        }

        if let Some(client) = self.routes.take(&response.id).await {
            let id = response.id.clone();
            let delivered = self
                .clients
                .send(client, WebviewOutbound::McpResponse { message: response })
                .await;
            if !delivered {
                debug!("{client} left before response {id} arrived");
            }
            return;
        }

        debug!("broadcasting unmatched response {}", response.id);
        self.clients
            .broadcast(WebviewOutbound::McpResponse { message: response })
            .await;
    }

    async fn finish_handshake(&self, response: &RpcResponse) {
        if let Some(error) = response.error.clone() {
            let dropped = self.outbound.fail().await;
            warn!("app-server initialize failed: {error}; dropped {dropped} queued messages");
            self.pending.fail_all(|| CallError::InitializeFailed).await;
            self.clients
                .broadcast(StatusEvent::InitFailed {
                    error: error.clone(),
                })
                .await;
            self.clients
                .broadcast(WebviewOutbound::CodexAppServerFatalError {
                    error_message: "Initialize failed".to_string(),
                    cli_error_message: error.to_string(),
                })
                .await;
            return;
        }

        match self.outbound.open().await {
            Ok(flushed) => {
                info!("app-server initialized; flushed {flushed} queued messages");
                self.clients.broadcast(StatusEvent::Initialized).await;
            }
            Err(err) => self.report_write_failure(&err).await,
        }
    }

    /// Writes or queues a message, reporting transport failures to every
    /// client. Returns false if the message will never reach the subprocess.
    async fn write(&self, message: RpcMessage) -> bool {
        match self.outbound.send(message).await {
            Ok(Delivery::Written | Delivery::Queued) => true,
            Ok(Delivery::Dropped) => false,
            Err(err) => {
                self.report_write_failure(&err).await;
                false
            }
        }
    }

    async fn report_write_failure(&self, err: &io::Error) {
        warn!("failed to write to app-server: {err}");
        self.clients
            .broadcast(StatusEvent::Error {
                error: format!("failed to write to app-server: {err}"),
            })
            .await;
    }
}
