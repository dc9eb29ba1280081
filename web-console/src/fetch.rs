//! HTTP requests executed on a client's behalf.
//!
//! `fetch` returns one buffered response; `fetch-stream` relays the response
//! body as Server-Sent Events. Sessions are keyed by the client-chosen
//! `requestId` and can be cancelled at any point until they complete, which
//! drops the in-flight transport.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use code_web_console_protocol::FetchRequest;
use code_web_console_protocol::FetchResponseType;
use code_web_console_protocol::WebviewOutbound;
use futures::StreamExt;
use reqwest::Method;
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use reqwest::header::HeaderMap;
use reqwest::header::HeaderName;
use reqwest::header::HeaderValue;
use serde_json::Value;
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::clients::ClientHub;
use crate::clients::ClientId;
use crate::error::FetchError;

/// Header flag marking a request body as base64 that must be decoded first.
const BASE64_BODY_HEADER: &str = "x-codex-base64";

struct FetchSession {
    seq: u64,
    client: ClientId,
    cancel: CancellationToken,
}

struct FetchedResponse {
    status: u16,
    headers: BTreeMap<String, String>,
    body_json_string: String,
}

pub struct FetchProxy {
    http: reqwest::Client,
    hub: Arc<ClientHub>,
    sessions: Mutex<HashMap<String, FetchSession>>,
    next_seq: AtomicU64,
}

impl FetchProxy {
    pub fn new(hub: Arc<ClientHub>) -> Self {
        Self {
            http: reqwest::Client::new(),
            hub,
            sessions: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Starts a single fetch. The session is registered before this returns
    /// so a cancel that follows immediately always finds it.
    pub async fn fetch(self: &Arc<Self>, client: ClientId, request: FetchRequest) {
        let (seq, cancel) = self.begin(client, &request.request_id).await;
        let proxy = Arc::clone(self);
        tokio::spawn(async move {
            let request_id = request.request_id.clone();
            let outcome = tokio::select! {
                _ = cancel.cancelled() => None,
                result = proxy.perform_fetch(&request) => Some(result),
            };
            proxy.finish(&request_id, seq).await;
            let Some(result) = outcome else {
                debug!("fetch {request_id} cancelled");
                return;
            };
            let message = match result {
                Ok(response) => WebviewOutbound::FetchResponse {
                    response_type: FetchResponseType::Success,
                    request_id,
                    status: response.status,
                    headers: Some(response.headers),
                    body_json_string: Some(response.body_json_string),
                    error: None,
                },
                Err(err) => WebviewOutbound::FetchResponse {
                    response_type: FetchResponseType::Error,
                    request_id,
                    status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                    headers: None,
                    body_json_string: None,
                    error: Some(err.to_string()),
                },
            };
            proxy.hub.send_wait(client, message, &cancel).await;
        });
    }

    /// Starts a streaming fetch whose body is relayed as SSE events.
    pub async fn fetch_stream(self: &Arc<Self>, client: ClientId, request: FetchRequest) {
        let (seq, cancel) = self.begin(client, &request.request_id).await;
        let proxy = Arc::clone(self);
        tokio::spawn(async move {
            let request_id = request.request_id.clone();
            let outcome = tokio::select! {
                _ = cancel.cancelled() => None,
                result = proxy.run_stream(client, &request, &cancel) => Some(result),
            };
            proxy.finish(&request_id, seq).await;
            match outcome {
                None => debug!("fetch stream {request_id} cancelled"),
                Some(Ok(())) => {}
                Some(Err(err)) => {
                    proxy
                        .hub
                        .send_wait(
                            client,
                            WebviewOutbound::FetchStreamError {
                                request_id,
                                error: err.to_string(),
                            },
                            &cancel,
                        )
                        .await;
                }
            }
        });
    }

    /// Cancels the session with this id. Returns false if none is running.
    pub async fn cancel(&self, request_id: &str) -> bool {
        match self.sessions.lock().await.remove(request_id) {
            Some(session) => {
                session.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every session a client started; used when its socket closes.
    pub async fn cancel_client(&self, client: ClientId) -> usize {
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, session| {
            if session.client == client {
                session.cancel.cancel();
                false
            } else {
                true
            }
        });
        before - sessions.len()
    }

    pub async fn in_flight(&self) -> usize {
        self.sessions.lock().await.len()
    }

    async fn begin(&self, client: ClientId, request_id: &str) -> (u64, CancellationToken) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let previous = self.sessions.lock().await.insert(
            request_id.to_string(),
            FetchSession {
                seq,
                client,
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous {
            debug!("fetch {request_id} superseded by a new request with the same id");
            previous.cancel.cancel();
        }
        (seq, cancel)
    }

    async fn finish(&self, request_id: &str, seq: u64) {
        let mut sessions = self.sessions.lock().await;
        if sessions.get(request_id).is_some_and(|session| session.seq == seq) {
            sessions.remove(request_id);
        }
    }

    fn build_request(
        &self,
        request: &FetchRequest,
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::RequestBuilder, FetchError> {
        let method = match request.method.as_deref() {
            Some(method) if !method.is_empty() => Method::from_bytes(method.as_bytes())
                .map_err(|_| FetchError::InvalidMethod(method.to_string()))?,
            _ => Method::GET,
        };
        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| FetchError::InvalidHeader(name.clone()))?;
            let header_value =
                HeaderValue::from_str(value).map_err(|_| FetchError::InvalidHeader(name.clone()))?;
            headers.append(header_name, header_value);
        }
        let mut builder = self.http.request(method, &request.url).headers(headers);
        if let Some(body) = body {
            builder = builder.body(body);
        }
        Ok(builder)
    }

    async fn perform_fetch(&self, request: &FetchRequest) -> Result<FetchedResponse, FetchError> {
        let body = request
            .body
            .as_deref()
            .map(|body| decode_body(&request.headers, body));
        let response = self.build_request(request, body)?.send().await?;
        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let body_json_string = if content_type.contains("application/json") {
            let body: Value = response.json().await?;
            serde_json::to_string(&body)?
        } else {
            let bytes = response.bytes().await?;
            serde_json::to_string(&json!({
                "base64": STANDARD.encode(&bytes),
                "contentType": content_type,
            }))?
        };

        Ok(FetchedResponse {
            status,
            headers,
            body_json_string,
        })
    }

    async fn run_stream(
        &self,
        client: ClientId,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<(), FetchError> {
        let body = request
            .body
            .as_ref()
            .filter(|body| !body.is_empty())
            .map(|body| body.clone().into_bytes());
        let builder = self.build_request(request, body)?;
        let response = builder.send().await?;
        if is_bodyless(response.status()) {
            return Err(FetchError::EmptyBody);
        }

        let request_id = &request.request_id;
        let mut parser = SseParser::default();
        let mut chunks = response.bytes_stream();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            for event in parser.push(&chunk) {
                if !self
                    .hub
                    .send_wait(client, event.into_message(request_id), cancel)
                    .await
                {
                    return Ok(());
                }
            }
        }
        if let Some(event) = parser.finish()
            && !self
                .hub
                .send_wait(client, event.into_message(request_id), cancel)
                .await
        {
            return Ok(());
        }
        self.hub
            .send_wait(
                client,
                WebviewOutbound::FetchStreamComplete {
                    request_id: request_id.clone(),
                },
                cancel,
            )
            .await;
        Ok(())
    }
}

fn decode_body(headers: &BTreeMap<String, String>, body: &str) -> Vec<u8> {
    let base64_flag = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(BASE64_BODY_HEADER))
        .is_some_and(|(_, value)| value == "1");
    if base64_flag && let Ok(decoded) = STANDARD.decode(body) {
        return decoded;
    }
    body.as_bytes().to_vec()
}

fn collect_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut collected: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        collected
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    collected
}

fn is_bodyless(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::NO_CONTENT | StatusCode::RESET_CONTENT | StatusCode::NOT_MODIFIED
    )
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SseEvent {
    pub(crate) event: String,
    pub(crate) data: String,
}

impl SseEvent {
    fn into_message(self, request_id: &str) -> WebviewOutbound {
        WebviewOutbound::FetchStreamEvent {
            request_id: request_id.to_string(),
            event: self.event,
            data: self.data,
        }
    }
}

/// Incremental Server-Sent Events parser: `event:` and `data:` fields,
/// multi-line data joined with `\n`, one event per blank-line-terminated
/// block. Other fields are ignored.
#[derive(Debug, Default)]
pub(crate) struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flushes whatever the stream left unterminated.
    pub(crate) fn finish(mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let mut line = std::mem::take(&mut self.buffer);
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(event) = self.process_line(&line) {
                return Some(event);
            }
        }
        let has_event = self.event.as_deref().is_some_and(|name| !name.is_empty());
        if self.data.is_empty() && !has_event {
            return None;
        }
        Some(self.take_event())
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if let Some(name) = line.strip_prefix("event:") {
            self.event = Some(name.trim().to_string());
        } else if let Some(data) = line.strip_prefix("data:") {
            self.data.push(data.trim_start().to_string());
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let named = self.event.as_deref().is_some_and(|name| !name.is_empty());
        let event = self.take_event();
        if event.data.is_empty() && !named {
            return None;
        }
        Some(event)
    }

    fn take_event(&mut self) -> SseEvent {
        let event = self.event.take().filter(|name| !name.is_empty());
        let data = std::mem::take(&mut self.data).join("\n");
        SseEvent {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
        }
    }
}
