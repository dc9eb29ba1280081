//! Frames exchanged with browser clients over the gateway socket.
//!
//! Client messages arrive wrapped as `{"type":"from-webview","message":{..}}`.
//! Gateway messages leave either wrapped as `to-webview` or as one of the
//! top-level frames (`status`, `stdout`, `stderr`, `rpc_message`, `error`).

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::jsonrpc::RequestId;
use crate::jsonrpc::RpcRequest;
use crate::jsonrpc::RpcResponse;

/// Outer frame sent by a client. Anything other than `from-webview` is
/// ignored by the gateway.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    FromWebview {
        #[serde(default)]
        message: Value,
    },
    #[serde(other)]
    Other,
}

/// Messages a client may send inside a `from-webview` frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WebviewInbound {
    Ready,
    PersistedAtomSyncRequest,
    PersistedAtomUpdate {
        key: String,
        #[serde(default)]
        value: Value,
        #[serde(default)]
        deleted: bool,
    },
    PersistedAtomReset,
    McpRequest {
        #[serde(default)]
        request: Option<ForwardedRequest>,
    },
    McpNotification {
        #[serde(default)]
        request: Option<ForwardedNotification>,
    },
    McpResponse {
        #[serde(default)]
        response: Option<RpcResponse>,
        /// Older clients put the response under `message`.
        #[serde(default)]
        message: Option<RpcResponse>,
    },
    Fetch(FetchRequest),
    #[serde(rename_all = "camelCase")]
    CancelFetch {
        request_id: String,
    },
    FetchStream(FetchRequest),
    #[serde(rename_all = "camelCase")]
    CancelFetchStream {
        request_id: String,
    },
    #[serde(other)]
    Unknown,
}

impl WebviewInbound {
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ForwardedRequest {
    pub id: RequestId,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

impl From<ForwardedRequest> for RpcRequest {
    fn from(value: ForwardedRequest) -> Self {
        RpcRequest {
            id: value.id,
            method: value.method,
            params: value.params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ForwardedNotification {
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

/// Proxied HTTP request, shared by `fetch` and `fetch-stream`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRequest {
    pub request_id: String,
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchResponseType {
    Success,
    Error,
}

/// Messages the gateway sends inside a `to-webview` frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum WebviewOutbound {
    ChatFontSettings {
        chat_font_size: Option<u32>,
        chat_code_font_size: Option<u32>,
    },
    CustomPromptsUpdated {
        prompts: Vec<Value>,
    },
    PersistedAtomSync {
        state: Map<String, Value>,
    },
    PersistedAtomUpdated {
        key: String,
        value: Value,
        deleted: bool,
    },
    McpRequest {
        request: RpcRequest,
    },
    McpNotification {
        method: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
    McpResponse {
        message: RpcResponse,
    },
    FetchResponse {
        response_type: FetchResponseType,
        request_id: String,
        status: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        headers: Option<BTreeMap<String, String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        body_json_string: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    FetchStreamEvent {
        request_id: String,
        event: String,
        data: String,
    },
    FetchStreamComplete {
        request_id: String,
    },
    FetchStreamError {
        request_id: String,
        error: String,
    },
    CodexAppServerFatalError {
        error_message: String,
        cli_error_message: String,
    },
}

/// Subprocess and connection lifecycle, sent as `{"type":"status",..}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusEvent {
    Connected,
    Started { pid: Option<u32> },
    Initialized,
    InitFailed { error: Value },
    /// `signal` is the name of the terminating signal, e.g. `"SIGTERM"`.
    Exit {
        code: Option<i32>,
        signal: Option<String>,
    },
    Error { error: String },
}

/// Every frame the gateway writes to a client socket.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "to-webview")]
    ToWebview { message: WebviewOutbound },
    #[serde(rename = "status")]
    Status(StatusEvent),
    #[serde(rename = "stdout")]
    Stdout { text: String },
    #[serde(rename = "stderr")]
    Stderr { text: String },
    #[serde(rename = "rpc_message")]
    RpcMessage { message: Value },
    #[serde(rename = "error")]
    Error { message: String },
}

impl From<WebviewOutbound> for ServerFrame {
    fn from(message: WebviewOutbound) -> Self {
        Self::ToWebview { message }
    }
}

impl From<StatusEvent> for ServerFrame {
    fn from(status: StatusEvent) -> Self {
        Self::Status(status)
    }
}
