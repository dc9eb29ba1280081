//! Line-oriented JSON-RPC messages exchanged with the app-server subprocess.
//!
//! The subprocess omits the `jsonrpc` version member, so messages are
//! classified by shape alone: an `id` plus a string `method` is a request, an
//! `id` without one is a response, and a bare `method` is a notification.

use std::fmt;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use serde_json::Value;

/// Correlation key attached to a request and echoed on its response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Integer(i64),
}

impl RequestId {
    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(value) => Some(Self::String(value.clone())),
            Value::Number(value) => value.as_i64().map(Self::Integer),
            _ => None,
        }
    }

    /// Table key for this id. `7` and `"7"` share a key, matching how the
    /// subprocess echoes ids back.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(value) => f.write_str(value),
            Self::Integer(value) => write!(f, "{value}"),
        }
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: RequestId,
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl RpcResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: RequestId, error: Value) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// An error member wins over a result member; a response carrying
    /// neither resolves to `null`.
    pub fn into_outcome(self) -> Result<Value, Value> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcNotification {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    Request(RpcRequest),
    Response(RpcResponse),
    Notification(RpcNotification),
}

impl RpcMessage {
    /// Classifies a decoded JSON value. Values that fit none of the three
    /// shapes are handed back unchanged.
    pub fn from_value(value: Value) -> Result<Self, Value> {
        let Value::Object(mut map) = value else {
            return Err(value);
        };

        let method = match map.get("method") {
            Some(Value::String(method)) => Some(method.clone()),
            _ => None,
        };

        let Some(raw_id) = map.get("id") else {
            return match method {
                Some(method) => Ok(Self::Notification(RpcNotification {
                    method,
                    params: map.remove("params"),
                })),
                None => Err(Value::Object(map)),
            };
        };

        let Some(id) = RequestId::from_json(raw_id) else {
            return Err(Value::Object(map));
        };

        match method {
            Some(method) => Ok(Self::Request(RpcRequest {
                id,
                method,
                params: map.remove("params"),
            })),
            None => Ok(Self::Response(RpcResponse {
                id,
                result: map.remove("result"),
                error: map.remove("error").filter(|error| !error.is_null()),
            })),
        }
    }

    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(request) => Some(&request.id),
            Self::Response(response) => Some(&response.id),
            Self::Notification(_) => None,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(request) => Some(request.method.as_str()),
            Self::Notification(notification) => Some(notification.method.as_str()),
            Self::Response(_) => None,
        }
    }

    /// Serializes the message as one wire line, without the terminator.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl Serialize for RpcMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Request(request) => request.serialize(serializer),
            Self::Response(response) => response.serialize(serializer),
            Self::Notification(notification) => notification.serialize(serializer),
        }
    }
}

impl From<RpcRequest> for RpcMessage {
    fn from(value: RpcRequest) -> Self {
        Self::Request(value)
    }
}

impl From<RpcResponse> for RpcMessage {
    fn from(value: RpcResponse) -> Self {
        Self::Response(value)
    }
}

impl From<RpcNotification> for RpcMessage {
    fn from(value: RpcNotification) -> Self {
        Self::Notification(value)
    }
}

/// Result of decoding one line of subprocess output.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Message(RpcMessage),
    /// A JSON object that is not a JSON-RPC message.
    Unrecognized(Value),
    /// Anything that is not a JSON object: banners, progress text, stray
    /// scalars.
    Text,
}

pub fn decode_line(line: &str) -> Decoded {
    match serde_json::from_str::<Value>(line) {
        Ok(value @ Value::Object(_)) => match RpcMessage::from_value(value) {
            Ok(message) => Decoded::Message(message),
            Err(value) => Decoded::Unrecognized(value),
        },
        Ok(_) | Err(_) => Decoded::Text,
    }
}

fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}
