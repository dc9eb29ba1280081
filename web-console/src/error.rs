use std::io;

use serde_json::Value;
use thiserror::Error;

/// Failure of a request the gateway itself issued to the subprocess.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("timeout waiting for {method}")]
    Timeout { method: String },

    #[error("app-server returned an error: {0}")]
    Rpc(Value),

    #[error("app-server closed before responding")]
    Closed,

    #[error("app-server initialize failed")]
    InitializeFailed,

    #[error("failed to write to app-server: {0}")]
    Transport(#[from] io::Error),
}

/// Failure while proxying an HTTP request for a client.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid method {0:?}")]
    InvalidMethod(String),

    #[error("invalid header {0:?}")]
    InvalidHeader(String),

    #[error("No response body")]
    EmptyBody,

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid bind address {0}")]
    Bind(String),
}

/// A client message that parsed but cannot be acted on.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{0} is missing its payload")]
    MissingPayload(&'static str),
}
