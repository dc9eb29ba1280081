use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::Json;
use axum::Router;
use axum::extract::Query;
use axum::extract::State;
use axum::extract::ws::CloseFrame;
use axum::extract::ws::Message;
use axum::extract::ws::Utf8Bytes;
use axum::extract::ws::WebSocket;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::close_code;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::http::Method;
use axum::http::StatusCode;
use axum::http::Uri;
use axum::response::IntoResponse;
use axum::response::Response;
use clap::Parser;
use code_web_console_protocol::ClientFrame;
use code_web_console_protocol::ServerFrame;
use code_web_console_protocol::WebviewInbound;
use futures::SinkExt;
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::time::Duration;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;

mod assets;
mod atoms;
mod auth;
mod clients;
mod config;
mod error;
mod fetch;
mod line_framer;
mod outbound;
mod pending;
mod relay;
mod rpc_log;
mod supervisor;

pub use clients::ClientHub;
pub use clients::ClientId;
pub use config::ClientInfo;
pub use config::FileConfig;
pub use config::WebConsoleCli;
pub use config::WebConsoleConfig;
pub use config::resolve_codex_executable;
pub use error::CallError;
pub use error::ConfigError;
pub use error::DispatchError;
pub use error::FetchError;
pub use outbound::BoxedWriter;
pub use outbound::InitPhase;
pub use relay::CALL_TIMEOUT;
pub use relay::HANDSHAKE_ID;
pub use relay::Relay;
pub use relay::RelayConfig;
pub use supervisor::SubprocessCommand;
pub use supervisor::spawn_subprocess;

/// How often routed calls left behind by departed clients are swept.
const ORPHAN_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Age after which a routed call with no client is given up on.
const ORPHAN_MAX_AGE: Duration = Duration::from_secs(10 * 60);

#[derive(Clone)]
struct GatewayState {
    relay: Arc<Relay>,
    token: Option<String>,
    public_dir: Arc<PathBuf>,
}

pub async fn run_main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    raise_open_file_limit();

    let cli = WebConsoleCli::parse();
    let config = WebConsoleConfig::load(cli)?;
    let listener = TcpListener::bind(config.bind_addr).await?;
    serve_with_listener(listener, config).await
}

/// Spawns the app-server and serves clients on `listener` until the server
/// stops. A subprocess that fails to start is reported to clients; the
/// gateway stays up.
pub async fn serve_with_listener(listener: TcpListener, config: WebConsoleConfig) -> Result<()> {
    let relay = Relay::new(RelayConfig {
        client_info: config.client_info,
        log_file: config.log_file,
    });

    if let Err(err) = spawn_subprocess(&relay, &config.command).await {
        warn!("app-server unavailable: {err}");
    }

    tokio::spawn({
        let relay = Arc::clone(&relay);
        async move {
            let mut interval = tokio::time::interval(ORPHAN_SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                relay.prune_orphaned_routes(ORPHAN_MAX_AGE).await;
            }
        }
    });

    if config.auth_token.is_some() {
        info!("access token required (pass ?token=...)");
    }
    let state = GatewayState {
        relay,
        token: config.auth_token,
        public_dir: Arc::new(config.public_dir),
    };

    let local_addr = listener.local_addr()?;
    info!("web console listening on http://{local_addr}");
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

#[cfg(unix)]
fn raise_open_file_limit() {
    let mut limits = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let ret_code = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limits) };
    if ret_code != 0 {
        warn!(
            "failed to read RLIMIT_NOFILE: {}",
            std::io::Error::last_os_error()
        );
        return;
    }
    let desired = 4096 as libc::rlim_t;
    let target = limits.rlim_max.min(desired);
    if target <= limits.rlim_cur {
        return;
    }
    let updated = libc::rlimit {
        rlim_cur: target,
        rlim_max: limits.rlim_max,
    };
    let ret_code = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &updated) };
    if ret_code != 0 {
        warn!(
            "failed to raise RLIMIT_NOFILE to {}: {}",
            updated.rlim_cur,
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn raise_open_file_limit() {}

fn build_router(state: GatewayState) -> Router {
    Router::new().fallback(handle_request).with_state(state)
}

/// WebSocket upgrades are accepted on any path; everything else is a static
/// asset request.
async fn handle_request(
    State(state): State<GatewayState>,
    method: Method,
    uri: Uri,
    Query(query): Query<auth::AuthQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let authorized = auth::is_authorized(state.token.as_deref(), query.token.as_deref());

    if let Ok(ws) = ws {
        let relay = Arc::clone(&state.relay);
        return ws.on_upgrade(move |socket| async move {
            if authorized {
                handle_socket(relay, socket).await;
            } else {
                reject_socket(socket).await;
            }
        });
    }

    if !authorized {
        return error_response(StatusCode::UNAUTHORIZED, "unauthorized".to_string());
    }
    if method != Method::GET {
        return error_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "method not allowed".to_string(),
        );
    }
    assets::serve(&state.public_dir, uri.path()).await
}

async fn reject_socket(mut socket: WebSocket) {
    let frame = CloseFrame {
        code: close_code::POLICY,
        reason: Utf8Bytes::from_static("Unauthorized"),
    };
    if let Err(err) = socket.send(Message::Close(Some(frame))).await {
        warn!("failed to close unauthorized socket: {err}");
    }
}

async fn handle_socket(relay: Arc<Relay>, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (client, mut frames) = relay.connect().await;

    let send_task = tokio::spawn(async move {
        while let Some(payload) = frames.recv().await {
            if sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    while let Some(Ok(message)) = receiver.next().await {
        match message {
            Message::Text(text) => handle_client_text(&relay, client, text.as_str()).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    relay.disconnect(client).await;
    send_task.abort();
}

async fn handle_client_text(relay: &Relay, client: ClientId, text: &str) {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(err) => {
            report_client_error(relay, client, format!("invalid message: {err}")).await;
            return;
        }
    };
    let ClientFrame::FromWebview { message } = frame else {
        return;
    };
    let message = match WebviewInbound::from_value(message) {
        Ok(message) => message,
        Err(err) => {
            report_client_error(relay, client, format!("invalid webview message: {err}")).await;
            return;
        }
    };
    if let Err(err) = relay.handle_webview_message(client, message).await {
        report_client_error(relay, client, err.to_string()).await;
    }
}

async fn report_client_error(relay: &Relay, client: ClientId, message: String) {
    relay
        .clients()
        .send(client, ServerFrame::Error { message })
        .await;
}

fn error_response(status: StatusCode, message: String) -> Response {
    let body = Json(serde_json::json!({ "error": message }));
    (status, body).into_response()
}
