use std::net::SocketAddr;
use std::net::ToSocketAddrs;
use std::path::Path;
use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::error::ConfigError;
use crate::supervisor::SubprocessCommand;

/// Used when `--config` is not given and the file exists.
pub const DEFAULT_CONFIG_FILE: &str = "web-console.toml";
pub const TOKEN_ENV_VAR: &str = "CODE_WEB_CONSOLE_TOKEN";
const CODEX_PATH_ENV_VAR: &str = "CODEX_PATH";
const ORIGINATOR_ENV_VAR: &str = "CODEX_INTERNAL_ORIGINATOR_OVERRIDE";
const RUST_LOG_ENV_VAR: &str = "RUST_LOG";

#[derive(Parser, Debug, Default)]
#[command(
    name = "code-web-console",
    about = "Serve a Codex app-server to browser clients over WebSocket"
)]
pub struct WebConsoleCli {
    /// TOML config file. Defaults to ./web-console.toml when present.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long)]
    pub bind: Option<String>,

    #[arg(long)]
    pub port: Option<u16>,

    /// Shared access token clients pass as `?token=`. Empty disables auth.
    #[arg(long)]
    pub token: Option<String>,

    /// Directory of static browser assets.
    #[arg(long, value_name = "DIR")]
    pub public_dir: Option<PathBuf>,

    /// App-server executable, or `auto` to look it up.
    #[arg(long, value_name = "PATH")]
    pub codex_path: Option<String>,

    /// Working directory for the app-server.
    #[arg(long, value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Append every raw app-server line to this file.
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Arguments passed to the app-server instead of the configured ones.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub codex_args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub title: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: "codex_vscode".to_string(),
            title: "Codex Extension".to_string(),
            version: "0.4.71".to_string(),
        }
    }
}

/// On-disk configuration. Every key is optional.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub bind: String,
    pub port: u16,
    pub public_dir: PathBuf,
    pub auth_token: String,
    pub codex_path: String,
    pub codex_args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub log_file: String,
    pub originator: String,
    pub rust_log: String,
    pub client_info: ClientInfo,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8800,
            public_dir: PathBuf::from("public"),
            auth_token: String::new(),
            codex_path: "auto".to_string(),
            codex_args: vec![
                "app-server".to_string(),
                "--analytics-default-enabled".to_string(),
            ],
            cwd: None,
            log_file: String::new(),
            originator: "codex_vscode".to_string(),
            rust_log: "warn".to_string(),
            client_info: ClientInfo::default(),
        }
    }
}

impl FileConfig {
    /// Reads `path`; a missing file is an error only when `required`.
    pub fn load(path: &Path, required: bool) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if !required && err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                });
            }
        };
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

/// Fully resolved settings for one gateway run.
#[derive(Debug, Clone)]
pub struct WebConsoleConfig {
    pub bind_addr: SocketAddr,
    pub auth_token: Option<String>,
    pub public_dir: PathBuf,
    pub command: SubprocessCommand,
    pub log_file: Option<PathBuf>,
    pub client_info: Value,
}

impl WebConsoleConfig {
    /// Loads the config file named on the command line (or the default one)
    /// and layers the CLI and process environment over it.
    pub fn load(cli: WebConsoleCli) -> Result<Self, ConfigError> {
        let file = match cli.config.as_deref() {
            Some(path) => FileConfig::load(path, true)?,
            None => FileConfig::load(Path::new(DEFAULT_CONFIG_FILE), false)?,
        };
        Self::resolve(cli, file, |key| std::env::var(key).ok())
    }

    /// Precedence is CLI, then environment, then file, then default.
    pub fn resolve(
        cli: WebConsoleCli,
        file: FileConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let bind = cli.bind.unwrap_or(file.bind);
        let port = cli.port.unwrap_or(file.port);
        let bind_addr = resolve_bind(&bind, port)?;

        let auth_token = cli
            .token
            .or_else(|| env(TOKEN_ENV_VAR))
            .unwrap_or(file.auth_token);
        let auth_token = (!auth_token.is_empty()).then_some(auth_token);

        let log_file = cli
            .log_file
            .or_else(|| (!file.log_file.is_empty()).then(|| PathBuf::from(&file.log_file)));

        let codex_path = cli.codex_path.unwrap_or(file.codex_path);
        let program = resolve_codex_executable(&codex_path, &env);
        let args = if cli.codex_args.is_empty() {
            file.codex_args
        } else {
            cli.codex_args
        };
        let (program, args) = wrap_batch_script(program, args, cfg!(windows));

        let mut subprocess_env = vec![(ORIGINATOR_ENV_VAR.to_string(), file.originator)];
        if env(RUST_LOG_ENV_VAR).is_none() {
            subprocess_env.push((RUST_LOG_ENV_VAR.to_string(), file.rust_log));
        }

        let client_info = serde_json::to_value(&file.client_info).unwrap_or(Value::Null);

        Ok(Self {
            bind_addr,
            auth_token,
            public_dir: cli.public_dir.unwrap_or(file.public_dir),
            command: SubprocessCommand {
                program,
                args,
                cwd: cli.cwd.or(file.cwd),
                env: subprocess_env,
            },
            log_file,
            client_info,
        })
    }
}

fn resolve_bind(host: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    (host, port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| ConfigError::Bind(format!("{host}:{port}")))
}

/// An explicit path wins; otherwise `CODEX_PATH`, then a `PATH` lookup, then
/// the bare name.
pub fn resolve_codex_executable(
    configured: &str,
    env: &impl Fn(&str) -> Option<String>,
) -> PathBuf {
    if !configured.is_empty() && configured != "auto" && configured != "codex" {
        return PathBuf::from(configured);
    }
    if let Some(path) = env(CODEX_PATH_ENV_VAR).filter(|path| !path.is_empty()) {
        return PathBuf::from(path);
    }
    which::which("codex").unwrap_or_else(|_| PathBuf::from("codex"))
}

/// Batch scripts cannot be spawned directly on Windows; run them through
/// `cmd.exe`.
fn wrap_batch_script(
    program: PathBuf,
    args: Vec<String>,
    windows: bool,
) -> (PathBuf, Vec<String>) {
    let is_batch = program
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("cmd") || ext.eq_ignore_ascii_case("bat"));
    if !windows || !is_batch {
        return (program, args);
    }
    let mut wrapped = vec![
        "/d".to_string(),
        "/s".to_string(),
        "/c".to_string(),
        program.display().to_string(),
    ];
    wrapped.extend(args);
    (PathBuf::from("cmd.exe"), wrapped)
}
