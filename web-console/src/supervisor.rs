use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::process::Stdio;
use std::sync::Arc;

use code_web_console_protocol::StatusEvent;
use tokio::process::Command;
use tokio::time::Duration;
use tracing::info;
use tracing::warn;

use crate::relay::Relay;

/// How long exit reporting waits for stdout to drain after the process is
/// gone. A grandchild holding the pipe open must not delay it forever.
const STDOUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything needed to start the app-server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubprocessCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Added to the inherited environment.
    pub env: Vec<(String, String)>,
}

/// Starts the subprocess and wires its streams into the relay.
///
/// On failure the error is reported to clients as a status event and
/// returned; the gateway keeps serving either way. Returns the pid when the
/// platform reports one.
pub async fn spawn_subprocess(
    relay: &Arc<Relay>,
    command: &SubprocessCommand,
) -> io::Result<Option<u32>> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .envs(command.env.iter().map(|(key, value)| (key, value)))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = command.cwd.as_ref() {
        cmd.current_dir(cwd);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            warn!("failed to spawn {}: {err}", command.program.display());
            relay
                .broadcast_status(StatusEvent::Error {
                    error: format!("failed to spawn {}: {err}", command.program.display()),
                })
                .await;
            return Err(err);
        }
    };

    let pid = child.id();
    info!(
        "spawned {} {} (pid {pid:?})",
        command.program.display(),
        command.args.join(" ")
    );
    relay.broadcast_status(StatusEvent::Started { pid }).await;

    let (Some(stdin), Some(stdout), Some(stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        return Err(io::Error::other("app-server stdio was not captured"));
    };

    if let Err(err) = relay.attach(Box::new(stdin)).await {
        warn!("failed to send initialize to app-server: {err}");
        relay
            .broadcast_status(StatusEvent::Error {
                error: format!("failed to send initialize: {err}"),
            })
            .await;
    }

    let stdout_task = tokio::spawn({
        let relay = Arc::clone(relay);
        async move { relay.pump_stdout(stdout).await }
    });
    tokio::spawn({
        let relay = Arc::clone(relay);
        async move { relay.pump_stderr(stderr).await }
    });
    tokio::spawn({
        let relay = Arc::clone(relay);
        async move {
            let status = child.wait().await;
            if tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, stdout_task)
                .await
                .is_err()
            {
                warn!("app-server stdout still open after exit");
            }
            match status {
                Ok(status) => {
                    relay
                        .on_subprocess_exit(status.code(), exit_signal(status))
                        .await;
                }
                Err(err) => {
                    warn!("failed to wait for app-server: {err}");
                    relay.on_subprocess_exit(None, None).await;
                }
            }
        }
    });

    Ok(pid)
}

#[cfg(unix)]
fn exit_signal(status: ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(signal_name)
}

#[cfg(not(unix))]
fn exit_signal(_status: ExitStatus) -> Option<String> {
    None
}

/// Conventional name of a signal number; unnamed signals keep their number.
#[cfg(unix)]
fn signal_name(signal: i32) -> String {
    let name = match signal {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGILL => "SIGILL",
        libc::SIGTRAP => "SIGTRAP",
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGKILL => "SIGKILL",
        libc::SIGUSR1 => "SIGUSR1",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGUSR2 => "SIGUSR2",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGALRM => "SIGALRM",
        libc::SIGTERM => "SIGTERM",
        libc::SIGXCPU => "SIGXCPU",
        libc::SIGXFSZ => "SIGXFSZ",
        _ => return signal.to_string(),
    };
    name.to_string()
}
