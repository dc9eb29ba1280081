use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use code_web_console_protocol::RpcMessage;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use crate::rpc_log::RpcLog;

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitPhase {
    NotInitialized,
    Initializing,
    Ready,
    /// The handshake was rejected; nothing more is written until respawn.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Written,
    Queued,
    Dropped,
}

struct OutboundState {
    phase: InitPhase,
    queue: VecDeque<RpcMessage>,
    lines: Option<mpsc::UnboundedSender<String>>,
}

/// The initialization gate in front of the subprocess input stream.
///
/// Phase, queue and the line channel share one lock so enqueue and drain
/// cannot interleave. The lock is never held across I/O: lines are handed to
/// a writer task that owns the stream, so a full stdin pipe stalls only that
/// task.
pub(crate) struct Outbound {
    state: Mutex<OutboundState>,
    log: Arc<RpcLog>,
}

impl Outbound {
    pub(crate) fn new(log: Arc<RpcLog>) -> Self {
        Self {
            state: Mutex::new(OutboundState {
                phase: InitPhase::NotInitialized,
                queue: VecDeque::new(),
                lines: None,
            }),
            log,
        }
    }

    /// Installs the input stream of a fresh subprocess and sends the
    /// handshake ahead of anything else. The returned task writes lines to
    /// `writer` until the channel closes or a write fails.
    pub(crate) async fn attach(
        &self,
        writer: BoxedWriter,
        handshake: &RpcMessage,
    ) -> io::Result<JoinHandle<io::Result<()>>> {
        let (lines, receiver) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_lines(writer, receiver, Arc::clone(&self.log)));
        let mut state = self.state.lock().await;
        state.phase = InitPhase::NotInitialized;
        state.queue.clear();
        state.lines = Some(lines);
        push_line(&mut state, handshake)?;
        state.phase = InitPhase::Initializing;
        Ok(writer_task)
    }

    /// Closes the line channel; the writer task drains what it has and
    /// drops the stream.
    pub(crate) async fn detach(&self) {
        self.state.lock().await.lines = None;
    }

    /// Hands the message to the writer when the gate is open, otherwise
    /// queues it.
    pub(crate) async fn send(&self, message: RpcMessage) -> io::Result<Delivery> {
        let mut state = self.state.lock().await;
        match state.phase {
            InitPhase::NotInitialized | InitPhase::Initializing => {
                state.queue.push_back(message);
                Ok(Delivery::Queued)
            }
            InitPhase::Failed => {
                warn!("app-server failed to initialize; dropping outbound message");
                Ok(Delivery::Dropped)
            }
            InitPhase::Ready => {
                if push_line(&mut state, &message)? {
                    Ok(Delivery::Written)
                } else {
                    warn!("app-server input is closed; dropping outbound message");
                    Ok(Delivery::Dropped)
                }
            }
        }
    }

    /// Opens the gate and drains the queue in enqueue order. Returns the
    /// number of messages flushed.
    pub(crate) async fn open(&self) -> io::Result<usize> {
        let mut state = self.state.lock().await;
        state.phase = InitPhase::Ready;
        let mut flushed = 0;
        while let Some(message) = state.queue.pop_front() {
            if !push_line(&mut state, &message)? {
                let dropped = state.queue.len() + 1;
                state.queue.clear();
                warn!("app-server input is closed; dropped {dropped} queued messages");
                break;
            }
            flushed += 1;
        }
        Ok(flushed)
    }

    /// Marks the handshake as failed and drops everything queued.
    pub(crate) async fn fail(&self) -> usize {
        let mut state = self.state.lock().await;
        state.phase = InitPhase::Failed;
        let dropped = state.queue.len();
        state.queue.clear();
        dropped
    }

    pub(crate) async fn phase(&self) -> InitPhase {
        self.state.lock().await.phase
    }

    pub(crate) async fn queued(&self) -> usize {
        self.state.lock().await.queue.len()
    }
}

/// Serializes `message` onto the line channel. Returns false once the
/// writer task has gone away.
fn push_line(state: &mut OutboundState, message: &RpcMessage) -> io::Result<bool> {
    let line = message
        .to_line()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    let Some(lines) = state.lines.as_ref() else {
        return Ok(false);
    };
    if lines.send(line).is_err() {
        state.lines = None;
        return Ok(false);
    }
    Ok(true)
}

async fn write_lines(
    mut writer: BoxedWriter,
    mut lines: mpsc::UnboundedReceiver<String>,
    log: Arc<RpcLog>,
) -> io::Result<()> {
    while let Some(line) = lines.recv().await {
        log.write_line(&line).await;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    debug!("app-server input writer exited (channel closed)");
    Ok(())
}
