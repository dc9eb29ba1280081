use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use code_web_console_protocol::ServerFrame;
use tokio::sync::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

/// Frames buffered per connection before the client counts as stalled.
pub(crate) const CLIENT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// The set of connected clients, each behind its own bounded send queue.
///
/// Relay traffic never waits on a client: a frame that does not fit in a
/// client's queue disconnects that client instead of stalling the relay.
/// Traffic produced for one client alone, such as a fetch stream, may wait
/// for room with `send_wait`.
pub struct ClientHub {
    next_id: AtomicU64,
    clients: RwLock<HashMap<ClientId, mpsc::Sender<String>>>,
}

impl Default for ClientHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientHub {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Adds a client. The receiver yields serialized frames for its socket
    /// writer; it closes once the hub drops the client.
    pub async fn register(&self) -> (ClientId, mpsc::Receiver<String>) {
        let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
        self.clients.write().await.insert(id, tx);
        (id, rx)
    }

    pub async fn unregister(&self, id: ClientId) -> bool {
        self.clients.write().await.remove(&id).is_some()
    }

    pub async fn is_connected(&self, id: ClientId) -> bool {
        self.clients.read().await.contains_key(&id)
    }

    pub async fn connected_ids(&self) -> HashSet<ClientId> {
        self.clients.read().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Sends a frame to one client. Returns whether it was queued.
    pub async fn send(&self, id: ClientId, frame: impl Into<ServerFrame>) -> bool {
        let Some(payload) = serialize_frame(&frame.into()) else {
            return false;
        };
        let sender = self.clients.read().await.get(&id).cloned();
        let Some(sender) = sender else {
            debug!("dropping frame for disconnected {id}");
            return false;
        };
        match sender.try_send(payload) {
            Ok(()) => true,
            Err(err) => {
                self.drop_client(id, &err).await;
                false
            }
        }
    }

    /// Sends a frame to one client, waiting for room in its queue. Gives up
    /// when `cancel` fires or the client goes away. Returns whether the frame
    /// was queued.
    pub async fn send_wait(
        &self,
        id: ClientId,
        frame: impl Into<ServerFrame>,
        cancel: &CancellationToken,
    ) -> bool {
        let Some(payload) = serialize_frame(&frame.into()) else {
            return false;
        };
        let sender = self.clients.read().await.get(&id).cloned();
        let Some(sender) = sender else {
            debug!("dropping frame for disconnected {id}");
            return false;
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            sent = sender.send(payload) => match sent {
                Ok(()) => true,
                Err(_) => {
                    debug!("{id} socket writer closed");
                    self.clients.write().await.remove(&id);
                    false
                }
            },
        }
    }

    /// Delivers a frame to every connected client independently.
    pub async fn broadcast(&self, frame: impl Into<ServerFrame>) {
        let Some(payload) = serialize_frame(&frame.into()) else {
            return;
        };
        let mut failed = Vec::new();
        {
            let clients = self.clients.read().await;
            for (id, sender) in clients.iter() {
                if let Err(err) = sender.try_send(payload.clone()) {
                    failed.push((*id, err));
                }
            }
        }
        for (id, err) in failed {
            self.drop_client(id, &err).await;
        }
    }

    async fn drop_client(&self, id: ClientId, err: &TrySendError<String>) {
        match err {
            TrySendError::Full(_) => {
                warn!("{id} send queue full; disconnecting");
            }
            TrySendError::Closed(_) => {
                debug!("{id} socket writer closed");
            }
        }
        self.clients.write().await.remove(&id);
    }
}

fn serialize_frame(frame: &ServerFrame) -> Option<String> {
    match serde_json::to_string(frame) {
        Ok(payload) => Some(payload),
        Err(err) => {
            warn!("failed to serialize frame: {err}");
            None
        }
    }
}
