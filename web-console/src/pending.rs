use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;

use code_web_console_protocol::RequestId;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::sync::oneshot;
use tokio::time::Duration;
use tokio::time::Instant;

use crate::clients::ClientId;
use crate::error::CallError;

pub(crate) type CallResult = Result<Value, CallError>;

struct PendingCall {
    method: String,
    resolver: oneshot::Sender<CallResult>,
}

type CallTable = Arc<StdMutex<HashMap<String, PendingCall>>>;

fn lock_calls(calls: &CallTable) -> MutexGuard<'_, HashMap<String, PendingCall>> {
    calls.lock().unwrap_or_else(|poison| poison.into_inner())
}

/// Waiting side of a gateway-issued call. Dropping it, waited on or not,
/// removes the call from the table.
pub(crate) struct PendingHandle {
    calls: CallTable,
    key: String,
    method: String,
    deadline: Instant,
    receiver: oneshot::Receiver<CallResult>,
}

impl PendingHandle {
    /// Waits for the call's resolution or its deadline.
    pub(crate) async fn wait(mut self) -> CallResult {
        match tokio::time::timeout_at(self.deadline, &mut self.receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CallError::Closed),
            Err(_) => {
                let expired = lock_calls(&self.calls).remove(&self.key).is_some();
                if expired {
                    return Err(CallError::Timeout {
                        method: std::mem::take(&mut self.method),
                    });
                }
                // A resolution raced the deadline and already owns the entry.
                match (&mut self.receiver).await {
                    Ok(result) => result,
                    Err(_) => Err(CallError::Closed),
                }
            }
        }
    }
}

impl Drop for PendingHandle {
    fn drop(&mut self) {
        lock_calls(&self.calls).remove(&self.key);
    }
}

/// Requests the gateway issued on its own behalf, keyed by id.
///
/// Each entry is removed exactly once, by whichever of response, timeout or
/// teardown reaches it first; that removal decides the single resolution.
/// The table lock is never held across an await.
#[derive(Default)]
pub(crate) struct PendingCalls {
    calls: CallTable,
}

impl PendingCalls {
    pub(crate) async fn register(
        &self,
        id: &RequestId,
        method: &str,
        timeout: Duration,
    ) -> PendingHandle {
        let (resolver, receiver) = oneshot::channel();
        let key = id.key();
        lock_calls(&self.calls).insert(
            key.clone(),
            PendingCall {
                method: method.to_string(),
                resolver,
            },
        );
        PendingHandle {
            calls: Arc::clone(&self.calls),
            key,
            method: method.to_string(),
            deadline: Instant::now() + timeout,
            receiver,
        }
    }

    /// Resolves the call with this id. Returns false when no such call is
    /// pending.
    pub(crate) async fn resolve(&self, id: &RequestId, outcome: Result<Value, Value>) -> bool {
        let Some(call) = lock_calls(&self.calls).remove(&id.key()) else {
            return false;
        };
        let result = outcome.map_err(CallError::Rpc);
        if call.resolver.send(result).is_err() {
            tracing::debug!("caller for {} went away before its response", call.method);
        }
        true
    }

    /// Fails every pending call, e.g. when the subprocess goes away.
    pub(crate) async fn fail_all(&self, error: impl Fn() -> CallError) -> usize {
        let drained: Vec<PendingCall> = lock_calls(&self.calls).drain().map(|(_, call)| call).collect();
        let count = drained.len();
        for call in drained {
            let _ = call.resolver.send(Err(error()));
        }
        count
    }

    pub(crate) async fn len(&self) -> usize {
        lock_calls(&self.calls).len()
    }
}

struct RoutedCall {
    client: ClientId,
    created: Instant,
}

/// Requests forwarded on behalf of clients, keyed by the client's own id.
///
/// Entries only reference the client by id; a client that disconnects leaves
/// its entries behind until the response arrives or the sweep collects them.
#[derive(Default)]
pub(crate) struct RoutedCalls {
    routes: Mutex<HashMap<String, RoutedCall>>,
}

impl RoutedCalls {
    pub(crate) async fn insert(&self, id: &RequestId, client: ClientId) {
        self.routes.lock().await.insert(
            id.key(),
            RoutedCall {
                client,
                created: Instant::now(),
            },
        );
    }

    pub(crate) async fn take(&self, id: &RequestId) -> Option<ClientId> {
        self.routes
            .lock()
            .await
            .remove(&id.key())
            .map(|route| route.client)
    }

    pub(crate) async fn clear(&self) {
        self.routes.lock().await.clear();
    }

    pub(crate) async fn len(&self) -> usize {
        self.routes.lock().await.len()
    }

    /// Drops entries whose client is gone and that are older than `max_age`.
    pub(crate) async fn prune_orphans(
        &self,
        connected: &HashSet<ClientId>,
        max_age: Duration,
    ) -> usize {
        let mut routes = self.routes.lock().await;
        let before = routes.len();
        routes.retain(|_, route| {
            connected.contains(&route.client) || route.created.elapsed() < max_age
        });
        before - routes.len()
    }
}
