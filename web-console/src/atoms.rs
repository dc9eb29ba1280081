use serde_json::Map;
use serde_json::Value;
use tokio::sync::Mutex;

/// One applied mutation, ready to replicate.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct AtomChange {
    pub(crate) key: String,
    pub(crate) value: Value,
    pub(crate) deleted: bool,
}

/// Small key/value state shared by every client. Memory only; last writer
/// wins.
#[derive(Default)]
pub(crate) struct AtomStore {
    state: Mutex<Map<String, Value>>,
}

impl AtomStore {
    pub(crate) async fn snapshot(&self) -> Map<String, Value> {
        self.state.lock().await.clone()
    }

    pub(crate) async fn apply(&self, key: String, value: Value, deleted: bool) -> AtomChange {
        let mut state = self.state.lock().await;
        if deleted {
            state.remove(&key);
            AtomChange {
                key,
                value: Value::Null,
                deleted: true,
            }
        } else {
            state.insert(key.clone(), value.clone());
            AtomChange {
                key,
                value,
                deleted: false,
            }
        }
    }

    pub(crate) async fn reset(&self) -> Map<String, Value> {
        let mut state = self.state.lock().await;
        state.clear();
        state.clone()
    }
}
