use std::path::PathBuf;

use tokio::fs::File;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

/// Appends every raw line exchanged with the subprocess to a file.
///
/// The file is opened on first use and closed when the subprocess exits; a
/// later line reopens it in append mode.
pub(crate) struct RpcLog {
    path: Option<PathBuf>,
    file: Mutex<Option<File>>,
}

impl RpcLog {
    pub(crate) fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            file: Mutex::new(None),
        }
    }

    pub(crate) async fn write_line(&self, line: &str) {
        let Some(path) = self.path.as_ref() else {
            return;
        };
        let mut guard = self.file.lock().await;
        if guard.is_none() {
            match OpenOptions::new().create(true).append(true).open(path).await {
                Ok(file) => *guard = Some(file),
                Err(err) => {
                    warn!("failed to open rpc log {}: {err}", path.display());
                    return;
                }
            }
        }
        let Some(file) = guard.as_mut() else {
            return;
        };
        let mut record = String::with_capacity(line.len() + 1);
        record.push_str(line);
        record.push('\n');
        let written = async {
            file.write_all(record.as_bytes()).await?;
            file.flush().await
        }
        .await;
        if let Err(err) = written {
            warn!("failed to write rpc log: {err}");
            *guard = None;
        }
    }

    pub(crate) async fn close(&self) {
        let file = self.file.lock().await.take();
        if let Some(mut file) = file
            && let Err(err) = file.flush().await
        {
            warn!("failed to flush rpc log: {err}");
        }
    }
}
