use daycare_core::{DaycareError, InterpreterErrorKind, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::protocol::{Progress, WorkerRequest, WorkerResponse};

type PendingMap = HashMap<u64, oneshot::Sender<Result<Progress>>>;

/// Host end of the JSON-lines protocol: writes requests, matches replies by id.
pub(crate) struct LineClient {
    label: String,
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: Mutex<PendingMap>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl LineClient {
    pub(crate) fn new(label: impl Into<String>, writer: impl AsyncWrite + Send + Unpin + 'static) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send one request and wait for the response carrying the same id.
    pub(crate) async fn request(&self, build: impl FnOnce(u64) -> WorkerRequest) -> Result<Progress> {
        if self.is_closed() {
            return Err(DaycareError::interpreter(
                InterpreterErrorKind::WorkerCrash,
                "worker is not running",
            ));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = build(id);
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let written = {
            let mut writer = self.writer.lock().await;
            match writer.write_all(line.as_bytes()).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = written {
            self.pending.lock().remove(&id);
            return Err(DaycareError::interpreter(
                InterpreterErrorKind::WorkerCrash,
                format!("failed to write to worker: {e}"),
            ));
        }
        debug!(worker = %self.label, id, "worker request sent");

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(DaycareError::interpreter(
                InterpreterErrorKind::WorkerCrash,
                "worker closed before replying",
            )),
        }
    }

    /// Route one line of worker output to the request waiting for it.
    pub(crate) fn dispatch_line(&self, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }

        let value: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(_) => {
                // Anything that isn't JSON is the worker's own chatter.
                debug!(worker = %self.label, "{trimmed}");
                return;
            }
        };

        let id = value.get("id").and_then(Value::as_u64);
        let result = match serde_json::from_value::<WorkerResponse>(value) {
            Ok(response) => response.into_result(),
            Err(e) => Err(DaycareError::interpreter(
                InterpreterErrorKind::WorkerProtocol,
                format!("malformed worker response: {e}"),
            )),
        };

        let Some(id) = id else {
            warn!(worker = %self.label, "worker response without id");
            return;
        };
        match self.pending.lock().remove(&id) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => warn!(worker = %self.label, id, "worker response for unknown request"),
        }
    }

    /// Mark the worker gone and fail everything still waiting.
    pub(crate) fn close(&self, reason: impl Fn() -> DaycareError) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<_> = self.pending.lock().drain().collect();
        for (_, tx) in drained {
            let _ = tx.send(Err(reason()));
        }
    }
}

/// Feed every line from `reader` to the client until EOF or a read error.
pub(crate) async fn read_responses<R: AsyncRead + Unpin>(client: &LineClient, reader: R) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => client.dispatch_line(&line),
            Ok(None) => break,
            Err(e) => {
                warn!(worker = %client.label, error = %e, "worker stdout read failed");
                break;
            }
        }
    }
}
