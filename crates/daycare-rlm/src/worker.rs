//! Worker end of the protocol.
//!
//! A worker binary wraps its interpreter in [`Interpreter`] and calls [`serve`]
//! on stdin/stdout. [`InProcessWorkerFactory`] runs the same loop over an
//! in-memory pipe, for embedding and tests.

use async_trait::async_trait;
use daycare_core::{DaycareError, InterpreterErrorKind, Result};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bridge::{WorkerFactory, WorkerHandle};
use crate::client::{LineClient, read_responses};
use crate::protocol::{
    Progress, ResumeRequest, StartRequest, WorkerError, WorkerRequest, WorkerResponse,
};

/// A pausable interpreter.
///
/// `start` runs a fresh script; `resume` continues from a snapshot this same
/// interpreter produced earlier, possibly in another process. Both return as
/// soon as the script finishes or calls a host function.
pub trait Interpreter: Send + Sync {
    fn start(&self, request: StartRequest) -> std::result::Result<Progress, WorkerError>;

    fn resume(&self, request: ResumeRequest) -> std::result::Result<Progress, WorkerError>;
}

/// Answer requests from `reader` on `writer` until the input closes.
pub async fn serve<R, W>(interpreter: Arc<dyn Interpreter>, reader: R, mut writer: W) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<WorkerRequest>(trimmed) {
            Ok(request) => handle(interpreter.clone(), request).await,
            Err(e) => {
                let id = serde_json::from_str::<Value>(trimmed)
                    .ok()
                    .and_then(|v| v.get("id").and_then(Value::as_u64));
                match id {
                    Some(id) => WorkerResponse::Error {
                        id,
                        error: WorkerError::internal(format!("invalid request: {e}")),
                    },
                    None => {
                        warn!(error = %e, "ignoring unreadable request");
                        continue;
                    }
                }
            }
        };

        let mut out = serde_json::to_string(&response).map_err(std::io::Error::other)?;
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}

async fn handle(interpreter: Arc<dyn Interpreter>, request: WorkerRequest) -> WorkerResponse {
    let id = request.id();
    debug!(id, "worker handling request");
    // Interpreters run synchronously; keep them off the async threads.
    let outcome = tokio::task::spawn_blocking(move || match request {
        WorkerRequest::Start { payload, .. } => interpreter.start(payload),
        WorkerRequest::Resume { payload, .. } => interpreter.resume(payload),
    })
    .await;

    match outcome {
        Ok(Ok(progress)) => WorkerResponse::Ok { id, progress },
        Ok(Err(error)) => WorkerResponse::Error { id, error },
        Err(e) => WorkerResponse::Error {
            id,
            error: WorkerError::internal(format!("interpreter panicked: {e}")),
        },
    }
}

/// A worker served by a task in this process.
pub struct InProcessWorker {
    client: Arc<LineClient>,
    task: JoinHandle<()>,
}

#[async_trait]
impl WorkerHandle for InProcessWorker {
    async fn start(&self, request: StartRequest) -> Result<Progress> {
        self.client
            .request(|id| WorkerRequest::Start { id, payload: request })
            .await
    }

    async fn resume(&self, request: ResumeRequest) -> Result<Progress> {
        self.client
            .request(|id| WorkerRequest::Resume { id, payload: request })
            .await
    }

    fn is_alive(&self) -> bool {
        !self.client.is_closed()
    }

    async fn stop(&self) {
        self.task.abort();
        self.client
            .close(|| DaycareError::interpreter(InterpreterErrorKind::WorkerCrash, "worker stopped"));
    }
}

/// Hosts an [`Interpreter`] without a subprocess.
pub struct InProcessWorkerFactory {
    interpreter: Arc<dyn Interpreter>,
}

impl InProcessWorkerFactory {
    pub fn new(interpreter: Arc<dyn Interpreter>) -> Self {
        Self { interpreter }
    }
}

#[async_trait]
impl WorkerFactory for InProcessWorkerFactory {
    async fn spawn(&self, key: &str) -> Result<Arc<dyn WorkerHandle>> {
        let (host_side, worker_side) = tokio::io::duplex(64 * 1024);
        let (host_read, host_write) = tokio::io::split(host_side);
        let (worker_read, worker_write) = tokio::io::split(worker_side);

        let interpreter = self.interpreter.clone();
        let label = key.to_string();
        let task = tokio::spawn(async move {
            if let Err(e) = serve(interpreter, worker_read, worker_write).await {
                warn!(worker = %label, error = %e, "in-process worker failed");
            }
        });

        let client = LineClient::new(key, host_write);
        {
            let client = client.clone();
            tokio::spawn(async move {
                read_responses(&client, host_read).await;
                client.close(|| DaycareError::interpreter(InterpreterErrorKind::WorkerCrash, "worker exited"));
            });
        }

        Ok(Arc::new(InProcessWorker { client, task }))
    }
}
