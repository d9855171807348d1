use async_trait::async_trait;
use daycare_core::{DaycareError, InterpreterErrorKind, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::protocol::{Progress, ResumeRequest, StartRequest};

/// Default time to wait for one worker reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// A live interpreter worker.
#[async_trait]
pub trait WorkerHandle: Send + Sync {
    async fn start(&self, request: StartRequest) -> Result<Progress>;

    async fn resume(&self, request: ResumeRequest) -> Result<Progress>;

    /// False once the worker has exited or been stopped.
    fn is_alive(&self) -> bool;

    /// Shut the worker down. Requests still in flight fail with `worker_crash`.
    async fn stop(&self);
}

/// Creates workers on demand for the pool.
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    async fn spawn(&self, key: &str) -> Result<Arc<dyn WorkerHandle>>;
}

/// Workers keyed by execution attempt.
///
/// A worker is spawned the first time its key is used, reused while it stays
/// alive, and torn down when the caller is done with the key. A worker that
/// crashes or stops answering is evicted so the next request gets a fresh one.
pub struct RlmWorkers {
    factory: Arc<dyn WorkerFactory>,
    workers: Mutex<HashMap<String, Arc<dyn WorkerHandle>>>,
    request_timeout: Duration,
}

impl RlmWorkers {
    pub fn new(factory: Arc<dyn WorkerFactory>) -> Self {
        Self {
            factory,
            workers: Mutex::new(HashMap::new()),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub async fn start(&self, key: &str, request: StartRequest) -> Result<Progress> {
        let worker = self.ensure(key).await?;
        let result = tokio::time::timeout(self.request_timeout, worker.start(request)).await;
        self.settle(key, result).await
    }

    pub async fn resume(&self, key: &str, request: ResumeRequest) -> Result<Progress> {
        let worker = self.ensure(key).await?;
        let result = tokio::time::timeout(self.request_timeout, worker.resume(request)).await;
        self.settle(key, result).await
    }

    /// Stop and forget the worker for `key`, if any.
    pub async fn stop_worker(&self, key: &str) {
        let worker = self.workers.lock().await.remove(key);
        if let Some(worker) = worker {
            debug!(key, "stopping worker");
            worker.stop().await;
        }
    }

    pub async fn stop_all(&self) {
        let workers: Vec<_> = self.workers.lock().await.drain().collect();
        if !workers.is_empty() {
            info!(count = workers.len(), "stopping all workers");
        }
        for (_, worker) in workers {
            worker.stop().await;
        }
    }

    /// Number of workers currently held by the pool.
    pub async fn active_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    async fn ensure(&self, key: &str) -> Result<Arc<dyn WorkerHandle>> {
        let mut workers = self.workers.lock().await;
        if let Some(worker) = workers.get(key) {
            if worker.is_alive() {
                return Ok(worker.clone());
            }
            debug!(key, "replacing dead worker");
            workers.remove(key);
        }
        let worker = self.factory.spawn(key).await?;
        workers.insert(key.to_string(), worker.clone());
        Ok(worker)
    }

    async fn settle(
        &self,
        key: &str,
        result: std::result::Result<Result<Progress>, tokio::time::error::Elapsed>,
    ) -> Result<Progress> {
        match result {
            Ok(Ok(progress)) => Ok(progress),
            Ok(Err(e)) => {
                if matches!(
                    e.interpreter_kind(),
                    Some(InterpreterErrorKind::WorkerCrash | InterpreterErrorKind::WorkerProtocol)
                ) {
                    warn!(key, error = %e, "worker failed, evicting");
                    self.stop_worker(key).await;
                }
                Err(e)
            }
            Err(_) => {
                warn!(key, timeout = ?self.request_timeout, "worker request timed out");
                self.stop_worker(key).await;
                Err(DaycareError::interpreter(
                    InterpreterErrorKind::WorkerProtocol,
                    "worker request timed out",
                ))
            }
        }
    }
}
