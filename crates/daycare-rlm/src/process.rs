use async_trait::async_trait;
use daycare_core::{DaycareError, InterpreterErrorKind, Result};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::bridge::{WorkerFactory, WorkerHandle};
use crate::client::{LineClient, read_responses};
use crate::protocol::{Progress, ResumeRequest, StartRequest, WorkerRequest};

/// Default wait between SIGTERM and SIGKILL when stopping a worker.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_millis(1000);

/// An interpreter worker running as a child process.
pub struct ProcessWorker {
    key: String,
    client: Arc<LineClient>,
    child: Arc<Mutex<Option<Child>>>,
    stop_grace: Duration,
}

impl ProcessWorker {
    pub async fn spawn(command: &str, args: &[String], key: &str, stop_grace: Duration) -> Result<Self> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DaycareError::interpreter(
                    InterpreterErrorKind::WorkerCrash,
                    format!("failed to spawn worker `{command}`: {e}"),
                )
            })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(DaycareError::interpreter(
                InterpreterErrorKind::WorkerCrash,
                "worker stdio unavailable",
            ));
        };

        info!(key, command, pid = ?child.id(), "worker spawned");

        let client = LineClient::new(key, stdin);
        let child = Arc::new(Mutex::new(Some(child)));

        let label = key.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(worker = %label, "stderr: {line}");
            }
        });

        {
            let client = client.clone();
            let child = child.clone();
            let label = key.to_string();
            tokio::spawn(async move {
                read_responses(&client, stdout).await;
                let reason = exit_reason(&child).await;
                debug!(worker = %label, %reason, "worker output closed");
                client.close(|| DaycareError::interpreter(InterpreterErrorKind::WorkerCrash, reason.clone()));
            });
        }

        Ok(Self {
            key: key.to_string(),
            client,
            child,
            stop_grace,
        })
    }
}

#[async_trait]
impl WorkerHandle for ProcessWorker {
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
        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            terminate(&mut child);
            match tokio::time::timeout(self.stop_grace, child.wait()).await {
                Ok(_) => debug!(key = %self.key, "worker exited after SIGTERM"),
                Err(_) => {
                    warn!(key = %self.key, "worker ignored SIGTERM, killing");
                    let _ = child.kill().await;
                }
            }
        }
        self.client
            .close(|| DaycareError::interpreter(InterpreterErrorKind::WorkerCrash, "worker stopped"));
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.start_kill();
}

/// Describe why the worker's stdout closed.
async fn exit_reason(child: &Mutex<Option<Child>>) -> String {
    let mut guard = child.lock().await;
    let Some(child) = guard.as_mut() else {
        return "worker stopped".into();
    };
    match tokio::time::timeout(Duration::from_secs(1), child.wait()).await {
        Ok(Ok(status)) => format!("worker exited ({})", describe_status(status)),
        _ => "worker closed its output".into(),
    }
}

fn describe_status(status: ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("signal={signal}");
        }
    }
    match status.code() {
        Some(code) => format!("code={code}"),
        None => "code=unknown".into(),
    }
}

/// Spawns one [`ProcessWorker`] per key from a fixed command line.
pub struct ProcessWorkerFactory {
    command: String,
    args: Vec<String>,
    stop_grace: Duration,
}

impl ProcessWorkerFactory {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }
}

#[async_trait]
impl WorkerFactory for ProcessWorkerFactory {
    async fn spawn(&self, key: &str) -> Result<Arc<dyn WorkerHandle>> {
        let worker = ProcessWorker::spawn(&self.command, &self.args, key, self.stop_grace).await?;
        Ok(Arc::new(worker))
    }
}
