//! Spawns and speaks to a worker process's control channel.
//! `GraphController` never touches `tokio::process` directly: it drives a
//! `WorkerLauncher`, so tests can swap in `launcher_memory`'s in-process
//! fake the same way `bpmn-lite-server` swaps a `MemoryStore` in for
//! Postgres.

use async_trait::async_trait;
use fsgui_core::transport::{ControlRequest, ControlResponse, JsonLineCodec};
use fsgui_core::types::InstanceId;
use futures::{SinkExt, StreamExt};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

/// One worker's live control channel, as the controller sees it: a sink for
/// requests and a non-blocking-drainable stream of responses.
#[async_trait]
pub trait WorkerChannel: Send {
    async fn send(&mut self, request: ControlRequest) -> anyhow::Result<()>;

    /// Block for the next response. Used only while building, to await the
    /// worker's `Endpoints` announcement.
    async fn recv(&mut self) -> Option<ControlResponse>;

    /// Non-blocking drain, used by `process_items`. `Ok(None)` means
    /// nothing is ready right now; `Err(())` means the channel is closed
    /// (the worker exited or crashed).
    fn try_recv(&mut self) -> Result<Option<ControlResponse>, ()>;
}

/// Spawns a worker for a given `type_id`/`instance_id` pair and hands back
/// its control channel.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn spawn(&self, type_id: &str, instance_id: InstanceId) -> anyhow::Result<Box<dyn WorkerChannel>>;
}

/// Real implementation: re-execs the `fsgui-worker` binary with
/// `--type-id`/`--instance-id`, framing its inherited stdin/stdout with the
/// same `JsonLineCodec` the worker skeleton uses on its end.
pub struct ProcessWorkerLauncher {
    worker_binary: PathBuf,
}

impl ProcessWorkerLauncher {
    pub fn new(worker_binary: PathBuf) -> Self {
        Self { worker_binary }
    }

    /// Locates the `fsgui-worker` binary next to the currently running
    /// executable, overridable by `FSGUI_WORKER_BIN` (set in development
    /// and in tests where the two binaries don't share an output directory
    /// with the one under test).
    pub fn discover() -> anyhow::Result<Self> {
        if let Ok(path) = std::env::var("FSGUI_WORKER_BIN") {
            return Ok(Self::new(PathBuf::from(path)));
        }
        let exe = std::env::current_exe()?;
        let dir = exe
            .parent()
            .ok_or_else(|| anyhow::anyhow!("controller binary path has no parent directory"))?;
        let name = if cfg!(windows) { "fsgui-worker.exe" } else { "fsgui-worker" };
        Ok(Self::new(dir.join(name)))
    }
}

#[async_trait]
impl WorkerLauncher for ProcessWorkerLauncher {
    async fn spawn(&self, type_id: &str, instance_id: InstanceId) -> anyhow::Result<Box<dyn WorkerChannel>> {
        let mut child = Command::new(&self.worker_binary)
            .arg("--type-id")
            .arg(type_id)
            .arg("--instance-id")
            .arg(instance_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow::anyhow!("spawning worker for {type_id}: {e}"))?;

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let writer = FramedWrite::new(stdin, JsonLineCodec::<ControlRequest>::new());
        let mut reader = FramedRead::new(stdout, JsonLineCodec::<ControlResponse>::new());

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(item) = reader.next().await {
                match item {
                    Ok(response) => {
                        if tx.send(response).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(%err, "malformed control response from worker, closing channel");
                        break;
                    }
                }
            }
        });

        Ok(Box::new(ProcessWorkerChannel { _child: child, writer, responses: rx }))
    }
}

struct ProcessWorkerChannel {
    // Kept alive so the child is only reaped (and `kill_on_drop` fires) once
    // the channel itself is dropped.
    _child: Child,
    writer: FramedWrite<tokio::process::ChildStdin, JsonLineCodec<ControlRequest>>,
    responses: mpsc::UnboundedReceiver<ControlResponse>,
}

#[async_trait]
impl WorkerChannel for ProcessWorkerChannel {
    async fn send(&mut self, request: ControlRequest) -> anyhow::Result<()> {
        self.writer.send(request).await
    }

    async fn recv(&mut self) -> Option<ControlResponse> {
        self.responses.recv().await
    }

    fn try_recv(&mut self) -> Result<Option<ControlResponse>, ()> {
        use tokio::sync::mpsc::error::TryRecvError;
        match self.responses.try_recv() {
            Ok(response) => Ok(Some(response)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(()),
        }
    }
}
