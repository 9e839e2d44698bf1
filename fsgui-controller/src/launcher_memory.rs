//! In-process `WorkerLauncher`: runs a real kernel's `Workload` on a
//! background thread instead of spawning the `fsgui-worker` binary, while
//! still speaking the exact `ControlRequest`/`ControlResponse` protocol and
//! still binding real zmq sockets for its data/telemetry planes, so graph
//! wiring (`AddFanoutSubscriber`, `inbound` endpoints) is exercised the same
//! way it would be against a real worker process. Grounded on
//! `store_memory::MemoryStore`: a full, non-test-gated implementation of the
//! same trait real production code spawns against, kept around for fast
//! integration tests.

use crate::launcher::{WorkerChannel, WorkerLauncher};
use async_trait::async_trait;
use fsgui_core::transport::{ControlRequest, ControlResponse, Consumer, FanoutPublisher, Publisher, Subscriber};
use fsgui_core::types::InstanceId;
use fsgui_core::value::Value;
use fsgui_kernels::kernel::{InboundMap, KernelRegistry, LogLevel, ServiceMap, WorkerContext, Workload};
use std::sync::Arc;
use tokio::sync::mpsc;

struct InProcessWorkerContext {
    data: FanoutPublisher,
    telemetry: Publisher,
}

impl WorkerContext for InProcessWorkerContext {
    fn publish_data(&mut self, value: &Value) {
        let _ = self.data.send(value);
    }

    fn publish_telemetry(&mut self, value: &Value) {
        let _ = self.telemetry.send(value);
    }

    fn log(&mut self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!("{message}"),
            LogLevel::Info => tracing::info!("{message}"),
            LogLevel::Warning => tracing::warn!("{message}"),
            LogLevel::Error | LogLevel::Critical => tracing::error!("{message}"),
        }
    }
}

/// Spawns workers as in-process tasks against a shared `KernelRegistry`
/// instead of OS processes.
pub struct MemoryWorkerLauncher {
    registry: Arc<KernelRegistry>,
    zmq_ctx: Arc<zmq::Context>,
}

impl MemoryWorkerLauncher {
    pub fn new(registry: Arc<KernelRegistry>, zmq_ctx: Arc<zmq::Context>) -> Self {
        Self { registry, zmq_ctx }
    }
}

#[async_trait]
impl WorkerLauncher for MemoryWorkerLauncher {
    async fn spawn(&self, type_id: &str, _instance_id: InstanceId) -> anyhow::Result<Box<dyn WorkerChannel>> {
        let registry = self.registry.clone();
        let type_id = type_id.to_string();
        if registry.get(&type_id).is_none() {
            anyhow::bail!("unknown node type {type_id}");
        }

        let data_publisher = FanoutPublisher::new(Publisher::bind_ephemeral(self.zmq_ctx.clone())?);
        let telemetry_publisher = Publisher::bind_ephemeral(self.zmq_ctx.clone())?;
        let endpoints = ControlResponse::Endpoints {
            data: data_publisher.endpoint().to_string(),
            telemetry: telemetry_publisher.endpoint().to_string(),
        };

        let (to_worker_tx, mut to_worker_rx) = mpsc::unbounded_channel::<ControlRequest>();
        let (from_worker_tx, from_worker_rx) = mpsc::unbounded_channel::<ControlResponse>();
        from_worker_tx.send(endpoints).expect("receiver held by channel below");

        let zmq_ctx = self.zmq_ctx.clone();
        tokio::spawn(async move {
            let init = loop {
                match to_worker_rx.recv().await {
                    Some(ControlRequest::Init { params, inbound, services, acquisition_endpoint: _ }) => {
                        break (params, inbound, services);
                    }
                    Some(_) => continue,
                    None => return,
                }
            };
            let (params, inbound_endpoints, service_endpoints) = init;

            let kernel = match registry.get(&type_id) {
                Some(k) => k,
                None => return,
            };

            let mut inbound: InboundMap = InboundMap::new();
            for (name, endpoint) in inbound_endpoints {
                match Subscriber::connect(zmq_ctx.clone(), &endpoint) {
                    Ok(sub) => {
                        inbound.insert(name, sub);
                    }
                    Err(err) => {
                        let _ = from_worker_tx.send(ControlResponse::Exception {
                            kind: "build".to_string(),
                            trace: format!("{err:?}"),
                            repr: err.to_string(),
                        });
                        return;
                    }
                }
            }
            let mut services: ServiceMap = ServiceMap::new();
            for (name, endpoint) in service_endpoints {
                if let Ok(consumer) = Consumer::connect(zmq_ctx.clone(), &endpoint) {
                    services.insert(name, consumer);
                }
            }

            let workload = match kernel.build(&params, inbound, services) {
                Ok(w) => w,
                Err(err) => {
                    let _ = from_worker_tx.send(ControlResponse::Exception {
                        kind: "build".to_string(),
                        trace: err.to_string(),
                        repr: err.to_string(),
                    });
                    return;
                }
            };

            // Everything after `Init` (Update/AddFanoutSubscriber/Stop)
            // keeps arriving on `to_worker_rx`; forward it to a plain std
            // channel for the blocking run loop, the same hand-off the
            // real worker skeleton uses between its async reader and its
            // synchronous `run_loop`.
            let (cmd_tx, cmd_rx) = std::sync::mpsc::channel::<ControlRequest>();
            tokio::spawn(async move {
                while let Some(message) = to_worker_rx.recv().await {
                    let is_stop = matches!(message, ControlRequest::Stop);
                    if cmd_tx.send(message).is_err() || is_stop {
                        break;
                    }
                }
            });

            let ctx = InProcessWorkerContext { data: data_publisher, telemetry: telemetry_publisher };
            let from_worker_for_loop = from_worker_tx.clone();
            let _ = tokio::task::spawn_blocking(move || {
                run_loop(workload, ctx, cmd_rx, from_worker_for_loop);
            })
            .await;
        });

        Ok(Box::new(MemoryWorkerChannel { requests: to_worker_tx, responses: from_worker_rx }))
    }
}

fn run_loop(
    mut workload: Box<dyn Workload>,
    mut ctx: InProcessWorkerContext,
    cmd_rx: std::sync::mpsc::Receiver<ControlRequest>,
    responses: mpsc::UnboundedSender<ControlResponse>,
) {
    let report = |responses: &mpsc::UnboundedSender<ControlResponse>, err: &anyhow::Error| {
        let _ = responses.send(ControlResponse::Exception {
            kind: "kernel".to_string(),
            trace: format!("{err:?}"),
            repr: err.to_string(),
        });
    };

    if let Err(err) = workload.setup(&mut ctx) {
        report(&responses, &err);
        let _ = workload.teardown(&mut ctx);
        return;
    }

    let mut stop = false;
    while !stop {
        while let Ok(command) = cmd_rx.try_recv() {
            match command {
                ControlRequest::Update { name, value } => workload.apply_update(&name, value),
                ControlRequest::AddFanoutSubscriber { .. } => ctx.data.note_subscriber_attached(),
                ControlRequest::Stop => stop = true,
                ControlRequest::Init { .. } => {}
            }
        }
        if stop {
            break;
        }
        if let Err(err) = workload.step(&mut ctx) {
            report(&responses, &err);
            let _ = workload.teardown(&mut ctx);
            return;
        }
    }

    let _ = workload.teardown(&mut ctx);
    let _ = responses.send(ControlResponse::Stopped);
}

struct MemoryWorkerChannel {
    requests: mpsc::UnboundedSender<ControlRequest>,
    responses: mpsc::UnboundedReceiver<ControlResponse>,
}

#[async_trait]
impl WorkerChannel for MemoryWorkerChannel {
    async fn send(&mut self, request: ControlRequest) -> anyhow::Result<()> {
        self.requests
            .send(request)
            .map_err(|_| anyhow::anyhow!("worker task is gone"))
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

#[cfg(test)]
mod tests {
    use super::*;
    use fsgui_core::types::{Datatype, NodeClass, ParamDescriptor, ParamValues};
    use fsgui_kernels::kernel::NodeKernel;
    use std::time::Duration;

    struct EchoWorkload;
    impl Workload for EchoWorkload {
        fn step(&mut self, ctx: &mut dyn WorkerContext) -> anyhow::Result<()> {
            ctx.publish_data(&Value::Bool(true));
            std::thread::sleep(Duration::from_millis(5));
            Ok(())
        }
    }

    struct EchoKernel;
    impl NodeKernel for EchoKernel {
        fn type_id(&self) -> &'static str {
            "test.echo"
        }
        fn class(&self) -> NodeClass {
            NodeClass::Source
        }
        fn datatype(&self) -> Datatype {
            Datatype::Bool
        }
        fn schema(&self) -> &[ParamDescriptor] {
            &[]
        }
        fn build(
            &self,
            _params: &ParamValues,
            _inbound: InboundMap,
            _services: ServiceMap,
        ) -> Result<Box<dyn Workload>, fsgui_core::error::BuildError> {
            Ok(Box::new(EchoWorkload))
        }
    }

    #[tokio::test]
    async fn announces_endpoints_then_runs_until_stop() {
        let mut registry = KernelRegistry::new();
        registry.register(Box::new(EchoKernel));
        let launcher = MemoryWorkerLauncher::new(Arc::new(registry), Arc::new(zmq::Context::new()));

        let mut channel = launcher.spawn("test.echo", InstanceId::new()).await.unwrap();
        let first = channel.recv().await.unwrap();
        assert!(matches!(first, ControlResponse::Endpoints { .. }));

        channel
            .send(ControlRequest::Init {
                params: ParamValues::new(),
                inbound: Default::default(),
                services: Default::default(),
                acquisition_endpoint: None,
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        channel.send(ControlRequest::Stop).await.unwrap();

        let stopped = channel.recv().await.unwrap();
        assert!(matches!(stopped, ControlResponse::Stopped));
    }
}
