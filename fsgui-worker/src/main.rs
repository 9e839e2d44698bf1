//! The generic worker process skeleton. The controller
//! re-execs this binary per built node with `--type-id <id>
//! --instance-id <uuid>`, inheriting stdin/stdout as a framed control
//! channel. Everything kernel-specific lives in `fsgui-kernels`; this
//! binary only ever knows `dyn NodeKernel` / `dyn Workload`.

mod acquisition;
mod context;
mod panic_hook;
mod tracing_layer;

use acquisition::ZmqAcquisitionSubscriber;
use context::ZmqWorkerContext;
use fsgui_core::transport::{
    Consumer, ControlRequest, ControlResponse, FanoutPublisher, JsonLineCodec, Publisher, Subscriber,
};
use fsgui_kernels::kernel::{InboundMap, KernelRegistry, ServiceMap};
use fsgui_kernels::sources::{LfpSource, PositionSource, WaveformSource};
use fsgui_kernels::{register_non_source_kernels, Workload};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::io::{stdin, stdout};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing_layer::ControlChannelLayer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

struct WorkerArgs {
    type_id: String,
    instance_id: String,
}

/// Hand-rolled flag scan (grounded on `bpmn-lite-server::main`'s
/// `parse_database_url`), not `clap`: the two flags are fixed and known
/// at spawn time, never user-typed.
fn parse_args() -> anyhow::Result<WorkerArgs> {
    let args: Vec<String> = std::env::args().collect();
    let type_id = args
        .windows(2)
        .find(|w| w[0] == "--type-id")
        .map(|w| w[1].clone())
        .ok_or_else(|| anyhow::anyhow!("missing --type-id"))?;
    let instance_id = args
        .windows(2)
        .find(|w| w[0] == "--instance-id")
        .map(|w| w[1].clone())
        .ok_or_else(|| anyhow::anyhow!("missing --instance-id"))?;
    Ok(WorkerArgs { type_id, instance_id })
}

fn build_registry(type_id: &str, acquisition: Option<ZmqAcquisitionSubscriber>) -> anyhow::Result<KernelRegistry> {
    let mut registry = KernelRegistry::new();
    register_non_source_kernels(&mut registry);
    if let Some(subscriber) = acquisition {
        match type_id {
            "source.lfp" => registry.register(Box::new(LfpSource::new(subscriber))),
            "source.waveforms" => registry.register(Box::new(WaveformSource::new(subscriber))),
            "source.position" => registry.register(Box::new(PositionSource::new(subscriber))),
            other => anyhow::bail!("acquisition endpoint supplied for non-source type {other}"),
        }
    }
    Ok(registry)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args()?;

    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<ControlResponse>();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(ControlChannelLayer::new(control_tx.clone()))
        .init();
    panic_hook::install(control_tx.clone());

    tracing::info!(type_id = %args.type_id, instance_id = %args.instance_id, "worker starting");

    let zmq_ctx = Arc::new(zmq::Context::new());
    let data_publisher = FanoutPublisher::new(Publisher::bind_ephemeral(zmq_ctx.clone())?);
    let telemetry_publisher = Publisher::bind_ephemeral(zmq_ctx.clone())?;

    // Step 1 of the skeleton: announce both endpoints before anything else.
    control_tx.send(ControlResponse::Endpoints {
        data: data_publisher.endpoint().to_string(),
        telemetry: telemetry_publisher.endpoint().to_string(),
    })?;

    let mut writer = FramedWrite::new(stdout(), JsonLineCodec::<ControlResponse>::new());
    let writer_task = tokio::spawn(async move {
        while let Some(message) = control_rx.recv().await {
            if writer.send(message).await.is_err() {
                break;
            }
        }
    });

    let mut reader = FramedRead::new(stdin(), JsonLineCodec::<ControlRequest>::new());

    let init = loop {
        match reader.next().await {
            Some(Ok(ControlRequest::Init { params, inbound, services, acquisition_endpoint })) => {
                break (params, inbound, services, acquisition_endpoint);
            }
            Some(Ok(other)) => {
                tracing::warn!(?other, "ignoring control message received before Init");
            }
            Some(Err(err)) => anyhow::bail!("malformed control message before Init: {err}"),
            None => anyhow::bail!("control channel closed before Init"),
        }
    };
    let (params, inbound_endpoints, service_endpoints, acquisition_endpoint) = init;

    let acquisition = match acquisition_endpoint {
        Some(endpoint) => {
            let subscriber = Subscriber::connect(zmq_ctx.clone(), &endpoint)?;
            Some(ZmqAcquisitionSubscriber(Arc::new(std::sync::Mutex::new(subscriber))))
        }
        None => None,
    };
    let registry = build_registry(&args.type_id, acquisition)?;
    let kernel = registry
        .get(&args.type_id)
        .ok_or_else(|| anyhow::anyhow!("unknown node type {}", args.type_id))?;

    let mut inbound: InboundMap = InboundMap::new();
    for (name, endpoint) in inbound_endpoints {
        inbound.insert(name, Subscriber::connect(zmq_ctx.clone(), &endpoint)?);
    }
    let mut services: ServiceMap = ServiceMap::new();
    for (name, endpoint) in service_endpoints {
        services.insert(name, Consumer::connect(zmq_ctx.clone(), &endpoint)?);
    }

    let workload = kernel
        .build(&params, inbound, services)
        .map_err(|e| anyhow::anyhow!(e))?;

    let ctx = ZmqWorkerContext { data: data_publisher, telemetry: telemetry_publisher };

    // Everything after Init (Update / AddFanoutSubscriber / Stop) keeps
    // arriving on the same framed reader; forward it to the synchronous
    // run loop below through a plain std channel.
    let (cmd_tx, cmd_rx) = std::sync::mpsc::channel::<ControlRequest>();
    tokio::spawn(async move {
        loop {
            match reader.next().await {
                Some(Ok(message)) => {
                    let is_stop = matches!(message, ControlRequest::Stop);
                    if cmd_tx.send(message).is_err() || is_stop {
                        break;
                    }
                }
                Some(Err(err)) => {
                    tracing::error!(%err, "malformed control message, stopping");
                    let _ = cmd_tx.send(ControlRequest::Stop);
                    break;
                }
                None => {
                    let _ = cmd_tx.send(ControlRequest::Stop);
                    break;
                }
            }
        }
    });

    let control_tx_for_loop = control_tx.clone();
    let run = tokio::task::spawn_blocking(move || run_loop(workload, ctx, cmd_rx, control_tx_for_loop));
    run.await??;

    let _ = control_tx.send(ControlResponse::Stopped);
    drop(control_tx);
    let _ = writer_task.await;
    Ok(())
}

/// Step 3-5 of the skeleton: drain control messages, step the workload,
/// repeat until a stop signal; teardown; forward any exception raised
/// along the way instead of letting it unwind past this thread.
fn run_loop(
    mut workload: Box<dyn Workload>,
    mut ctx: ZmqWorkerContext,
    cmd_rx: std::sync::mpsc::Receiver<ControlRequest>,
    control_tx: mpsc::UnboundedSender<ControlResponse>,
) -> anyhow::Result<()> {
    let report = |control_tx: &mpsc::UnboundedSender<ControlResponse>, err: &anyhow::Error| {
        let _ = control_tx.send(ControlResponse::Exception {
            kind: "kernel".to_string(),
            trace: format!("{err:?}"),
            repr: err.to_string(),
        });
    };

    if let Err(err) = workload.setup(&mut ctx) {
        report(&control_tx, &err);
        let _ = workload.teardown(&mut ctx);
        return Err(err);
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
            report(&control_tx, &err);
            let _ = workload.teardown(&mut ctx);
            return Err(err);
        }
    }

    workload.teardown(&mut ctx)?;
    Ok(())
}
