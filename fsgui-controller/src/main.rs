//! CLI entry point: one process, one tick loop, no
//! subcommands. Boots the graph controller against whatever configuration
//! file already exists, builds everything, then drives `process_items` at
//! a fixed cadence until interrupted.

use fsgui_controller::graph::GraphController;
use fsgui_controller::launcher::ProcessWorkerLauncher;
use fsgui_controller::telemetry::TelemetryLog;
use fsgui_core::config;
use fsgui_core::transport::discovery;
use fsgui_core::transport::Registry;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_SERVER_ADDRESS: &str = "tcp://127.0.0.1";
const DEFAULT_SERVER_PORT: u16 = 49152;
const TICK_INTERVAL: Duration = Duration::from_millis(500);

struct CliArgs {
    trodes_config: Option<PathBuf>,
    server_address: String,
    server_port: u16,
}

/// Hand-rolled single-dash flag scan (grounded on `bpmn-lite-server::main`'s
/// `parse_database_url`), not `clap`: three fixed flags, no subcommands.
fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let trodes_config = args
        .windows(2)
        .find(|w| w[0] == "-trodesConfig")
        .map(|w| PathBuf::from(&w[1]));
    let server_address = args
        .windows(2)
        .find(|w| w[0] == "-serverAddress")
        .map(|w| w[1].clone())
        .unwrap_or_else(|| DEFAULT_SERVER_ADDRESS.to_string());
    let server_port = args
        .windows(2)
        .find(|w| w[0] == "-serverPort")
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(DEFAULT_SERVER_PORT);
    CliArgs { trodes_config, server_address, server_port }
}

/// The original Trodes acquisition/hardware server multiplexes every
/// well-known endpoint behind one address:port pair; the registry
/// announces all five names against it rather than five separately
/// discovered ports.
fn build_registry(address: &str, port: u16) -> Registry {
    let registry = Registry::new();
    let endpoint = format!("{address}:{port}");
    for name in [
        discovery::SOURCE_LFP,
        discovery::SOURCE_WAVEFORMS,
        discovery::SOURCE_POSITION,
        discovery::TRODES_HARDWARE,
        discovery::STATESCRIPT_SERVICE,
    ] {
        registry.announce(name, endpoint.clone());
    }
    registry
}

fn config_path() -> PathBuf {
    std::env::var("FSGUI_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("fsgui-config.yaml"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = parse_args();
    if let Some(path) = &args.trodes_config {
        match std::fs::read_to_string(path) {
            Ok(content) => match fsgui_core::geometry::parse(&content) {
                Ok(geometry) => tracing::info!(
                    path = %path.display(),
                    zones = geometry.zones.len(),
                    inclusion = geometry.inclusion.len(),
                    exclusion = geometry.exclusion.len(),
                    "loaded track geometry file"
                ),
                Err(err) => tracing::error!(path = %path.display(), error = %err, "failed to parse track geometry file"),
            },
            Err(err) => tracing::warn!(path = %path.display(), error = %err, "could not read track geometry file"),
        }
    }

    let registry = build_registry(&args.server_address, args.server_port);
    let kernels = Arc::new(fsgui_controller::build_kernel_registry());
    let launcher = Arc::new(ProcessWorkerLauncher::discover()?);
    let mut controller = GraphController::new(kernels, launcher, registry);

    let config_path = config_path();
    let config = config::load(&config_path);
    controller.load_instances(config.nodes);

    controller.build_all().await;

    let zmq_ctx = Arc::new(zmq::Context::new());
    let started_at = chrono::Local::now().format("%Y%m%d-%H%M%S").to_string();
    let mut telemetry = TelemetryLog::create(std::path::Path::new("."), &started_at, zmq_ctx)?;

    let mut interval = tokio::time::interval(TICK_INTERVAL);
    let mut shutdown = Box::pin(tokio::signal::ctrl_c());
    loop {
        tokio::select! {
            _ = interval.tick() => {
                controller.process_items();
                telemetry.sync(&controller.get_reporters_map())?;
                telemetry.poll()?;
            }
            _ = &mut shutdown => {
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }

    telemetry.flush_all()?;
    for id in controller.built_in_reverse_dependency_order() {
        if let Err(err) = controller.unbuild_node(id).await {
            tracing::error!(instance = %id, error = %err, "failed to unbuild during shutdown");
        }
    }

    let config = config::ConfigFile { nodes: controller.get_save_config() };
    if let Err(err) = config::save(&config_path, &config) {
        tracing::error!(error = %err, "failed to save configuration on shutdown");
    }

    Ok(())
}
