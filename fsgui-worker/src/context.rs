//! The concrete `WorkerContext` every real worker process runs a workload
//! against: a fanout data publisher, a plain telemetry publisher, and a
//! `tracing` call per log record instead of a bespoke method.

use fsgui_core::transport::FanoutPublisher;
use fsgui_core::transport::Publisher;
use fsgui_core::value::Value;
use fsgui_kernels::{LogLevel, WorkerContext};

pub struct ZmqWorkerContext {
    pub data: FanoutPublisher,
    pub telemetry: Publisher,
}

impl WorkerContext for ZmqWorkerContext {
    fn publish_data(&mut self, value: &Value) {
        if let Err(err) = self.data.send(value) {
            tracing::error!(%err, "failed to publish on data plane");
        }
    }

    fn publish_telemetry(&mut self, value: &Value) {
        if let Err(err) = self.telemetry.send(value) {
            tracing::error!(%err, "failed to publish on telemetry plane");
        }
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
