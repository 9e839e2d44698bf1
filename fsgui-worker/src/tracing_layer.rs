//! Routes every `tracing` record to the control channel instead of stderr,
//! as one of the messages a worker sends back: `log(level, string)`.
//! Grounded on the control-channel tracing layer in
//! `examples/other_examples/...replicate-cog.../worker.rs`.

use fsgui_core::transport::ControlResponse;
use tokio::sync::mpsc::UnboundedSender;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

pub struct ControlChannelLayer {
    tx: UnboundedSender<ControlResponse>,
}

impl ControlChannelLayer {
    pub fn new(tx: UnboundedSender<ControlResponse>) -> Self {
        Self { tx }
    }
}

impl<S: Subscriber> Layer<S> for ControlChannelLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let level = match *event.metadata().level() {
            Level::ERROR => "error",
            Level::WARN => "warning",
            Level::INFO => "info",
            Level::DEBUG => "debug",
            Level::TRACE => "debug",
        };
        // The controller outlives every worker's stdout reader for as long
        // as the process is alive; a send failure here means the control
        // channel is already gone, which teardown will observe on its own.
        let _ = self.tx.send(ControlResponse::Log {
            level: level.to_string(),
            target: event.metadata().target().to_string(),
            message: visitor.message,
        });
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }
}
