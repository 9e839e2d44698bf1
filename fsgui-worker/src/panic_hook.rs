//! Forwards a Rust panic to the controller as an `exception` control
//! message before the process dies, instead of letting it vanish into a
//! stderr the controller isn't reading: on any exception, forward a typed
//! error record over the control channel. Grounded
//! on the panic-hook-to-IPC pattern in
//! `examples/other_examples/...replicate-cog.../worker.rs`.

use fsgui_core::transport::ControlResponse;
use tokio::sync::mpsc::UnboundedSender;

pub fn install(tx: UnboundedSender<ControlResponse>) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let repr = info.to_string();
        let trace = std::backtrace::Backtrace::capture().to_string();
        let _ = tx.send(ControlResponse::Exception {
            kind: "panic".to_string(),
            trace,
            repr,
        });
        previous(info);
    }));
}
