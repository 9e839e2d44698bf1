use crate::error::TransportError;
use crate::value::Value;
use std::sync::Arc;
use std::time::Duration;

/// Blocking request/response client used only to talk to external
/// hardware services (`trodes.hardware`, `statescript.service`).
/// The ZMQ REQ/REP pattern maps directly onto the original's
/// `ServiceConsumer`/`request(...)` call shape
/// (`examples/original_source/fsgui/spikegadgets/action/shortcut.py`).
pub struct Consumer {
    sock: zmq::Socket,
}

impl Consumer {
    pub fn connect(ctx: Arc<zmq::Context>, endpoint: &str) -> Result<Self, TransportError> {
        let sock = ctx
            .socket(zmq::REQ)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        sock.connect(endpoint)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(Self { sock })
    }

    /// Send a request and block for a response up to `timeout`. Returns
    /// `TransportError::Timeout` if no reply arrives in time — the caller
    /// (the stimulator kernel) treats every call as fire-and-forget and
    /// ignores the response content.
    pub fn request(&self, payload: &Value, timeout: Duration) -> Result<Value, TransportError> {
        let bytes = serde_json::to_vec(payload).map_err(|e| TransportError::Io(e.to_string()))?;
        self.sock
            .send(bytes, 0)
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let mut item = [self.sock.as_poll_item(zmq::POLLIN)];
        let timeout_ms = timeout.as_millis().min(i64::MAX as u128) as i64;
        let ready =
            zmq::poll(&mut item, timeout_ms).map_err(|e| TransportError::Io(e.to_string()))?;
        if ready == 0 || !item[0].is_readable() {
            return Err(TransportError::Timeout);
        }

        let bytes = self
            .sock
            .recv_bytes(0)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| TransportError::Io(e.to_string()))
    }
}
