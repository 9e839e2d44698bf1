use crate::error::TransportError;
use crate::value::Value;
use std::sync::Arc;

/// One-to-many pub/sub publisher. Binds to an OS-assigned TCP port and
/// exposes the resolved endpoint so the controller can hand it to
/// subscribers.
pub struct Publisher {
    ctx: Arc<zmq::Context>,
    sock: zmq::Socket,
    endpoint: String,
}

impl Publisher {
    /// Bind to an ephemeral port on all interfaces.
    pub fn bind_ephemeral(ctx: Arc<zmq::Context>) -> Result<Self, TransportError> {
        Self::bind(ctx, "tcp://0.0.0.0:*")
    }

    pub fn bind(ctx: Arc<zmq::Context>, location: &str) -> Result<Self, TransportError> {
        let sock = ctx
            .socket(zmq::PUB)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        sock.bind(location)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let endpoint = sock
            .get_last_endpoint()
            .map_err(|e| TransportError::Io(e.to_string()))?
            .map_err(|_| TransportError::Io("endpoint is not valid utf-8".to_string()))?;
        Ok(Self {
            ctx,
            sock,
            endpoint,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn send(&self, value: &Value) -> Result<(), TransportError> {
        let bytes = serde_json::to_vec(value).map_err(|e| TransportError::Io(e.to_string()))?;
        self.sock
            .send(bytes, 0)
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    pub(crate) fn context(&self) -> Arc<zmq::Context> {
        self.ctx.clone()
    }
}

/// Connects to a publisher's endpoint and subscribes to all messages.
/// Lossy under back-pressure: ZMQ's own PUB/SUB high-water-mark policy
/// drops the oldest undelivered message on overflow rather than this
/// wrapper re-implementing that policy itself.
pub struct Subscriber {
    sock: zmq::Socket,
}

impl Subscriber {
    pub fn connect(ctx: Arc<zmq::Context>, endpoint: &str) -> Result<Self, TransportError> {
        let sock = ctx
            .socket(zmq::SUB)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        sock.connect(endpoint)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        sock.set_subscribe(b"")
            .map_err(|e| TransportError::Io(e.to_string()))?;
        // Bounded subscriber-side queue: lossy under subscriber
        // back-pressure rather than unbounded memory growth.
        sock.set_rcvhwm(1000)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(Self { sock })
    }

    /// Non-blocking receive of the next available message, if any.
    pub fn try_recv(&self) -> Result<Option<Value>, TransportError> {
        match self.sock.recv_bytes(zmq::DONTWAIT) {
            Ok(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| TransportError::Io(e.to_string()))?;
                Ok(Some(value))
            }
            Err(zmq::Error::EAGAIN) => Ok(None),
            Err(e) => Err(TransportError::Io(e.to_string())),
        }
    }

    pub(crate) fn raw(&self) -> &zmq::Socket {
        &self.sock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn publish_subscribe_round_trip() {
        let ctx = Arc::new(zmq::Context::new());
        let publisher = Publisher::bind_ephemeral(ctx.clone()).unwrap();
        let subscriber = Subscriber::connect(ctx, publisher.endpoint()).unwrap();

        // PUB/SUB needs a moment for the subscription to propagate.
        std::thread::sleep(Duration::from_millis(200));

        for _ in 0..20 {
            publisher.send(&Value::Bool(true)).unwrap();
            std::thread::sleep(Duration::from_millis(5));
            if let Some(v) = subscriber.try_recv().unwrap() {
                assert_eq!(v, Value::Bool(true));
                return;
            }
        }
        panic!("never received a published message");
    }
}
