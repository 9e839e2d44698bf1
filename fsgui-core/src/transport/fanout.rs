use crate::error::TransportError;
use crate::transport::channel::Publisher;
use crate::value::Value;
use std::sync::Arc;

/// A worker's "output" is logically a multicast: under the hood this is a
/// single PUB socket that every new subscriber connects to directly (ZMQ's
/// own PUB socket already fans out to every connected subscriber, so
/// "fanout" here is bookkeeping for when subscribers attach, not a vector
/// of sockets to iterate — the send-to-all happens once inside ZMQ).
///
/// A fanout publisher: the controller tells a
/// worker to add a downstream subscriber via `AddFanoutSubscriber`
/// (carrying the *endpoint the new consumer will connect to*, which for a
/// PUB socket is just this publisher's own endpoint — the message exists
/// so the worker can count/observe attachments, not so it can dial out).
pub struct FanoutPublisher {
    publisher: Publisher,
    subscriber_count: usize,
}

impl FanoutPublisher {
    pub fn new(publisher: Publisher) -> Self {
        Self {
            publisher,
            subscriber_count: 0,
        }
    }

    pub fn endpoint(&self) -> &str {
        self.publisher.endpoint()
    }

    pub fn context(&self) -> Arc<zmq::Context> {
        self.publisher.context()
    }

    /// Recorded when the controller sends `add_fanout_subscriber`.
    pub fn note_subscriber_attached(&mut self) {
        self.subscriber_count += 1;
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count
    }

    /// Broken pipes are handled by ZMQ itself (a PUB socket never blocks
    /// on a slow/gone subscriber); any genuine I/O error here means the
    /// publisher's own socket is gone, which is unrecoverable for this
    /// worker.
    pub fn send(&self, value: &Value) -> Result<(), TransportError> {
        self.publisher.send(value)
    }
}
