use crate::error::TransportError;
use crate::transport::channel::Subscriber;
use std::time::Duration;

/// Waits on the union of a worker's subscribers with a single timeout,
/// returning which of them are ready to read.
pub struct MultiPoller<'a> {
    subscribers: Vec<&'a Subscriber>,
}

impl<'a> MultiPoller<'a> {
    pub fn new(subscribers: Vec<&'a Subscriber>) -> Self {
        Self { subscribers }
    }

    /// Returns the indices (into the slice passed to `new`) of the
    /// subscribers that have at least one message ready.
    pub fn poll(&self, timeout: Duration) -> Result<Vec<usize>, TransportError> {
        if self.subscribers.is_empty() {
            return Ok(Vec::new());
        }
        let mut items: Vec<zmq::PollItem> = self
            .subscribers
            .iter()
            .map(|s| s.raw().as_poll_item(zmq::POLLIN))
            .collect();

        let timeout_ms = timeout.as_millis().min(i64::MAX as u128) as i64;
        zmq::poll(&mut items, timeout_ms).map_err(|e| TransportError::Io(e.to_string()))?;

        Ok(items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.is_readable())
            .map(|(i, _)| i)
            .collect())
    }
}
