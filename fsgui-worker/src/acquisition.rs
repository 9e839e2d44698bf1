//! The real `AcquisitionSubscriber` a `source.*` kernel runs against in
//! this process: the acquisition server is just another zmq publisher at
//! a well-known, controller-resolved endpoint. The
//! acquisition server's own wire protocol is out of scope; what's in
//! scope is subscribing to it the same way any other node's output is
//! subscribed to.

use fsgui_core::transport::Subscriber;
use fsgui_core::value::Value;
use fsgui_kernels::sources::AcquisitionSubscriber;
use std::sync::{Arc, Mutex};

/// `Subscriber` itself is only `Send` (a raw zmq socket isn't safe to
/// call concurrently from two threads); the `Mutex` buys the `Sync` a
/// `NodeKernel` impl needs without claiming the socket is lock-free.
#[derive(Clone)]
pub struct ZmqAcquisitionSubscriber(pub Arc<Mutex<Subscriber>>);

impl AcquisitionSubscriber for ZmqAcquisitionSubscriber {
    fn poll(&mut self) -> Option<Value> {
        self.0.lock().expect("acquisition subscriber mutex poisoned").try_recv().unwrap_or(None)
    }
}
