pub mod channel;
pub mod codec;
pub mod control;
pub mod discovery;
pub mod fanout;
pub mod poller;
pub mod service;

pub use channel::{Publisher, Subscriber};
pub use codec::JsonLineCodec;
pub use control::{ControlRequest, ControlResponse};
pub use discovery::Registry;
pub use fanout::FanoutPublisher;
pub use poller::MultiPoller;
pub use service::Consumer;
