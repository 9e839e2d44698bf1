//! Source kernels: thin adapters that pull samples from the acquisition
//! server and republish them on the data plane. The
//! acquisition server's own client library is out of scope, so every
//! source kernel is built against `AcquisitionSubscriber`, a narrow trait
//! seam a real client implements and `MockAcquisitionSubscriber` fakes for
//! tests (grounded on `examples/original_source/fsgui/mock/source.py`).

use crate::kernel::{InboundMap, LogLevel, NodeKernel, ServiceMap, Workload, WorkerContext};
use fsgui_core::error::BuildError;
use fsgui_core::types::{Datatype, NodeClass, ParamDescriptor, ParamValues};
use fsgui_core::value::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// The seam every acquisition-server client implements: one blocking
/// `poll` per tick that returns `None` on a timed-out read, matching the
/// original's `source_pipe.poll(timeout=...)` / `recv()` pair. `Sync` is
/// required here (not just `Send`) because every source kernel built
/// around an implementor has to satisfy `NodeKernel: Send + Sync` too.
pub trait AcquisitionSubscriber: Send + Sync {
    fn poll(&mut self) -> Option<Value>;
}

/// Replays a fixed queue of values, then reports "no data" forever — a
/// disconnected source stays alive rather than tearing itself down. Shared
/// via `Arc<Mutex<_>>` so tests can both drive a kernel and assert against
/// the fixture from outside.
#[derive(Clone, Default)]
pub struct MockAcquisitionSubscriber {
    queue: Arc<Mutex<VecDeque<Value>>>,
}

impl MockAcquisitionSubscriber {
    pub fn new(samples: Vec<Value>) -> Self {
        Self { queue: Arc::new(Mutex::new(samples.into())) }
    }

    pub fn push(&self, value: Value) {
        self.queue.lock().unwrap().push_back(value);
    }
}

impl AcquisitionSubscriber for MockAcquisitionSubscriber {
    fn poll(&mut self) -> Option<Value> {
        self.queue.lock().unwrap().pop_front()
    }
}

/// Consecutive missed polls before the source logs a disconnect warning.
const MISS_WARNING_INTERVAL: u32 = 40;

/// Own poll/sleep discipline for a miss: a source kernel
/// must never busy-spin its core waiting on the acquisition server.
const MISS_BACKOFF: Duration = Duration::from_millis(1);

struct SourceWorkload<S: AcquisitionSubscriber> {
    subscriber: S,
    consecutive_misses: u32,
}

impl<S: AcquisitionSubscriber> Workload for SourceWorkload<S> {
    fn step(&mut self, ctx: &mut dyn WorkerContext) -> anyhow::Result<()> {
        match self.subscriber.poll() {
            Some(value) => {
                self.consecutive_misses = 0;
                ctx.publish_data(&value);
            }
            None => {
                self.consecutive_misses += 1;
                if self.consecutive_misses % MISS_WARNING_INTERVAL == 0 {
                    ctx.log(
                        LogLevel::Warning,
                        &format!("no data received from acquisition server ({} consecutive misses)", self.consecutive_misses),
                    );
                }
                std::thread::sleep(MISS_BACKOFF);
            }
        }
        Ok(())
    }
}

/// `source.lfp`: republishes one `float` (vector-valued) sample per tick.
pub struct LfpSource<S: AcquisitionSubscriber + Clone + 'static> {
    schema: Vec<ParamDescriptor>,
    subscriber: S,
}

impl<S: AcquisitionSubscriber + Clone + 'static> LfpSource<S> {
    pub fn new(subscriber: S) -> Self {
        Self { schema: Vec::new(), subscriber }
    }
}

impl<S: AcquisitionSubscriber + Clone + 'static> NodeKernel for LfpSource<S> {
    fn type_id(&self) -> &'static str {
        "source.lfp"
    }
    fn class(&self) -> NodeClass {
        NodeClass::Source
    }
    fn datatype(&self) -> Datatype {
        Datatype::Float
    }
    fn schema(&self) -> &[ParamDescriptor] {
        &self.schema
    }
    fn build(&self, _params: &ParamValues, _inbound: InboundMap, _services: ServiceMap) -> Result<Box<dyn Workload>, BuildError> {
        Ok(Box::new(SourceWorkload { subscriber: self.subscriber.clone(), consecutive_misses: 0 }))
    }
}

/// `source.waveforms`: republishes one `spikes` record per detected spike.
pub struct WaveformSource<S: AcquisitionSubscriber + Clone + 'static> {
    schema: Vec<ParamDescriptor>,
    subscriber: S,
}

impl<S: AcquisitionSubscriber + Clone + 'static> WaveformSource<S> {
    pub fn new(subscriber: S) -> Self {
        Self { schema: Vec::new(), subscriber }
    }
}

impl<S: AcquisitionSubscriber + Clone + 'static> NodeKernel for WaveformSource<S> {
    fn type_id(&self) -> &'static str {
        "source.waveforms"
    }
    fn class(&self) -> NodeClass {
        NodeClass::Source
    }
    fn datatype(&self) -> Datatype {
        Datatype::Spikes
    }
    fn schema(&self) -> &[ParamDescriptor] {
        &self.schema
    }
    fn build(&self, _params: &ParamValues, _inbound: InboundMap, _services: ServiceMap) -> Result<Box<dyn Workload>, BuildError> {
        Ok(Box::new(SourceWorkload { subscriber: self.subscriber.clone(), consecutive_misses: 0 }))
    }
}

/// `source.position`: republishes one `point2d` frame per tick.
pub struct PositionSource<S: AcquisitionSubscriber + Clone + 'static> {
    schema: Vec<ParamDescriptor>,
    subscriber: S,
}

impl<S: AcquisitionSubscriber + Clone + 'static> PositionSource<S> {
    pub fn new(subscriber: S) -> Self {
        Self { schema: Vec::new(), subscriber }
    }
}

impl<S: AcquisitionSubscriber + Clone + 'static> NodeKernel for PositionSource<S> {
    fn type_id(&self) -> &'static str {
        "source.position"
    }
    fn class(&self) -> NodeClass {
        NodeClass::Source
    }
    fn datatype(&self) -> Datatype {
        Datatype::Point2d
    }
    fn schema(&self) -> &[ParamDescriptor] {
        &self.schema
    }
    fn build(&self, _params: &ParamValues, _inbound: InboundMap, _services: ServiceMap) -> Result<Box<dyn Workload>, BuildError> {
        Ok(Box::new(SourceWorkload { subscriber: self.subscriber.clone(), consecutive_misses: 0 }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingContext {
        published: Vec<Value>,
        warnings: Vec<String>,
    }

    impl WorkerContext for RecordingContext {
        fn publish_data(&mut self, value: &Value) {
            self.published.push(value.clone());
        }
        fn publish_telemetry(&mut self, _value: &Value) {}
        fn log(&mut self, level: LogLevel, message: &str) {
            if level == LogLevel::Warning {
                self.warnings.push(message.to_string());
            }
        }
    }

    #[test]
    fn republishes_each_available_sample() {
        let mock = MockAcquisitionSubscriber::new(vec![Value::FloatVec(vec![1.0, 2.0])]);
        let kernel = LfpSource::new(mock);
        let mut workload = kernel.build(&ParamValues::new(), InboundMap::new(), ServiceMap::new()).unwrap();
        let mut ctx = RecordingContext { published: vec![], warnings: vec![] };
        workload.step(&mut ctx).unwrap();
        assert_eq!(ctx.published, vec![Value::FloatVec(vec![1.0, 2.0])]);
    }

    #[test]
    fn warns_every_forty_consecutive_misses() {
        let mock = MockAcquisitionSubscriber::new(vec![]);
        let kernel = LfpSource::new(mock);
        let mut workload = kernel.build(&ParamValues::new(), InboundMap::new(), ServiceMap::new()).unwrap();
        let mut ctx = RecordingContext { published: vec![], warnings: vec![] };
        for _ in 0..40 {
            workload.step(&mut ctx).unwrap();
        }
        assert_eq!(ctx.warnings.len(), 1);
        for _ in 0..39 {
            workload.step(&mut ctx).unwrap();
        }
        assert_eq!(ctx.warnings.len(), 1);
        workload.step(&mut ctx).unwrap();
        assert_eq!(ctx.warnings.len(), 2);
    }
}
