use fsgui_core::error::BuildError;
use fsgui_core::transport::{Consumer, Subscriber};
use fsgui_core::types::{Datatype, NodeClass, ParamDescriptor, ParamValues};
use fsgui_core::value::Value;
use std::collections::BTreeMap;

/// The subscribers a worker opened for a node's resolved children, keyed by
/// the parameter name the reference came from (e.g. `"trigger"`, `"input"`),
/// or for a trigger-tree parameter, by the string form of each referenced
/// leaf's `InstanceId`. A kernel's `build` consumes this map to wire its own
/// inbound reads.
pub type InboundMap = BTreeMap<String, Subscriber>;

/// Request/response clients for the external hardware services a kernel
/// declared it needs, resolved by the
/// worker skeleton via discovery before `build` runs and keyed by the
/// well-known service name (`"trodes.hardware"`, `"statescript.service"`).
/// Most kernels never touch this; only the stimulator does.
pub type ServiceMap = BTreeMap<String, Consumer>;

/// Severity levels a worker forwards over the control channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

/// What a `Workload` can do to the world each tick: publish on its data and
/// telemetry planes, and forward a structured log record. The worker
/// skeleton (`fsgui-worker`) owns the concrete zmq sockets and control
/// channel; kernels only ever see this trait, so unit tests can drive a
/// kernel against a recording fake instead of a real socket.
pub trait WorkerContext {
    fn publish_data(&mut self, value: &Value);
    fn publish_telemetry(&mut self, value: &Value);
    fn log(&mut self, level: LogLevel, message: &str);
}

/// The runtime half of a built node: everything that happens after
/// `NodeKernel::build` returns. One `Workload` instance lives for exactly
/// one worker process's lifetime.
///
/// The worker skeleton calls `setup` once, then `step` repeatedly until a
/// stop signal, then `teardown` once — the setup/loop/teardown shell every
/// worker runs. `step` is synchronous: it does its own poll/sleep
/// discipline and is expected to return quickly enough for the skeleton to
/// keep draining its control channel between calls.
pub trait Workload: Send {
    fn setup(&mut self, _ctx: &mut dyn WorkerContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn step(&mut self, ctx: &mut dyn WorkerContext) -> anyhow::Result<()>;

    fn teardown(&mut self, _ctx: &mut dyn WorkerContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Apply a live-edited parameter. Only ever called for parameters the
    /// kernel's schema marked `live_editable`; everything else requires a
    /// rebuild, so kernels that have no live-editable parameters can leave
    /// this a no-op.
    fn apply_update(&mut self, _name: &str, _value: Value) {}
}

/// The build-time descriptor every node type implements. A `NodeKernel` is
/// stateless; it only describes a type and turns validated params plus
/// resolved inbound subscribers into a fresh `Workload`.
pub trait NodeKernel: Send + Sync {
    fn type_id(&self) -> &'static str;
    fn class(&self) -> NodeClass;
    fn datatype(&self) -> Datatype;
    fn schema(&self) -> &[ParamDescriptor];

    fn build(
        &self,
        params: &ParamValues,
        inbound: InboundMap,
        services: ServiceMap,
    ) -> Result<Box<dyn Workload>, BuildError>;
}

/// A `type_id -> NodeKernel` catalog, populated from a fixed list of
/// providers at startup.
#[derive(Default)]
pub struct KernelRegistry {
    kernels: BTreeMap<&'static str, Box<dyn NodeKernel>>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kernel: Box<dyn NodeKernel>) {
        self.kernels.insert(kernel.type_id(), kernel);
    }

    pub fn get(&self, type_id: &str) -> Option<&dyn NodeKernel> {
        self.kernels.get(type_id).map(|k| k.as_ref())
    }

    pub fn type_ids(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.kernels.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsgui_core::types::ParamKind;

    struct RecordingContext {
        published: Vec<Value>,
    }

    impl WorkerContext for RecordingContext {
        fn publish_data(&mut self, value: &Value) {
            self.published.push(value.clone());
        }
        fn publish_telemetry(&mut self, _value: &Value) {}
        fn log(&mut self, _level: LogLevel, _message: &str) {}
    }

    struct EchoWorkload;

    impl Workload for EchoWorkload {
        fn step(&mut self, ctx: &mut dyn WorkerContext) -> anyhow::Result<()> {
            ctx.publish_data(&Value::Bool(true));
            Ok(())
        }
    }

    struct EchoKernel {
        schema: Vec<ParamDescriptor>,
    }

    impl NodeKernel for EchoKernel {
        fn type_id(&self) -> &'static str {
            "test.echo"
        }
        fn class(&self) -> NodeClass {
            NodeClass::Filter
        }
        fn datatype(&self) -> Datatype {
            Datatype::Bool
        }
        fn schema(&self) -> &[ParamDescriptor] {
            &self.schema
        }
        fn build(
            &self,
            _params: &ParamValues,
            _inbound: InboundMap,
            _services: ServiceMap,
        ) -> Result<Box<dyn Workload>, BuildError> {
            Ok(Box::new(EchoWorkload))
        }
    }

    #[test]
    fn registry_round_trips_by_type_id() {
        let mut registry = KernelRegistry::new();
        registry.register(Box::new(EchoKernel {
            schema: vec![ParamDescriptor::new(
                "threshold",
                ParamKind::Float { lower: 0.0, upper: 1.0 },
                Value::Float(0.5),
            )],
        }));

        assert!(registry.get("test.echo").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.type_ids().collect::<Vec<_>>(), vec!["test.echo"]);
    }

    #[test]
    fn workload_runs_against_a_recording_context() {
        let kernel = EchoKernel { schema: vec![] };
        let mut workload = kernel
            .build(&ParamValues::new(), InboundMap::new(), ServiceMap::new())
            .unwrap();
        let mut ctx = RecordingContext { published: vec![] };
        workload.step(&mut ctx).unwrap();
        assert_eq!(ctx.published, vec![Value::Bool(true)]);
    }
}
