//! Lifecycle integration tests: exercise `GraphController` end to end
//! against `MemoryWorkerLauncher` instead of spawning real worker
//! processes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fsgui_controller::graph::GraphController;
use fsgui_controller::launcher_memory::MemoryWorkerLauncher;
use fsgui_core::error::{BuildError, ConfigurationError, FsguiError, LifecycleError};
use fsgui_core::transport::{ControlRequest, Registry};
use fsgui_core::types::{Datatype, NodeClass, ParamDescriptor, ParamValues};
use fsgui_core::value::Value;
use fsgui_kernels::kernel::{InboundMap, KernelRegistry, NodeKernel, ServiceMap, WorkerContext, Workload};

fn new_controller() -> GraphController {
    let registry = Arc::new(fsgui_controller::build_kernel_registry());
    let zmq_ctx = Arc::new(zmq::Context::new());
    let launcher = Arc::new(MemoryWorkerLauncher::new(registry.clone(), zmq_ctx));
    GraphController::new(registry, launcher, Registry::new())
}

/// S1: a filter built after its child source is reachable through the
/// resolved dependency graph, and both end up `Built`.
#[tokio::test]
async fn s1_build_order_wires_child_before_parent() {
    let mut controller = new_controller();

    let source_id = controller
        .create_node("source.lfp", ParamValues::new())
        .unwrap();

    let mut filter_params = ParamValues::new();
    filter_params.insert("input".to_string(), Value::String(source_id.to_string()));
    let filter_id = controller
        .create_node("filter.ripple-envelope", filter_params)
        .unwrap();

    let children = controller.get_node_children_ids(filter_id).unwrap();
    assert_eq!(children, vec![source_id]);

    controller.build_node(filter_id).await.unwrap();

    let configs = controller.get_configs();
    let source = configs.iter().find(|c| c.instance_id == source_id).unwrap();
    let filter = configs.iter().find(|c| c.instance_id == filter_id).unwrap();
    assert!(source.is_built(), "child must be built before its parent");
    assert!(filter.is_built());
}

/// S2: editing a built instance's params never rebuilds it; only
/// `send_message` + `Update` reaches the running worker.
#[tokio::test]
async fn s2_edit_while_built_does_not_rebuild() {
    let mut controller = new_controller();
    let id = controller
        .create_node("filter.ripple-envelope", ParamValues::new())
        .unwrap();
    controller.build_node(id).await.unwrap();

    let mut params = ParamValues::new();
    params.insert("input".to_string(), Value::Bool(false));
    controller.edit_node(id, params).unwrap();

    assert!(controller.get_configs().iter().find(|c| c.instance_id == id).unwrap().is_built());

    controller
        .send_message(id, ControlRequest::Update { name: "input".to_string(), value: Value::Bool(false) })
        .await
        .unwrap();
}

/// S3: a built parent blocks its child's unbuild; unbuilding the parent
/// first lets the child's unbuild succeed.
#[tokio::test]
async fn s3_dependent_unbuild_refused_then_succeeds() {
    let mut controller = new_controller();
    let source_id = controller.create_node("source.lfp", ParamValues::new()).unwrap();
    let mut params = ParamValues::new();
    params.insert("input".to_string(), Value::String(source_id.to_string()));
    let filter_id = controller.create_node("filter.ripple-envelope", params).unwrap();

    controller.build_node(filter_id).await.unwrap();

    let err = controller.unbuild_node(source_id).await.unwrap_err();
    assert!(matches!(err, FsguiError::Lifecycle(LifecycleError::DependentStillBuilt { dependent }) if dependent == filter_id));

    controller.unbuild_node(filter_id).await.unwrap();
    controller.unbuild_node(source_id).await.unwrap();
}

/// S4: once a worker's channel disconnects, `process_items` marks the
/// instance `error` without taking down the controller, and the instance
/// can be rebuilt afterward.
#[tokio::test]
async fn s4_worker_crash_marks_instance_error_and_rebuild_recovers() {
    let mut controller = new_controller();
    let id = controller.create_node("filter.ripple-envelope", ParamValues::new()).unwrap();
    controller.build_node(id).await.unwrap();

    controller.send_message(id, ControlRequest::Stop).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    controller.process_items();

    let status = format!("{:?}", controller.get_configs().iter().find(|c| c.instance_id == id).unwrap().status);
    assert!(status.contains("Process crashed."), "expected crashed status, got {status}");

    // An errored instance is not `built`, so a fresh build is legal and
    // spins up a brand new worker rather than failing `AlreadyBuilt`.
    controller.build_node(id).await.unwrap();
    assert!(controller.get_configs().into_iter().find(|c| c.instance_id == id).unwrap().is_built());
}

#[tokio::test]
async fn create_node_rejects_unknown_type() {
    let mut controller = new_controller();
    let err = controller.create_node("no.such.type", ParamValues::new()).unwrap_err();
    assert!(matches!(err, FsguiError::Configuration(ConfigurationError::UnknownType(_))));
}

#[tokio::test]
async fn build_node_rejects_reference_to_nonexistent_instance() {
    let mut controller = new_controller();
    let mut params = ParamValues::new();
    params.insert(
        "input".to_string(),
        Value::String(fsgui_core::types::InstanceId::new().to_string()),
    );
    // Schema-level validation only checks shape (a UUID string), not that
    // the target exists yet; that is `build_node`'s job.
    let id = controller.create_node("filter.ripple-envelope", params).unwrap();
    let err = controller.build_node(id).await.unwrap_err();
    assert!(matches!(err, FsguiError::Configuration(ConfigurationError::UnresolvedReference { .. })));
}

#[tokio::test]
async fn duplicate_node_copies_params_with_fresh_id_and_prefixed_nickname() {
    let mut controller = new_controller();
    let id = controller.create_node("source.lfp", ParamValues::new()).unwrap();
    let copy_id = controller.duplicate_node(id).unwrap();

    assert_ne!(id, copy_id);
    let copy = controller.get_configs().into_iter().find(|c| c.instance_id == copy_id).unwrap();
    assert_eq!(copy.nickname, "Copy of source.lfp");
}

#[tokio::test]
async fn delete_built_node_is_refused() {
    let mut controller = new_controller();
    let id = controller.create_node("filter.ripple-envelope", ParamValues::new()).unwrap();
    controller.build_node(id).await.unwrap();
    let err = controller.delete_node(id).unwrap_err();
    assert!(matches!(err, FsguiError::Lifecycle(LifecycleError::StillBuilt(_))));
}

#[tokio::test]
async fn cyclic_reference_is_rejected_at_build_time() {
    let mut controller = new_controller();
    let a = controller.create_node("filter.ripple-envelope", ParamValues::new()).unwrap();
    let b = controller.create_node("filter.ripple-envelope", ParamValues::new()).unwrap();

    let mut a_params = ParamValues::new();
    a_params.insert("input".to_string(), Value::String(b.to_string()));
    controller.edit_node(a, a_params).unwrap();

    let mut b_params = ParamValues::new();
    b_params.insert("input".to_string(), Value::String(a.to_string()));
    controller.edit_node(b, b_params).unwrap();

    let err = controller.build_node(a).await.unwrap_err();
    assert!(matches!(err, FsguiError::Configuration(ConfigurationError::Cycle(_))));
}

/// A workload whose `teardown` only ever runs if the worker reaches a
/// graceful stop; it never sets the flag on its own, and its `step` never
/// terminates the loop by itself.
struct StoppableWorkload(Arc<AtomicBool>);

impl Workload for StoppableWorkload {
    fn step(&mut self, _ctx: &mut dyn WorkerContext) -> anyhow::Result<()> {
        std::thread::sleep(Duration::from_millis(5));
        Ok(())
    }
    fn teardown(&mut self, _ctx: &mut dyn WorkerContext) -> anyhow::Result<()> {
        self.0.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct StoppableKernel(Arc<AtomicBool>);

impl NodeKernel for StoppableKernel {
    fn type_id(&self) -> &'static str {
        "test.stoppable"
    }
    fn class(&self) -> NodeClass {
        NodeClass::Source
    }
    fn datatype(&self) -> Datatype {
        Datatype::Bool
    }
    fn schema(&self) -> &[ParamDescriptor] {
        &[]
    }
    fn build(&self, _params: &ParamValues, _inbound: InboundMap, _services: ServiceMap) -> Result<Box<dyn Workload>, BuildError> {
        Ok(Box::new(StoppableWorkload(self.0.clone())))
    }
}

/// `unbuild_node` must send `stop` and join the worker's own graceful
/// teardown before dropping its handle, not just drop the handle and let
/// the OS process (or, here, the in-process task) get cut loose. Without
/// the join, `StoppableWorkload::teardown` — which only this worker's own
/// `Stop`-triggered shutdown path ever calls — would never run.
#[tokio::test]
async fn unbuild_node_sends_stop_and_joins_teardown_before_dropping_handle() {
    let torn_down = Arc::new(AtomicBool::new(false));
    let mut registry = KernelRegistry::new();
    registry.register(Box::new(StoppableKernel(torn_down.clone())));
    let registry = Arc::new(registry);
    let zmq_ctx = Arc::new(zmq::Context::new());
    let launcher = Arc::new(MemoryWorkerLauncher::new(registry.clone(), zmq_ctx));
    let mut controller = GraphController::new(registry, launcher, Registry::new());

    let id = controller.create_node("test.stoppable", ParamValues::new()).unwrap();
    controller.build_node(id).await.unwrap();

    controller.unbuild_node(id).await.unwrap();

    assert!(
        torn_down.load(Ordering::SeqCst),
        "unbuild_node must join the worker's graceful stop/teardown before releasing its handle"
    );
}

#[test]
fn available_types_lists_the_closed_catalog() {
    let controller = new_controller();
    let types = controller.available_types();
    for expected in [
        "source.lfp",
        "source.waveforms",
        "source.position",
        "filter.ripple-envelope",
        "filter.theta-hilbert",
        "filter.markspace-encoder",
        "filter.bayesian-decoder",
        "action.stimulator",
    ] {
        assert!(types.contains(&expected), "missing {expected}");
    }
}

