pub mod graph;
pub mod launcher;
pub mod launcher_memory;
pub mod telemetry;
pub mod validate;

use fsgui_kernels::kernel::KernelRegistry;
use fsgui_kernels::sources::{LfpSource, MockAcquisitionSubscriber, PositionSource, WaveformSource};
use fsgui_kernels::{register_non_source_kernels, NodeKernel};

/// The full, closed catalog of node types the controller can create or
/// validate against. Source kernels are generic over an
/// `AcquisitionSubscriber` the real worker process resolves at spawn time;
/// the controller only ever needs their `type_id`/`schema` (both of which
/// don't depend on the subscriber), so it registers them against an unused
/// mock here rather than duplicating their schemas by hand.
pub fn build_kernel_registry() -> KernelRegistry {
    let mut registry = KernelRegistry::new();
    register_non_source_kernels(&mut registry);
    let unused = MockAcquisitionSubscriber::default();
    register_source(&mut registry, Box::new(LfpSource::new(unused.clone())));
    register_source(&mut registry, Box::new(WaveformSource::new(unused.clone())));
    register_source(&mut registry, Box::new(PositionSource::new(unused)));
    registry
}

fn register_source(registry: &mut KernelRegistry, kernel: Box<dyn NodeKernel>) {
    registry.register(kernel);
}
