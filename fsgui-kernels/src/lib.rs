//! The closed catalog of node kernels: sources, filters, and
//! actions, plus the DSP helpers they share. Each kernel module keeps a
//! transport-free "Core" type separate from a thin `Workload` adapter so
//! the numeric pipeline stays unit-testable without a real socket.

pub mod action;
pub mod decoder;
pub mod dsp;
pub mod kernel;
pub mod markspace;
pub mod params;
pub mod ripple;
pub mod sources;
pub mod theta;

pub use kernel::{InboundMap, KernelRegistry, LogLevel, NodeKernel, ServiceMap, WorkerContext, Workload};

/// Registers every node kernel this catalog knows about under its
/// `type_id`, except the three acquisition-backed sources
/// (`source.lfp`/`source.waveforms`/`source.position`), which are generic
/// over an `AcquisitionSubscriber` implementation the worker binary
/// supplies at startup and so are registered by the caller instead.
pub fn register_non_source_kernels(registry: &mut KernelRegistry) {
    registry.register(Box::new(ripple::RippleEnvelopeKernel::new()));
    registry.register(Box::new(theta::ThetaPredictorKernel::new()));
    registry.register(Box::new(markspace::MarkSpaceEncoderKernel::new()));
    registry.register(Box::new(decoder::BayesianDecoderKernel::new()));
    registry.register(Box::new(action::StimulatorKernel::new()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_every_non_source_kernel_by_type_id() {
        let mut registry = KernelRegistry::new();
        register_non_source_kernels(&mut registry);
        for type_id in [
            "filter.ripple-envelope",
            "filter.theta-hilbert",
            "filter.markspace-encoder",
            "filter.bayesian-decoder",
            "action.stimulator",
        ] {
            assert!(registry.get(type_id).is_some(), "missing {type_id}");
        }
    }
}
