use crate::types::InstanceId;
use thiserror::Error;

/// Bad parameters, unknown node type, or an unresolved/cyclic reference.
#[derive(Debug, Clone, Error)]
pub enum ConfigurationError {
    #[error("unknown node type: {0}")]
    UnknownType(String),

    #[error("invalid params for {type_id}: {message}")]
    InvalidParams { type_id: String, message: String },

    #[error("parameter {param} references unknown instance {target}")]
    UnresolvedReference { param: String, target: InstanceId },

    #[error("cycle through {0:?}")]
    Cycle(Vec<InstanceId>),
}

/// Violations of the build/unbuild/delete state machine.
#[derive(Debug, Clone, Error)]
pub enum LifecycleError {
    #[error("instance {0} not found")]
    NotFound(InstanceId),

    #[error("instance {0} is already built")]
    AlreadyBuilt(InstanceId),

    #[error("instance {0} is not built")]
    NotBuilt(InstanceId),

    #[error("instance {0} is still built")]
    StillBuilt(InstanceId),

    #[error("instance {dependent} depends on {0} and is still built", dependent = .dependent)]
    DependentStillBuilt { dependent: InstanceId },
}

/// A kernel's `build` raised during a `build_node` call.
#[derive(Debug, Clone, Error)]
#[error("build failed: {message}")]
pub struct BuildError {
    pub message: String,
}

/// Errors surfaced from a running worker, or from its disappearance.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("external service unavailable: {0}")]
    ExternalServiceUnavailable(String),

    #[error("kernel panicked: {0}")]
    KernelPanic(String),

    #[error("Process crashed.")]
    ProcessCrashed,
}

/// Failures from the pub/sub or request/response transport.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("endpoint not found for {name} after retry budget exhausted")]
    EndpointNotFound { name: String },

    #[error("transport I/O error: {0}")]
    Io(String),
}

/// The union of everything this crate's public operations can fail with.
#[derive(Debug, Clone, Error)]
pub enum FsguiError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
