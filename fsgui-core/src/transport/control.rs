//! The control-channel wire protocol a worker process and the controller
//! that spawned it speak over the worker's inherited stdin/stdout.
//! Lives in `core` rather than in either process's own
//! crate because both `fsgui-worker` and `fsgui-controller` need the
//! exact same types to frame the same newline-delimited JSON stream.

use crate::types::ParamValues;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Controller -> worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlRequest {
    /// The build-time message: every endpoint the controller resolved on
    /// this node's behalf, plus its bound params. Sent exactly once, after
    /// the worker has announced its own endpoints.
    Init {
        params: ParamValues,
        /// Resolved subscriber endpoints, keyed the same way
        /// `fsgui_kernels::kernel::InboundMap` is keyed.
        inbound: BTreeMap<String, String>,
        /// Resolved hardware service endpoints, keyed by well-known name.
        services: BTreeMap<String, String>,
        /// Resolved acquisition-server endpoint, present only for the
        /// three `source.*` kernels.
        acquisition_endpoint: Option<String>,
    },
    /// Apply a live-edited parameter (only legal for `live_editable` ones).
    Update { name: String, value: Value },
    /// A downstream consumer attached to this node's data plane.
    AddFanoutSubscriber { endpoint: String },
    Stop,
}

/// Worker -> controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlResponse {
    /// Sent once at startup, before `Init` arrives, in this declared
    /// order: data plane endpoint, then telemetry plane endpoint.
    Endpoints { data: String, telemetry: String },
    Log { level: String, target: String, message: String },
    Exception { kind: String, trace: String, repr: String },
    Stopped,
}
