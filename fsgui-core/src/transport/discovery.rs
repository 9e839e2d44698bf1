use crate::error::TransportError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Maps a well-known name to an endpoint, polling every 500ms until found.
/// Backed by a simple shared registry rather than a
/// network round trip — in this runtime the registry lives in the
/// controller process and workers are handed the registry's address at
/// spawn time, but the polling contract (retry budget, 500ms cadence) is
/// what callers depend on.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn announce(&self, name: impl Into<String>, endpoint: impl Into<String>) {
        self.inner
            .lock()
            .expect("registry mutex poisoned")
            .insert(name.into(), endpoint.into());
    }

    pub fn lookup(&self, name: &str) -> Option<String> {
        self.inner
            .lock()
            .expect("registry mutex poisoned")
            .get(name)
            .cloned()
    }

    /// Retries every 500ms until `name` resolves or `retries` is
    /// exhausted.
    pub fn resolve(&self, name: &str, retries: usize) -> Result<String, TransportError> {
        for attempt in 0..=retries {
            if let Some(endpoint) = self.lookup(name) {
                return Ok(endpoint);
            }
            if attempt < retries {
                std::thread::sleep(Duration::from_millis(500));
            }
        }
        Err(TransportError::EndpointNotFound {
            name: name.to_string(),
        })
    }
}

pub const SOURCE_LFP: &str = "source.lfp";
pub const SOURCE_WAVEFORMS: &str = "source.waveforms";
pub const SOURCE_POSITION: &str = "source.position";
pub const TRODES_HARDWARE: &str = "trodes.hardware";
pub const STATESCRIPT_SERVICE: &str = "statescript.service";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_once_announced() {
        let registry = Registry::new();
        registry.announce(SOURCE_LFP, "tcp://127.0.0.1:9000");
        assert_eq!(
            registry.resolve(SOURCE_LFP, 0).unwrap(),
            "tcp://127.0.0.1:9000"
        );
    }

    #[test]
    fn fails_after_retry_budget() {
        let registry = Registry::new();
        let err = registry.resolve("source.unknown", 0).unwrap_err();
        assert!(matches!(err, TransportError::EndpointNotFound { .. }));
    }
}
