//! HDF5 telemetry log: one file per run, one group per
//! instance id, one extensible 1-D `f32` dataset per telemetry key.
//! Grounded on `examples/other_examples/manifests/GReX-Telescope-GReX-T0`'s
//! Cargo.toml, the one instrument-adjacent repo in the pack that reaches
//! for the `hdf5` crate for exactly this shape of append-only sample log.

use fsgui_core::transport::Subscriber;
use fsgui_core::types::InstanceId;
use fsgui_core::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Samples buffered in memory before a dataset is extended and flushed, to
/// avoid one HDF5 write call per telemetry tick.
const FLUSH_THRESHOLD: usize = 256;

struct PendingWrites {
    by_key: HashMap<String, Vec<f32>>,
}

impl PendingWrites {
    fn new() -> Self {
        Self { by_key: HashMap::new() }
    }
}

/// One instance's telemetry subscription plus its HDF5 group and buffered
/// samples.
struct InstanceSink {
    subscriber: Subscriber,
    group: hdf5::Group,
    pending: PendingWrites,
}

/// Owns the run's HDF5 file and every built instance's telemetry
/// subscription. Runs entirely on the controller's main task: one
/// non-blocking poll per tick, same cadence as `process_items`.
pub struct TelemetryLog {
    file: hdf5::File,
    sinks: HashMap<InstanceId, InstanceSink>,
    zmq_ctx: Arc<zmq::Context>,
}

impl TelemetryLog {
    /// Creates `<started_at>_fsgui_log.h5` in `dir`. `started_at` is passed
    /// in (rather than taken from `chrono::Local::now()` here) so callers
    /// that need a deterministic name in tests can supply one.
    pub fn create(dir: &std::path::Path, started_at: &str, zmq_ctx: Arc<zmq::Context>) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{started_at}_fsgui_log.h5"));
        let file = hdf5::File::create(path)?;
        Ok(Self { file, sinks: HashMap::new(), zmq_ctx })
    }

    /// Opens a subscription to every instance in `reporters` not already
    /// tracked, and drops sinks for instances no longer present (a node
    /// was unbuilt since the last sync).
    pub fn sync(&mut self, reporters: &HashMap<InstanceId, String>) -> anyhow::Result<()> {
        self.sinks.retain(|id, _| reporters.contains_key(id));
        for (&id, endpoint) in reporters {
            if self.sinks.contains_key(&id) {
                continue;
            }
            let subscriber = Subscriber::connect(self.zmq_ctx.clone(), endpoint)?;
            let group = self.file.create_group(&id.to_string())?;
            self.sinks.insert(id, InstanceSink { subscriber, group, pending: PendingWrites::new() });
        }
        Ok(())
    }

    /// Drains every ready telemetry sample without blocking, buffering it
    /// per key and flushing a key's dataset once its buffer reaches
    /// `FLUSH_THRESHOLD`.
    pub fn poll(&mut self) -> anyhow::Result<()> {
        for sink in self.sinks.values_mut() {
            while let Some(value) = sink.subscriber.try_recv()? {
                let Value::Map(map) = value else { continue };
                for (key, sample) in map {
                    let Some(sample) = sample.as_f64() else { continue };
                    let buffer = sink.pending.by_key.entry(key.clone()).or_default();
                    buffer.push(sample as f32);
                    if buffer.len() >= FLUSH_THRESHOLD {
                        flush_key(&sink.group, &key, buffer)?;
                        buffer.clear();
                    }
                }
            }
        }
        Ok(())
    }

    /// Flushes every remaining buffered sample. Called once at shutdown.
    pub fn flush_all(&mut self) -> anyhow::Result<()> {
        for sink in self.sinks.values_mut() {
            for (key, buffer) in sink.pending.by_key.iter_mut() {
                if buffer.is_empty() {
                    continue;
                }
                flush_key(&sink.group, key, buffer)?;
                buffer.clear();
            }
        }
        Ok(())
    }
}

/// Extends (or creates) `group/key`'s 1-D f32 dataset by `samples.len()`
/// and writes them into the newly opened slice.
fn flush_key(group: &hdf5::Group, key: &str, samples: &[f32]) -> anyhow::Result<()> {
    let dataset = match group.dataset(key) {
        Ok(dataset) => {
            let current = dataset.shape()[0];
            dataset.resize(current + samples.len())?;
            dataset
        }
        Err(_) => group
            .new_dataset::<f32>()
            .shape(hdf5::SimpleExtents::resizable(samples.len()))
            .create(key)?,
    };
    let current = dataset.shape()[0] - samples.len();
    dataset.write_slice(samples, current..current + samples.len())?;
    Ok(())
}
