//! Mark-space kernel density encoder: learns a joint
//! density between spike marks and the animal's discretised covariate,
//! per electrode group, and answers point queries with an unnormalised
//! posterior over bins. Grounded on
//! `examples/original_source/fsgui/filter/spikes/markspace.py`.

use crate::kernel::{InboundMap, LogLevel, NodeKernel, ServiceMap, WorkerContext, Workload};
use crate::params::{f64_or, usize_or};
use fsgui_core::buffers::AppendList;
use fsgui_core::error::BuildError;
use fsgui_core::transport::{MultiPoller, Subscriber};
use fsgui_core::types::{Datatype, NodeClass, ParamDescriptor, ParamKind, ParamValues};
use fsgui_core::value::Value;
use std::collections::BTreeMap;
use std::time::Duration;

const WEIGHT_FLOOR: f64 = 1e-20;

pub struct MarkSpaceEncoderKernel {
    schema: Vec<ParamDescriptor>,
}

impl MarkSpaceEncoderKernel {
    pub fn new() -> Self {
        let schema = vec![
            ParamDescriptor::new("spikes", ParamKind::Ref(Datatype::Spikes), Value::Bool(false)),
            ParamDescriptor::new("covariate", ParamKind::Ref(Datatype::BinId), Value::Bool(false)),
            ParamDescriptor::new("update_signal", ParamKind::Ref(Datatype::Bool), Value::Bool(false)),
            ParamDescriptor::new("mark_ndims", ParamKind::Int { lower: 1, upper: 256 }, Value::Int(4)),
            ParamDescriptor::new("bin_count", ParamKind::Int { lower: 1, upper: 1024 }, Value::Int(20)),
            ParamDescriptor::new("sigma", ParamKind::Float { lower: 0.0, upper: 10000.0 }, Value::Float(1.0))
                .live_editable(),
            ParamDescriptor::new("n_min", ParamKind::Int { lower: 0, upper: 10000 }, Value::Int(10))
                .live_editable(),
            ParamDescriptor::new("z", ParamKind::Float { lower: 0.0, upper: 100.0 }, Value::Float(5.0))
                .live_editable(),
            ParamDescriptor::new(
                "voltage_scaling_factor",
                ParamKind::Float { lower: 0.0, upper: 10000.0 },
                Value::Float(0.195),
            )
            .live_editable(),
        ];
        Self { schema }
    }
}

impl Default for MarkSpaceEncoderKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeKernel for MarkSpaceEncoderKernel {
    fn type_id(&self) -> &'static str {
        "filter.markspace-encoder"
    }
    fn class(&self) -> NodeClass {
        NodeClass::Filter
    }
    fn datatype(&self) -> Datatype {
        Datatype::DiscreteDistribution
    }
    fn schema(&self) -> &[ParamDescriptor] {
        &self.schema
    }

    fn build(&self, params: &ParamValues, mut inbound: InboundMap, _services: ServiceMap) -> Result<Box<dyn Workload>, BuildError> {
        let spikes = inbound.remove("spikes").ok_or_else(|| BuildError {
            message: "markspace-encoder: missing inbound subscriber for \"spikes\"".to_string(),
        })?;
        let covariate = inbound.remove("covariate").ok_or_else(|| BuildError {
            message: "markspace-encoder: missing inbound subscriber for \"covariate\"".to_string(),
        })?;
        let update_signal = inbound.remove("update_signal").ok_or_else(|| BuildError {
            message: "markspace-encoder: missing inbound subscriber for \"update_signal\"".to_string(),
        })?;

        let core = MarkSpaceCore {
            groups: BTreeMap::new(),
            bin_count: usize_or(params, "bin_count", 20),
            sigma: f64_or(params, "sigma", 1.0),
            n_min: usize_or(params, "n_min", 10),
            z: f64_or(params, "z", 5.0),
            voltage_scaling_factor: f64_or(params, "voltage_scaling_factor", 0.195),
            update_enabled: false,
            current_covariate: None,
        };

        Ok(Box::new(MarkSpaceWorkload { core, spikes, covariate, update_signal }))
    }
}

#[derive(Default)]
struct GroupState {
    marks: AppendList<Vec<f64>>,
    bins: AppendList<usize>,
}

impl GroupState {
    fn admissible(&self, mark: &[f64], half_width: f64) -> usize {
        self.marks
            .iter()
            .filter(|m| m.iter().zip(mark).all(|(mi, mj)| (mi - mj).abs() < half_width))
            .count()
    }

    fn histogram(&self, mark: &[f64], sigma: f64, bin_count: usize) -> Vec<f64> {
        let k1 = 1.0 / ((2.0 * std::f64::consts::PI).sqrt() * sigma);
        let k2 = -0.5 / (sigma * sigma);

        let mut weighted = vec![0.0; bin_count];
        let mut occupancy = vec![0usize; bin_count];
        for (m, &bin) in self.marks.iter().zip(self.bins.iter()) {
            if bin >= bin_count {
                continue;
            }
            let squared_distance: f64 = m.iter().zip(mark).map(|(a, b)| (a - b) * (a - b)).sum();
            let mut weight = k1 * (k2 * squared_distance).exp();
            if weight < WEIGHT_FLOOR {
                weight = 0.0;
            }
            weighted[bin] += weight;
            occupancy[bin] += 1;
        }

        let mean_occupancy =
            occupancy.iter().sum::<usize>() as f64 / bin_count.max(1) as f64;
        let occ_norm: Vec<f64> = occupancy
            .iter()
            .map(|&o| if o == 0 { mean_occupancy } else { o as f64 })
            .collect();
        let occ_sum: f64 = occ_norm.iter().sum();
        let occ_norm: Vec<f64> = if occ_sum > 0.0 {
            occ_norm.iter().map(|v| v / occ_sum).collect()
        } else {
            vec![1.0 / bin_count.max(1) as f64; bin_count]
        };

        weighted.iter().zip(occ_norm.iter()).map(|(w, o)| w / o).collect()
    }
}

/// Extract the mark from a spike waveform: the per-channel amplitude at
/// the sample time of the globally largest peak.
pub fn compute_mark(waveform: &[Vec<f64>], voltage_scaling_factor: f64) -> Vec<f64> {
    let mut peak_channel = 0;
    let mut peak_time = 0;
    let mut peak_value = f64::NEG_INFINITY;
    for (c, channel) in waveform.iter().enumerate() {
        for (t, &v) in channel.iter().enumerate() {
            if v > peak_value {
                peak_value = v;
                peak_channel = c;
                peak_time = t;
            }
        }
    }
    let _ = peak_channel;
    waveform
        .iter()
        .map(|channel| channel.get(peak_time).copied().unwrap_or(0.0) * voltage_scaling_factor)
        .collect()
}

/// The pure per-electrode-group density model, free of transport state.
pub struct MarkSpaceCore {
    groups: BTreeMap<i64, GroupState>,
    bin_count: usize,
    sigma: f64,
    n_min: usize,
    z: f64,
    voltage_scaling_factor: f64,
    update_enabled: bool,
    current_covariate: Option<usize>,
}

impl MarkSpaceCore {
    /// Process one spike: query the group's density at its mark, then
    /// (if the update signal is on) add it as a training observation
    /// against the current covariate. Returns `None` ("no result") if
    /// fewer than `n_min` training marks fall in the admissibility box.
    pub fn process_spike(&mut self, group: i64, waveform: &[Vec<f64>]) -> Option<Vec<f64>> {
        let mark = compute_mark(waveform, self.voltage_scaling_factor);
        let result = {
            let state = self.groups.entry(group).or_default();
            let half_width = self.z * self.sigma;
            if state.admissible(&mark, half_width) < self.n_min {
                None
            } else {
                Some(state.histogram(&mark, self.sigma, self.bin_count))
            }
        };

        if self.update_enabled {
            if let Some(bin) = self.current_covariate {
                let state = self.groups.entry(group).or_default();
                state.marks.push(mark);
                state.bins.push(bin);
            }
        }

        result
    }

    pub fn set_update_enabled(&mut self, enabled: bool) {
        self.update_enabled = enabled;
    }

    pub fn set_covariate(&mut self, bin: usize) {
        self.current_covariate = Some(bin);
    }

    pub fn apply_update(&mut self, name: &str, value: Value) {
        match name {
            "sigma" => {
                if let Some(v) = value.as_f64() {
                    self.sigma = v;
                }
            }
            "n_min" => {
                if let Some(v) = value.as_i64() {
                    self.n_min = v.max(0) as usize;
                }
            }
            "z" => {
                if let Some(v) = value.as_f64() {
                    self.z = v;
                }
            }
            "voltage_scaling_factor" => {
                if let Some(v) = value.as_f64() {
                    self.voltage_scaling_factor = v;
                }
            }
            _ => {}
        }
    }
}

fn parse_spike(value: &Value) -> Option<(i64, Vec<Vec<f64>>)> {
    let map = match value {
        Value::Map(m) => m,
        _ => return None,
    };
    let group = map.get("n_trode_id")?.as_i64()?;
    let samples = match map.get("samples")? {
        Value::List(rows) => rows.iter().filter_map(Value::as_float_vec).map(|s| s.to_vec()).collect(),
        _ => return None,
    };
    Some((group, samples))
}

struct MarkSpaceWorkload {
    core: MarkSpaceCore,
    spikes: Subscriber,
    covariate: Subscriber,
    update_signal: Subscriber,
}

impl Workload for MarkSpaceWorkload {
    fn step(&mut self, ctx: &mut dyn WorkerContext) -> anyhow::Result<()> {
        let ready = {
            let poller = MultiPoller::new(vec![&self.spikes, &self.covariate, &self.update_signal]);
            poller.poll(Duration::from_millis(200))?
        };
        if ready.is_empty() {
            return Ok(());
        }

        if let Some(value) = self.update_signal.try_recv()? {
            if let Some(b) = value.as_bool() {
                self.core.set_update_enabled(b);
            }
        }
        if let Some(value) = self.covariate.try_recv()? {
            if let Some(v) = value.as_i64() {
                self.core.set_covariate(v.max(0) as usize);
            }
        }
        if let Some(value) = self.spikes.try_recv()? {
            match parse_spike(&value) {
                Some((group, waveform)) => {
                    let result = self.core.process_spike(group, &waveform);
                    let histogram = match result {
                        Some(h) => Value::FloatVec(h),
                        None => Value::Bool(false),
                    };
                    let mut out = BTreeMap::new();
                    out.insert("electrode_group_id".to_string(), Value::Int(group));
                    out.insert("histogram".to_string(), histogram);
                    ctx.publish_data(&Value::Map(out));
                }
                None => ctx.log(LogLevel::Warning, "markspace-encoder: malformed spike record"),
            }
        }
        Ok(())
    }

    fn apply_update(&mut self, name: &str, value: Value) {
        self.core.apply_update(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_mark_picks_amplitude_at_global_peak_time() {
        let waveform = vec![vec![0.0, 1.0, 0.0], vec![0.0, 5.0, 2.0]];
        let mark = compute_mark(&waveform, 1.0);
        assert_eq!(mark, vec![1.0, 5.0]);
    }

    #[test]
    fn empty_training_history_returns_no_result() {
        let mut core = MarkSpaceCore {
            groups: BTreeMap::new(),
            bin_count: 4,
            sigma: 1.0,
            n_min: 1,
            z: 5.0,
            voltage_scaling_factor: 1.0,
            update_enabled: false,
            current_covariate: None,
        };
        let waveform = vec![vec![1.0, 2.0], vec![1.0, 2.0]];
        assert!(core.process_spike(0, &waveform).is_none());
    }

    #[test]
    fn update_signal_gates_training_and_result_improves_after() {
        let mut core = MarkSpaceCore {
            groups: BTreeMap::new(),
            bin_count: 2,
            sigma: 2.0,
            n_min: 1,
            z: 10.0,
            voltage_scaling_factor: 1.0,
            update_enabled: true,
            current_covariate: Some(0),
        };
        let waveform = vec![vec![0.0, 3.0], vec![0.0, 3.0]];
        assert!(core.process_spike(7, &waveform).is_none());
        // After one training example with update enabled, n_min=1 is met.
        assert!(core.process_spike(7, &waveform).is_some());
    }

    #[test]
    fn update_disabled_never_accumulates_observations() {
        let mut core = MarkSpaceCore {
            groups: BTreeMap::new(),
            bin_count: 2,
            sigma: 2.0,
            n_min: 1,
            z: 10.0,
            voltage_scaling_factor: 1.0,
            update_enabled: false,
            current_covariate: Some(0),
        };
        let waveform = vec![vec![0.0, 3.0]];
        for _ in 0..5 {
            assert!(core.process_spike(1, &waveform).is_none());
        }
    }
}
