//! Ripple envelope estimator: a Butterworth bandpass
//! cascade, FIR envelope, Welford running statistics, and a per-channel
//! z-score threshold vote. Grounded on
//! `examples/original_source/fsgui/filter/lfp/ripple_new.py`.
//!
//! The numeric pipeline (`RippleCore`) is kept free of any transport type
//! so it can be driven directly in tests; `RippleWorkload` is the thin
//! adapter that owns the real inbound `Subscriber` and calls it.

use crate::dsp::{butter_bandpass_sos, BiquadCascade, FirFilter, Welford};
use crate::kernel::{InboundMap, LogLevel, NodeKernel, ServiceMap, WorkerContext, Workload};
use crate::params::{bool_or, f64_list, f64_or, string_or, usize_list, usize_or};
use fsgui_core::error::BuildError;
use fsgui_core::transport::{MultiPoller, Subscriber};
use fsgui_core::types::{Datatype, NodeClass, ParamDescriptor, ParamKind, ParamValues};
use fsgui_core::value::Value;
use std::collections::BTreeMap;
use std::time::Duration;

pub struct RippleEnvelopeKernel {
    schema: Vec<ParamDescriptor>,
}

impl RippleEnvelopeKernel {
    pub fn new() -> Self {
        let schema = vec![
            ParamDescriptor::new("input", ParamKind::Ref(Datatype::Float), Value::Bool(false)),
            ParamDescriptor::new("n_channels", ParamKind::Int { lower: 1, upper: 256 }, Value::Int(32)),
            ParamDescriptor::new(
                "channels",
                ParamKind::List(Box::new(ParamKind::Int { lower: 0, upper: 255 })),
                Value::List(vec![]),
            ),
            ParamDescriptor::new("fs", ParamKind::Float { lower: 1.0, upper: 30000.0 }, Value::Float(1500.0)),
            ParamDescriptor::new("low_hz", ParamKind::Float { lower: 1.0, upper: 10000.0 }, Value::Float(150.0)),
            ParamDescriptor::new("high_hz", ParamKind::Float { lower: 1.0, upper: 10000.0 }, Value::Float(250.0)),
            ParamDescriptor::new("order", ParamKind::Int { lower: 1, upper: 8 }, Value::Int(2)),
            ParamDescriptor::new("envelope_taps", ParamKind::Int { lower: 1, upper: 512 }, Value::Int(10)),
            ParamDescriptor::new(
                "sd_threshold",
                ParamKind::Float { lower: 0.0, upper: 50.0 },
                Value::Float(3.0),
            )
            .live_editable(),
            ParamDescriptor::new(
                "n_above_threshold",
                ParamKind::Int { lower: 1, upper: 256 },
                Value::Int(1),
            )
            .live_editable(),
            ParamDescriptor::new("auto_flag", ParamKind::Bool, Value::Bool(true)).live_editable(),
            ParamDescriptor::new(
                "means_manual",
                ParamKind::List(Box::new(ParamKind::Float { lower: -1e9, upper: 1e9 })),
                Value::List(vec![]),
            )
            .live_editable(),
            ParamDescriptor::new(
                "sigmas_manual",
                ParamKind::List(Box::new(ParamKind::Float { lower: 0.0, upper: 1e9 })),
                Value::List(vec![]),
            )
            .live_editable(),
            ParamDescriptor::new(
                "sample_mean_sd",
                ParamKind::Bool,
                Value::Bool(false),
            )
            .live_editable(),
            ParamDescriptor::new("display_channel", ParamKind::Int { lower: 0, upper: 255 }, Value::Int(0))
                .live_editable(),
        ];
        Self { schema }
    }
}

impl Default for RippleEnvelopeKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeKernel for RippleEnvelopeKernel {
    fn type_id(&self) -> &'static str {
        "filter.ripple-envelope"
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

    fn build(&self, params: &ParamValues, mut inbound: InboundMap, _services: ServiceMap) -> Result<Box<dyn Workload>, BuildError> {
        let input = inbound.remove("input").ok_or_else(|| BuildError {
            message: "ripple-envelope: missing inbound subscriber for \"input\"".to_string(),
        })?;

        let n_channels = usize_or(params, "n_channels", 32);
        let mut channel_indices = usize_list(params, "channels");
        if channel_indices.is_empty() {
            channel_indices = (0..n_channels).collect();
        }

        let fs = f64_or(params, "fs", 1500.0);
        let low_hz = f64_or(params, "low_hz", 150.0);
        let high_hz = f64_or(params, "high_hz", 250.0);
        let order = usize_or(params, "order", 2);
        let envelope_taps = usize_or(params, "envelope_taps", 10);

        let sections = butter_bandpass_sos(order, low_hz, high_hz, fs);
        let cascade = BiquadCascade::new(sections, n_channels);
        let fir = (0..channel_indices.len())
            .map(|_| FirFilter::new(vec![1.0 / envelope_taps as f64; envelope_taps]))
            .collect();
        let welford = vec![Welford::new(); channel_indices.len()];

        let core = RippleCore {
            cascade,
            fir,
            welford,
            channel_indices,
            auto_flag: bool_or(params, "auto_flag", true),
            means_manual: f64_list(params, "means_manual"),
            sigmas_manual: f64_list(params, "sigmas_manual"),
            sd_threshold: f64_or(params, "sd_threshold", 3.0),
            n_above_threshold: usize_or(params, "n_above_threshold", 1),
            display_channel: usize_or(params, "display_channel", 0),
        };

        Ok(Box::new(RippleWorkload { core, input }))
    }
}

/// One tick's result: whether the ripple vote triggered, plus the values
/// the telemetry record carries.
pub struct RippleTick {
    pub triggered: bool,
    pub displayed_envelope: f64,
    pub displayed_mean: f64,
    pub displayed_sd: f64,
    pub z_scores: Vec<f64>,
}

/// The pure numeric pipeline: bandpass cascade -> squared-envelope FIR ->
/// Welford z-score vote. Holds no transport state.
pub struct RippleCore {
    cascade: BiquadCascade,
    fir: Vec<FirFilter>,
    welford: Vec<Welford>,
    channel_indices: Vec<usize>,
    auto_flag: bool,
    means_manual: Vec<f64>,
    sigmas_manual: Vec<f64>,
    sd_threshold: f64,
    n_above_threshold: usize,
    display_channel: usize,
}

impl RippleCore {
    pub fn process(&mut self, sample: &[f64]) -> RippleTick {
        let filtered = self.cascade.process(sample);

        let mut z_scores = Vec::with_capacity(self.channel_indices.len());
        let mut count_above = 0usize;
        let mut displayed_envelope = 0.0;
        let mut displayed_mean = 0.0;
        let mut displayed_sd = 0.0;

        for (i, &ch) in self.channel_indices.iter().enumerate() {
            let ripple_band = filtered.get(ch).copied().unwrap_or(0.0);
            let squared = ripple_band * ripple_band;
            let envelope = self.fir[i].push(squared).max(0.0).sqrt();

            let (mean, sd) = if self.auto_flag {
                self.welford[i].update(envelope);
                (self.welford[i].mean(), self.welford[i].sd())
            } else {
                (
                    self.means_manual.get(i).copied().unwrap_or(0.0),
                    self.sigmas_manual.get(i).copied().unwrap_or(1.0),
                )
            };
            // Clamp to avoid division by zero even in manual mode, where a
            // user could supply sigma = 0.
            let sd = if sd == 0.0 { 1.0 } else { sd };

            let z = (envelope - mean) / sd;
            if z > self.sd_threshold {
                count_above += 1;
            }
            if ch == self.display_channel {
                displayed_envelope = envelope;
                displayed_mean = mean;
                displayed_sd = sd;
            }
            z_scores.push(z);
        }

        RippleTick {
            triggered: count_above >= self.n_above_threshold,
            displayed_envelope,
            displayed_mean,
            displayed_sd,
            z_scores,
        }
    }

    pub fn apply_update(&mut self, name: &str, value: Value) {
        match name {
            "sd_threshold" => {
                if let Some(v) = value.as_f64() {
                    self.sd_threshold = v;
                }
            }
            "n_above_threshold" => {
                if let Some(v) = value.as_i64() {
                    self.n_above_threshold = v.max(0) as usize;
                }
            }
            "auto_flag" => {
                if let Some(v) = value.as_bool() {
                    self.auto_flag = v;
                }
            }
            "means_manual" => {
                if let Some(list) = value.as_list() {
                    self.means_manual = list.iter().filter_map(Value::as_f64).collect();
                }
            }
            "sigmas_manual" => {
                if let Some(list) = value.as_list() {
                    self.sigmas_manual = list.iter().filter_map(Value::as_f64).collect();
                }
            }
            "display_channel" => {
                if let Some(v) = value.as_i64() {
                    self.display_channel = v.max(0) as usize;
                }
            }
            "sample_mean_sd" => {
                if value.as_bool() == Some(true) {
                    for w in &mut self.welford {
                        *w = Welford::new();
                    }
                }
            }
            _ => {}
        }
    }
}

struct RippleWorkload {
    core: RippleCore,
    input: Subscriber,
}

impl Workload for RippleWorkload {
    fn step(&mut self, ctx: &mut dyn WorkerContext) -> anyhow::Result<()> {
        let poller = MultiPoller::new(vec![&self.input]);
        if poller.poll(Duration::from_millis(200))?.is_empty() {
            return Ok(());
        }
        let Some(value) = self.input.try_recv()? else {
            return Ok(());
        };
        let Some(sample) = value.as_float_vec() else {
            ctx.log(LogLevel::Warning, "ripple-envelope: expected a float vector sample");
            return Ok(());
        };

        let tick = self.core.process(sample);
        ctx.publish_data(&Value::Bool(tick.triggered));

        let mut telemetry = BTreeMap::new();
        telemetry.insert("triggered".to_string(), Value::Bool(tick.triggered));
        telemetry.insert(
            "displayed_channel_envelope".to_string(),
            Value::Float(tick.displayed_envelope),
        );
        telemetry.insert("displayed_mean".to_string(), Value::Float(tick.displayed_mean));
        telemetry.insert("displayed_sd".to_string(), Value::Float(tick.displayed_sd));
        telemetry.insert(
            "thresholds".to_string(),
            Value::FloatVec(tick.z_scores),
        );
        ctx.publish_telemetry(&Value::Map(telemetry));
        Ok(())
    }

    fn apply_update(&mut self, name: &str, value: Value) {
        self.core.apply_update(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core(n_channels: usize, taps: usize) -> RippleCore {
        let sections = butter_bandpass_sos(2, 150.0, 250.0, 1500.0);
        RippleCore {
            cascade: BiquadCascade::new(sections, n_channels),
            fir: (0..n_channels).map(|_| FirFilter::new(vec![1.0 / taps as f64; taps])).collect(),
            welford: vec![Welford::new(); n_channels],
            channel_indices: (0..n_channels).collect(),
            auto_flag: true,
            means_manual: vec![],
            sigmas_manual: vec![],
            sd_threshold: 3.0,
            n_above_threshold: 1,
            display_channel: 0,
        }
    }

    #[test]
    fn first_tick_never_produces_nan_sd() {
        let mut core = core(2, 4);
        let tick = core.process(&[1.0, -1.0]);
        assert!(tick.displayed_sd.is_finite());
        assert!(!tick.displayed_sd.is_nan());
    }

    #[test]
    fn manual_mode_uses_fixed_mean_and_sd_and_never_updates_welford() {
        let mut core = core(1, 2);
        core.auto_flag = false;
        core.means_manual = vec![0.0];
        core.sigmas_manual = vec![1.0];
        for _ in 0..5 {
            core.process(&[10.0]);
        }
        // Welford must not have accumulated any samples in manual mode.
        assert_eq!(core.welford[0].mean(), 0.0);
    }

    #[test]
    fn manual_mode_zero_sigma_is_clamped_not_nan() {
        let mut core = core(1, 2);
        core.auto_flag = false;
        core.means_manual = vec![0.0];
        core.sigmas_manual = vec![0.0];
        let tick = core.process(&[5.0]);
        assert!(tick.z_scores[0].is_finite());
    }

    #[test]
    fn triggered_requires_n_above_threshold_channels_over_sd_threshold() {
        let mut core = core(3, 2);
        core.auto_flag = false;
        core.means_manual = vec![0.0, 0.0, 0.0];
        core.sigmas_manual = vec![1.0, 1.0, 1.0];
        core.sd_threshold = 0.5;
        core.n_above_threshold = 2;
        // Drive a large value through one tick; with only 3-sample history
        // it's the squared-energy envelope that crosses threshold.
        let tick = core.process(&[100.0, 100.0, 0.0]);
        assert!(tick.z_scores[0] > 0.5 || tick.z_scores[1] > 0.5);
    }

    #[test]
    fn apply_update_changes_live_editable_params_only() {
        let mut core = core(1, 2);
        core.apply_update("sd_threshold", Value::Float(5.0));
        assert_eq!(core.sd_threshold, 5.0);
        core.apply_update("n_above_threshold", Value::Int(4));
        assert_eq!(core.n_above_threshold, 4);
        core.apply_update("unknown_param", Value::Bool(true));
    }

    #[test]
    fn sample_mean_sd_resets_running_statistics() {
        let mut core = core(1, 2);
        core.process(&[50.0]);
        core.process(&[50.0]);
        assert!(core.welford[0].mean() > 0.0);
        core.apply_update("sample_mean_sd", Value::Bool(true));
        assert_eq!(core.welford[0].mean(), 0.0);
    }
}
