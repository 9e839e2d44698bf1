//! Hilbert-phase theta predictor: predicts the next
//! moment the LFP's theta-band oscillation crosses a target phase on a
//! chosen reference channel, and fires exactly once per predicted
//! crossing. Grounded on
//! `examples/original_source/fsgui/filter/lfp/theta_hilbert.py`.
//!
//! Each incoming sample advances an internal tick counter used as the
//! hardware timestamp: bit-exact numerics are not
//! required, and the runtime core here has no separate timestamp plane
//! wired to the LFP source — one tick per sample is the simplification.

use crate::dsp::{filtfilt, hilbert_phase, unwrap_phase, ArExtrapolator};
use crate::kernel::{InboundMap, LogLevel, NodeKernel, ServiceMap, WorkerContext, Workload};
use crate::params::{f64_list, f64_or, usize_or};
use fsgui_core::buffers::CircularBuffer;
use fsgui_core::error::BuildError;
use fsgui_core::transport::{MultiPoller, Subscriber};
use fsgui_core::types::{Datatype, NodeClass, ParamDescriptor, ParamKind, ParamValues};
use fsgui_core::value::Value;
use std::f64::consts::PI;
use std::time::Duration;

pub struct ThetaPredictorKernel {
    schema: Vec<ParamDescriptor>,
}

impl ThetaPredictorKernel {
    pub fn new() -> Self {
        let schema = vec![
            ParamDescriptor::new("input", ParamKind::Ref(Datatype::Float), Value::Bool(false)),
            ParamDescriptor::new("reference_channel", ParamKind::Int { lower: 0, upper: 255 }, Value::Int(0)),
            ParamDescriptor::new("fs", ParamKind::Float { lower: 1.0, upper: 30000.0 }, Value::Float(1500.0)),
            ParamDescriptor::new(
                "target_phase",
                ParamKind::Float { lower: -PI, upper: PI },
                Value::Float(0.0),
            )
            .live_editable(),
            ParamDescriptor::new(
                "ar_coeffs",
                ParamKind::List(Box::new(ParamKind::Float { lower: -10.0, upper: 10.0 })),
                Value::List(vec![Value::Float(1.9), Value::Float(-0.95)]),
            ),
        ];
        Self { schema }
    }
}

impl Default for ThetaPredictorKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeKernel for ThetaPredictorKernel {
    fn type_id(&self) -> &'static str {
        "filter.theta-hilbert"
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
            message: "theta-hilbert: missing inbound subscriber for \"input\"".to_string(),
        })?;

        let fs = f64_or(params, "fs", 1500.0);
        let ar_coeffs = {
            let c = f64_list(params, "ar_coeffs");
            if c.is_empty() {
                vec![1.9, -0.95]
            } else {
                c
            }
        };
        let trim = (0.15 * fs).round() as usize;
        let horizon = 2 * trim;

        let core = ThetaCore {
            buffer: CircularBuffer::new(fs.round() as usize),
            bandpass: crate::dsp::butter_bandpass_sos(1, 4.0, 9.0, fs),
            ar: ArExtrapolator::new(&ar_coeffs, horizon),
            ar_order: ar_coeffs.len(),
            trim,
            target_phase: f64_or(params, "target_phase", 0.0),
            t_next: None,
            tick: 0,
        };

        Ok(Box::new(ThetaWorkload {
            core,
            input,
            reference_channel: usize_or(params, "reference_channel", 0),
        }))
    }
}

/// The pure prediction pipeline, free of any transport type.
pub struct ThetaCore {
    buffer: CircularBuffer<f64>,
    bandpass: Vec<crate::dsp::Biquad>,
    ar: ArExtrapolator,
    ar_order: usize,
    trim: usize,
    target_phase: f64,
    /// Tick at which the next predicted crossing fires, if any prediction
    /// is currently pending: exactly one `true` per predicted crossing
    /// event.
    t_next: Option<i64>,
    tick: i64,
}

impl ThetaCore {
    /// Feed one new sample; returns whether this tick fires the predicted
    /// crossing.
    pub fn process(&mut self, sample: f64) -> bool {
        self.tick += 1;
        let ts = self.tick;
        self.buffer.push(sample);

        if let Some(t_next) = self.t_next {
            if ts >= t_next {
                self.t_next = None;
                return true;
            }
            return false;
        }

        self.maybe_predict(ts);
        false
    }

    fn maybe_predict(&mut self, last_ts: i64) {
        if self.buffer.len() < 2 * self.trim + self.ar_order + 1 {
            return;
        }
        let raw = self.buffer.to_vec_forward();
        let filtered = filtfilt(&self.bandpass, &raw);

        let trim = self.trim;
        let trimmed = &filtered[trim..filtered.len() - trim];
        if trimmed.len() < self.ar_order {
            return;
        }

        let tail = &trimmed[trimmed.len() - self.ar_order..];
        let future = self.ar.extrapolate(tail);

        let mut combined = trimmed.to_vec();
        combined.extend(future.iter().copied());
        let phase = unwrap_phase(&hilbert_phase(&combined));

        let last_phase = phase[trimmed.len() - 1];
        let k = ((last_phase - self.target_phase) / (2.0 * PI)).ceil();
        let target = k * 2.0 * PI + self.target_phase;

        let mut found = None;
        for (i, &p) in phase[trimmed.len()..].iter().enumerate() {
            if p >= target {
                found = Some(i);
                break;
            }
        }

        if let Some(idx) = found {
            let lower = trim as f64 / 4.0;
            let upper = trim as f64 / 2.0;
            if (idx as f64) > lower && (idx as f64) < upper {
                self.t_next = Some(last_ts + idx as i64);
            }
        }
    }
}

struct ThetaWorkload {
    core: ThetaCore,
    input: Subscriber,
    reference_channel: usize,
}

impl Workload for ThetaWorkload {
    fn step(&mut self, ctx: &mut dyn WorkerContext) -> anyhow::Result<()> {
        let poller = MultiPoller::new(vec![&self.input]);
        if poller.poll(Duration::from_millis(200))?.is_empty() {
            return Ok(());
        }
        let Some(value) = self.input.try_recv()? else {
            return Ok(());
        };
        let Some(sample) = value.as_float_vec() else {
            ctx.log(LogLevel::Warning, "theta-hilbert: expected a float vector sample");
            return Ok(());
        };
        let Some(&channel_value) = sample.get(self.reference_channel) else {
            ctx.log(LogLevel::Warning, "theta-hilbert: reference channel out of range");
            return Ok(());
        };

        let fired = self.core.process(channel_value);
        ctx.publish_data(&Value::Bool(fired));
        Ok(())
    }

    fn apply_update(&mut self, name: &str, value: Value) {
        if name == "target_phase" {
            if let Some(v) = value.as_f64() {
                self.core.target_phase = v;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core(fs: f64) -> ThetaCore {
        let trim = (0.15 * fs).round() as usize;
        let ar_coeffs = vec![1.9, -0.95];
        ThetaCore {
            buffer: CircularBuffer::new(fs.round() as usize),
            bandpass: crate::dsp::butter_bandpass_sos(1, 4.0, 9.0, fs),
            ar_order: ar_coeffs.len(),
            ar: ArExtrapolator::new(&ar_coeffs, 2 * trim),
            trim,
            target_phase: 0.0,
            t_next: None,
            tick: 0,
        }
    }

    #[test]
    fn never_fires_twice_for_the_same_pending_prediction() {
        let mut c = core(150.0);
        c.tick = 50;
        c.t_next = Some(100);
        let mut fires = 0;
        for _ in 0..120 {
            if c.process(0.0) {
                fires += 1;
            }
        }
        assert_eq!(fires, 1);
    }

    #[test]
    fn does_not_predict_before_buffer_has_enough_samples() {
        let mut c = core(150.0);
        for _ in 0..5 {
            assert!(!c.process(1.0));
        }
        assert!(c.t_next.is_none());
    }

    #[test]
    fn feeding_a_clean_theta_oscillation_eventually_sets_a_pending_prediction() {
        let fs = 150.0;
        let mut c = core(fs);
        let freq = 6.0;
        let mut any_prediction = false;
        for n in 0..(fs as usize * 3) {
            let x = (2.0 * PI * freq * n as f64 / fs).sin();
            c.process(x);
            if c.t_next.is_some() {
                any_prediction = true;
                break;
            }
        }
        assert!(any_prediction, "expected a pending prediction within 3 seconds of clean theta");
    }
}
