//! Bayesian point-process decoder: combines encoded
//! spikes accumulated since the previous timekeeper tick into a
//! posterior distribution over covariate bins. Grounded on
//! `examples/original_source/fsgui/filter/decoder.py`'s
//! `FiringHistory`/`OccupancyHistory`/`LikelihoodCalculator`/
//! `BayesianPosteriorEstimator`.

use crate::kernel::{InboundMap, LogLevel, NodeKernel, ServiceMap, WorkerContext, Workload};
use crate::params::usize_or;
use fsgui_core::error::BuildError;
use fsgui_core::transport::{MultiPoller, Subscriber};
use fsgui_core::types::{Datatype, NodeClass, ParamDescriptor, ParamKind, ParamValues};
use fsgui_core::value::Value;
use std::collections::BTreeMap;
use std::time::Duration;

const OCCUPANCY_FLOOR: f64 = 1e-7;
const HISTOGRAM_FLOOR: f64 = 1e-7;

pub struct BayesianDecoderKernel {
    schema: Vec<ParamDescriptor>,
}

impl BayesianDecoderKernel {
    pub fn new() -> Self {
        let schema = vec![
            ParamDescriptor::new("encoded_spikes", ParamKind::Ref(Datatype::DiscreteDistribution), Value::Bool(false)),
            ParamDescriptor::new("covariate", ParamKind::Ref(Datatype::BinId), Value::Bool(false)),
            ParamDescriptor::new("tick", ParamKind::Ref(Datatype::Timestamp), Value::Bool(false)),
            ParamDescriptor::new("bin_count", ParamKind::Int { lower: 1, upper: 1024 }, Value::Int(20)),
            ParamDescriptor::new("dt_ms", ParamKind::Float { lower: 0.0, upper: 100_000.0 }, Value::Float(100.0)),
            ParamDescriptor::new(
                "transition_matrix",
                ParamKind::List(Box::new(ParamKind::List(Box::new(ParamKind::Float {
                    lower: 0.0,
                    upper: 1.0,
                })))),
                Value::List(vec![]),
            ),
        ];
        Self { schema }
    }
}

impl Default for BayesianDecoderKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeKernel for BayesianDecoderKernel {
    fn type_id(&self) -> &'static str {
        "filter.bayesian-decoder"
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
        let encoded_spikes = inbound.remove("encoded_spikes").ok_or_else(|| BuildError {
            message: "bayesian-decoder: missing inbound subscriber for \"encoded_spikes\"".to_string(),
        })?;
        let covariate = inbound.remove("covariate").ok_or_else(|| BuildError {
            message: "bayesian-decoder: missing inbound subscriber for \"covariate\"".to_string(),
        })?;
        let tick = inbound.remove("tick").ok_or_else(|| BuildError {
            message: "bayesian-decoder: missing inbound subscriber for \"tick\"".to_string(),
        })?;

        let bin_count = usize_or(params, "bin_count", 20);
        let dt_ms = params.get("dt_ms").and_then(Value::as_f64).unwrap_or(100.0);

        let transition = params
            .get("transition_matrix")
            .and_then(Value::as_list)
            .filter(|rows| !rows.is_empty())
            .map(|rows| {
                rows.iter()
                    .map(|row| {
                        row.as_list()
                            .map(|r| r.iter().filter_map(Value::as_f64).collect())
                            .unwrap_or_default()
                    })
                    .collect()
            })
            .unwrap_or_else(|| uniform_transition(bin_count));

        let core = DecoderCore {
            bin_count,
            dt_ms,
            transition,
            lambda: BTreeMap::new(),
            occupancy: vec![0.0; bin_count],
            last_posterior: uniform(bin_count),
            current_covariate: None,
            pending: Vec::new(),
        };

        Ok(Box::new(DecoderWorkload { core, encoded_spikes, covariate, tick }))
    }
}

/// A uniform-mixing transition matrix: every row is the flat distribution.
fn uniform_transition(bin_count: usize) -> Vec<Vec<f64>> {
    vec![uniform(bin_count); bin_count]
}

fn uniform(bin_count: usize) -> Vec<f64> {
    if bin_count == 0 {
        return Vec::new();
    }
    vec![1.0 / bin_count as f64; bin_count]
}

fn normalize(v: &mut [f64]) {
    let sum: f64 = v.iter().sum();
    if sum > 0.0 {
        for x in v.iter_mut() {
            *x /= sum;
        }
    } else {
        let n = v.len().max(1);
        for x in v.iter_mut() {
            *x = 1.0 / n as f64;
        }
    }
}

fn floor_min(v: &mut [f64], floor: f64) {
    for x in v.iter_mut() {
        if *x < floor {
            *x = floor;
        }
    }
}

/// One buffered spike observation between decode ticks: which electrode
/// group it came from, the covariate bin active at spike time, and its
/// mark-space encoder histogram (`None` when the encoder returned "no
/// result").
struct Observation {
    group: i64,
    bin_id: usize,
    histogram: Option<Vec<f64>>,
}

pub struct DecodeResult {
    pub posterior: Vec<f64>,
    pub likelihood: Vec<f64>,
    pub previous_posterior: Vec<f64>,
    pub prior: Vec<f64>,
    pub current_covariate: Option<usize>,
}

/// The pure decode pipeline, free of any transport type.
pub struct DecoderCore {
    bin_count: usize,
    dt_ms: f64,
    transition: Vec<Vec<f64>>,
    lambda: BTreeMap<i64, Vec<f64>>,
    occupancy: Vec<f64>,
    last_posterior: Vec<f64>,
    current_covariate: Option<usize>,
    pending: Vec<Observation>,
}

impl DecoderCore {
    pub fn observe_covariate(&mut self, bin: usize) {
        if bin < self.bin_count {
            self.occupancy[bin] += 1.0;
        }
        self.current_covariate = Some(bin);
    }

    pub fn observe_spike(&mut self, group: i64, bin_id: usize, histogram: Option<Vec<f64>>) {
        self.pending.push(Observation { group, bin_id, histogram });
    }

    /// Run one decode tick over everything buffered since the previous
    /// call: update firing rates, fold in occupancy and no-spike
    /// likelihoods, multiply in each spiking group's histogram, advance the
    /// prior through the transition matrix, then normalize.
    pub fn decode_tick(&mut self) -> DecodeResult {
        let observations = std::mem::take(&mut self.pending);

        for obs in &observations {
            if obs.bin_id < self.bin_count {
                let lambda = self
                    .lambda
                    .entry(obs.group)
                    .or_insert_with(|| vec![1.0; self.bin_count]);
                lambda[obs.bin_id] += 1.0;
            }
        }

        let mut occupancy_norm = self.occupancy.clone();
        normalize(&mut occupancy_norm);
        floor_min(&mut occupancy_norm, OCCUPANCY_FLOOR);

        let mut likelihood = uniform(self.bin_count);

        let spiked_groups: std::collections::BTreeSet<i64> =
            observations.iter().map(|o| o.group).collect();
        let dt = self.dt_ms;
        for (&group, lambda) in self.lambda.iter() {
            if spiked_groups.contains(&group) {
                continue;
            }
            let sum: f64 = lambda.iter().sum();
            let mut contribution: Vec<f64> = lambda
                .iter()
                .zip(occupancy_norm.iter())
                .map(|(&l, &o)| {
                    let rate = if sum > 0.0 { l / sum } else { 0.0 };
                    (-dt * rate / o).exp()
                })
                .collect();
            floor_min(&mut contribution, HISTOGRAM_FLOOR);
            for (l, c) in likelihood.iter_mut().zip(contribution.iter()) {
                *l *= c;
            }
            normalize(&mut likelihood);
        }

        for obs in &observations {
            if let Some(histogram) = &obs.histogram {
                let mut h = histogram.clone();
                h.resize(self.bin_count, 0.0);
                floor_min(&mut h, HISTOGRAM_FLOOR);
                for (l, c) in likelihood.iter_mut().zip(h.iter()) {
                    *l *= c;
                }
                normalize(&mut likelihood);
            }
        }

        let prior = self.predicted_prior();

        let mut posterior: Vec<f64> = likelihood.iter().zip(prior.iter()).map(|(l, p)| l * p).collect();
        normalize(&mut posterior);

        let previous_posterior = self.last_posterior.clone();
        self.last_posterior = posterior.clone();

        DecodeResult {
            posterior,
            likelihood,
            previous_posterior,
            prior,
            current_covariate: self.current_covariate,
        }
    }

    fn predicted_prior(&self) -> Vec<f64> {
        let mut out = vec![0.0; self.bin_count];
        for (i, &pi) in self.last_posterior.iter().enumerate() {
            if let Some(row) = self.transition.get(i) {
                for (j, &p_ij) in row.iter().enumerate() {
                    if let Some(slot) = out.get_mut(j) {
                        *slot += pi * p_ij;
                    }
                }
            }
        }
        out
    }
}

fn parse_observation(value: &Value) -> Option<(i64, usize, Option<Vec<f64>>)> {
    let map = match value {
        Value::Map(m) => m,
        _ => return None,
    };
    let group = map.get("electrode_group_id")?.as_i64()?;
    let bin_id = map.get("bin_id")?.as_i64()?.max(0) as usize;
    let histogram = match map.get("histogram") {
        Some(Value::FloatVec(v)) => Some(v.clone()),
        _ => None,
    };
    Some((group, bin_id, histogram))
}

struct DecoderWorkload {
    core: DecoderCore,
    encoded_spikes: Subscriber,
    covariate: Subscriber,
    tick: Subscriber,
}

impl Workload for DecoderWorkload {
    fn step(&mut self, ctx: &mut dyn WorkerContext) -> anyhow::Result<()> {
        let ready = {
            let poller = MultiPoller::new(vec![&self.encoded_spikes, &self.covariate, &self.tick]);
            poller.poll(Duration::from_millis(200))?
        };
        if ready.is_empty() {
            return Ok(());
        }

        if let Some(value) = self.covariate.try_recv()? {
            if let Some(b) = value.as_i64() {
                self.core.observe_covariate(b.max(0) as usize);
            }
        }
        if let Some(value) = self.encoded_spikes.try_recv()? {
            match parse_observation(&value) {
                Some((group, bin_id, histogram)) => self.core.observe_spike(group, bin_id, histogram),
                None => ctx.log(LogLevel::Warning, "bayesian-decoder: malformed encoded spike observation"),
            }
        }
        if self.tick.try_recv()?.is_some() {
            let result = self.core.decode_tick();
            ctx.publish_data(&Value::FloatVec(result.posterior.clone()));

            let mut telemetry = BTreeMap::new();
            telemetry.insert("posterior".to_string(), Value::FloatVec(result.posterior));
            telemetry.insert("likelihood".to_string(), Value::FloatVec(result.likelihood));
            telemetry.insert("previous_posterior".to_string(), Value::FloatVec(result.previous_posterior));
            telemetry.insert("prior".to_string(), Value::FloatVec(result.prior));
            telemetry.insert(
                "current_covariate".to_string(),
                match result.current_covariate {
                    Some(b) => Value::Int(b as i64),
                    None => Value::Bool(false),
                },
            );
            ctx.publish_telemetry(&Value::Map(telemetry));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core(bin_count: usize) -> DecoderCore {
        DecoderCore {
            bin_count,
            dt_ms: 100.0,
            transition: uniform_transition(bin_count),
            lambda: BTreeMap::new(),
            occupancy: vec![0.0; bin_count],
            last_posterior: uniform(bin_count),
            current_covariate: None,
            pending: Vec::new(),
        }
    }

    #[test]
    fn posterior_sums_to_one_with_no_observations() {
        let mut c = core(4);
        let result = c.decode_tick();
        let sum: f64 = result.posterior.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn a_strong_histogram_pulls_the_posterior_toward_its_peak_bin() {
        let mut c = core(4);
        c.observe_covariate(1);
        c.observe_spike(7, 1, Some(vec![0.01, 0.01, 10.0, 0.01]));
        let result = c.decode_tick();
        let max_bin = result
            .posterior
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(max_bin, 2);
    }

    #[test]
    fn uniform_transition_matrix_flattens_the_prior_regardless_of_last_posterior() {
        let c = core(5);
        let prior = c.predicted_prior();
        for p in prior {
            assert!((p - 0.2).abs() < 1e-9);
        }
    }

    #[test]
    fn groups_with_no_spike_this_tick_still_contribute_a_no_spike_likelihood() {
        let mut c = core(3);
        c.observe_covariate(0);
        c.observe_spike(1, 0, Some(vec![1.0, 0.0, 0.0]));
        let _ = c.decode_tick();

        // group 1 has firing history now; a tick with no spike from it at all
        // should still fold in its no-spike contribution rather than ignore it.
        c.observe_covariate(0);
        let result = c.decode_tick();
        let sum: f64 = result.likelihood.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }
}
