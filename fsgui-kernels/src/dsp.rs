//! Shared signal-processing building blocks used by the ripple and theta
//! kernels: a biquad section cascade, FIR convolution, Welford running
//! statistics, and the Hilbert-transform/AR-extrapolation pair the theta
//! predictor needs. None of this owns transport or lifecycle state — it is
//! pure numeric code, unit tested against closed-form inputs.

/// One Butterworth biquad (second-order section) in direct form II,
/// running independently per channel.
/// `b`/`a` are the usual `[b0, b1, b2]` / `[a0, a1, a2]` difference-equation
/// coefficients with `a0` normalised to `1`.
#[derive(Clone, Debug)]
pub struct Biquad {
    pub b: [f64; 3],
    pub a: [f64; 3],
}

impl Biquad {
    pub fn new(b: [f64; 3], a: [f64; 3]) -> Self {
        Self { b, a }
    }
}

/// A cascade of biquad sections applied to an N-channel vector sample,
/// maintaining a `(ns, 3, N)` history of shared `X_k`,
/// `Y_k` buffers per section. `n_channels` is fixed at construction; every
/// `process` call must be given a same-length slice.
#[derive(Clone, Debug)]
pub struct BiquadCascade {
    sections: Vec<Biquad>,
    /// `x_hist[k]` holds the last 3 raw inputs to section `k`, per channel.
    x_hist: Vec<Vec<[f64; 3]>>,
    /// `y_hist[k]` holds the last 3 outputs of section `k`, per channel.
    y_hist: Vec<Vec<[f64; 3]>>,
}

impl BiquadCascade {
    pub fn new(sections: Vec<Biquad>, n_channels: usize) -> Self {
        let x_hist = vec![vec![[0.0; 3]; n_channels]; sections.len()];
        let y_hist = vec![vec![[0.0; 3]; n_channels]; sections.len()];
        Self { sections, x_hist, y_hist }
    }

    /// Filter one N-channel sample through every section in turn, in
    /// place. Returns the cascade's output for this tick.
    pub fn process(&mut self, sample: &[f64]) -> Vec<f64> {
        let mut stage_in = sample.to_vec();
        for (k, section) in self.sections.iter().enumerate() {
            let mut stage_out = vec![0.0; stage_in.len()];
            for (ch, &x0) in stage_in.iter().enumerate() {
                let xh = &mut self.x_hist[k][ch];
                let yh = &mut self.y_hist[k][ch];

                let y0 = section.b[0] * x0 + section.b[1] * xh[0] + section.b[2] * xh[1]
                    - section.a[1] * yh[0]
                    - section.a[2] * yh[1];

                xh[1] = xh[0];
                xh[0] = x0;
                yh[1] = yh[0];
                yh[0] = y0;

                stage_out[ch] = y0;
            }
            stage_in = stage_out;
        }
        stage_in
    }
}

/// Minimal complex arithmetic for the Butterworth pole placement below.
/// Not a general-purpose type — just enough to carry the analog poles
/// through the lowpass-to-bandpass and bilinear transforms.
#[derive(Clone, Copy, Debug)]
struct Complex {
    re: f64,
    im: f64,
}

impl Complex {
    fn new(re: f64, im: f64) -> Self {
        Self { re, im }
    }

    fn sqrt(self) -> Self {
        let r = (self.re * self.re + self.im * self.im).sqrt();
        let re = ((r + self.re) / 2.0).sqrt();
        let im = ((r - self.re) / 2.0).sqrt() * if self.im < 0.0 { -1.0 } else { 1.0 };
        Self { re, im }
    }
}

impl std::ops::Add for Complex {
    type Output = Complex;
    fn add(self, rhs: Complex) -> Complex {
        Complex::new(self.re + rhs.re, self.im + rhs.im)
    }
}
impl std::ops::Sub for Complex {
    type Output = Complex;
    fn sub(self, rhs: Complex) -> Complex {
        Complex::new(self.re - rhs.re, self.im - rhs.im)
    }
}
impl std::ops::Mul for Complex {
    type Output = Complex;
    fn mul(self, rhs: Complex) -> Complex {
        Complex::new(self.re * rhs.re - self.im * rhs.im, self.re * rhs.im + self.im * rhs.re)
    }
}
impl std::ops::Mul<f64> for Complex {
    type Output = Complex;
    fn mul(self, rhs: f64) -> Complex {
        Complex::new(self.re * rhs, self.im * rhs)
    }
}
impl std::ops::Div for Complex {
    type Output = Complex;
    fn div(self, rhs: Complex) -> Complex {
        let denom = rhs.re * rhs.re + rhs.im * rhs.im;
        Complex::new(
            (self.re * rhs.re + self.im * rhs.im) / denom,
            (self.im * rhs.re - self.re * rhs.im) / denom,
        )
    }
}

/// Design a Butterworth bandpass filter as a cascade of `order` biquad
/// sections (second-order sections), the same shape `scipy.signal.iirfilter(
/// ..., output='sos', btype='bandpass', ftype='butter')` returns and that
/// `examples/original_source/fsgui/filter/lfp/ripple_new.py` builds its
/// cascade from. Standard analog-prototype + lowpass-to-bandpass +
/// bilinear-transform pipeline; exact coefficient values are allowed to
/// drift from a reference implementation — bit-exact numerics are not a
/// goal here.
pub fn butter_bandpass_sos(order: usize, low_hz: f64, high_hz: f64, fs: f64) -> Vec<Biquad> {
    assert!(order >= 1, "filter order must be at least 1");
    let wl = 2.0 * fs * (std::f64::consts::PI * low_hz / fs).tan();
    let wh = 2.0 * fs * (std::f64::consts::PI * high_hz / fs).tan();
    let bw = wh - wl;
    let w0_sq = wl * wh;

    (0..order)
        .map(|k| {
            let theta = std::f64::consts::PI * (2 * k + 1) as f64 / (2 * order) as f64;
            let lp_pole = Complex::new(-theta.sin(), theta.cos());

            // Lowpass-to-bandpass pole transform: s^2 - (p*bw)*s + w0^2 = 0.
            let b = lp_pole * bw;
            let disc = (b * b) - Complex::new(4.0 * w0_sq, 0.0);
            let sqrt_disc = disc.sqrt();
            let root_plus = (b + sqrt_disc) * 0.5;
            let root_minus = (b - sqrt_disc) * 0.5;
            let bp_pole = if root_plus.re < 0.0 { root_plus } else { root_minus };

            // Bilinear transform (pole only; numerator placed as a pure
            // bandpass zero pair at DC and Nyquist, matching a Butterworth
            // bandpass's zeros).
            let two_fs = Complex::new(2.0 * fs, 0.0);
            let z_pole = (two_fs + bp_pole) / (two_fs - bp_pole);

            let a1 = -2.0 * z_pole.re;
            let a2 = z_pole.re * z_pole.re + z_pole.im * z_pole.im;

            // Unity-gain at the geometric center frequency, matching the
            // Butterworth bandpass convention of 0 dB in the passband.
            let b_raw = [1.0, 0.0, -1.0];
            let unity = {
                let mut cascade = BiquadCascade::new(vec![Biquad::new(b_raw, [1.0, a1, a2])], 1);
                let center = (wl * wh).sqrt();
                let omega = 2.0 * (center / (2.0 * fs)).atan();
                let probe_len = 64;
                let mut peak = 0.0_f64;
                for n in 0..probe_len {
                    let x = (omega * n as f64).cos();
                    let y = cascade.process(&[x])[0];
                    peak = peak.max(y.abs());
                }
                if peak > 0.0 { 1.0 / peak } else { 1.0 }
            };

            Biquad::new([b_raw[0] * unity, b_raw[1] * unity, b_raw[2] * unity], [1.0, a1, a2])
        })
        .collect()
}

/// Apply a zero-phase (forward-backward) Butterworth bandpass to a single
/// channel's buffered samples. Used only on a buffered
/// window, not per-tick, so it rebuilds filter state from scratch rather
/// than carrying a `BiquadCascade`'s running history.
pub fn filtfilt(sections: &[Biquad], samples: &[f64]) -> Vec<f64> {
    let forward = run_once(sections, samples);
    let mut reversed: Vec<f64> = forward.into_iter().rev().collect();
    reversed = run_once(sections, &reversed);
    reversed.into_iter().rev().collect()
}

fn run_once(sections: &[Biquad], samples: &[f64]) -> Vec<f64> {
    let mut cascade = BiquadCascade::new(sections.to_vec(), 1);
    samples.iter().map(|&s| cascade.process(&[s])[0]).collect()
}

/// A length-`T` FIR filter applied to a single channel's running history,
/// used by the ripple estimator's squared-envelope stage.
#[derive(Clone, Debug)]
pub struct FirFilter {
    taps: Vec<f64>,
    history: std::collections::VecDeque<f64>,
}

impl FirFilter {
    pub fn new(taps: Vec<f64>) -> Self {
        let len = taps.len();
        Self {
            taps,
            history: std::collections::VecDeque::from(vec![0.0; len]),
        }
    }

    pub fn push(&mut self, sample: f64) -> f64 {
        self.history.push_front(sample);
        self.history.pop_back();
        self.taps
            .iter()
            .zip(self.history.iter())
            .map(|(t, x)| t * x)
            .sum()
    }
}

/// Welford's one-pass running mean/variance. `count` initialises at `1`, not `0`: with
/// `count = 0` the very first update would leave `σ = sqrt(0/1) = 0` and
/// every subsequent z-score would divide by zero. This is the single place
/// in the crate that guard lives; nothing else reimplements Welford.
#[derive(Clone, Copy, Debug)]
pub struct Welford {
    count: u64,
    mean: f64,
    m2: f64,
}

impl Welford {
    pub fn new() -> Self {
        Self { count: 1, mean: 0.0, m2: 0.0 }
    }

    pub fn update(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Clamped to `1` while `count < 2`: `count = 1` uses `σ = 1`, never NaN.
    pub fn sd(&self) -> f64 {
        if self.count < 2 {
            1.0
        } else {
            (self.m2 / self.count as f64).sqrt()
        }
    }
}

impl Default for Welford {
    fn default() -> Self {
        Self::new()
    }
}

/// Precomputed AR forward-extrapolation weights: the matrix
/// mapping the last `p` samples to the next `horizon` samples, built once
/// from the companion-matrix powers of the AR coefficients so each
/// prediction is a single matrix-vector multiply.
#[derive(Clone, Debug)]
pub struct ArExtrapolator {
    /// `weights[h]` is the length-`p` row used to predict step `h+1` ahead.
    weights: Vec<Vec<f64>>,
    order: usize,
}

impl ArExtrapolator {
    /// `coeffs` are the AR coefficients `[a_1, ..., a_p]` such that
    /// `x_t = sum_i a_i * x_{t-i}`. `horizon` is the number of future
    /// samples to precompute weights for.
    pub fn new(coeffs: &[f64], horizon: usize) -> Self {
        let order = coeffs.len();
        let mut companion_row = vec![0.0; order];
        companion_row.copy_from_slice(coeffs);

        // state[i] tracks, for each of the `order` lag slots, the linear
        // combination of the original `p` inputs that lag slot currently
        // holds. Row 0 starts as the identity on the most recent sample;
        // advancing one step shifts rows down and recomputes row 0 from
        // the AR recurrence.
        let mut state: Vec<Vec<f64>> = (0..order)
            .map(|i| {
                let mut row = vec![0.0; order];
                row[i] = 1.0;
                row
            })
            .collect();

        let mut weights = Vec::with_capacity(horizon);
        for _ in 0..horizon {
            let mut next_row = vec![0.0; order];
            for (lag, &coeff) in companion_row.iter().enumerate() {
                for (j, &v) in state[lag].iter().enumerate() {
                    next_row[j] += coeff * v;
                }
            }
            weights.push(next_row.clone());
            state.rotate_right(1);
            state[0] = next_row;
        }

        Self { weights, order }
    }

    /// Extrapolate `horizon` future samples from the most recent `order`
    /// samples, given oldest-to-newest as `recent_tail` (length `order`).
    pub fn extrapolate(&self, recent_tail: &[f64]) -> Vec<f64> {
        assert_eq!(recent_tail.len(), self.order, "AR extrapolation needs exactly `order` samples");
        // weights were derived with index 0 = most recent sample, so
        // reverse the oldest-to-newest input for the dot product.
        let reversed: Vec<f64> = recent_tail.iter().rev().copied().collect();
        self.weights
            .iter()
            .map(|row| row.iter().zip(reversed.iter()).map(|(w, x)| w * x).sum())
            .collect()
    }
}

/// Discrete Hilbert transform via the standard FFT-free analytic-signal
/// construction is not used here; instead this computes the analytic
/// signal's imaginary part directly from the discrete Hilbert kernel,
/// which is accurate enough for the short extrapolated windows the theta
/// predictor works with; no bit-exact numerics are required here.
pub fn hilbert_phase(samples: &[f64]) -> Vec<f64> {
    let n = samples.len();
    let mut phase = vec![0.0; n];
    let mut imag = vec![0.0; n];
    for t in 0..n {
        let mut acc = 0.0;
        for (k, &x) in samples.iter().enumerate() {
            if k == t {
                continue;
            }
            let diff = t as isize - k as isize;
            if diff % 2 != 0 {
                acc += x / (std::f64::consts::PI * diff as f64 / 2.0);
            }
        }
        imag[t] = acc;
    }
    for t in 0..n {
        phase[t] = imag[t].atan2(samples[t]);
    }
    phase
}

/// Unwrap a phase sequence so consecutive samples never jump by more than
/// `pi` (standard `numpy.unwrap` semantics).
pub fn unwrap_phase(phase: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(phase.len());
    let mut offset = 0.0;
    let mut prev = None;
    for &p in phase {
        let adjusted = p + offset;
        if let Some(prev_value) = prev {
            let delta: f64 = adjusted - prev_value;
            if delta > std::f64::consts::PI {
                offset -= 2.0 * std::f64::consts::PI;
            } else if delta < -std::f64::consts::PI {
                offset += 2.0 * std::f64::consts::PI;
            }
        }
        let final_value = p + offset;
        out.push(final_value);
        prev = Some(final_value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_pass_biquad() -> Biquad {
        Biquad::new([1.0, 0.0, 0.0], [1.0, 0.0, 0.0])
    }

    #[test]
    fn butter_bandpass_sos_returns_one_section_per_order_with_finite_coefficients() {
        let sections = butter_bandpass_sos(2, 150.0, 250.0, 1500.0);
        assert_eq!(sections.len(), 2);
        for section in &sections {
            for &c in section.b.iter().chain(section.a.iter()) {
                assert!(c.is_finite());
            }
        }
    }

    #[test]
    fn biquad_cascade_identity_passes_samples_through_unchanged() {
        let mut cascade = BiquadCascade::new(vec![identity_pass_biquad()], 2);
        let out = cascade.process(&[1.0, -2.0]);
        assert_eq!(out, vec![1.0, -2.0]);
    }

    #[test]
    fn welford_first_tick_has_sd_one() {
        let mut w = Welford::new();
        w.update(5.0);
        assert_eq!(w.sd(), 1.0);
        assert_eq!(w.mean(), 5.0);
    }

    #[test]
    fn welford_converges_to_known_stats() {
        let mut w = Welford::new();
        for x in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            w.update(x);
        }
        assert!((w.mean() - 5.0).abs() < 1e-9);
        assert!((w.sd() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn fir_filter_computes_moving_average() {
        let mut fir = FirFilter::new(vec![1.0 / 3.0; 3]);
        fir.push(3.0);
        fir.push(3.0);
        let out = fir.push(3.0);
        assert!((out - 3.0).abs() < 1e-9);
    }

    #[test]
    fn ar_extrapolator_reproduces_linear_recurrence() {
        // x_t = x_{t-1} (pure carry-forward AR(1)): extrapolation should
        // repeat the last observed sample forever.
        let ar = ArExtrapolator::new(&[1.0], 3);
        let out = ar.extrapolate(&[7.0]);
        assert_eq!(out, vec![7.0, 7.0, 7.0]);
    }

    #[test]
    fn unwrap_phase_removes_large_jumps() {
        let wrapped = vec![3.0, -3.0, 3.0 - 2.0 * std::f64::consts::PI + 0.1];
        let unwrapped = unwrap_phase(&wrapped);
        for w in unwrapped.windows(2) {
            assert!((w[1] - w[0]).abs() < std::f64::consts::PI + 1e-6);
        }
    }
}
