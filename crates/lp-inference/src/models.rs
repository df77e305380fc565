//! Pharmacokinetic forward models.
//!
//! Implemented:
//! - Dual-input single-compartment model ("disc"): arterial and portal-venous
//!   inflow, one exchange compartment.
//! - Single-input Tofts model.
//!
//! Both share one delay-shift kernel and one convolution kernel:
//!
//! `C[i] = dt · (Σ_{t≤i} f[t]·h[i−t] − ½·(f[0]·h[i] + f[i]·h[0]))`,
//! `h[j] = exp(−k · (times[j] − times[0]))`
//!
//! i.e. the trapezoidal rule applied to the lower-triangular Toeplitz form of
//! the convolution integral. `C[0]` is always zero.
//!
//! Parameter ranges are not validated here: a grid or fitter supplying
//! `mtt = 0` gets a [`Error::Domain`] back from the non-finite output check.

use lp_core::{Error, ForwardModel, InputCurves, KineticParameters, Result};

/// Shift `curve` by `delay` samples (rounded to nearest, ties to even).
///
/// A positive delay moves samples later; the leading `delay` samples keep
/// their own values rather than being zero-filled. A negative delay advances
/// the curve and the trailing samples keep their values. Shifts of at least
/// the curve length leave it unchanged.
pub fn shift_curve(curve: &[f64], delay: f64) -> Vec<f64> {
    let mut out = curve.to_vec();
    let n = curve.len();
    let k = delay.round_ties_even();
    if !k.is_finite() || k == 0.0 || k.abs() >= n as f64 {
        return out;
    }
    let k = k.abs() as usize;
    if delay > 0.0 {
        out[k..].copy_from_slice(&curve[..n - k]);
    } else {
        out[..n - k].copy_from_slice(&curve[k..]);
    }
    out
}

/// Convolve `input` with `exp(−rate · (t − t0))` on the uniform grid `times`
/// using the trapezoidal Toeplitz form. O(n²).
pub fn convolve_exponential(times: &[f64], input: &[f64], rate: f64) -> Vec<f64> {
    let n = times.len();
    if n < 2 {
        return vec![0.0; n];
    }
    let dt = times[1] - times[0];
    let t0 = times[0];
    let kernel: Vec<f64> = times.iter().map(|&t| (-rate * (t - t0)).exp()).collect();

    (0..n)
        .map(|i| {
            let mut acc = 0.0;
            for t in 0..=i {
                acc += input[t] * kernel[i - t];
            }
            dt * (acc - 0.5 * (input[0] * kernel[i] + input[i] * kernel[0]))
        })
        .collect()
}

fn check_lengths(times: &[f64], curves: &[(&str, &[f64])]) -> Result<()> {
    if times.len() < 2 {
        return Err(Error::Validation(format!(
            "need at least 2 time samples, got {}",
            times.len()
        )));
    }
    for (name, c) in curves {
        if c.len() != times.len() {
            return Err(Error::Validation(format!(
                "{name} length {} does not match time grid length {}",
                c.len(),
                times.len()
            )));
        }
    }
    Ok(())
}

fn finite_or_domain(curve: Vec<f64>, what: &str) -> Result<Vec<f64>> {
    match curve.iter().position(|v| !v.is_finite()) {
        None => Ok(curve),
        Some(i) => Err(Error::Domain(format!("{what}: non-finite concentration at sample {i}"))),
    }
}

/// Dual-input single-compartment liver model.
///
/// Rate constants: `k1a = af·dv/mtt`, `k1p = (1−af)·dv/mtt`, `k2 = 1/mtt`.
/// Each input is shifted by its own delay before weighting and convolution.
pub fn disc(
    times: &[f64],
    arterial: &[f64],
    portal: &[f64],
    params: &KineticParameters,
) -> Result<Vec<f64>> {
    check_lengths(times, &[("arterial", arterial), ("portal", portal)])?;
    let KineticParameters { af, dv, mtt, tau_a, tau_p } = *params;

    let k1a = af * dv / mtt;
    let k1p = (1.0 - af) * dv / mtt;
    let k2 = 1.0 / mtt;

    let art = shift_curve(arterial, tau_a);
    let pv = shift_curve(portal, tau_p);
    let f0: Vec<f64> = art.iter().zip(pv.iter()).map(|(a, p)| k1a * a + k1p * p).collect();

    finite_or_domain(convolve_exponential(times, &f0, k2), "disc")
}

/// Single-input Tofts model: `k_trans · art(t − tau) ⊛ exp(−k_ep · t)`.
pub fn tofts(
    times: &[f64],
    arterial: &[f64],
    k_trans: f64,
    k_ep: f64,
    tau: f64,
) -> Result<Vec<f64>> {
    check_lengths(times, &[("arterial", arterial)])?;
    let art = shift_curve(arterial, tau);
    let f0: Vec<f64> = art.iter().map(|a| k_trans * a).collect();
    finite_or_domain(convolve_exponential(times, &f0, k_ep), "tofts")
}

/// [`ForwardModel`] adapter for [`disc`].
///
/// Parameters are `(af, dv, mtt, tau_a, tau_p)`. Delays are multiplied by
/// `delay_scale` before reaching the model, so a fitter can work with delays
/// in scaled units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DualInputModel {
    /// Factor converting delay parameters to sample units.
    pub delay_scale: f64,
}

impl DualInputModel {
    /// Model taking delays directly in sample units.
    pub fn new() -> Self {
        Self { delay_scale: 1.0 }
    }

    /// Model taking delays in units of `1 / delay_scale` samples.
    pub fn with_delay_scale(delay_scale: f64) -> Self {
        Self { delay_scale }
    }

    /// Map a parameter vector to the kinetic tuple seen by [`disc`].
    pub fn kinetic_parameters(&self, params: &[f64]) -> Result<KineticParameters> {
        let mut p = KineticParameters::from_slice(params)?;
        p.tau_a *= self.delay_scale;
        p.tau_p *= self.delay_scale;
        Ok(p)
    }
}

impl Default for DualInputModel {
    fn default() -> Self {
        Self::new()
    }
}

impl ForwardModel for DualInputModel {
    fn n_parameters(&self) -> usize {
        KineticParameters::LEN
    }

    fn parameter_names(&self) -> Vec<String> {
        KineticParameters::NAMES.iter().map(|s| s.to_string()).collect()
    }

    fn parameter_bounds(&self) -> Vec<(f64, f64)> {
        vec![(0.0, 1.0), (0.0, 1.0), (1e-4, 100.0), (0.0, 0.015), (0.0, 0.007)]
    }

    fn parameter_steps(&self) -> Vec<f64> {
        let sample = 1.0 / self.delay_scale;
        vec![0.0, 0.0, 0.0, sample, sample]
    }

    fn simulate(&self, inputs: &InputCurves, params: &[f64]) -> Result<Vec<f64>> {
        let p = self.kinetic_parameters(params)?;
        disc(&inputs.times, &inputs.arterial, &inputs.portal, &p)
    }
}

/// [`ForwardModel`] adapter for [`tofts`]; parameters `(k_trans, k_ep, tau)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToftsModel {
    /// Factor converting the delay parameter to sample units.
    pub delay_scale: f64,
}

impl ToftsModel {
    /// Model taking the delay directly in sample units.
    pub fn new() -> Self {
        Self { delay_scale: 1.0 }
    }

    /// Model taking the delay in units of `1 / delay_scale` samples.
    pub fn with_delay_scale(delay_scale: f64) -> Self {
        Self { delay_scale }
    }
}

impl Default for ToftsModel {
    fn default() -> Self {
        Self::new()
    }
}

impl ForwardModel for ToftsModel {
    fn n_parameters(&self) -> usize {
        3
    }

    fn parameter_names(&self) -> Vec<String> {
        vec!["k_trans".to_string(), "k_ep".to_string(), "tau".to_string()]
    }

    fn parameter_bounds(&self) -> Vec<(f64, f64)> {
        vec![(0.0, 10.0), (1e-4, 100.0), (0.0, 0.015)]
    }

    fn parameter_steps(&self) -> Vec<f64> {
        vec![0.0, 0.0, 1.0 / self.delay_scale]
    }

    fn simulate(&self, inputs: &InputCurves, params: &[f64]) -> Result<Vec<f64>> {
        match params {
            &[k_trans, k_ep, tau] => {
                tofts(&inputs.times, &inputs.arterial, k_trans, k_ep, tau * self.delay_scale)
            }
            _ => Err(Error::Validation(format!("expected 3 parameters, got {}", params.len()))),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Gamma-variate bolus starting at `t0`.
    pub(crate) fn gamma_variate(times: &[f64], t0: f64, amp: f64, alpha: f64, beta: f64) -> Vec<f64> {
        times
            .iter()
            .map(|&t| {
                if t <= t0 {
                    0.0
                } else {
                    let x = (t - t0) / beta;
                    amp * x.powf(alpha) * (-x).exp()
                }
            })
            .collect()
    }

    /// Synthetic arterial/portal input pair on a 2 s grid.
    pub(crate) fn synthetic_inputs(n: usize) -> InputCurves {
        let times: Vec<f64> = (0..n).map(|i| i as f64 * 2.0).collect();
        let arterial = gamma_variate(&times, 10.0, 0.8, 3.0, 2.0);
        let portal = gamma_variate(&times, 16.0, 0.25, 3.0, 4.0);
        InputCurves::new(times, arterial, portal).unwrap()
    }

    #[test]
    fn shift_positive_extends_leading_samples() {
        let c = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(shift_curve(&c, 2.0), vec![1.0, 2.0, 1.0, 2.0, 3.0]);
        // rounds to nearest
        assert_eq!(shift_curve(&c, 0.6), vec![1.0, 1.0, 2.0, 3.0, 4.0]);
        // ties to even: 0.5 -> 0
        assert_eq!(shift_curve(&c, 0.5), c.to_vec());
    }

    #[test]
    fn shift_negative_advances() {
        let c = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(shift_curve(&c, -2.0), vec![3.0, 4.0, 5.0, 4.0, 5.0]);
    }

    #[test]
    fn shift_preserves_length_and_handles_large_delays() {
        let c = [1.0, 2.0, 3.0];
        for d in [-10.0, -3.0, -1.0, 0.0, 1.0, 3.0, 10.0, f64::NAN] {
            assert_eq!(shift_curve(&c, d).len(), 3);
        }
        assert_eq!(shift_curve(&c, 3.0), c.to_vec());
        assert_eq!(shift_curve(&c, -7.0), c.to_vec());
        assert!(shift_curve(&[], 2.0).is_empty());
    }

    #[test]
    fn convolution_matches_trapezoidal_integral() {
        // Unit step input: exact integral ∫0^t e^{-k s} ds = (1 - e^{-kt})/k
        let dt = 0.01;
        let times: Vec<f64> = (0..2001).map(|i| i as f64 * dt).collect();
        let input = vec![1.0; times.len()];
        let k = 0.7;
        let c = convolve_exponential(&times, &input, k);
        assert_eq!(c[0], 0.0);
        for i in [100, 500, 2000] {
            let exact = (1.0 - (-k * times[i]).exp()) / k;
            assert_relative_eq!(c[i], exact, max_relative = 1e-4);
        }
    }

    #[test]
    fn disc_reduces_to_tofts_for_pure_arterial_input() {
        let inputs = synthetic_inputs(60);
        let zero_pv = vec![0.0; inputs.len()];
        let mtt = 12.0;
        let p = KineticParameters::new(1.0, 1.0, mtt, 0.0, 0.0);
        let d = disc(&inputs.times, &inputs.arterial, &zero_pv, &p).unwrap();
        let t = tofts(&inputs.times, &inputs.arterial, 1.0 / mtt, 1.0 / mtt, 0.0).unwrap();
        for (a, b) in d.iter().zip(t.iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-12);
        }
    }

    #[test]
    fn disc_is_linear_in_dv() {
        let inputs = synthetic_inputs(50);
        let p1 = KineticParameters::new(0.3, 0.2, 8.0, 1.0, 2.0);
        let p2 = KineticParameters { dv: 0.4, ..p1 };
        let c1 = disc(&inputs.times, &inputs.arterial, &inputs.portal, &p1).unwrap();
        let c2 = disc(&inputs.times, &inputs.arterial, &inputs.portal, &p2).unwrap();
        for (a, b) in c1.iter().zip(c2.iter()) {
            assert_relative_eq!(2.0 * a, *b, epsilon = 1e-12);
        }
    }

    #[test]
    fn zero_delay_shift_pair_matches_unshifted() {
        let inputs = synthetic_inputs(40);
        let base = KineticParameters::new(0.4, 0.6, 10.0, 0.0, 0.0);
        let c0 = disc(&inputs.times, &inputs.arterial, &inputs.portal, &base).unwrap();
        let plus = KineticParameters { tau_a: 0.0, ..base };
        let minus = KineticParameters { tau_a: -0.0, ..base };
        assert_eq!(disc(&inputs.times, &inputs.arterial, &inputs.portal, &plus).unwrap(), c0);
        assert_eq!(disc(&inputs.times, &inputs.arterial, &inputs.portal, &minus).unwrap(), c0);

        for k in [3.0, -3.0, 100.0, -100.0] {
            let shifted = KineticParameters { tau_a: k, ..base };
            let c = disc(&inputs.times, &inputs.arterial, &inputs.portal, &shifted).unwrap();
            assert_eq!(c.len(), c0.len());
        }
    }

    #[test]
    fn inputs_are_not_mutated() {
        let inputs = synthetic_inputs(30);
        let before = inputs.clone();
        let p = KineticParameters::new(0.5, 0.5, 5.0, 4.0, -3.0);
        disc(&inputs.times, &inputs.arterial, &inputs.portal, &p).unwrap();
        disc(&inputs.times, &inputs.arterial, &inputs.portal, &p).unwrap();
        assert_eq!(inputs, before);
    }

    #[test]
    fn zero_mtt_is_a_domain_error() {
        let inputs = synthetic_inputs(20);
        let p = KineticParameters::new(0.5, 0.5, 0.0, 0.0, 0.0);
        let err = disc(&inputs.times, &inputs.arterial, &inputs.portal, &p).unwrap_err();
        assert!(err.is_domain(), "{err}");
    }

    #[test]
    fn length_mismatch_is_a_validation_error() {
        let p = KineticParameters::new(0.5, 0.5, 5.0, 0.0, 0.0);
        let err = disc(&[0.0, 1.0, 2.0], &[0.0, 1.0], &[0.0, 1.0, 2.0], &p).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(tofts(&[0.0], &[0.0], 1.0, 1.0, 0.0).is_err());
    }

    #[test]
    fn forward_model_adapters_apply_delay_scale() {
        let inputs = synthetic_inputs(40);
        let scaled = DualInputModel::with_delay_scale(1000.0);
        let direct = DualInputModel::new();
        let a = scaled.simulate(&inputs, &[0.3, 0.5, 10.0, 0.003, 0.002]).unwrap();
        let b = direct.simulate(&inputs, &[0.3, 0.5, 10.0, 3.0, 2.0]).unwrap();
        assert_eq!(a, b);
        assert!(direct.simulate(&inputs, &[0.3, 0.5]).is_err());

        let tofts_model = ToftsModel::with_delay_scale(1000.0);
        let c = tofts_model.simulate(&inputs, &[0.1, 0.1, 0.002]).unwrap();
        let d = tofts(&inputs.times, &inputs.arterial, 0.1, 0.1, 2.0).unwrap();
        assert_eq!(c, d);
        assert_eq!(tofts_model.parameter_names().len(), tofts_model.n_parameters());
        assert_eq!(direct.parameter_bounds().len(), direct.n_parameters());
        assert_eq!(scaled.parameter_steps(), vec![0.0, 0.0, 0.0, 0.001, 0.001]);
        assert_eq!(tofts_model.parameter_steps(), vec![0.0, 0.0, 0.001]);
    }
}
