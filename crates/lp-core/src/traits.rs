//! Core traits for LiverPerf
//!
//! Forward models are pluggable behind [`ForwardModel`] so the curve fitter
//! does not depend on a concrete kinetic model.

use crate::Result;
use crate::types::InputCurves;

/// Pharmacokinetic forward model: maps input curves and a parameter vector
/// to a simulated tissue concentration curve.
pub trait ForwardModel: Send + Sync {
    /// Number of parameters
    fn n_parameters(&self) -> usize;

    /// Parameter names
    fn parameter_names(&self) -> Vec<String>;

    /// Default parameter bounds (min, max) used when fitting
    fn parameter_bounds(&self) -> Vec<(f64, f64)>;

    /// Simulate the tissue concentration curve on `inputs.times`.
    fn simulate(&self, inputs: &InputCurves, params: &[f64]) -> Result<Vec<f64>>;

    /// Smallest change of each parameter that can alter the output.
    ///
    /// `0.0` marks a continuous parameter. Parameters that only act in whole
    /// quanta (delays rounded to samples) report one quantum.
    fn parameter_steps(&self) -> Vec<f64> {
        vec![0.0; self.n_parameters()]
    }
}
