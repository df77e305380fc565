//! Kinetic-parameter estimation from a single tissue curve.
//!
//! Minimises the squared residual between a forward model and an observed
//! concentration curve inside the model's box bounds. Delay parameters are
//! fitted in scaled units: the dual-input model multiplies them by
//! [`FitConfig::delay_scale`] before shifting, so `tau_a ∈ [0, 0.015]` covers
//! 0–15 samples at the default scale.
//!
//! Delays only act in whole samples. Their Jacobian columns use a difference
//! step of one sample, and the converged fit is followed by a neighbour
//! search that moves each delay one sample at a time while the residual
//! drops.

use crate::least_squares::{
    LeastSquaresConfig, ResidualFunction, TrustRegionSolver, finite_difference_jacobian,
};
use crate::models::DualInputModel;
use crate::optimizer::{LbfgsbOptimizer, OptimizerConfig, SumOfSquares};
use crate::signal;
use lp_core::{
    AcquisitionRecord, Error, FitResult, ForwardModel, InputCurves, KineticParameters, Result,
};
use nalgebra::{DMatrix, DVector};

/// Solver used to minimise the residual.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FitMethod {
    /// Bounded Levenberg–Marquardt trust-region solver.
    #[default]
    TrustRegion,
    /// L-BFGS on the sum of squares with clamped bounds.
    Lbfgsb,
}

/// Curve-fitting configuration.
#[derive(Debug, Clone)]
pub struct FitConfig {
    /// Solver selection.
    pub method: FitMethod,
    /// Factor converting fitted delay values to sample units.
    pub delay_scale: f64,
    /// Settings for [`FitMethod::TrustRegion`].
    pub least_squares: LeastSquaresConfig,
    /// Settings for [`FitMethod::Lbfgsb`].
    pub lbfgs: OptimizerConfig,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            method: FitMethod::default(),
            delay_scale: 1000.0,
            least_squares: LeastSquaresConfig::default(),
            lbfgs: OptimizerConfig::default(),
        }
    }
}

impl FitConfig {
    /// Validate the configuration parameters.
    pub fn validate(&self) -> Result<()> {
        if !self.delay_scale.is_finite() || self.delay_scale <= 0.0 {
            return Err(Error::Validation(format!(
                "delay_scale must be finite and > 0, got {}",
                self.delay_scale
            )));
        }
        match self.method {
            FitMethod::TrustRegion => self.least_squares.validate(),
            FitMethod::Lbfgsb => self.lbfgs.validate(),
        }
    }
}

/// Estimated dual-input parameters with their covariance.
#[derive(Debug, Clone)]
pub struct CurveFit {
    /// Best-fit parameters, delays in fitted (scaled) units.
    pub parameters: KineticParameters,
    /// Solver output in [`KineticParameters::NAMES`] order.
    pub result: FitResult,
    delay_scale: f64,
}

impl CurveFit {
    fn from_result(result: FitResult, delay_scale: f64) -> Result<Self> {
        Ok(Self { parameters: result.kinetic_parameters()?, result, delay_scale })
    }

    /// Parameters with delays converted to sample units, as the forward model
    /// consumes them.
    pub fn sample_parameters(&self) -> KineticParameters {
        KineticParameters {
            tau_a: self.parameters.tau_a * self.delay_scale,
            tau_p: self.parameters.tau_p * self.delay_scale,
            ..self.parameters
        }
    }

    /// One-sigma uncertainties, delays in fitted units.
    pub fn uncertainties(&self) -> &[f64] {
        &self.result.uncertainties
    }

    /// Residual sum of squares at the optimum.
    pub fn sse(&self) -> f64 {
        self.result.sse
    }

    /// Covariance element (i, j).
    pub fn covariance_at(&self, i: usize, j: usize) -> Option<f64> {
        self.result.covariance_at(i, j)
    }

    /// Correlation between parameters `i` and `j`.
    pub fn correlation(&self, i: usize, j: usize) -> Option<f64> {
        self.result.correlation(i, j)
    }
}

/// Upper limit on whole-quantum moves during refinement.
const MAX_QUANTUM_MOVES: usize = 32;

/// One converged bounded solve.
struct Solution {
    parameters: Vec<f64>,
    jacobian: DMatrix<f64>,
    sse: f64,
    n_iter: usize,
    n_fev: usize,
}

/// Fits forward models to observed concentration curves.
#[derive(Debug, Clone, Default)]
pub struct CurveFitter {
    config: FitConfig,
}

impl CurveFitter {
    /// Create a fitter with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fitter with custom configuration.
    pub fn with_config(config: FitConfig) -> Self {
        Self { config }
    }

    /// Access the configuration.
    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    /// Fit the dual-input model to `observed`, deriving the input curves from
    /// the acquisition's arterial and portal series.
    pub fn fit(
        &self,
        observed: &[f64],
        acquisition: &AcquisitionRecord,
        initial: &KineticParameters,
    ) -> Result<CurveFit> {
        let inputs = signal::input_curves(acquisition)?;
        self.fit_inputs(observed, &inputs, initial)
    }

    /// Fit the dual-input model against precomputed input curves.
    ///
    /// `initial` carries delays in fitted units (see [`FitConfig::delay_scale`]).
    pub fn fit_inputs(
        &self,
        observed: &[f64],
        inputs: &InputCurves,
        initial: &KineticParameters,
    ) -> Result<CurveFit> {
        let model = DualInputModel::with_delay_scale(self.config.delay_scale);
        let result = self.fit_model(&model, inputs, observed, &initial.to_array())?;
        CurveFit::from_result(result, self.config.delay_scale)
    }

    /// Fit any [`ForwardModel`] within its default bounds.
    ///
    /// Parameters with a nonzero [`ForwardModel::parameter_steps`] entry are
    /// differenced with at least that step, and after the first solve they
    /// are moved by whole steps while that lowers the residual, re-solving
    /// the others from each candidate.
    ///
    /// Returns [`Error::NonConvergence`] when the solver stops without meeting
    /// its criteria and propagates [`Error::Domain`] from the model.
    pub fn fit_model<M: ForwardModel>(
        &self,
        model: &M,
        inputs: &InputCurves,
        observed: &[f64],
        initial: &[f64],
    ) -> Result<FitResult> {
        self.config.validate()?;
        if observed.len() != inputs.len() {
            return Err(Error::Validation(format!(
                "observed curve length {} != input length {}",
                observed.len(),
                inputs.len()
            )));
        }
        if initial.len() != model.n_parameters() {
            return Err(Error::Validation(format!(
                "expected {} initial values, got {}",
                model.n_parameters(),
                initial.len()
            )));
        }

        let bounds = model.parameter_bounds();
        let steps = model.parameter_steps();
        if steps.len() != initial.len() || bounds.len() != initial.len() {
            return Err(Error::Validation(format!(
                "model reports {} bounds and {} steps for {} parameters",
                bounds.len(),
                steps.len(),
                initial.len()
            )));
        }
        let residuals = |p: &[f64]| -> Result<Vec<f64>> {
            let simulated = model.simulate(inputs, p)?;
            Ok(simulated.iter().zip(observed.iter()).map(|(s, o)| s - o).collect())
        };

        let first = self.solve(&residuals, initial, &bounds, &steps)?;
        let best = self.refine_quantised(&residuals, first, initial, &bounds, &steps)?;
        let Solution { parameters, jacobian, sse, n_iter, n_fev } = best;

        let n = parameters.len();
        let fit = match covariance_from_jacobian(&jacobian, sse) {
            Some(cov) => {
                let uncertainties = (0..n).map(|i| cov[(i, i)].max(0.0).sqrt()).collect();
                // symmetric, so column-major iteration is also row-major
                let flat = cov.iter().copied().collect();
                FitResult::new(parameters, uncertainties, sse, n_iter, n_fev).with_covariance(flat)
            }
            None => {
                log::warn!("parameter covariance could not be estimated");
                FitResult::new(parameters, vec![f64::INFINITY; n], sse, n_iter, n_fev)
            }
        };
        Ok(fit)
    }

    fn solve(
        &self,
        residuals: &dyn ResidualFunction,
        start: &[f64],
        bounds: &[(f64, f64)],
        steps: &[f64],
    ) -> Result<Solution> {
        match self.config.method {
            FitMethod::TrustRegion => {
                let solver = TrustRegionSolver::new(self.config.least_squares.clone());
                let res = solver.minimize_with_steps(residuals, start, bounds, steps)?;
                if !res.converged {
                    return Err(Error::NonConvergence(format!(
                        "{} after {} iterations (sse={:.6e})",
                        res.message, res.n_iter, res.sse
                    )));
                }
                Ok(Solution {
                    parameters: res.parameters,
                    jacobian: res.jacobian,
                    sse: res.sse,
                    n_iter: res.n_iter,
                    n_fev: res.n_fev,
                })
            }
            FitMethod::Lbfgsb => {
                let objective = SumOfSquares::new(residuals);
                let res = LbfgsbOptimizer::new(self.config.lbfgs.clone())
                    .minimize(&objective, start, bounds)?;
                if !res.converged {
                    return Err(Error::NonConvergence(format!(
                        "{} after {} iterations (sse={:.6e})",
                        res.message, res.n_iter, res.fval
                    )));
                }
                let r = DVector::from_vec(residuals.residuals(&res.parameters)?);
                let jacobian = finite_difference_jacobian(
                    residuals,
                    &res.parameters,
                    &r,
                    bounds,
                    self.config.least_squares.fd_step,
                    steps,
                )?;
                let n = res.parameters.len();
                Ok(Solution {
                    parameters: res.parameters,
                    jacobian,
                    sse: r.norm_squared(),
                    n_iter: res.n_iter as usize,
                    n_fev: res.n_fev + n + 1,
                })
            }
        }
    }

    /// Coordinate search over whole steps of the quantised parameters.
    ///
    /// Each candidate is re-solved twice: from the current best and from
    /// `initial` with the candidate's quantised values.
    fn refine_quantised(
        &self,
        residuals: &dyn ResidualFunction,
        mut best: Solution,
        initial: &[f64],
        bounds: &[(f64, f64)],
        steps: &[f64],
    ) -> Result<Solution> {
        let quantised: Vec<usize> = (0..steps.len()).filter(|&j| steps[j] > 0.0).collect();
        if quantised.is_empty() {
            return Ok(best);
        }
        let mut n_iter = best.n_iter;
        let mut n_fev = best.n_fev;

        for _ in 0..MAX_QUANTUM_MOVES {
            let mut moved = false;
            for &j in &quantised {
                let (lo, hi) = bounds[j];
                let q = steps[j];
                for dir in [1.0, -1.0] {
                    let target = best.parameters[j] + dir * q;
                    if target < lo - 0.5 * q || target > hi + 0.5 * q {
                        continue;
                    }
                    let mut warm = best.parameters.clone();
                    warm[j] = target.clamp(lo, hi);
                    let mut cold = initial.to_vec();
                    for &k in &quantised {
                        cold[k] = warm[k];
                    }

                    for start in [warm, cold] {
                        match self.solve(residuals, &start, bounds, steps) {
                            Ok(candidate) => {
                                n_iter += candidate.n_iter;
                                n_fev += candidate.n_fev;
                                if candidate.sse < best.sse {
                                    // polishing within the same quanta does not count as a move
                                    let shifted = quantised.iter().any(|&k| {
                                        (candidate.parameters[k] / steps[k]).round_ties_even()
                                            != (best.parameters[k] / steps[k]).round_ties_even()
                                    });
                                    if shifted {
                                        log::debug!(
                                            "parameter {j} moved to {:.6e}: sse {:.6e} -> {:.6e}",
                                            candidate.parameters[j],
                                            best.sse,
                                            candidate.sse
                                        );
                                        moved = true;
                                    }
                                    best = candidate;
                                }
                            }
                            Err(Error::NonConvergence(msg)) => {
                                log::debug!("skipping candidate {start:?}: {msg}");
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
            }
            if !moved {
                break;
            }
        }

        best.n_iter = n_iter;
        best.n_fev = n_fev;
        Ok(best)
    }
}

/// `pinv(JᵀJ) · sse / (m − n)` from the SVD of `J`.
///
/// Singular values below `ε·max(m, n)·s_max` are discarded, so directions the
/// data do not constrain (e.g. a delay sitting inside one sample) get zero
/// variance. `None` when there are no residual degrees of freedom.
fn covariance_from_jacobian(jacobian: &DMatrix<f64>, sse: f64) -> Option<DMatrix<f64>> {
    let (m, n) = jacobian.shape();
    if m <= n {
        return None;
    }
    let svd = jacobian.clone().svd(false, true);
    let v_t = svd.v_t?;
    let s_max = svd.singular_values.max();
    let threshold = f64::EPSILON * m as f64 * s_max;

    let mut pinv = DMatrix::zeros(n, n);
    let mut rank = 0usize;
    for (k, &s) in svd.singular_values.iter().enumerate() {
        if s > threshold {
            rank += 1;
            let row = v_t.row(k);
            pinv += row.transpose() * row / (s * s);
        }
    }
    if rank < n {
        log::debug!("rank-deficient Jacobian ({rank} of {n}); covariance from pseudo-inverse");
    }

    let cov = pinv * (sse / (m - n) as f64);
    cov.iter().all(|v| v.is_finite()).then_some(cov)
}
