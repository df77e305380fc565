//! Bounded nonlinear least squares.
//!
//! Levenberg–Marquardt with Marquardt diagonal scaling, run as a trust-region
//! method: the damping factor λ is the (inverse) trust radius, shrunk on a
//! good step and grown on a rejected one. Box bounds are handled by
//! projecting every trial point onto the box and zeroing gradient components
//! that push outward at an active bound.
//!
//! Per iteration:
//! 1. `J` by forward differences (step flipped inward at the upper bound).
//! 2. Solve `(JᵀJ + λ·D) δ = −Jᵀr`, `D = diag(JᵀJ)` (1 where a column is zero).
//! 3. `x' = P(x + δ)`; accept if the cost decreases, else grow λ and retry.
//! 4. Stop on projected-gradient (`gtol`), step (`xtol`) or relative cost
//!    decrease (`ftol`).

use lp_core::{Error, Result};
use nalgebra::{DMatrix, DVector};
use std::fmt;

/// Damping above which the solver gives up on finding a decreasing step.
const LAMBDA_MAX: f64 = 1e20;
/// Damping floor.
const LAMBDA_MIN: f64 = 1e-15;

/// Configuration for the trust-region least-squares solver.
#[derive(Debug, Clone)]
pub struct LeastSquaresConfig {
    /// Maximum number of outer iterations (accepted steps).
    pub max_iter: usize,
    /// Relative cost-decrease tolerance.
    pub ftol: f64,
    /// Relative step-size tolerance.
    pub xtol: f64,
    /// Projected-gradient infinity-norm tolerance.
    pub gtol: f64,
    /// Initial damping factor λ.
    pub lambda_init: f64,
    /// λ multiplier on a rejected step.
    pub lambda_up: f64,
    /// λ multiplier on an accepted step.
    pub lambda_down: f64,
    /// Relative forward-difference step for the Jacobian.
    pub fd_step: f64,
}

impl Default for LeastSquaresConfig {
    fn default() -> Self {
        Self {
            max_iter: 200,
            ftol: 1e-12,
            xtol: 1e-12,
            gtol: 1e-12,
            lambda_init: 1e-3,
            lambda_up: 10.0,
            lambda_down: 0.1,
            fd_step: 1.490_116_119_384_765_6e-8,
        }
    }
}

impl LeastSquaresConfig {
    /// Validate the configuration parameters.
    pub fn validate(&self) -> Result<()> {
        if self.max_iter == 0 {
            return Err(Error::Validation("max_iter must be > 0".to_string()));
        }
        for (name, v) in [("ftol", self.ftol), ("xtol", self.xtol), ("gtol", self.gtol)] {
            if !v.is_finite() || v < 0.0 {
                return Err(Error::Validation(format!("{name} must be finite and >= 0")));
            }
        }
        if !self.lambda_init.is_finite() || self.lambda_init <= 0.0 {
            return Err(Error::Validation("lambda_init must be finite and > 0".to_string()));
        }
        if self.lambda_up.is_nan() || self.lambda_up <= 1.0 {
            return Err(Error::Validation("lambda_up must be > 1".to_string()));
        }
        if self.lambda_down.is_nan() || self.lambda_down <= 0.0 || self.lambda_down >= 1.0 {
            return Err(Error::Validation("lambda_down must be in (0, 1)".to_string()));
        }
        if self.fd_step.is_nan() || self.fd_step <= 0.0 {
            return Err(Error::Validation("fd_step must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Residual vector `r(x) = model(x) − data` to be minimised in the 2-norm.
pub trait ResidualFunction {
    /// Evaluate the residuals at `params`.
    fn residuals(&self, params: &[f64]) -> Result<Vec<f64>>;
}

impl<F> ResidualFunction for F
where
    F: Fn(&[f64]) -> Result<Vec<f64>>,
{
    fn residuals(&self, params: &[f64]) -> Result<Vec<f64>> {
        self(params)
    }
}

/// Result of a least-squares solve.
#[derive(Debug, Clone)]
pub struct LeastSquaresResult {
    /// Best-fit parameters (inside the bounds).
    pub parameters: Vec<f64>,
    /// Residuals at the solution.
    pub residuals: Vec<f64>,
    /// Jacobian at the solution (m × n).
    pub jacobian: DMatrix<f64>,
    /// Sum of squared residuals at the solution.
    pub sse: f64,
    /// Number of accepted iterations.
    pub n_iter: usize,
    /// Number of residual evaluations (Jacobian columns included).
    pub n_fev: usize,
    /// Convergence status
    pub converged: bool,
    /// Termination message
    pub message: String,
}

impl fmt::Display for LeastSquaresResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LeastSquaresResult(sse={:.6e}, n_iter={}, n_fev={}, converged={}, message={})",
            self.sse, self.n_iter, self.n_fev, self.converged, self.message
        )
    }
}

pub(crate) fn clamp_params(params: &[f64], bounds: &[(f64, f64)]) -> Vec<f64> {
    params.iter().zip(bounds.iter()).map(|(&v, &(lo, hi))| v.clamp(lo, hi)).collect()
}

pub(crate) fn check_bounds(init: &[f64], bounds: &[(f64, f64)]) -> Result<()> {
    if init.len() != bounds.len() {
        return Err(Error::Validation(format!(
            "Parameter and bounds length mismatch: {} != {}",
            init.len(),
            bounds.len()
        )));
    }
    for (i, &(lo, hi)) in bounds.iter().enumerate() {
        if lo.is_nan() || hi.is_nan() || lo > hi {
            return Err(Error::Validation(format!("invalid bounds for parameter {i}: ({lo}, {hi})")));
        }
    }
    if init.iter().any(|v| !v.is_finite()) {
        return Err(Error::Validation("initial parameters must be finite".to_string()));
    }
    Ok(())
}

fn check_steps(min_steps: &[f64], n: usize) -> Result<()> {
    if !min_steps.is_empty() && min_steps.len() != n {
        return Err(Error::Validation(format!(
            "expected {n} minimum steps, got {}",
            min_steps.len()
        )));
    }
    if let Some(h) = min_steps.iter().find(|h| !h.is_finite() || **h < 0.0) {
        return Err(Error::Validation(format!("minimum step must be finite and >= 0, got {h}")));
    }
    Ok(())
}

fn evaluate(f: &dyn ResidualFunction, x: &[f64], m: Option<usize>) -> Result<DVector<f64>> {
    let r = f.residuals(x)?;
    if let Some(m) = m {
        if r.len() != m {
            return Err(Error::Validation(format!(
                "residual length changed between evaluations: {} vs {}",
                r.len(),
                m
            )));
        }
    }
    if let Some(i) = r.iter().position(|v| !v.is_finite()) {
        return Err(Error::Domain(format!("non-finite residual at index {i} for parameters {x:?}")));
    }
    Ok(DVector::from_vec(r))
}

/// Forward-difference Jacobian of `f` at `x`, stepping inward at upper bounds.
///
/// The step for parameter `j` is `fd_step · max(|x_j|, 1)`, raised to
/// `min_steps[j]` when given. Quantised parameters (whole-sample delays) need
/// a floor of one quantum or their column is identically zero.
pub fn finite_difference_jacobian(
    f: &dyn ResidualFunction,
    x: &[f64],
    r: &DVector<f64>,
    bounds: &[(f64, f64)],
    fd_step: f64,
    min_steps: &[f64],
) -> Result<DMatrix<f64>> {
    let m = r.len();
    let n = x.len();
    let mut jac = DMatrix::zeros(m, n);
    let mut xp = x.to_vec();
    for j in 0..n {
        let floor = min_steps.get(j).copied().unwrap_or(0.0);
        let mut h = (fd_step * x[j].abs().max(1.0)).max(floor);
        let (lo, hi) = bounds[j];
        if x[j] + h > hi && x[j] - h >= lo {
            h = -h;
        }
        xp[j] = x[j] + h;
        let rp = evaluate(f, &xp, Some(m))?;
        xp[j] = x[j];
        let col = (rp - r) / h;
        jac.set_column(j, &col);
    }
    Ok(jac)
}

/// Gradient components that would push the iterate outside the box are zeroed.
fn projected_gradient(g: &DVector<f64>, x: &[f64], bounds: &[(f64, f64)]) -> DVector<f64> {
    const EPS: f64 = 1e-12;
    let mut pg = g.clone();
    for (i, (&xi, &(lo, hi))) in x.iter().zip(bounds.iter()).enumerate() {
        // descent direction is −g
        if (xi <= lo + EPS && g[i] > 0.0) || (xi >= hi - EPS && g[i] < 0.0) {
            pg[i] = 0.0;
        }
    }
    pg
}

/// Bounded trust-region (Levenberg–Marquardt) least-squares solver.
#[derive(Debug, Clone, Default)]
pub struct TrustRegionSolver {
    config: LeastSquaresConfig,
}

impl TrustRegionSolver {
    /// Create a solver with the given configuration.
    pub fn new(config: LeastSquaresConfig) -> Self {
        Self { config }
    }

    /// Access the solver configuration.
    pub fn config(&self) -> &LeastSquaresConfig {
        &self.config
    }

    /// Minimise `‖f(x)‖²` subject to `bounds`, starting at `init`.
    ///
    /// A solve that runs out of iterations returns `Ok` with
    /// `converged == false`; non-finite residuals are a [`Error::Domain`].
    pub fn minimize(
        &self,
        f: &dyn ResidualFunction,
        init: &[f64],
        bounds: &[(f64, f64)],
    ) -> Result<LeastSquaresResult> {
        self.minimize_with_steps(f, init, bounds, &[])
    }

    /// [`minimize`](Self::minimize) with per-parameter lower limits on the
    /// finite-difference step. `min_steps` is empty or one value per
    /// parameter (`0.0` for no limit).
    pub fn minimize_with_steps(
        &self,
        f: &dyn ResidualFunction,
        init: &[f64],
        bounds: &[(f64, f64)],
        min_steps: &[f64],
    ) -> Result<LeastSquaresResult> {
        self.config.validate()?;
        check_bounds(init, bounds)?;
        check_steps(min_steps, init.len())?;
        let cfg = &self.config;
        let n = init.len();

        let mut x = clamp_params(init, bounds);
        let mut r = evaluate(f, &x, None)?;
        let m = r.len();
        if m < n {
            return Err(Error::Validation(format!(
                "fewer residuals ({m}) than parameters ({n})"
            )));
        }
        let mut n_fev = 1usize;
        let mut cost = r.norm_squared();
        let mut lambda = cfg.lambda_init;
        let mut n_iter = 0usize;
        let mut converged = false;
        let mut message = String::from("maximum iterations reached");

        'outer: while n_iter < cfg.max_iter {
            if cost == 0.0 {
                converged = true;
                message = "exact fit".to_string();
                break;
            }

            let jac = finite_difference_jacobian(f, &x, &r, bounds, cfg.fd_step, min_steps)?;
            n_fev += n;
            let jt = jac.transpose();
            let g = &jt * &r;
            let pg = projected_gradient(&g, &x, bounds);
            if pg.amax() <= cfg.gtol {
                converged = true;
                message = "projected gradient below gtol".to_string();
                break;
            }
            let a = &jt * &jac;

            loop {
                let mut damped = a.clone();
                for i in 0..n {
                    let d = if a[(i, i)] > 0.0 { a[(i, i)] } else { 1.0 };
                    damped[(i, i)] += lambda * d;
                }
                let Some(chol) = damped.cholesky() else {
                    lambda *= cfg.lambda_up;
                    if lambda > LAMBDA_MAX {
                        message = "damped normal equations not positive definite".to_string();
                        break 'outer;
                    }
                    continue;
                };
                let delta = chol.solve(&(-&pg));

                let trial: Vec<f64> = x.iter().zip(delta.iter()).map(|(xi, di)| xi + di).collect();
                let trial = clamp_params(&trial, bounds);
                let step = DVector::from_iterator(n, trial.iter().zip(x.iter()).map(|(a, b)| a - b));
                let x_norm = DVector::from_column_slice(&x).norm();
                if step.norm() <= cfg.xtol * (x_norm + cfg.xtol) {
                    converged = true;
                    message = "step size below xtol".to_string();
                    break 'outer;
                }

                let r_trial = evaluate(f, &trial, Some(m))?;
                n_fev += 1;
                let cost_trial = r_trial.norm_squared();

                if cost_trial < cost {
                    let rel = (cost - cost_trial) / cost;
                    x = trial;
                    r = r_trial;
                    cost = cost_trial;
                    n_iter += 1;
                    lambda = (lambda * cfg.lambda_down).max(LAMBDA_MIN);
                    log::trace!("lm iter {n_iter}: sse={cost:.6e} lambda={lambda:.1e}");
                    if rel <= cfg.ftol {
                        converged = true;
                        message = "relative reduction below ftol".to_string();
                        break 'outer;
                    }
                    break;
                }

                lambda *= cfg.lambda_up;
                if lambda > LAMBDA_MAX {
                    message = "no decreasing step within trust region".to_string();
                    break 'outer;
                }
            }
        }

        let jacobian = finite_difference_jacobian(f, &x, &r, bounds, cfg.fd_step, min_steps)?;
        n_fev += n;

        log::debug!(
            "trust-region solve: sse={cost:.6e}, n_iter={n_iter}, n_fev={n_fev}, converged={converged} ({message})"
        );

        Ok(LeastSquaresResult {
            parameters: x,
            residuals: r.iter().copied().collect(),
            jacobian,
            sse: cost,
            n_iter,
            n_fev,
            converged,
            message,
        })
    }
}
