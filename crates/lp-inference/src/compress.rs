//! Randomized low-rank compression of a curve dictionary.
//!
//! Two passes over the grid, never holding the full `time × entries` matrix:
//!
//! 1. Each curve `c` is normalised and centred (`x = c/‖c‖ − mean`), and
//!    accumulated into a random sketch `W += x·ωᵀ` (ω Gaussian, one draw per
//!    entry) and the Gram matrix `Z += x·xᵀ`.
//! 2. `Q = qr(Z·W).Q` spans the dominant column space (one power iteration
//!    is folded into `Z`). Curves are regenerated and projected: `B[:, j] = Qᵀ·x`.
//!
//! Finally `Bᵀ = L·Σ·Rᵀ`, so `X ≈ (Q·R)·Σ·Lᵀ`, truncated to `rank` components.
//! Memory is `O(t² + t·k + k·N)` for `t` samples, `k` sketch columns and `N`
//! kept entries.

use crate::dictionary::simulate_entry;
use crate::grid::ParameterGrid;
use crate::signal;
use lp_core::{AcquisitionRecord, Error, InputCurves, KineticParameters, Result};
use nalgebra::{DMatrix, DVector};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};

/// Configuration for [`build_compressed_dictionary`].
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Number of retained singular components.
    pub rank: usize,
    /// Extra random directions drawn beyond `rank` (capped by the number of samples).
    pub oversample: usize,
    /// Seed for the random projection; `None` draws one from the OS.
    pub seed: Option<u64>,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self { rank: 20, oversample: 10, seed: None }
    }
}

impl CompressionConfig {
    /// Validate the configuration parameters.
    pub fn validate(&self) -> Result<()> {
        if self.rank == 0 {
            return Err(Error::Validation("rank must be > 0".to_string()));
        }
        Ok(())
    }

    fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        }
    }
}

/// Truncated factorisation `X ≈ U·diag(s)·Vᵀ` of the preprocessed dictionary.
#[derive(Debug, Clone)]
pub struct CompressedDictionary {
    /// Left basis (time × rank).
    pub u: DMatrix<f64>,
    /// Singular values, descending.
    pub s: DVector<f64>,
    /// Right basis (entries × rank).
    pub v: DMatrix<f64>,
    /// Euclidean norm of each raw curve.
    pub rss: Vec<f64>,
    /// Parameters of each entry.
    pub lut: Vec<KineticParameters>,
    /// Grid index of each entry.
    pub source_index: Vec<usize>,
}

impl CompressedDictionary {
    /// Number of retained components.
    pub fn rank(&self) -> usize {
        self.s.len()
    }

    /// Number of retained entries.
    pub fn n_entries(&self) -> usize {
        self.lut.len()
    }

    /// Number of time samples.
    pub fn n_samples(&self) -> usize {
        self.u.nrows()
    }

    /// Approximate preprocessed curve of entry `j`: `U·diag(s)·V[j, :]ᵀ`.
    pub fn reconstruct(&self, j: usize) -> Option<Vec<f64>> {
        if j >= self.n_entries() {
            return None;
        }
        let coeffs = self.v.row(j).transpose().component_mul(&self.s);
        Some((&self.u * coeffs).iter().copied().collect())
    }
}

/// Normalise `curve` to unit norm and subtract its mean.
///
/// Returns the preprocessed curve and the original norm. A zero or
/// non-finite norm is a [`Error::Domain`] error.
pub fn preprocess_curve(curve: &[f64]) -> Result<(Vec<f64>, f64)> {
    if curve.is_empty() {
        return Err(Error::Domain("empty curve".to_string()));
    }
    let rss = curve.iter().map(|v| v * v).sum::<f64>().sqrt();
    if !rss.is_finite() || rss == 0.0 {
        return Err(Error::Domain(format!("curve norm {rss} cannot be normalised")));
    }
    let mean = curve.iter().sum::<f64>() / (rss * curve.len() as f64);
    Ok((curve.iter().map(|v| v / rss - mean).collect(), rss))
}

/// Simulate and preprocess one entry; `None` when degenerate.
fn prepared_entry(
    inputs: &InputCurves,
    params: &KineticParameters,
) -> Result<Option<(DVector<f64>, f64)>> {
    let Some(curve) = simulate_entry(inputs, params)? else {
        return Ok(None);
    };
    match preprocess_curve(&curve) {
        Ok((x, rss)) => Ok(Some((DVector::from_vec(x), rss))),
        Err(e) if e.is_domain() => {
            log::debug!("dropping degenerate entry {params:?}: {e}");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Build the compressed dictionary for `grid` from the acquisition's input curves.
pub fn build_compressed_dictionary(
    grid: &ParameterGrid,
    acquisition: &AcquisitionRecord,
    config: &CompressionConfig,
) -> Result<CompressedDictionary> {
    let inputs = signal::input_curves(acquisition)?;
    build_compressed_dictionary_from_inputs(grid, &inputs, config)
}

/// Build the compressed dictionary for `grid` from precomputed input curves.
pub fn build_compressed_dictionary_from_inputs(
    grid: &ParameterGrid,
    inputs: &InputCurves,
    config: &CompressionConfig,
) -> Result<CompressedDictionary> {
    config.validate()?;
    grid.validate()?;
    let t = inputs.len();
    let rank = config.rank;
    if rank > t {
        return Err(Error::Validation(format!("rank {rank} exceeds the {t} time samples")));
    }
    let k = (rank + config.oversample).min(t);
    let mut rng = config.rng();

    // Pass 1: sketch and Gram accumulation.
    let mut w = DMatrix::<f64>::zeros(t, k);
    let mut z = DMatrix::<f64>::zeros(t, t);
    let mut rss = Vec::new();
    let mut lut = Vec::new();
    let mut source_index = Vec::new();
    for (i, params) in grid.iter() {
        let Some((x, norm)) = prepared_entry(inputs, &params)? else {
            continue;
        };
        let omega = DVector::<f64>::from_fn(k, |_, _| StandardNormal.sample(&mut rng));
        w.ger(1.0, &x, &omega, 1.0);
        z.ger(1.0, &x, &x, 1.0);
        rss.push(norm);
        lut.push(params);
        source_index.push(i);
    }

    let n = lut.len();
    log::info!("compressed dictionary: kept {n} of {} entries, sketch width {k}", grid.len());
    if n < rank {
        return Err(Error::Validation(format!(
            "only {n} non-degenerate entries, fewer than rank {rank}"
        )));
    }

    let q = (&z * &w).qr().q();

    // Pass 2: regenerate and project onto Q, in the same order as pass 1.
    let mut b = DMatrix::<f64>::zeros(k, n);
    let mut col = 0usize;
    for (i, params) in grid.iter() {
        if source_index.get(col) != Some(&i) {
            continue;
        }
        let (x, _) = prepared_entry(inputs, &params)?.ok_or_else(|| {
            Error::Computation(format!("entry {i} became degenerate between passes"))
        })?;
        b.set_column(col, &q.tr_mul(&x));
        col += 1;
    }
    if col != n {
        return Err(Error::Computation(format!("projected {col} entries, expected {n}")));
    }

    let svd = b.transpose().svd(true, true);
    let l = svd.u.ok_or_else(|| Error::Computation("SVD did not return U".to_string()))?;
    let r_t = svd.v_t.ok_or_else(|| Error::Computation("SVD did not return Vᵀ".to_string()))?;

    let u = (&q * r_t.transpose()).columns(0, rank).into_owned();
    let s = svd.singular_values.rows(0, rank).into_owned();
    let v = l.columns(0, rank).into_owned();

    log::debug!(
        "compressed dictionary: leading singular values {:?}",
        s.iter().take(5).collect::<Vec<_>>()
    );

    Ok(CompressedDictionary { u, s, v, rss, lut, source_index })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::linspace;
    use crate::models::tests::synthetic_inputs;
    use approx::assert_relative_eq;

    fn grid_50() -> ParameterGrid {
        ParameterGrid::new(
            vec![0.2, 0.8],
            linspace(0.2, 0.9, 5),
            vec![3.0, 6.0, 10.0, 15.0, 25.0],
            vec![0.0],
            vec![0.0],
        )
        .unwrap()
    }

    fn config(rank: usize, seed: Option<u64>) -> CompressionConfig {
        CompressionConfig { rank, seed, ..Default::default() }
    }

    fn relative_error(a: &[f64], b: &[f64]) -> f64 {
        let num: f64 = a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum();
        let den: f64 = b.iter().map(|y| y * y).sum();
        (num / den).sqrt()
    }

    #[test]
    fn preprocess_normalises_and_centres() {
        let (x, rss) = preprocess_curve(&[3.0, 4.0]).unwrap();
        assert_relative_eq!(rss, 5.0);
        assert_relative_eq!(x[0], 0.6 - 0.7, epsilon = 1e-15);
        assert_relative_eq!(x[1], 0.8 - 0.7, epsilon = 1e-15);
        assert!(preprocess_curve(&[0.0; 4]).unwrap_err().is_domain());
    }

    #[test]
    fn reconstruction_matches_preprocessed_curves() {
        let inputs = synthetic_inputs(40);
        let grid = grid_50();
        let dict = build_compressed_dictionary_from_inputs(&grid, &inputs, &config(5, None)).unwrap();

        assert_eq!(dict.n_entries(), 50);
        assert_eq!(dict.u.shape(), (40, 5));
        assert_eq!(dict.v.shape(), (50, 5));
        assert_eq!(dict.rank(), 5);
        for w in dict.s.as_slice().windows(2) {
            assert!(w[0] >= w[1]);
        }

        for (j, p) in dict.lut.iter().enumerate() {
            let raw = models_disc(&inputs, p);
            let (x, rss) = preprocess_curve(&raw).unwrap();
            assert_relative_eq!(dict.rss[j], rss, max_relative = 1e-12);
            let approx = dict.reconstruct(j).unwrap();
            let err = relative_error(&approx, &x);
            assert!(err < 0.05, "entry {j} ({p:?}): relative error {err}");
        }
    }

    fn models_disc(inputs: &InputCurves, p: &KineticParameters) -> Vec<f64> {
        crate::models::disc(&inputs.times, &inputs.arterial, &inputs.portal, p).unwrap()
    }

    #[test]
    fn left_basis_is_orthonormal() {
        let inputs = synthetic_inputs(40);
        let dict =
            build_compressed_dictionary_from_inputs(&grid_50(), &inputs, &config(4, Some(3))).unwrap();
        let gram = dict.u.tr_mul(&dict.u);
        for i in 0..4 {
            for j in 0..4 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_relative_eq!(gram[(i, j)], expected, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn same_seed_gives_same_factors() {
        let inputs = synthetic_inputs(30);
        let a = build_compressed_dictionary_from_inputs(&grid_50(), &inputs, &config(3, Some(11))).unwrap();
        let b = build_compressed_dictionary_from_inputs(&grid_50(), &inputs, &config(3, Some(11))).unwrap();
        assert_eq!(a.s, b.s);
        assert_eq!(a.u, b.u);
    }

    #[test]
    fn degenerate_entry_shrinks_every_table_by_one() {
        let inputs = synthetic_inputs(30);
        let cfg = config(3, Some(5));
        let clean =
            ParameterGrid::new(vec![0.5], vec![0.4], vec![3.0, 8.0, 15.0, 30.0], vec![0.0], vec![0.0])
                .unwrap();
        let mut with_zero = clean.clone();
        with_zero.mtt.insert(0, 0.0);

        let a = build_compressed_dictionary_from_inputs(&clean, &inputs, &cfg).unwrap();
        let b = build_compressed_dictionary_from_inputs(&with_zero, &inputs, &cfg).unwrap();

        assert_eq!(with_zero.len(), clean.len() + 1);
        assert_eq!(b.lut.len(), with_zero.len() - 1);
        assert_eq!(b.rss.len(), with_zero.len() - 1);
        assert_eq!(b.v.nrows(), with_zero.len() - 1);
        assert_eq!(b.source_index, vec![1, 2, 3, 4]);
        for (p, &i) in b.lut.iter().zip(b.source_index.iter()) {
            assert_eq!(with_zero.params_at(i), Some(*p));
        }
        assert_eq!(a.lut, b.lut);
        assert_eq!(a.rss, b.rss);
    }

    #[test]
    fn nan_delay_entries_are_excluded_from_every_table() {
        let inputs = synthetic_inputs(30);
        let cfg = config(3, Some(5));
        let clean =
            ParameterGrid::new(vec![0.5], vec![0.4], vec![3.0, 8.0, 15.0, 30.0], vec![0.0], vec![0.0])
                .unwrap();
        let mut with_nan = clean.clone();
        with_nan.tau_a.push(f64::NAN);

        let a = build_compressed_dictionary_from_inputs(&clean, &inputs, &cfg).unwrap();
        let b = build_compressed_dictionary_from_inputs(&with_nan, &inputs, &cfg).unwrap();

        // one NaN delay value touches one entry per mtt
        assert_eq!(with_nan.len(), 8);
        assert_eq!(b.lut.len(), 4);
        assert_eq!(b.rss.len(), 4);
        assert_eq!(b.v.nrows(), 4);
        assert_eq!(b.source_index, vec![0, 2, 4, 6]);
        assert_eq!(a.lut, b.lut);
        assert_eq!(a.rss, b.rss);
    }

    #[test]
    fn rank_larger_than_time_grid_is_rejected() {
        let inputs = synthetic_inputs(10);
        let err = build_compressed_dictionary_from_inputs(&grid_50(), &inputs, &config(11, Some(1)))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(CompressionConfig { rank: 0, ..Default::default() }.validate().is_err());
    }
}
