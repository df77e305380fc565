//! Cartesian parameter grids for dictionary generation.
//!
//! Enumeration order is fixed: `af` varies slowest, `tau_p` fastest. Entry
//! `i` of every dictionary table corresponds to [`ParameterGrid::params_at`]`(i)`.

use lp_core::{Error, KineticParameters, Result};
use serde::{Deserialize, Serialize};

/// Candidate values for each kinetic parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterGrid {
    /// Arterial fraction axis.
    pub af: Vec<f64>,
    /// Distribution volume axis.
    pub dv: Vec<f64>,
    /// Mean transit time axis.
    pub mtt: Vec<f64>,
    /// Arterial delay axis (sample units).
    pub tau_a: Vec<f64>,
    /// Portal delay axis (sample units).
    pub tau_p: Vec<f64>,
}

impl ParameterGrid {
    /// Create a grid; every axis must be non-empty.
    pub fn new(
        af: Vec<f64>,
        dv: Vec<f64>,
        mtt: Vec<f64>,
        tau_a: Vec<f64>,
        tau_p: Vec<f64>,
    ) -> Result<Self> {
        let grid = Self { af, dv, mtt, tau_a, tau_p };
        grid.validate()?;
        Ok(grid)
    }

    /// Check that no axis is empty and the total size fits in `usize`.
    pub fn validate(&self) -> Result<()> {
        for (name, axis) in KineticParameters::NAMES.iter().zip(self.axes()) {
            if axis.is_empty() {
                return Err(Error::Validation(format!("grid axis '{name}' is empty")));
            }
        }
        self.shape()
            .iter()
            .try_fold(1usize, |acc, &n| acc.checked_mul(n))
            .ok_or_else(|| Error::Validation("grid size overflows usize".to_string()))?;
        Ok(())
    }

    /// Axes in enumeration order (slowest first).
    pub fn axes(&self) -> [&[f64]; 5] {
        [&self.af, &self.dv, &self.mtt, &self.tau_a, &self.tau_p]
    }

    /// Axis lengths in enumeration order.
    pub fn shape(&self) -> [usize; 5] {
        self.axes().map(<[f64]>::len)
    }

    /// Total number of combinations.
    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    /// True if any axis is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `index`-th combination, or `None` past the end.
    pub fn params_at(&self, index: usize) -> Option<KineticParameters> {
        if index >= self.len() {
            return None;
        }
        let shape = self.shape();
        let mut rem = index;
        let mut idx = [0usize; 5];
        for k in (0..5).rev() {
            idx[k] = rem % shape[k];
            rem /= shape[k];
        }
        Some(KineticParameters::new(
            self.af[idx[0]],
            self.dv[idx[1]],
            self.mtt[idx[2]],
            self.tau_a[idx[3]],
            self.tau_p[idx[4]],
        ))
    }

    /// Lazily enumerate `(index, parameters)` in grid order.
    pub fn iter(&self) -> GridIter<'_> {
        GridIter { grid: self, next: 0, len: self.len() }
    }
}

impl<'a> IntoIterator for &'a ParameterGrid {
    type Item = (usize, KineticParameters);
    type IntoIter = GridIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over the combinations of a [`ParameterGrid`].
#[derive(Debug, Clone)]
pub struct GridIter<'a> {
    grid: &'a ParameterGrid,
    next: usize,
    len: usize,
}

impl Iterator for GridIter<'_> {
    type Item = (usize, KineticParameters);

    fn next(&mut self) -> Option<Self::Item> {
        let i = self.next;
        let params = self.grid.params_at(i)?;
        self.next += 1;
        Some((i, params))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.len.saturating_sub(self.next);
        (n, Some(n))
    }
}

impl ExactSizeIterator for GridIter<'_> {}

/// `n` evenly spaced values over `[start, stop]`, endpoints included.
pub fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (n - 1) as f64;
            (0..n).map(|i| if i + 1 == n { stop } else { start + step * i as f64 }).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> ParameterGrid {
        ParameterGrid::new(vec![0.1, 0.2], vec![0.3, 0.4], vec![5.0, 6.0], vec![0.0], vec![1.0])
            .unwrap()
    }

    #[test]
    fn enumeration_order_af_slowest_tau_p_fastest() {
        let grid = small();
        assert_eq!(grid.len(), 8);
        assert_eq!(grid.shape(), [2, 2, 2, 1, 1]);

        let mut expected = Vec::new();
        for &af in &grid.af {
            for &dv in &grid.dv {
                for &mtt in &grid.mtt {
                    for &tau_a in &grid.tau_a {
                        for &tau_p in &grid.tau_p {
                            expected.push(KineticParameters::new(af, dv, mtt, tau_a, tau_p));
                        }
                    }
                }
            }
        }
        let got: Vec<_> = grid.iter().map(|(_, p)| p).collect();
        assert_eq!(got, expected);
        for (i, p) in grid.iter() {
            assert_eq!(grid.params_at(i), Some(p));
        }
    }

    #[test]
    fn fastest_axis_is_tau_p() {
        let grid = ParameterGrid::new(vec![0.5], vec![0.5], vec![1.0], vec![0.0, 1.0], vec![0.0, 2.0, 4.0])
            .unwrap();
        let taus: Vec<(f64, f64)> = grid.iter().map(|(_, p)| (p.tau_a, p.tau_p)).collect();
        assert_eq!(taus, vec![(0.0, 0.0), (0.0, 2.0), (0.0, 4.0), (1.0, 0.0), (1.0, 2.0), (1.0, 4.0)]);
    }

    #[test]
    fn iterator_is_exact_size() {
        let grid = small();
        let mut it = grid.iter();
        assert_eq!(it.len(), 8);
        it.next();
        it.next();
        assert_eq!(it.len(), 6);
        assert_eq!(it.count(), 6);
        assert!(grid.params_at(8).is_none());
    }

    #[test]
    fn empty_axis_is_rejected() {
        let err = ParameterGrid::new(vec![0.1], vec![], vec![1.0], vec![0.0], vec![0.0]).unwrap_err();
        assert!(err.to_string().contains("dv"));
    }

    #[test]
    fn linspace_includes_endpoints() {
        let v = linspace(0.0, 1.0, 5);
        assert_eq!(v, vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        assert_eq!(linspace(2.0, 3.0, 1), vec![2.0]);
        assert!(linspace(0.0, 1.0, 0).is_empty());
    }
}
