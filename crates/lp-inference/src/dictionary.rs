//! Dense dictionary of simulated tissue curves.
//!
//! One column per grid combination, in grid order. Combinations with a
//! non-finite parameter, or whose curve is undefined (the model reports a
//! domain error, e.g. `mtt = 0`), are skipped; `lut` and `source_index` stay
//! aligned with the surviving columns.

use crate::grid::ParameterGrid;
use crate::models;
use crate::signal;
use lp_core::{AcquisitionRecord, InputCurves, KineticParameters, Result};
use nalgebra::DMatrix;

/// Simulated curves for every non-degenerate grid combination.
#[derive(Debug, Clone)]
pub struct DenseDictionary {
    /// Curves as columns (time × entries).
    pub curves: DMatrix<f64>,
    /// Parameters of each column.
    pub lut: Vec<KineticParameters>,
    /// Grid index of each column.
    pub source_index: Vec<usize>,
}

impl DenseDictionary {
    /// Number of retained entries.
    pub fn n_entries(&self) -> usize {
        self.lut.len()
    }

    /// Number of time samples per curve.
    pub fn n_samples(&self) -> usize {
        self.curves.nrows()
    }

    /// Copy of column `j`.
    pub fn curve(&self, j: usize) -> Option<Vec<f64>> {
        (j < self.n_entries()).then(|| self.curves.column(j).iter().copied().collect())
    }
}

/// Simulate one grid entry; `Ok(None)` marks a degenerate combination.
pub(crate) fn simulate_entry(
    inputs: &InputCurves,
    params: &KineticParameters,
) -> Result<Option<Vec<f64>>> {
    // a NaN delay would otherwise pass through the shift unchanged
    if !params.is_finite() {
        log::debug!("dropping entry with non-finite parameters {params:?}");
        return Ok(None);
    }
    match models::disc(&inputs.times, &inputs.arterial, &inputs.portal, params) {
        Ok(curve) => Ok(Some(curve)),
        Err(e) if e.is_domain() => {
            log::debug!("dropping degenerate entry {params:?}: {e}");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Build the dense dictionary for `grid` from the acquisition's input curves.
pub fn build_dictionary(
    grid: &ParameterGrid,
    acquisition: &AcquisitionRecord,
) -> Result<DenseDictionary> {
    let inputs = signal::input_curves(acquisition)?;
    build_dictionary_from_inputs(grid, &inputs)
}

/// Build the dense dictionary for `grid` from precomputed input curves.
///
/// Delay axes are in sample units.
pub fn build_dictionary_from_inputs(
    grid: &ParameterGrid,
    inputs: &InputCurves,
) -> Result<DenseDictionary> {
    grid.validate()?;
    let t = inputs.len();
    let mut data = Vec::with_capacity(t * grid.len());
    let mut lut = Vec::with_capacity(grid.len());
    let mut source_index = Vec::with_capacity(grid.len());

    for (i, params) in grid.iter() {
        if let Some(curve) = simulate_entry(inputs, &params)? {
            data.extend_from_slice(&curve);
            lut.push(params);
            source_index.push(i);
        }
    }

    let dropped = grid.len() - lut.len();
    if dropped > 0 {
        log::info!("dense dictionary: dropped {dropped} of {} degenerate entries", grid.len());
    }
    log::debug!("dense dictionary: {t} samples x {} entries", lut.len());

    Ok(DenseDictionary { curves: DMatrix::from_vec(t, lut.len(), data), lut, source_index })
}
