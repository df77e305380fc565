//! Serializable dictionary artifacts.
//!
//! A dictionary is persisted together with the grid that produced it and the
//! acquisition it was simulated for, so it can be matched against curves from
//! the same session without regeneration. Matrices are stored row-major.
//!
//! # Schema versioning
//!
//! The `schema_version` field tracks breaking changes. Current: `"1.0.0"`.
//! Artifacts with a different major version are rejected on conversion, as are
//! artifacts whose curves do not match the stored acquisition's frame count.

use crate::compress::CompressedDictionary;
use crate::dictionary::DenseDictionary;
use crate::grid::ParameterGrid;
use lp_core::{AcquisitionRecord, Error, KineticParameters, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Current schema version for dictionary artifacts.
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Dense matrix in row-major order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixData {
    /// Number of rows.
    pub rows: usize,
    /// Number of columns.
    pub cols: usize,
    /// `rows * cols` values, row by row.
    pub data: Vec<f64>,
}

impl From<&DMatrix<f64>> for MatrixData {
    fn from(m: &DMatrix<f64>) -> Self {
        let (rows, cols) = m.shape();
        let data = m.transpose().iter().copied().collect();
        Self { rows, cols, data }
    }
}

impl TryFrom<&MatrixData> for DMatrix<f64> {
    type Error = Error;

    fn try_from(m: &MatrixData) -> Result<Self> {
        if m.rows.checked_mul(m.cols) != Some(m.data.len()) {
            return Err(Error::Validation(format!(
                "matrix {}x{} has {} values",
                m.rows,
                m.cols,
                m.data.len()
            )));
        }
        Ok(DMatrix::from_row_slice(m.rows, m.cols, &m.data))
    }
}

fn check_schema(version: &str) -> Result<()> {
    let major = |v: &str| v.split('.').next().map(str::to_owned);
    if major(version) != major(SCHEMA_VERSION) {
        return Err(Error::Validation(format!(
            "unsupported artifact schema {version} (expected {SCHEMA_VERSION})"
        )));
    }
    Ok(())
}

fn check_len(what: &str, got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(Error::Validation(format!("{what}: expected {expected}, got {got}")));
    }
    Ok(())
}

/// Persisted dense dictionary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseDictionaryArtifact {
    /// Schema version for forward compatibility.
    pub schema_version: String,
    /// The five parameter ranges.
    pub grid: ParameterGrid,
    /// Acquisition the dictionary was simulated for.
    pub acquisition: AcquisitionRecord,
    /// Curves as columns (time × entries).
    pub dictionary: MatrixData,
    /// Parameters of each column.
    pub lut: Vec<KineticParameters>,
    /// Grid index of each column.
    pub source_index: Vec<usize>,
}

impl DenseDictionaryArtifact {
    /// Bundle a dense dictionary with its provenance.
    pub fn new(
        dictionary: &DenseDictionary,
        grid: &ParameterGrid,
        acquisition: &AcquisitionRecord,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            grid: grid.clone(),
            acquisition: acquisition.clone(),
            dictionary: MatrixData::from(&dictionary.curves),
            lut: dictionary.lut.clone(),
            source_index: dictionary.source_index.clone(),
        }
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Write to `path` as JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Read from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}

impl TryFrom<&DenseDictionaryArtifact> for DenseDictionary {
    type Error = Error;

    fn try_from(a: &DenseDictionaryArtifact) -> Result<Self> {
        check_schema(&a.schema_version)?;
        let curves = DMatrix::<f64>::try_from(&a.dictionary)?;
        check_len("lut", a.lut.len(), curves.ncols())?;
        check_len("source_index", a.source_index.len(), curves.ncols())?;
        let dictionary =
            DenseDictionary { curves, lut: a.lut.clone(), source_index: a.source_index.clone() };
        check_len("curve samples", dictionary.n_samples(), a.acquisition.len())?;
        Ok(dictionary)
    }
}

/// Persisted compressed dictionary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressedDictionaryArtifact {
    /// Schema version for forward compatibility.
    pub schema_version: String,
    /// The five parameter ranges.
    pub grid: ParameterGrid,
    /// Acquisition the dictionary was simulated for.
    pub acquisition: AcquisitionRecord,
    /// Left basis (time × rank).
    pub u: MatrixData,
    /// Singular values.
    pub s: Vec<f64>,
    /// Right basis (entries × rank).
    pub v: MatrixData,
    /// Norm of each raw curve.
    pub rss: Vec<f64>,
    /// Parameters of each entry.
    pub lut: Vec<KineticParameters>,
    /// Grid index of each entry.
    pub source_index: Vec<usize>,
}

impl CompressedDictionaryArtifact {
    /// Bundle a compressed dictionary with its provenance.
    pub fn new(
        dictionary: &CompressedDictionary,
        grid: &ParameterGrid,
        acquisition: &AcquisitionRecord,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            grid: grid.clone(),
            acquisition: acquisition.clone(),
            u: MatrixData::from(&dictionary.u),
            s: dictionary.s.iter().copied().collect(),
            v: MatrixData::from(&dictionary.v),
            rss: dictionary.rss.clone(),
            lut: dictionary.lut.clone(),
            source_index: dictionary.source_index.clone(),
        }
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Write to `path` as JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Read from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}

impl TryFrom<&CompressedDictionaryArtifact> for CompressedDictionary {
    type Error = Error;

    fn try_from(a: &CompressedDictionaryArtifact) -> Result<Self> {
        check_schema(&a.schema_version)?;
        let u = DMatrix::<f64>::try_from(&a.u)?;
        let v = DMatrix::<f64>::try_from(&a.v)?;
        let rank = a.s.len();
        check_len("u columns", u.ncols(), rank)?;
        check_len("v columns", v.ncols(), rank)?;
        let n = v.nrows();
        check_len("rss", a.rss.len(), n)?;
        check_len("lut", a.lut.len(), n)?;
        check_len("source_index", a.source_index.len(), n)?;
        let dictionary = CompressedDictionary {
            u,
            s: DVector::from_vec(a.s.clone()),
            v,
            rss: a.rss.clone(),
            lut: a.lut.clone(),
            source_index: a.source_index.clone(),
        };
        check_len("basis samples", dictionary.n_samples(), a.acquisition.len())?;
        Ok(dictionary)
    }
}
