//! Common data types for LiverPerf

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::Path;

/// Blood hematocrit used to convert whole-blood to plasma concentration.
pub const HEMATOCRIT: f64 = 0.4;

/// Relative tolerance on sample spacing when checking for a uniform time grid.
const UNIFORM_SPACING_RTOL: f64 = 1e-6;

/// Region whose signal series is being converted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    /// Liver parenchyma. Scaled by the acquisition `scaleFactor`.
    Tissue,
    /// Arterial input (aorta / hepatic artery). Converted to plasma concentration.
    Arterial,
    /// Portal-venous input. Converted to plasma concentration.
    Portal,
}

impl Region {
    /// Vascular regions carry blood, and are corrected for hematocrit.
    pub fn is_vascular(self) -> bool {
        matches!(self, Region::Arterial | Region::Portal)
    }
}

/// Acquisition bundle: time grid, raw signal series and sequence constants.
///
/// Field names on the wire follow the acquisition software (`allts`,
/// `flipAngle`, `T10l`, ...). Loaded once per session and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionRecord {
    /// Rows of `[time (s), arterial signal, portal-venous signal]`.
    pub allts: Vec<[f64; 3]>,
    /// Optional liver-tissue signal series on the same time grid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tissue: Option<Vec<f64>>,
    /// Flip angle in degrees.
    #[serde(rename = "flipAngle")]
    pub flip_angle: f64,
    /// Baseline T1 of liver tissue (s).
    #[serde(rename = "T10l")]
    pub t10_liver: f64,
    /// Baseline T1 of arterial blood (s).
    #[serde(rename = "T10b")]
    pub t10_blood: f64,
    /// Baseline T1 of portal-venous blood (s).
    #[serde(rename = "T10p")]
    pub t10_portal: f64,
    /// Repetition time (ms).
    #[serde(rename = "TR")]
    pub tr: f64,
    /// Contrast-agent relaxivity (1/(mM·s)).
    pub relaxivity: f64,
    /// Global intensity scale applied to tissue concentration.
    #[serde(rename = "scaleFactor")]
    pub scale_factor: f64,
    /// First pre-contrast frame, 1-based.
    #[serde(rename = "startFrame")]
    pub start_frame: usize,
    /// Number of additional pre-contrast frames after `start_frame`.
    #[serde(rename = "addFrames")]
    pub add_frames: usize,
}

impl AcquisitionRecord {
    /// Parse an acquisition record from JSON and validate it.
    pub fn from_json(json: &str) -> Result<Self> {
        let record: Self = serde_json::from_str(json)?;
        record.validate()?;
        Ok(record)
    }

    /// Load an acquisition record from a JSON file and validate it.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Number of time samples.
    pub fn len(&self) -> usize {
        self.allts.len()
    }

    /// True when the record holds no samples.
    pub fn is_empty(&self) -> bool {
        self.allts.is_empty()
    }

    /// Acquisition times (s).
    pub fn times(&self) -> Vec<f64> {
        self.allts.iter().map(|row| row[0]).collect()
    }

    /// Raw arterial signal series.
    pub fn arterial_signal(&self) -> Vec<f64> {
        self.allts.iter().map(|row| row[1]).collect()
    }

    /// Raw portal-venous signal series.
    pub fn portal_signal(&self) -> Vec<f64> {
        self.allts.iter().map(|row| row[2]).collect()
    }

    /// Uniform sample spacing (s).
    pub fn dt(&self) -> f64 {
        if self.allts.len() < 2 { 0.0 } else { self.allts[1][0] - self.allts[0][0] }
    }

    /// Zero-based, half-open index range of the pre-contrast baseline window.
    pub fn baseline_window(&self) -> Range<usize> {
        let start = self.start_frame.saturating_sub(1);
        start..start + self.add_frames + 1
    }

    /// Baseline T1 (s) for a region.
    pub fn t10(&self, region: Region) -> f64 {
        match region {
            Region::Tissue => self.t10_liver,
            Region::Arterial => self.t10_blood,
            Region::Portal => self.t10_portal,
        }
    }

    /// Check the invariants every component relies on.
    pub fn validate(&self) -> Result<()> {
        let n = self.allts.len();
        if n < 2 {
            return Err(Error::Validation(format!(
                "acquisition needs at least 2 time samples, got {n}"
            )));
        }
        if self.allts.iter().flatten().any(|v| !v.is_finite()) {
            return Err(Error::Validation("allts contains non-finite values".to_string()));
        }
        let dt = self.dt();
        if dt <= 0.0 {
            return Err(Error::Validation("times must be strictly increasing".to_string()));
        }
        for w in self.allts.windows(2) {
            let step = w[1][0] - w[0][0];
            if step <= 0.0 {
                return Err(Error::Validation("times must be strictly increasing".to_string()));
            }
            if (step - dt).abs() > UNIFORM_SPACING_RTOL * dt.abs().max(1.0) {
                return Err(Error::Validation(format!(
                    "times must be uniformly spaced: step {step} differs from dt {dt}"
                )));
            }
        }
        if let Some(tissue) = &self.tissue {
            if tissue.len() != n {
                return Err(Error::Validation(format!(
                    "tissue/allts length mismatch: {} vs {}",
                    tissue.len(),
                    n
                )));
            }
        }
        if self.start_frame == 0 {
            return Err(Error::Validation("startFrame is 1-based and must be >= 1".to_string()));
        }
        let window = self.baseline_window();
        if window.end > n {
            return Err(Error::Validation(format!(
                "baseline window {}..{} exceeds series length {}",
                window.start, window.end, n
            )));
        }
        if !(self.flip_angle > 0.0 && self.flip_angle < 180.0) {
            return Err(Error::Validation("flipAngle must be in (0, 180) degrees".to_string()));
        }
        for (name, v) in [
            ("T10l", self.t10_liver),
            ("T10b", self.t10_blood),
            ("T10p", self.t10_portal),
            ("TR", self.tr),
            ("relaxivity", self.relaxivity),
        ] {
            if !v.is_finite() || v <= 0.0 {
                return Err(Error::Validation(format!("{name} must be finite and > 0")));
            }
        }
        if !self.scale_factor.is_finite() {
            return Err(Error::Validation("scaleFactor must be finite".to_string()));
        }
        Ok(())
    }
}

/// Input concentration curves on a shared time grid: the `(time, arterial,
/// portal)` design bundle consumed by the forward models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputCurves {
    /// Sample times (s), uniform spacing.
    pub times: Vec<f64>,
    /// Arterial plasma concentration.
    pub arterial: Vec<f64>,
    /// Portal-venous plasma concentration.
    pub portal: Vec<f64>,
}

impl InputCurves {
    /// Bundle the three series, checking lengths.
    pub fn new(times: Vec<f64>, arterial: Vec<f64>, portal: Vec<f64>) -> Result<Self> {
        if times.len() < 2 {
            return Err(Error::Validation(format!(
                "need at least 2 time samples, got {}",
                times.len()
            )));
        }
        if arterial.len() != times.len() || portal.len() != times.len() {
            return Err(Error::Validation(format!(
                "input curve length mismatch: times={}, arterial={}, portal={}",
                times.len(),
                arterial.len(),
                portal.len()
            )));
        }
        Ok(Self { times, arterial, portal })
    }

    /// Number of time samples.
    pub fn len(&self) -> usize {
        self.times.len()
    }

    /// True when there are no samples.
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
}

/// Dual-input kinetic parameters `(af, dv, mtt, tau_a, tau_p)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KineticParameters {
    /// Arterial fraction of the total inflow.
    pub af: f64,
    /// Distribution volume.
    pub dv: f64,
    /// Mean transit time (s). Must be > 0 for a finite curve.
    pub mtt: f64,
    /// Arterial arrival delay (samples, rounded to nearest).
    pub tau_a: f64,
    /// Portal-venous arrival delay (samples, rounded to nearest).
    pub tau_p: f64,
}

impl KineticParameters {
    /// Number of parameters.
    pub const LEN: usize = 5;

    /// Parameter names in canonical order.
    pub const NAMES: [&'static str; 5] = ["af", "dv", "mtt", "tau_a", "tau_p"];

    /// Construct from values.
    pub fn new(af: f64, dv: f64, mtt: f64, tau_a: f64, tau_p: f64) -> Self {
        Self { af, dv, mtt, tau_a, tau_p }
    }

    /// Canonical array form.
    pub fn to_array(&self) -> [f64; 5] {
        [self.af, self.dv, self.mtt, self.tau_a, self.tau_p]
    }

    /// Build from a slice in canonical order.
    pub fn from_slice(values: &[f64]) -> Result<Self> {
        match values {
            &[af, dv, mtt, tau_a, tau_p] => Ok(Self { af, dv, mtt, tau_a, tau_p }),
            _ => Err(Error::Validation(format!(
                "expected {} kinetic parameters, got {}",
                Self::LEN,
                values.len()
            ))),
        }
    }

    /// True if no component is NaN or infinite.
    pub fn is_finite(&self) -> bool {
        self.to_array().iter().all(|v| v.is_finite())
    }
}

/// Fit result containing parameter estimates and uncertainties
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitResult {
    /// Best-fit parameter values
    pub parameters: Vec<f64>,

    /// Parameter uncertainties (sqrt of covariance diagonal)
    pub uncertainties: Vec<f64>,

    /// Covariance matrix (row-major, N×N). `None` if the Jacobian was rank-deficient.
    pub covariance: Option<Vec<f64>>,

    /// Sum of squared residuals at the minimum
    pub sse: f64,

    /// Number of solver iterations
    pub n_iter: usize,

    /// Number of function evaluations
    pub n_evaluations: usize,
}

impl FitResult {
    /// Create a new fit result
    pub fn new(
        parameters: Vec<f64>,
        uncertainties: Vec<f64>,
        sse: f64,
        n_iter: usize,
        n_evaluations: usize,
    ) -> Self {
        Self { parameters, uncertainties, covariance: None, sse, n_iter, n_evaluations }
    }

    /// Attach a covariance matrix (row-major, N×N)
    pub fn with_covariance(mut self, covariance: Vec<f64>) -> Self {
        self.covariance = Some(covariance);
        self
    }

    /// Covariance element (i, j). Returns `None` if covariance is unavailable.
    pub fn covariance_at(&self, i: usize, j: usize) -> Option<f64> {
        let cov = self.covariance.as_ref()?;
        let n = self.parameters.len();
        if i >= n || j >= n {
            return None;
        }
        cov.get(i * n + j).copied()
    }

    /// Get correlation matrix element (i, j). Returns `None` if covariance is unavailable.
    pub fn correlation(&self, i: usize, j: usize) -> Option<f64> {
        let c = self.covariance_at(i, j)?;
        let sigma_i = *self.uncertainties.get(i)?;
        let sigma_j = *self.uncertainties.get(j)?;
        if sigma_i <= 0.0 || sigma_j <= 0.0 || !sigma_i.is_finite() || !sigma_j.is_finite() {
            return None;
        }
        Some(c / (sigma_i * sigma_j))
    }

    /// Interpret the parameters as dual-input kinetic parameters.
    pub fn kinetic_parameters(&self) -> Result<KineticParameters> {
        KineticParameters::from_slice(&self.parameters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> AcquisitionRecord {
        let allts = (0..20).map(|i| [i as f64 * 2.0, 100.0, 120.0]).collect();
        AcquisitionRecord {
            allts,
            tissue: None,
            flip_angle: 15.0,
            t10_liver: 0.8,
            t10_blood: 1.4,
            t10_portal: 1.4,
            tr: 3.5,
            relaxivity: 4.5,
            scale_factor: 1.0,
            start_frame: 1,
            add_frames: 3,
        }
    }

    #[test]
    fn test_fit_result() {
        let result = FitResult::new(vec![1.0, 2.0], vec![0.1, 0.2], 1.5, 7, 100);
        assert_eq!(result.parameters.len(), 2);
        assert_eq!(result.uncertainties.len(), 2);
        assert!(result.correlation(0, 1).is_none());

        let result = result.with_covariance(vec![0.01, 0.002, 0.002, 0.04]);
        let rho = result.correlation(0, 1).unwrap();
        assert!((rho - 0.1).abs() < 1e-12);
        assert!(result.covariance_at(2, 0).is_none());
    }

    #[test]
    fn test_fit_result_with_short_tables() {
        let json = r#"{
            "parameters": [1.0, 2.0],
            "uncertainties": [0.1],
            "covariance": [0.01, 0.002],
            "sse": 0.5,
            "n_iter": 3,
            "n_evaluations": 12
        }"#;
        let result: FitResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.covariance_at(0, 1), Some(0.002));
        assert!(result.covariance_at(1, 1).is_none());
        assert!(result.correlation(0, 1).is_none());
        assert!(result.correlation(1, 0).is_none());
    }

    #[test]
    fn test_kinetic_parameters_slice() {
        let p = KineticParameters::from_slice(&[0.3, 0.5, 10.0, 1.0, 2.0]).unwrap();
        assert_eq!(p.to_array(), [0.3, 0.5, 10.0, 1.0, 2.0]);
        assert!(KineticParameters::from_slice(&[0.3]).is_err());
        assert!(!KineticParameters::new(0.3, 0.5, 10.0, f64::NAN, 0.0).is_finite());
        assert!(!KineticParameters::new(0.3, 0.5, 10.0, 0.0, f64::INFINITY).is_finite());
        assert!(p.is_finite());
    }

    #[test]
    fn test_baseline_window_is_zero_based() {
        let mut rec = sample_record();
        rec.start_frame = 2;
        rec.add_frames = 3;
        assert_eq!(rec.baseline_window(), 1..5);
        assert!(rec.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_records() {
        let mut rec = sample_record();
        rec.start_frame = 0;
        assert!(rec.validate().is_err());

        let mut rec = sample_record();
        rec.add_frames = 40;
        assert!(rec.validate().is_err());

        let mut rec = sample_record();
        rec.allts[5][0] += 0.5;
        assert!(rec.validate().is_err());

        let mut rec = sample_record();
        rec.tr = 0.0;
        assert!(rec.validate().is_err());

        let mut rec = sample_record();
        rec.tissue = Some(vec![1.0; 3]);
        assert!(rec.validate().is_err());
    }

    #[test]
    fn test_json_uses_acquisition_field_names() {
        let rec = sample_record();
        let json = rec.to_json().unwrap();
        assert!(json.contains("\"flipAngle\""));
        assert!(json.contains("\"T10l\""));
        assert!(json.contains("\"startFrame\""));
        assert!(!json.contains("tissue"));

        let back = AcquisitionRecord::from_json(&json).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn test_input_curves_length_check() {
        assert!(InputCurves::new(vec![0.0, 1.0], vec![0.0, 1.0], vec![0.0]).is_err());
        assert!(InputCurves::new(vec![0.0], vec![0.0], vec![0.0]).is_err());
        let ic = InputCurves::new(vec![0.0, 1.0], vec![0.0, 1.0], vec![0.0, 2.0]).unwrap();
        assert_eq!(ic.len(), 2);
    }

    #[test]
    fn test_region_vascular() {
        assert!(Region::Arterial.is_vascular());
        assert!(Region::Portal.is_vascular());
        assert!(!Region::Tissue.is_vascular());
        let rec = sample_record();
        assert_eq!(rec.t10(Region::Tissue), 0.8);
        assert_eq!(rec.t10(Region::Portal), 1.4);
    }
}
