//! Signal intensity ↔ contrast-agent concentration.
//!
//! Inverts the steady-state spoiled-gradient-echo (SPGR) signal equation
//!
//! `S = M · sin α · (1 − E) / (1 − E · cos α)`, `E = exp(−R1 · TR)`
//!
//! with the effective magnetization `M` calibrated from the pre-contrast
//! baseline window, and maps the relaxation-rate change to concentration via
//! the agent relaxivity: `C = (R1 − R10) · 1000 / r1`.
//!
//! Units follow the acquisition record: T10 in seconds, TR in milliseconds,
//! so `R1` is carried per millisecond and the factor 1000 returns to per
//! second.

use lp_core::{AcquisitionRecord, Error, HEMATOCRIT, InputCurves, Region, Result};

/// Sequence constants resolved for one region.
#[derive(Debug, Clone, Copy)]
struct SpgrConstants {
    sin_a: f64,
    cos_a: f64,
    r10: f64,
    tr: f64,
    relaxivity: f64,
}

impl SpgrConstants {
    fn new(acq: &AcquisitionRecord, region: Region) -> Self {
        let alpha = acq.flip_angle.to_radians();
        Self {
            sin_a: alpha.sin(),
            cos_a: alpha.cos(),
            r10: 1.0 / (acq.t10(region) * 1000.0),
            tr: acq.tr,
            relaxivity: acq.relaxivity,
        }
    }

    /// `exp(−R10 · TR)`
    fn e10(&self) -> f64 {
        (-self.r10 * self.tr).exp()
    }

    /// Effective magnetization from the mean baseline signal.
    fn effective_m0(&self, m0: f64) -> Result<f64> {
        let e10 = self.e10();
        let denom = (1.0 - e10) * self.sin_a;
        if denom == 0.0 {
            return Err(Error::Domain("zero denominator in baseline magnetization".to_string()));
        }
        Ok(m0 * (1.0 - e10 * self.cos_a) / denom)
    }
}

/// Post-scaling applied after inversion: tissue uses the global scale factor,
/// vascular curves are converted from blood to plasma concentration.
fn region_scale(acq: &AcquisitionRecord, region: Region) -> f64 {
    if region.is_vascular() { 1.0 / (1.0 - HEMATOCRIT) } else { acq.scale_factor }
}

/// Mean signal over the acquisition's baseline window.
pub fn baseline_signal(signal: &[f64], acquisition: &AcquisitionRecord) -> Result<f64> {
    let window = acquisition.baseline_window();
    if window.is_empty() || window.end > signal.len() {
        return Err(Error::Validation(format!(
            "baseline window {}..{} does not fit a series of length {}",
            window.start,
            window.end,
            signal.len()
        )));
    }
    let n = window.len() as f64;
    Ok(signal[window].iter().sum::<f64>() / n)
}

/// Convert a raw signal-intensity series to a concentration curve.
///
/// Vascular series are taken as magnitudes before inversion. Any sample that
/// makes the logarithm argument non-positive, or the denominator zero, is a
/// [`Error::Domain`] failure; nothing is clamped.
pub fn signal_to_concentration(
    signal: &[f64],
    acquisition: &AcquisitionRecord,
    region: Region,
) -> Result<Vec<f64>> {
    if signal.is_empty() {
        return Err(Error::Domain("signal series is empty".to_string()));
    }
    let signal: Vec<f64> =
        if region.is_vascular() { signal.iter().map(|s| s.abs()).collect() } else { signal.to_vec() };

    let k = SpgrConstants::new(acquisition, region);
    let m0 = baseline_signal(&signal, acquisition)?;
    let m_eff = k.effective_m0(m0)?;
    let m_sin = m_eff * k.sin_a;
    let scale = region_scale(acquisition, region);

    signal
        .iter()
        .enumerate()
        .map(|(t, &s)| {
            let denom = m_sin - s;
            if denom == 0.0 {
                return Err(Error::Domain(format!(
                    "{region:?} sample {t}: signal {s} equals M0·sin(α)"
                )));
            }
            let ratio = (m_sin - s * k.cos_a) / denom;
            if ratio.is_nan() || ratio <= 0.0 {
                return Err(Error::Domain(format!(
                    "{region:?} sample {t}: log argument {ratio} is not positive"
                )));
            }
            let r1 = ratio.ln().abs() / k.tr;
            Ok((r1 - k.r10) * 1000.0 / k.relaxivity * scale)
        })
        .collect()
}

/// Forward SPGR equation: synthesise the signal series that converts back to
/// `concentration`, given the mean baseline signal `m0`.
///
/// Exact inverse of [`signal_to_concentration`] provided the baseline window
/// of `concentration` is zero.
pub fn concentration_to_signal(
    concentration: &[f64],
    m0: f64,
    acquisition: &AcquisitionRecord,
    region: Region,
) -> Result<Vec<f64>> {
    let k = SpgrConstants::new(acquisition, region);
    let m_sin = k.effective_m0(m0)? * k.sin_a;
    let scale = region_scale(acquisition, region);
    if scale == 0.0 {
        return Err(Error::Domain("region scale factor is zero".to_string()));
    }

    concentration
        .iter()
        .map(|&c| {
            let r1 = k.r10 + (c / scale) * k.relaxivity / 1000.0;
            let e = (-r1 * k.tr).exp();
            let denom = 1.0 - e * k.cos_a;
            if denom == 0.0 {
                return Err(Error::Domain("zero denominator in SPGR equation".to_string()));
            }
            Ok(m_sin * (1.0 - e) / denom)
        })
        .collect()
}

/// Arterial plasma concentration from the record's arterial series.
pub fn arterial_concentration(acquisition: &AcquisitionRecord) -> Result<Vec<f64>> {
    signal_to_concentration(&acquisition.arterial_signal(), acquisition, Region::Arterial)
}

/// Portal-venous plasma concentration from the record's portal series.
pub fn portal_concentration(acquisition: &AcquisitionRecord) -> Result<Vec<f64>> {
    signal_to_concentration(&acquisition.portal_signal(), acquisition, Region::Portal)
}

/// Liver tissue concentration from the record's tissue series.
pub fn tissue_concentration(acquisition: &AcquisitionRecord) -> Result<Vec<f64>> {
    let tissue = acquisition
        .tissue
        .as_deref()
        .ok_or_else(|| Error::Validation("acquisition has no tissue series".to_string()))?;
    signal_to_concentration(tissue, acquisition, Region::Tissue)
}

/// Build the `(time, arterial, portal)` input bundle for the forward models.
pub fn input_curves(acquisition: &AcquisitionRecord) -> Result<InputCurves> {
    acquisition.validate()?;
    InputCurves::new(
        acquisition.times(),
        arterial_concentration(acquisition)?,
        portal_concentration(acquisition)?,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn record(n: usize) -> AcquisitionRecord {
        AcquisitionRecord {
            allts: (0..n).map(|i| [i as f64 * 2.0, 150.0, 180.0]).collect(),
            tissue: Some(vec![90.0; n]),
            flip_angle: 12.0,
            t10_liver: 0.81,
            t10_blood: 1.93,
            t10_portal: 1.93,
            tr: 3.7,
            relaxivity: 4.4,
            scale_factor: 1.3,
            start_frame: 2,
            add_frames: 4,
        }
    }

    #[test]
    fn constant_signal_gives_zero_concentration() {
        let acq = record(30);
        for region in [Region::Tissue, Region::Arterial, Region::Portal] {
            let c = signal_to_concentration(&vec![200.0; 30], &acq, region).unwrap();
            for v in c {
                assert!(v.abs() < 1e-9, "{region:?}: expected 0, got {v}");
            }
        }
    }

    #[test]
    fn forward_and_inverse_agree() {
        let acq = record(40);
        let conc: Vec<f64> =
            (0..40).map(|i| if i < 6 { 0.0 } else { 2.5 * (1.0 - (-(i as f64) / 8.0).exp()) }).collect();

        for region in [Region::Tissue, Region::Arterial] {
            let sig = concentration_to_signal(&conc, 250.0, &acq, region).unwrap();
            // baseline samples reproduce m0
            for &s in &sig[..6] {
                assert_relative_eq!(s, 250.0, max_relative = 1e-12);
            }
            let back = signal_to_concentration(&sig, &acq, region).unwrap();
            for (a, b) in back.iter().zip(conc.iter()) {
                assert_relative_eq!(*a, *b, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn enhancement_is_positive_and_scaled() {
        let acq = record(20);
        let mut sig = vec![100.0; 20];
        for s in sig.iter_mut().skip(10) {
            *s = 160.0;
        }
        let tissue = signal_to_concentration(&sig, &acq, Region::Tissue).unwrap();
        assert!(tissue[15] > 0.0);

        let mut unscaled = acq.clone();
        unscaled.scale_factor = 1.0;
        let raw = signal_to_concentration(&sig, &unscaled, Region::Tissue).unwrap();
        assert_relative_eq!(tissue[15], raw[15] * 1.3, max_relative = 1e-12);
    }

    #[test]
    fn vascular_uses_signal_magnitude() {
        let acq = record(20);
        let sig: Vec<f64> = (0..20).map(|i| if i < 8 { 100.0 } else { 140.0 }).collect();
        let neg: Vec<f64> = sig.iter().map(|s| -s).collect();
        let a = signal_to_concentration(&sig, &acq, Region::Arterial).unwrap();
        let b = signal_to_concentration(&neg, &acq, Region::Arterial).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn saturated_signal_is_a_domain_error() {
        let acq = record(20);
        let m0 = 100.0;
        let k = SpgrConstants::new(&acq, Region::Tissue);
        let m_sin = k.effective_m0(m0).unwrap() * k.sin_a;
        let mut sig = vec![m0; 20];
        sig[12] = m_sin;
        let err = signal_to_concentration(&sig, &acq, Region::Tissue).unwrap_err();
        assert!(err.is_domain(), "{err}");

        // beyond saturation the log argument goes negative
        sig[12] = m_sin * 1.01;
        let err = signal_to_concentration(&sig, &acq, Region::Tissue).unwrap_err();
        assert!(err.is_domain(), "{err}");
    }

    #[test]
    fn empty_series_is_a_domain_error() {
        let acq = record(20);
        assert!(signal_to_concentration(&[], &acq, Region::Tissue).unwrap_err().is_domain());
    }

    #[test]
    fn input_curves_have_record_length() {
        let acq = record(25);
        let inputs = input_curves(&acq).unwrap();
        assert_eq!(inputs.len(), 25);
        assert_eq!(inputs.times[1], 2.0);
        assert!(tissue_concentration(&acq).is_ok());

        let mut no_tissue = acq.clone();
        no_tissue.tissue = None;
        assert!(tissue_concentration(&no_tissue).is_err());
    }
}
