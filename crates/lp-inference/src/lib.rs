//! # lp-inference
//!
//! Contrast kinetics for liver DCE-MRI.
//!
//! This crate provides:
//! - Signal intensity to concentration conversion (SPGR inversion)
//! - Dual-input ("disc") and single-input (Tofts) forward models
//! - Bounded curve fitting of kinetic parameters
//! - Dense and randomized low-rank dictionaries over a parameter grid
//!
//! ## Architecture
//!
//! The fitter depends on the `ForwardModel` trait from lp-core, not on a
//! concrete model. Dictionaries share one grid enumeration order.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Persisted dictionaries with provenance.
pub mod artifacts;
/// Randomized SVD compression of the dictionary.
pub mod compress;
/// Dense dictionary construction.
pub mod dictionary;
/// Curve fitting of kinetic parameters.
pub mod fit;
/// Parameter grids and enumeration order.
pub mod grid;
/// Bounded nonlinear least squares (trust-region Levenberg–Marquardt).
pub mod least_squares;
/// Forward pharmacokinetic models.
pub mod models;
/// Generic numerical optimizer (L-BFGS-B backend).
pub mod optimizer;
/// Signal ↔ concentration conversion.
pub mod signal;

pub use artifacts::{CompressedDictionaryArtifact, DenseDictionaryArtifact, MatrixData};
pub use compress::{
    CompressedDictionary, CompressionConfig, build_compressed_dictionary,
    build_compressed_dictionary_from_inputs, preprocess_curve,
};
pub use dictionary::{DenseDictionary, build_dictionary, build_dictionary_from_inputs};
pub use fit::{CurveFit, CurveFitter, FitConfig, FitMethod};
pub use grid::{GridIter, ParameterGrid, linspace};
pub use least_squares::{LeastSquaresConfig, LeastSquaresResult, TrustRegionSolver};
pub use models::{DualInputModel, ToftsModel, disc, tofts};
pub use optimizer::{LbfgsbOptimizer, ObjectiveFunction, OptimizationResult, OptimizerConfig};
pub use signal::{concentration_to_signal, input_curves, signal_to_concentration};
