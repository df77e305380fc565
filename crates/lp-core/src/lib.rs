//! # lp-core
//!
//! Core types and traits for LiverPerf, a toolkit for dual-input
//! pharmacokinetic modelling of liver DCE-MRI.
//!
//! This crate holds what every other crate agrees on: the acquisition record,
//! kinetic parameter tuples, fit results, the error taxonomy and the
//! [`ForwardModel`] trait.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use traits::ForwardModel;
pub use types::{
    AcquisitionRecord, FitResult, HEMATOCRIT, InputCurves, KineticParameters, Region,
};
