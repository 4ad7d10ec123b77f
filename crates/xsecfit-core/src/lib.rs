//! Parametric event reweighting and chi-square aggregation for
//! cross-section fits.
//!
//! A fit is assembled from dials ([`weights::DialRegistry`]), response curves
//! with a per-event coefficient cache ([`spline`]), binned samples and an
//! aggregation mode ([`fit`]). [`fit::FitObjective::propose_parameters`] is the
//! function handed to the minimizer.

pub mod config;
pub mod domain;
pub mod fit;
pub mod numerics;
pub mod spline;
pub mod weights;
