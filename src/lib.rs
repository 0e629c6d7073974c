#![warn(clippy::all, rust_2018_idioms)]

//! Spectrum analysis for photoelectron spectroscopy: reads multi-region
//! spectrum files, subtracts a Shirley background and fits core-level or
//! Fermi-edge models by least squares.

pub mod baseline;
pub mod error;
pub mod fitter;
pub mod reader;
pub mod settings;

pub use error::XpsError;
