//! Charge state deconvolution of mass spectra.
//!
//! A spectrum of (m/z, intensity) points is explained as a grid of
//! (point x charge) contributions that is refined with Richardson-Lucy
//! iterations, smoothed across neighboring charges and masses, and finally
//! projected on a mass axis. See [`decon::Deconvolver`] for the run itself.
pub mod baseline;
pub mod blur;
pub mod config;
pub mod convolution;
pub mod decon;
pub mod double_decon;
pub mod errors;
pub mod fit;
pub mod grid;
pub mod input;
pub mod isotopes;
pub mod peak_shape;
pub mod scoring;
pub mod sharpen;
pub mod transforms;
pub mod utils;

pub use config::{
    Config,
    NormalizedConfig,
};
pub use decon::{
    Decon,
    Deconvolver,
    Diagnostic,
    run_unidec,
};
pub use double_decon::PointSpreadKernel;
pub use errors::UniDecError;
pub use input::Input;
pub use scoring::{
    Scorer,
    UniScorer,
};
