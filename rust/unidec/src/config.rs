//! Run parameters.
//!
//! [`Config`] is the user facing record, it deserializes from JSON with every
//! missing key falling back to its default. Before a run it has to be turned
//! into a [`NormalizedConfig`] with [`Config::normalize`], which resolves the
//! derived values and applies the division-by-zero guards. The deconvolution
//! entry points only accept the normalized form.
//!
//! Example:
//! ```
//! use unidec::config::Config;
//!
//! let config = Config {
//!     startz: 1,
//!     endz: 10,
//!     ..Config::default()
//! };
//! let normalized = config.normalize().unwrap();
//! assert_eq!(normalized.numz, 10);
//! ```
use serde::{
    Deserialize,
    Serialize,
};
use std::ops::Deref;

use crate::errors::{
    Result,
    UniDecError,
};

/// Conversion from full width at half maximum to a Gaussian sigma.
pub const FWHM_TO_SIGMA: f32 = 2.35482;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PeakShapeKind {
    #[default]
    Gaussian,
    Lorentzian,
    /// Gaussian on the low m/z side, Lorentzian on the high side.
    SplitGaussianLorentzian,
}

impl TryFrom<i32> for PeakShapeKind {
    type Error = UniDecError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(PeakShapeKind::Gaussian),
            1 => Ok(PeakShapeKind::Lorentzian),
            2 => Ok(PeakShapeKind::SplitGaussianLorentzian),
            x => Err(UniDecError::UnknownPeakShape(x)),
        }
    }
}

/// How the final grid is projected onto the mass axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PoolingMode {
    Integrate,
    #[default]
    Interpolate,
    Smart,
}

impl TryFrom<i32> for PoolingMode {
    type Error = UniDecError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(PoolingMode::Integrate),
            1 => Ok(PoolingMode::Interpolate),
            2 => Ok(PoolingMode::Smart),
            x => Err(UniDecError::UnknownPoolingMode(x)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BaselineMode {
    #[default]
    Off,
    /// Baseline is re-estimated and added to the expected signal every iteration.
    Iterative,
    /// Baseline is estimated once and subtracted from the data.
    Subtract,
}

impl TryFrom<i32> for BaselineMode {
    type Error = UniDecError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(BaselineMode::Off),
            1 => Ok(BaselineMode::Iterative),
            2 => Ok(BaselineMode::Subtract),
            x => Err(UniDecError::UnknownBaselineMode(x)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IsotopeMode {
    #[default]
    Off,
    /// Deconvolve isotope envelopes, report monoisotopic masses.
    Monoisotopic,
    /// Deconvolve isotope envelopes, report average masses.
    Average,
}

impl IsotopeMode {
    pub fn is_active(&self) -> bool {
        !matches!(self, IsotopeMode::Off)
    }
}

impl TryFrom<i32> for IsotopeMode {
    type Error = UniDecError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(IsotopeMode::Off),
            1 => Ok(IsotopeMode::Monoisotopic),
            2 => Ok(IsotopeMode::Average),
            x => Err(UniDecError::UnknownIsotopeMode(x)),
        }
    }
}

/// Which grid is read out onto the mass axis and whether the full grids are
/// meant to be persisted by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReadoutMode {
    /// Reconvolved grid, grids are written out.
    Profile,
    /// Raw deconvolved grid, grids are written out.
    #[default]
    Centroid,
    ProfileMassOnly,
    CentroidMassOnly,
}

impl ReadoutMode {
    pub fn is_profile(&self) -> bool {
        matches!(self, ReadoutMode::Profile | ReadoutMode::ProfileMassOnly)
    }

    pub fn writes_grids(&self) -> bool {
        matches!(self, ReadoutMode::Profile | ReadoutMode::Centroid)
    }
}

impl TryFrom<i32> for ReadoutMode {
    type Error = UniDecError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(ReadoutMode::Profile),
            1 => Ok(ReadoutMode::Centroid),
            2 => Ok(ReadoutMode::ProfileMassOnly),
            3 => Ok(ReadoutMode::CentroidMassOnly),
            x => Err(UniDecError::UnknownReadoutMode(x)),
        }
    }
}

/// Normalization applied to detected peak heights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PeakNormalization {
    None,
    #[default]
    Max,
    Sum,
}

/// Coefficients of the mass dependent isotope envelope model.
///
/// Layout: `[a0, a1, b0, b1, mid0, mid1, mid2, sig0, sig1, sig2]` where
/// `alpha = a0*exp(-m*a1)`, `beta = b0*exp(-m*b1)`,
/// `mid = mid0 + mid1*m^mid2` and `sig = sig0 + sig1*m^sig2`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IsotopeParams(pub [f32; 10]);

impl Default for IsotopeParams {
    fn default() -> Self {
        IsotopeParams([
            1.008_408_5,
            1.253_187_2e-3,
            2.372_263_4,
            8.191_78e-4,
            -0.437_741_95,
            6.649_93e-4,
            0.994_230_5,
            0.464_975_24,
            1.005_291_6e-2,
            0.581_240_3,
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Iteration budget. Negative values run `|numit|` iterations without
    /// early stopping.
    pub numit: i32,
    pub startz: i32,
    pub endz: i32,
    /// Charge smoothing width. The sign selects the blur flavor.
    pub zsig: f32,
    /// Point smoothing. `>= 1` moving mean half width, `< 0` peak width
    /// reconvolution.
    pub psig: f32,
    /// Softargmax sharpening strength.
    pub beta: f32,
    /// Peak width (FWHM) in m/z.
    pub mzsig: f32,
    /// Mass (oligomer) smoothing width. The sign selects the blur flavor.
    pub msig: f32,
    /// Oligomer mass used for mass smoothing offsets.
    pub molig: f32,
    pub massub: f32,
    pub masslb: f32,
    pub psfun: PeakShapeKind,
    /// Window around reference masses. Zero restricts to the nearest points.
    pub mtabsig: f32,
    pub massbins: f32,
    /// Number of peak widths covered by each peak shape window.
    pub psthresh: f32,
    pub speedyflag: bool,
    /// Linearization mode of the input, `-1` when unknown.
    pub linflag: i32,
    pub aggressiveflag: BaselineMode,
    pub adductmass: f32,
    pub rawflag: ReadoutMode,
    pub nativezub: f32,
    pub nativezlb: f32,
    pub poolflag: PoolingMode,
    /// Points at or below this intensity are removed, `-1` disables it.
    pub intthresh: f32,
    pub peakshapeinflate: f32,
    pub isotopemode: IsotopeMode,
    pub isotope_params: IsotopeParams,
    /// Scale intensities by charge (orbitrap-like detection).
    pub orbimode: bool,
    pub filterwidth: usize,
    /// Floor used instead of the log of non-positive values.
    pub zerolog: f32,
    pub peakwin: f32,
    pub peakthresh: f32,
    pub peaknorm: PeakNormalization,
    pub doubledec: bool,
    pub convergence_threshold: f32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            numit: 50,
            startz: 1,
            endz: 100,
            zsig: 1.0,
            psig: 1.0,
            beta: 0.0,
            mzsig: 15.0,
            msig: 0.0,
            molig: 0.0,
            massub: 5_000_000.0,
            masslb: 100.0,
            psfun: PeakShapeKind::Gaussian,
            mtabsig: 0.0,
            massbins: 100.0,
            psthresh: 6.0,
            speedyflag: false,
            linflag: -1,
            aggressiveflag: BaselineMode::Off,
            adductmass: 1.007_276_5,
            rawflag: ReadoutMode::Centroid,
            nativezub: 100.0,
            nativezlb: -200.0,
            poolflag: PoolingMode::Interpolate,
            intthresh: 0.0,
            peakshapeinflate: 1.0,
            isotopemode: IsotopeMode::Off,
            isotope_params: IsotopeParams::default(),
            orbimode: false,
            filterwidth: 20,
            zerolog: -12.0,
            peakwin: 500.0,
            peakthresh: 0.1,
            peaknorm: PeakNormalization::Max,
            doubledec: false,
            convergence_threshold: 1e-6,
        }
    }
}

impl Config {
    /// Resolve the derived parameters and guard against the values that
    /// would cause divisions by zero.
    pub fn normalize(&self) -> Result<NormalizedConfig> {
        if self.endz < self.startz {
            return Err(UniDecError::InvalidChargeRange {
                startz: self.startz,
                endz: self.endz,
            });
        }
        let mut config = self.clone();

        if config.psfun == PeakShapeKind::Gaussian {
            config.mzsig /= FWHM_TO_SIGMA;
        }
        let numz = (config.endz - config.startz + 1) as usize;

        let speedy = if config.linflag != -1 {
            config.linflag != 2
        } else {
            config.speedyflag
        };

        let fixed_mass_axis = config.massub < 0.0 || config.masslb < 0.0;
        config.massub = config.massub.abs();
        config.masslb = config.masslb.abs();

        if config.msig == 0.0 {
            config.msig = 0.00001;
        }
        if config.zsig == 0.0 {
            config.zsig = 0.00001;
        }
        if config.massbins == 0.0 {
            config.massbins = 1.0;
        }

        // Peak width reconvolution smoothing widens the effective peak.
        if config.psig < 0.0 {
            config.mzsig /= 3.0;
        }

        Ok(NormalizedConfig {
            config,
            numz,
            fixed_mass_axis,
            speedy,
        })
    }
}

/// A [`Config`] whose derived values have been resolved.
///
/// Dereferences to the underlying (normalized) [`Config`].
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedConfig {
    config: Config,
    pub numz: usize,
    pub fixed_mass_axis: bool,
    /// Circular (uniform spacing) convolution mode.
    pub speedy: bool,
}

impl NormalizedConfig {
    pub fn baseline_enabled(&self) -> bool {
        !matches!(self.config.aggressiveflag, BaselineMode::Off)
    }

    pub fn charge_states(&self) -> impl Iterator<Item = i32> + '_ {
        (0..self.numz).map(|j| self.config.startz + j as i32)
    }

    /// Number of iterations the driver will run at most.
    pub fn iteration_budget(&self) -> usize {
        self.config.numit.unsigned_abs() as usize
    }

    /// Window half width (in m/z) covered by a peak shape.
    pub fn peak_window_threshold(&self) -> f32 {
        self.config.psthresh * self.config.mzsig.abs() * self.config.peakshapeinflate
    }
}

impl Deref for NormalizedConfig {
    type Target = Config;

    fn deref(&self) -> &Config {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_defaults() {
        let normalized = Config::default().normalize().unwrap();
        assert_eq!(normalized.numz, 100);
        assert!(!normalized.fixed_mass_axis);
        assert!(!normalized.speedy);
        assert!((normalized.mzsig - 15.0 / FWHM_TO_SIGMA).abs() < 1e-6);
        assert_eq!(normalized.msig, 0.00001);
        assert_eq!(normalized.zsig, 1.0);
        assert!(!normalized.baseline_enabled());
    }

    #[test]
    fn test_normalize_fixed_mass_axis() {
        let config = Config {
            massub: -20000.0,
            masslb: 1000.0,
            ..Config::default()
        };
        let normalized = config.normalize().unwrap();
        assert!(normalized.fixed_mass_axis);
        assert_eq!(normalized.massub, 20000.0);
        assert_eq!(normalized.masslb, 1000.0);
    }

    #[test]
    fn test_normalize_zero_guards() {
        let config = Config {
            msig: 0.0,
            zsig: 0.0,
            massbins: 0.0,
            ..Config::default()
        };
        let normalized = config.normalize().unwrap();
        assert!(normalized.msig > 0.0);
        assert!(normalized.zsig > 0.0);
        assert_eq!(normalized.massbins, 1.0);
    }

    #[test]
    fn test_linflag_overrides_speedy() {
        let config = Config {
            linflag: 2,
            speedyflag: true,
            ..Config::default()
        };
        assert!(!config.normalize().unwrap().speedy);
        let config = Config {
            linflag: 0,
            speedyflag: false,
            ..Config::default()
        };
        assert!(config.normalize().unwrap().speedy);
    }

    #[test]
    fn test_lorentzian_keeps_fwhm() {
        let config = Config {
            psfun: PeakShapeKind::Lorentzian,
            mzsig: 2.0,
            ..Config::default()
        };
        assert_eq!(config.normalize().unwrap().mzsig, 2.0);
    }

    #[test]
    fn test_invalid_charge_range() {
        let config = Config {
            startz: 5,
            endz: 2,
            ..Config::default()
        };
        assert!(matches!(
            config.normalize(),
            Err(UniDecError::InvalidChargeRange { .. })
        ));
    }

    #[test]
    fn test_unknown_codes() {
        assert!(matches!(
            PoolingMode::try_from(7),
            Err(UniDecError::UnknownPoolingMode(7))
        ));
        assert_eq!(PoolingMode::try_from(2).unwrap(), PoolingMode::Smart);
        assert!(PeakShapeKind::try_from(3).is_err());
        assert!(ReadoutMode::try_from(2).unwrap().is_profile());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"startz": 2, "endz": 30, "poolflag": "smart"}"#).unwrap();
        assert_eq!(config.startz, 2);
        assert_eq!(config.endz, 30);
        assert_eq!(config.poolflag, PoolingMode::Smart);
        assert_eq!(config.numit, 50);
        assert_eq!(config.isotope_params, IsotopeParams::default());
    }
}
