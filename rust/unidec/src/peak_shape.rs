//! Peak shapes and their windows.
//!
//! Every spectrum point `i` gets a window `[start[i], end[i]]` of points
//! whose peak shape contribution to `i` is non negligible. Window bounds past
//! the edges of the spectrum are mirrored instead of truncated, so intensity
//! close to the edges is not lost. Two storage modes exist:
//!
//! - Bounded: a dense `L x (maxlength + 1)` table, row `i` holds the
//!   contributions of every point of the window of `i`, addressed relative to
//!   `start[i]`.
//! - Circular: a single length `L` kernel centered at index 0, addressed
//!   modulo `L`. Only valid for uniformly spaced m/z values.
use rayon::prelude::*;
use tracing::{
    debug,
    warn,
};

use crate::config::{
    NormalizedConfig,
    PeakShapeKind,
};
use crate::errors::{
    Result,
    UniDecError,
};
use crate::grid::{
    Grid2D,
    index_mod,
    reflect_index,
};
use crate::utils::nearfast;

/// FWHM² to variance factor used by the Gaussian half of the split shape.
const SPLIT_GAUSSIAN_VARIANCE: f32 = 0.180337;
const TABLE_WARN_BYTES: usize = 4 << 30;

impl PeakShapeKind {
    /// Peak shape centered at `x` evaluated at `y`.
    ///
    /// `sigma` must be non zero, see [`mz_peak_shape`] for the checked
    /// version.
    #[inline]
    pub fn evaluate(&self, x: f32, y: f32, sigma: f32) -> f32 {
        let d2 = (x - y) * (x - y);
        let half = sigma / 2.0;
        match self {
            PeakShapeKind::Gaussian => (-d2 / (2.0 * sigma * sigma)).exp(),
            PeakShapeKind::Lorentzian => half * half / (d2 + half * half),
            PeakShapeKind::SplitGaussianLorentzian => {
                if y < x {
                    (-d2 / (2.0 * sigma * sigma * SPLIT_GAUSSIAN_VARIANCE)).exp()
                } else {
                    half * half / (d2 + half * half)
                }
            }
        }
    }
}

pub fn mz_peak_shape(x: f32, y: f32, sigma: f32, kind: PeakShapeKind) -> Result<f32> {
    if sigma == 0.0 {
        return Err(UniDecError::ZeroPeakWidth);
    }
    Ok(kind.evaluate(x, y, sigma))
}

/// Start and end indices of every point's peak shape window.
///
/// Indices below 0 or above `L - 1` refer to mirrored points.
#[derive(Debug, Clone, PartialEq)]
pub struct Windows {
    pub start: Vec<isize>,
    pub end: Vec<isize>,
    pub maxlength: usize,
}

impl Windows {
    pub fn new(data_mz: &[f32], threshold: f32, circular: bool) -> Self {
        let lengthmz = data_mz.len();
        let last = lengthmz as isize - 1;
        let mut start = Vec::with_capacity(lengthmz);
        let mut end = Vec::with_capacity(lengthmz);
        let mut maxlength = 1usize;

        for &mz in data_mz.iter() {
            let low = mz - threshold;
            let s = if low < data_mz[0] && !circular {
                -(nearfast(data_mz, 2.0 * data_mz[0] - low) as isize)
            } else {
                nearfast(data_mz, low) as isize
            };

            let high = mz + threshold;
            let e = if high > data_mz[lengthmz - 1] && !circular {
                2 * last - nearfast(data_mz, 2.0 * data_mz[lengthmz - 1] - high) as isize
            } else {
                nearfast(data_mz, high) as isize
            };

            maxlength = maxlength.max((e - s) as usize);
            start.push(s);
            end.push(e);
        }

        Windows {
            start,
            end,
            maxlength,
        }
    }

    pub fn len(&self) -> usize {
        self.start.len()
    }

    pub fn is_empty(&self) -> bool {
        self.start.is_empty()
    }
}

/// m/z of a possibly mirrored point index.
#[inline]
fn virtual_mz(data_mz: &[f32], k: isize) -> f32 {
    let last = data_mz.len() - 1;
    let mirrored = data_mz[reflect_index(k, data_mz.len())];
    if k < 0 {
        2.0 * data_mz[0] - mirrored
    } else if k as usize > last {
        2.0 * data_mz[last] - mirrored
    } else {
        mirrored
    }
}

#[derive(Debug, Clone)]
enum Table {
    Bounded {
        forward: Grid2D<f32>,
        reverse: Option<Grid2D<f32>>,
    },
    Circular {
        forward: Vec<f32>,
        reverse: Option<Vec<f32>>,
    },
}

/// Peak shape tables for one spectrum.
#[derive(Debug, Clone)]
pub struct PeakShape {
    windows: Windows,
    table: Table,
    kind: PeakShapeKind,
    sigma: f32,
}

impl PeakShape {
    /// Builds the windows and tables for the configured peak width.
    ///
    /// The mirrored table is only built when `with_reverse` is set, it is
    /// needed by the symmetric update (`mzsig < 0`) and the transposed
    /// sharpening (`beta < 0`).
    pub fn build(data_mz: &[f32], config: &NormalizedConfig, with_reverse: bool) -> Result<Self> {
        if data_mz.is_empty() {
            return Err(UniDecError::ExpectedNonEmptyData {
                context: Some("Peak shape construction".to_string()),
            });
        }
        let threshold = config.peak_window_threshold();
        let windows = Windows::new(data_mz, threshold, config.speedy);
        debug!(
            "Peak shape windows built, threshold {} maxlength {}",
            threshold, windows.maxlength
        );
        let sigma = config.mzsig.abs() * config.peakshapeinflate;
        Self::with_windows(data_mz, windows, config.psfun, sigma, config.speedy, with_reverse)
    }

    /// Same windows, new width. Used to drop the peak shape inflation once
    /// the iterations are done.
    pub fn with_sigma(&self, data_mz: &[f32], sigma: f32) -> Result<Self> {
        let (circular, with_reverse) = match &self.table {
            Table::Bounded { reverse, .. } => (false, reverse.is_some()),
            Table::Circular { reverse, .. } => (true, reverse.is_some()),
        };
        Self::with_windows(
            data_mz,
            self.windows.clone(),
            self.kind,
            sigma,
            circular,
            with_reverse,
        )
    }

    fn with_windows(
        data_mz: &[f32],
        windows: Windows,
        kind: PeakShapeKind,
        sigma: f32,
        circular: bool,
        with_reverse: bool,
    ) -> Result<Self> {
        if sigma == 0.0 {
            return Err(UniDecError::ZeroPeakWidth);
        }
        let table = if circular {
            let forward = circular_kernel(data_mz, &windows, kind, sigma, false);
            let reverse =
                with_reverse.then(|| circular_kernel(data_mz, &windows, kind, sigma, true));
            Table::Circular { forward, reverse }
        } else {
            let width = windows.maxlength + 1;
            let bytes = data_mz.len() * width * std::mem::size_of::<f32>();
            if bytes > TABLE_WARN_BYTES {
                warn!(
                    "Peak shape table needs {} bytes, this may exhaust the memory",
                    bytes
                );
            }
            let forward = bounded_table(data_mz, &windows, kind, sigma, false);
            let reverse = with_reverse.then(|| bounded_table(data_mz, &windows, kind, sigma, true));
            Table::Bounded { forward, reverse }
        };
        Ok(PeakShape {
            windows,
            table,
            kind,
            sigma,
        })
    }

    pub fn windows(&self) -> &Windows {
        &self.windows
    }

    pub fn sigma(&self) -> f32 {
        self.sigma
    }

    pub fn kind(&self) -> PeakShapeKind {
        self.kind
    }

    pub fn has_reverse(&self) -> bool {
        match &self.table {
            Table::Bounded { reverse, .. } => reverse.is_some(),
            Table::Circular { reverse, .. } => reverse.is_some(),
        }
    }

    /// Calls `f(k, weight)` for every point `k` of the window of `i`, where
    /// `weight` is the contribution of a peak centered at `k` to point `i`.
    /// Mirrored points are resolved to their real index. With `reverse` the
    /// mirrored peak shape is used, falling back to the forward one when it
    /// was not built.
    #[inline]
    pub fn for_each_contribution(&self, i: usize, reverse: bool, mut f: impl FnMut(usize, f32)) {
        let lengthmz = self.windows.len();
        let start = self.windows.start[i];
        let end = self.windows.end[i];
        match &self.table {
            Table::Bounded {
                forward,
                reverse: rev,
            } => {
                let table = match (reverse, rev) {
                    (true, Some(r)) => r,
                    _ => forward,
                };
                let row = &table.as_slice()[i * table.ncols()..(i + 1) * table.ncols()];
                for (c, k) in (start..=end).enumerate() {
                    f(reflect_index(k, lengthmz), row[c]);
                }
            }
            Table::Circular {
                forward,
                reverse: rev,
            } => {
                let kernel = match (reverse, rev) {
                    (true, Some(r)) => r,
                    _ => forward,
                };
                for k in start..=end {
                    let k = k as usize;
                    f(k, kernel[index_mod(lengthmz, k, i as isize)]);
                }
            }
        }
    }
}

fn bounded_table(
    data_mz: &[f32],
    windows: &Windows,
    kind: PeakShapeKind,
    sigma: f32,
    reverse: bool,
) -> Grid2D<f32> {
    let width = windows.maxlength + 1;
    let mut table = Grid2D::new_filled(data_mz.len(), width, 0.0f32);
    table.par_rows_mut().for_each(|(i, row)| {
        let start = windows.start[i];
        for (c, k) in (start..=windows.end[i]).enumerate() {
            let center = virtual_mz(data_mz, k);
            row[c] = if reverse {
                kind.evaluate(data_mz[i], center, sigma)
            } else {
                kind.evaluate(center, data_mz[i], sigma)
            };
        }
    });
    table
}

fn circular_kernel(
    data_mz: &[f32],
    windows: &Windows,
    kind: PeakShapeKind,
    sigma: f32,
    reverse: bool,
) -> Vec<f32> {
    let lengthmz = data_mz.len();
    let mut kernel = vec![0.0f32; lengthmz];
    if lengthmz < 2 {
        kernel.iter_mut().for_each(|x| *x = 1.0);
        return kernel;
    }
    let binsize = data_mz[1] - data_mz[0];
    let reach = windows
        .start
        .iter()
        .zip(windows.end.iter())
        .map(|(s, e)| (e - s) as usize)
        .max()
        .unwrap_or(0)
        .div_ceil(2)
        .min((lengthmz - 1) / 2) as isize;
    for n in -reach..=reach {
        let offset = n as f32 * binsize;
        kernel[index_mod(lengthmz, 0, n)] = if reverse {
            kind.evaluate(offset, 0.0, sigma)
        } else {
            kind.evaluate(0.0, offset, sigma)
        };
    }
    kernel
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn axis(n: usize, step: f32) -> Vec<f32> {
        (0..n).map(|i| 500.0 + i as f32 * step).collect()
    }

    #[test]
    fn test_shapes() {
        let g = PeakShapeKind::Gaussian;
        assert_eq!(g.evaluate(1.0, 1.0, 0.5), 1.0);
        let s = 2.0f32;
        let at_sigma = g.evaluate(0.0, s, s);
        assert!((at_sigma - (-0.5f32).exp()).abs() < 1e-6);

        let l = PeakShapeKind::Lorentzian;
        // Half maximum at half the width.
        assert!((l.evaluate(0.0, 1.0, 2.0) - 0.5).abs() < 1e-6);

        let split = PeakShapeKind::SplitGaussianLorentzian;
        assert_eq!(split.evaluate(0.0, 1.0, 2.0), l.evaluate(0.0, 1.0, 2.0));
        assert!(split.evaluate(0.0, -1.0, 2.0) != l.evaluate(0.0, -1.0, 2.0));
        // FWHM convention of the Gaussian half.
        assert!((split.evaluate(0.0, -1.0, 2.0) - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_zero_sigma_is_fatal() {
        assert!(matches!(
            mz_peak_shape(1.0, 2.0, 0.0, PeakShapeKind::Gaussian),
            Err(UniDecError::ZeroPeakWidth)
        ));
        assert!(mz_peak_shape(1.0, 2.0, 1.0, PeakShapeKind::Lorentzian).is_ok());
    }

    #[test]
    fn test_windows_reflect_at_edges() {
        let data = axis(100, 1.0);
        let windows = Windows::new(&data, 3.0, false);
        assert_eq!(windows.start[0], -3);
        assert_eq!(windows.end[0], 3);
        assert_eq!(windows.start[50], 47);
        assert_eq!(windows.end[99], 102);
        assert_eq!(windows.maxlength, 6);

        let circular = Windows::new(&data, 3.0, true);
        assert_eq!(circular.start[0], 0);
        assert_eq!(circular.end[99], 99);
    }

    #[test]
    fn test_bounded_and_circular_agree_in_the_middle() {
        let data = axis(200, 0.1);
        let mut config = Config {
            mzsig: 0.5,
            psfun: PeakShapeKind::Lorentzian,
            ..Config::default()
        };
        let bounded = PeakShape::build(&data, &config.normalize().unwrap(), false).unwrap();
        config.speedyflag = true;
        let circular = PeakShape::build(&data, &config.normalize().unwrap(), false).unwrap();

        let collect = |shape: &PeakShape| {
            let mut out = Vec::new();
            shape.for_each_contribution(100, false, |k, w| out.push((k, w)));
            out
        };
        let a = collect(&bounded);
        let b = collect(&circular);
        assert_eq!(a.len(), b.len());
        for ((ka, wa), (kb, wb)) in a.iter().zip(b.iter()) {
            assert_eq!(ka, kb);
            assert!((wa - wb).abs() < 1e-4);
        }
    }

    #[test]
    fn test_edge_contributions_are_mirrored() {
        let data = axis(50, 1.0);
        let config = Config {
            mzsig: 1.0,
            psfun: PeakShapeKind::Lorentzian,
            ..Config::default()
        }
        .normalize()
        .unwrap();
        let shape = PeakShape::build(&data, &config, false).unwrap();
        let mut seen = Vec::new();
        shape.for_each_contribution(0, false, |k, w| seen.push((k, w)));
        // Point 1 appears twice, once real and once mirrored, with equal weight.
        let ones: Vec<f32> = seen.iter().filter(|(k, _)| *k == 1).map(|x| x.1).collect();
        assert_eq!(ones.len(), 2);
        assert!((ones[0] - ones[1]).abs() < 1e-6);
        assert!(seen.iter().all(|(k, _)| *k < data.len()));
    }
}
