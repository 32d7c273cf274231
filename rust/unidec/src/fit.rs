//! Reconstruction of the fitted spectrum from the final grid.
use rayon::prelude::*;

use crate::config::{
    BaselineMode,
    NormalizedConfig,
};
use crate::convolution::{
    convolve,
    sum_deltas,
};
use crate::grid::Grid2D;
use crate::isotopes::IsotopeTable;
use crate::peak_shape::PeakShape;
use crate::utils::{
    average,
    clip_negatives,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Fit {
    pub fitdat: Vec<f32>,
    /// Sum of squared residuals.
    pub error: f32,
    pub rsquared: f32,
}

/// Predicts the spectrum from `blur` and compares it to `data_int`.
///
/// The prediction is the convolved grid plus the baseline in iterative
/// baseline mode, clipped at zero. A flat spectrum has no variance to
/// explain, its R² is 1 for an exact fit and 0 otherwise.
#[allow(clippy::too_many_arguments)]
pub fn errfun_speedy(
    config: &NormalizedConfig,
    blur: &Grid2D<f32>,
    barr: &Grid2D<bool>,
    data_int: &[f32],
    baseline: &[f32],
    shape: Option<&PeakShape>,
    isotopes: Option<&IsotopeTable>,
) -> Fit {
    let deltas = sum_deltas(blur, barr, isotopes);
    let mut fitdat = match shape {
        Some(shape) if config.psig >= 0.0 => convolve(shape, &deltas, false),
        _ => deltas,
    };
    if config.aggressiveflag == BaselineMode::Iterative {
        fitdat
            .iter_mut()
            .zip(baseline.iter())
            .for_each(|(f, b)| *f += b);
    }
    clip_negatives(&mut fitdat);

    let fitmean = average(data_int) as f64;
    let (error, sstot) = fitdat
        .par_iter()
        .zip(data_int.par_iter())
        .map(|(&f, &d)| {
            let residual = (f - d) as f64;
            let spread = d as f64 - fitmean;
            (residual * residual, spread * spread)
        })
        .reduce(|| (0.0, 0.0), |a, b| (a.0 + b.0, a.1 + b.1));

    let rsquared = if sstot > 0.0 {
        1.0 - error / sstot
    } else if error == 0.0 {
        1.0
    } else {
        0.0
    };
    Fit {
        fitdat,
        error: error as f32,
        rsquared: rsquared as f32,
    }
}

/// Zeroes the fit over every run of two or more zero intensity points.
pub fn zero_fit_at_gaps(fitdat: &mut [f32], data_int: &[f32]) {
    for i in 0..data_int.len().saturating_sub(1) {
        if data_int[i] == 0.0 && data_int[i + 1] == 0.0 {
            fitdat[i] = 0.0;
            fitdat[i + 1] = 0.0;
        }
    }
}

/// Divides every charge column by its absolute charge.
pub fn charge_scaling(blur: &mut Grid2D<f32>, nztab: &[i32]) {
    blur.par_rows_mut().for_each(|(_, row)| {
        for (x, z) in row.iter_mut().zip(nztab.iter()) {
            let z = z.unsigned_abs();
            if z != 0 {
                *x /= z as f32;
            }
        }
    });
}
