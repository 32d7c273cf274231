//! Peak shape convolution and the Richardson-Lucy update.
use rayon::prelude::*;

use crate::baseline::blur_baseline;
use crate::config::{
    BaselineMode,
    NormalizedConfig,
};
use crate::grid::Grid2D;
use crate::isotopes::IsotopeTable;
use crate::peak_shape::PeakShape;

/// Forward convolution of a 1D signal with the peak shape.
///
/// `out[i]` is the sum over the window of `i` of `deltas[k]` times the
/// contribution of a peak at `k` to `i`. With `reverse` the mirrored peak
/// shape is used (correlation).
pub fn convolve(shape: &PeakShape, deltas: &[f32], reverse: bool) -> Vec<f32> {
    (0..deltas.len())
        .into_par_iter()
        .map(|i| {
            let mut total = 0.0f32;
            shape.for_each_contribution(i, reverse, |k, w| total += deltas[k] * w);
            total
        })
        .collect()
}

/// Convolves every charge column of `blur` with the peak shape, writing the
/// result to `out`. Returns the maximum of the result.
pub fn reconvolve(shape: &PeakShape, blur: &Grid2D<f32>, out: &mut Grid2D<f32>) -> f32 {
    let numz = blur.ncols();
    out.par_rows_mut()
        .map(|(i, row)| {
            row.iter_mut().for_each(|x| *x = 0.0);
            shape.for_each_contribution(i, false, |k, w| {
                let source = &blur.as_slice()[k * numz..(k + 1) * numz];
                row.iter_mut()
                    .zip(source.iter())
                    .for_each(|(x, b)| *x += b * w);
            });
            row.iter().copied().fold(0.0f32, f32::max)
        })
        .reduce(|| 0.0f32, f32::max)
}

/// Collapses the grid into one value per spectrum point.
///
/// Without isotopes this is the sum over charges of the accepted cells,
/// with isotopes every cell is spread over its isotope peaks.
pub fn sum_deltas(blur: &Grid2D<f32>, barr: &Grid2D<bool>, isotopes: Option<&IsotopeTable>) -> Vec<f32> {
    match isotopes {
        Some(table) => table.scatter_deltas(blur, barr),
        None => blur
            .par_rows()
            .map(|(i, row)| {
                row.iter()
                    .enumerate()
                    .filter(|(j, _)| barr.get(i, *j))
                    .map(|(_, x)| *x)
                    .sum()
            })
            .collect(),
    }
}

/// Multiplies every accepted cell by the ratio of its point (or the
/// isotope weighted ratios of its peaks). Rejected cells are zeroed.
pub fn apply_ratios(
    blur: &Grid2D<f32>,
    barr: &Grid2D<bool>,
    isotopes: Option<&IsotopeTable>,
    ratios: &[f32],
    out: &mut Grid2D<f32>,
) {
    match isotopes {
        Some(table) => table.gather_ratios(blur, barr, ratios, out),
        None => out.par_rows_mut().for_each(|(i, row)| {
            for (j, x) in row.iter_mut().enumerate() {
                *x = if barr.get(i, j) {
                    blur.get(i, j) * ratios[i]
                } else {
                    0.0
                };
            }
        }),
    }
}

/// Read-only inputs of a Richardson-Lucy update.
#[derive(Debug, Clone, Copy)]
pub struct UpdateContext<'a> {
    pub config: &'a NormalizedConfig,
    pub data_mz: &'a [f32],
    /// Observed intensities, baseline subtracted when that mode is on.
    pub data_int: &'a [f32],
    pub barr: &'a Grid2D<bool>,
    pub shape: Option<&'a PeakShape>,
    pub isotopes: Option<&'a IsotopeTable>,
}

/// One Richardson-Lucy step: `blur` is the current (blurred) estimate and
/// `out` receives the updated one.
///
/// The estimate is collapsed to the spectrum, convolved with the peak shape
/// to predict the observed intensities, and every accepted cell is then
/// scaled by the observed / predicted ratio at its point. In iterative
/// baseline mode the baseline is part of the prediction and gets the same
/// multiplicative update.
pub fn deconvolve_iteration_speedy(
    ctx: &UpdateContext<'_>,
    blur: &Grid2D<f32>,
    out: &mut Grid2D<f32>,
    baseline: &mut [f32],
) {
    let config = ctx.config;
    let iterative_baseline = config.aggressiveflag == BaselineMode::Iterative;
    if iterative_baseline && config.mzsig != 0.0 {
        blur_baseline(baseline, ctx.data_mz, config.mzsig.abs(), 0, config.filterwidth);
    }

    let deltas = sum_deltas(blur, ctx.barr, ctx.isotopes);
    let mut expected = match ctx.shape {
        Some(shape) if config.psig >= 0.0 => convolve(shape, &deltas, false),
        _ => deltas,
    };
    if iterative_baseline {
        expected
            .iter_mut()
            .zip(baseline.iter())
            .for_each(|(e, b)| *e += b);
    }

    let mut ratios: Vec<f32> = expected
        .iter()
        .zip(ctx.data_int.iter())
        .map(|(&e, &d)| if e > 0.0 && d > 0.0 { d / e } else { 0.0 })
        .collect();

    if config.mzsig < 0.0 {
        if let Some(shape) = ctx.shape {
            ratios = convolve(shape, &ratios, true);
        }
    }

    apply_ratios(blur, ctx.barr, ctx.isotopes, &ratios, out);

    if iterative_baseline {
        blur_baseline(&mut ratios, ctx.data_mz, config.mzsig.abs(), 0, config.filterwidth);
        baseline
            .iter_mut()
            .zip(ratios.iter())
            .for_each(|(b, r)| *b *= r);
    }
}
