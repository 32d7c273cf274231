//! Sharpening and smoothing passes applied to the grid between iterations.
use rayon::prelude::*;

use crate::convolution::{
    convolve,
    reconvolve,
    sum_deltas,
};
use crate::grid::Grid2D;
use crate::isotopes::IsotopeTable;
use crate::peak_shape::PeakShape;

/// Exponential re-weighting of `values` that keeps their sum.
///
/// Every value becomes `exp(beta * x) - min`, rescaled so the total is
/// unchanged. Returns false (leaving `values` untouched) when all values
/// are equal and there is nothing to sharpen.
fn softmax_in_place(values: &mut [f32], beta: f32) -> bool {
    let sum1: f32 = values.iter().sum();
    let exps: Vec<f32> = values.iter().map(|&d| (beta * d).exp()).collect();
    let min2 = exps.iter().copied().fold(f32::INFINITY, f32::min);
    let sum2: f32 = exps.iter().sum();
    let denom = sum2 - min2 * values.len() as f32;
    if denom == 0.0 || !denom.is_finite() {
        return false;
    }
    let factor = sum1 / denom;
    if factor > 0.0 {
        values
            .iter_mut()
            .zip(exps.iter())
            .for_each(|(x, e)| *x = (e - min2) * factor);
    } else {
        values.iter_mut().for_each(|x| *x = 0.0);
    }
    true
}

/// Sharpens every point toward its dominant charge state.
///
/// A negative `beta` sharpens the whole grid at once instead of row by row.
pub fn softargmax(blur: &mut Grid2D<f32>, beta: f32) {
    if beta < 0.0 {
        softargmax_everything(blur, beta.abs());
        return;
    }
    blur.par_rows_mut().for_each(|(_, row)| {
        softmax_in_place(row, beta);
    });
}

pub fn softargmax_everything(blur: &mut Grid2D<f32>, beta: f32) {
    softmax_in_place(blur.as_mut_slice(), beta);
}

/// Sharpens each charge state along the m/z axis, then rescales every point
/// so the convolved signal matches the one before sharpening.
pub fn softargmax_transposed(
    blur: &mut Grid2D<f32>,
    barr: &Grid2D<bool>,
    beta: f32,
    shape: Option<&PeakShape>,
    isotopes: Option<&IsotopeTable>,
) {
    let convolved = |grid: &Grid2D<f32>| {
        let deltas = sum_deltas(grid, barr, isotopes);
        match shape {
            Some(shape) => convolve(shape, &deltas, shape.has_reverse()),
            None => deltas,
        }
    };
    let before = convolved(blur);

    let numz = blur.ncols();
    let columns: Vec<Vec<f32>> = (0..numz)
        .into_par_iter()
        .map(|j| {
            let mut column = blur.column(j);
            softmax_in_place(&mut column, beta);
            column
        })
        .collect();
    blur.par_rows_mut().for_each(|(i, row)| {
        for (j, x) in row.iter_mut().enumerate() {
            *x = columns[j][i];
        }
    });

    let after = convolved(blur);
    blur.par_rows_mut().for_each(|(i, row)| {
        let scale = if after[i] > 0.0 { before[i] / after[i] } else { 0.0 };
        for (j, x) in row.iter_mut().enumerate() {
            *x = if barr.get(i, j) { *x * scale } else { 0.0 };
        }
    });
}

/// Moving mean of half width `width` along the m/z axis of accepted cells.
pub fn point_smoothing(blur: &mut Grid2D<f32>, barr: &Grid2D<bool>, width: usize) {
    let lengthmz = blur.nrows();
    let source = blur.clone();
    blur.par_rows_mut().for_each(|(i, row)| {
        let low = i.saturating_sub(width);
        let high = (i + width + 1).min(lengthmz);
        for (j, x) in row.iter_mut().enumerate() {
            if barr.get(i, j) {
                let total: f32 = (low..high).map(|k| source.get(k, j)).sum();
                *x = total / (high - low) as f32;
            }
        }
    });
}

/// Smooths the grid by reconvolving it with the peak shape.
pub fn point_smoothing_peak_width(blur: &mut Grid2D<f32>, barr: &Grid2D<bool>, shape: &PeakShape) {
    let mut smoothed = Grid2D::new_filled(blur.nrows(), blur.ncols(), 0.0f32);
    reconvolve(shape, blur, &mut smoothed);
    blur.par_rows_mut().for_each(|(i, row)| {
        for (j, x) in row.iter_mut().enumerate() {
            *x = if barr.get(i, j) { smoothed.get(i, j) } else { 0.0 };
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_softargmax_keeps_row_sums() {
        let mut grid =
            Grid2D::from_flat_vector(vec![1.0, 2.0, 3.0, 0.5, 0.5, 4.0], 2, 3).unwrap();
        let before: Vec<f32> = grid.row_apply(|r| r.iter().sum()).collect();
        softargmax(&mut grid, 1.0);
        let after: Vec<f32> = grid.row_apply(|r| r.iter().sum()).collect();
        for (a, b) in before.iter().zip(after.iter()) {
            assert!((a - b).abs() < 1e-4);
        }
        // The dominant charge gets relatively stronger.
        assert!(grid.get(0, 2) / grid.get(0, 1) > 1.5);
        assert_eq!(grid.get(0, 0), 0.0);
    }

    #[test]
    fn test_softargmax_flat_rows_are_kept() {
        let mut grid = Grid2D::new_filled(3, 1, 2.0f32);
        softargmax(&mut grid, 1.0);
        assert!(grid.as_slice().iter().all(|x| *x == 2.0));
    }

    #[test]
    fn test_global_softargmax_keeps_total() {
        let mut grid =
            Grid2D::from_flat_vector(vec![1.0, 2.0, 3.0, 0.5, 0.5, 4.0], 2, 3).unwrap();
        softargmax(&mut grid, -1.0);
        let total: f32 = grid.as_slice().iter().sum();
        assert!((total - 11.0).abs() < 1e-3);
        assert!(grid.get(1, 2) > grid.get(0, 2));
    }

    #[test]
    fn test_transposed_keeps_the_signal() {
        let values: Vec<f32> = (0..40)
            .map(|i| if (15..25).contains(&i) { 1.0 + (i % 3) as f32 } else { 0.1 })
            .collect();
        let mut grid = Grid2D::from_flat_vector(values, 20, 2).unwrap();
        let barr = Grid2D::new_filled(20, 2, true);
        let before = sum_deltas(&grid, &barr, None);
        softargmax_transposed(&mut grid, &barr, 0.5, None, None);
        let after = sum_deltas(&grid, &barr, None);
        // Rows made only of the column minimum are sharpened away, the rest
        // keep their convolved intensity.
        for (a, b) in before.iter().zip(after.iter()) {
            if *a > 0.5 {
                assert!((a - b).abs() < 1e-3 * a);
            } else {
                assert_eq!(*b, 0.0);
            }
        }
    }

    #[test]
    fn test_point_smoothing() {
        let mut grid = Grid2D::new_filled(10, 2, 3.0f32);
        let barr = Grid2D::new_filled(10, 2, true);
        point_smoothing(&mut grid, &barr, 2);
        assert!(grid.as_slice().iter().all(|x| (x - 3.0).abs() < 1e-6));

        let mut spike = Grid2D::new_filled(10, 1, 0.0f32);
        spike.insert(5, 0, 5.0);
        let barr = Grid2D::new_filled(10, 1, true);
        point_smoothing(&mut spike, &barr, 2);
        assert!((spike.get(5, 0) - 1.0).abs() < 1e-6);
        assert!((spike.get(3, 0) - 1.0).abs() < 1e-6);
        assert_eq!(spike.get(2, 0), 0.0);
    }
}
