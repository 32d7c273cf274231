//! Baseline estimation filters.
//!
//! Both filters sample the signal on a strided window around every point,
//! mirroring samples that fall off either end of the spectrum.
use rayon::prelude::*;

use crate::grid::reflect_index;

const MIDBLUR_WINDOW: isize = 25;

/// Replaces every value with the mean of the lower half of a 50 sample
/// window taken every `mult` points. A `mult` of zero picks a stride from the
/// spectrum length.
pub fn midblur_baseline(baseline: &mut [f32], mult: usize) {
    let lengthmz = baseline.len();
    if lengthmz == 0 {
        return;
    }
    let mult = if mult == 0 { lengthmz / 400 } else { mult }.max(1) as isize;
    let temp = baseline.to_vec();

    baseline.par_iter_mut().enumerate().for_each(|(i, out)| {
        let mut window: Vec<f32> = (-MIDBLUR_WINDOW..MIDBLUR_WINDOW)
            .map(|j| temp[reflect_index(i as isize + j * mult, lengthmz)])
            .collect();
        window.sort_unstable_by(|a, b| a.total_cmp(b));
        let lower = &window[..MIDBLUR_WINDOW as usize];
        *out = lower.iter().sum::<f32>() / lower.len() as f32;
    });
}

/// Moving mean over `2 * filterwidth` samples. Without an explicit `mult`
/// the stride is two peak widths in points.
pub fn blur_baseline(baseline: &mut [f32], data_mz: &[f32], mzsig: f32, mult: usize, filterwidth: usize) {
    let lengthmz = baseline.len();
    if lengthmz < 2 {
        return;
    }
    let temp = baseline.to_vec();
    let window = filterwidth as isize;

    baseline.par_iter_mut().enumerate().for_each(|(i, out)| {
        let mzdiff = if i > 0 {
            data_mz[i] - data_mz[i - 1]
        } else {
            data_mz[1] - data_mz[0]
        };
        let stride = if mult == 0 && mzdiff > 0.0 {
            (2.0 * mzsig / mzdiff) as isize
        } else {
            mult as isize
        }
        .max(1);

        let total: f32 = (-window..window)
            .map(|j| temp[reflect_index(i as isize + j * stride, lengthmz)])
            .sum();
        *out = total / (2 * filterwidth + 1) as f32;
    });
}

/// Estimates a baseline from the data: two median-style passes give a
/// first guess, which is then corrected by the smoothed data/guess ratio.
pub fn deconvolve_baseline(data_int: &[f32], baseline: &mut [f32]) {
    midblur_baseline(baseline, 0);
    midblur_baseline(baseline, 5);

    let mut ratio: Vec<f32> = baseline
        .iter()
        .zip(data_int.iter())
        .map(|(&b, &d)| if b != 0.0 && d >= 0.0 { d / b } else { b })
        .collect();
    midblur_baseline(&mut ratio, 0);
    midblur_baseline(&mut ratio, 5);

    baseline
        .iter_mut()
        .zip(ratio.iter())
        .for_each(|(b, r)| *b *= r);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_midblur_keeps_constant() {
        let mut data = vec![3.0f32; 500];
        midblur_baseline(&mut data, 0);
        assert!(data.iter().all(|x| (x - 3.0).abs() < 1e-6));
    }

    #[test]
    fn test_midblur_ignores_narrow_peaks() {
        let mut data = vec![1.0f32; 500];
        for x in data[240..250].iter_mut() {
            *x = 100.0;
        }
        midblur_baseline(&mut data, 1);
        assert!(data.iter().all(|x| (x - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_blur_baseline_smooths() {
        let mz: Vec<f32> = (0..300).map(|i| 100.0 + i as f32).collect();
        let mut data = vec![2.0f32; 300];
        data[150] = 80.0;
        blur_baseline(&mut data, &mz, 0.5, 1, 10);
        assert!(data[150] < 10.0);
        assert!(data[0] > 1.5);
    }

    #[test]
    fn test_deconvolve_baseline_tracks_offset() {
        let data: Vec<f32> = (0..800)
            .map(|i| {
                let x = i as f32;
                5.0 + 100.0 * (-(x - 400.0).powi(2) / 20.0).exp()
            })
            .collect();
        let mut baseline = data.clone();
        deconvolve_baseline(&data, &mut baseline);
        assert!((baseline[50] - 5.0).abs() < 0.5);
        assert!(baseline[400] < 20.0);
    }
}
