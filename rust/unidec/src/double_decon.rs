//! Second deconvolution of the mass spectrum against a measured kernel.
//!
//! The kernel (for example the mass spectrum of a reference compound) is
//! resampled onto the mass axis spacing, rotated so its apex sits at index
//! zero, and the mass spectrum is then sharpened with a Richardson-Lucy
//! deconvolution computed with real FFTs (circular convolution).
use realfft::num_complex::Complex;
use realfft::{
    ComplexToReal,
    RealFftPlanner,
    RealToComplex,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{
    debug,
    info,
};

use crate::errors::{
    Result,
    UniDecError,
};
use crate::utils::linear_interpolate_position;

const MAX_ITERATIONS: usize = 50;
const MIN_RELATIVE_CHANGE: f64 = 1e-4;

/// Empirical point spread function sampled on an ascending mass axis.
#[derive(Debug, Clone, PartialEq)]
pub struct PointSpreadKernel {
    x: Vec<f32>,
    y: Vec<f32>,
}

impl PointSpreadKernel {
    pub fn new(x: Vec<f32>, y: Vec<f32>) -> Result<Self> {
        if x.len() != y.len() {
            return Err(UniDecError::ExpectedSlicesSameLength {
                expected: x.len(),
                other: y.len(),
                context: "kernel axis and values".to_string(),
            });
        }
        if x.len() < 2 {
            return Err(UniDecError::InvalidKernel {
                context: format!("at least two points are needed, got {}", x.len()),
            });
        }
        if let Some(i) = x.windows(2).position(|w| w[1] <= w[0]) {
            return Err(UniDecError::InvalidKernel {
                context: format!("axis is not strictly ascending at index {}", i + 1),
            });
        }
        if !y.iter().any(|v| *v > 0.0) {
            return Err(UniDecError::InvalidKernel {
                context: "no positive values".to_string(),
            });
        }
        Ok(PointSpreadKernel { x, y })
    }

    pub fn x(&self) -> &[f32] {
        &self.x
    }

    pub fn y(&self) -> &[f32] {
        &self.y
    }

    /// Kernel values on an axis starting at the first kernel point with the
    /// given spacing. A coarser target spacing integrates the kernel over
    /// each bin with the trapezoid rule, a finer one interpolates it
    /// linearly. Integrated bins are expressed in kernel samples so the
    /// total is kept.
    pub fn resample(&self, spacing: f32) -> Vec<f32> {
        let kspacing = self.x[1] - self.x[0];
        if spacing <= 0.0 || spacing == kspacing {
            return self.y.clone();
        }
        let x0 = self.x[0];
        let span = self.x[self.x.len() - 1] - x0;
        let newlen = (span / spacing) as usize + 1;

        if spacing > kspacing {
            let half = spacing / 2.0;
            (0..newlen)
                .map(|n| {
                    let center = x0 + n as f32 * spacing;
                    self.trapezoid(center - half, center + half) / kspacing
                })
                .collect()
        } else {
            (0..newlen)
                .map(|n| {
                    let target = x0 + n as f32 * spacing;
                    let upper = self.x.partition_point(|&x| x < target).min(self.x.len() - 1);
                    if upper == 0 || self.x[upper] == target {
                        return self.y[upper];
                    }
                    let lower = upper - 1;
                    let mu = linear_interpolate_position(self.x[lower], self.x[upper], target);
                    self.y[lower] * (1.0 - mu) + self.y[upper] * mu
                })
                .collect()
        }
    }

    /// Trapezoid integral of the kernel between `lo` and `hi`, clipped to
    /// the kernel axis.
    fn trapezoid(&self, lo: f32, hi: f32) -> f32 {
        let at = |i: usize, target: f32| {
            let mu = linear_interpolate_position(self.x[i], self.x[i + 1], target);
            self.y[i] * (1.0 - mu) + self.y[i + 1] * mu
        };
        let first = self.x.partition_point(|&x| x <= lo).saturating_sub(1);
        let mut total = 0.0f32;
        for i in first..self.x.len() - 1 {
            if self.x[i] >= hi {
                break;
            }
            let a = self.x[i].max(lo);
            let b = self.x[i + 1].min(hi);
            if b <= a {
                continue;
            }
            total += (b - a) * (at(i, a) + at(i, b)) / 2.0;
        }
        total
    }
}

/// Forward and inverse real FFT plans of one length.
struct FftPair {
    len: usize,
    forward: Arc<dyn RealToComplex<f64>>,
    inverse: Arc<dyn ComplexToReal<f64>>,
}

impl FftPair {
    fn new(len: usize) -> Self {
        let mut planner = RealFftPlanner::<f64>::new();
        FftPair {
            len,
            forward: planner.plan_fft_forward(len),
            inverse: planner.plan_fft_inverse(len),
        }
    }

    fn transform(&self, signal: &[f64]) -> Result<Vec<Complex<f64>>> {
        let mut input = self.forward.make_input_vec();
        input.copy_from_slice(signal);
        let mut spectrum = self.forward.make_output_vec();
        self.forward.process(&mut input, &mut spectrum)?;
        Ok(spectrum)
    }

    /// Inverse transform of `a * b` (or `a * conj(b)` when `conjugate`),
    /// scaled so that it is the circular convolution (correlation).
    fn multiply_inverse(
        &self,
        a: &[Complex<f64>],
        b: &[Complex<f64>],
        conjugate: bool,
    ) -> Result<Vec<f64>> {
        let mut product: Vec<Complex<f64>> = a
            .iter()
            .zip(b.iter())
            .map(|(x, y)| if conjugate { x * y.conj() } else { x * y })
            .collect();
        // Imaginary parts of the DC (and Nyquist) bins of a real signal are 0.
        product[0].im = 0.0;
        if self.len % 2 == 0 {
            if let Some(last) = product.last_mut() {
                last.im = 0.0;
            }
        }
        let mut output = self.inverse.make_output_vec();
        self.inverse.process(&mut product, &mut output)?;
        let scale = self.len as f64;
        output.iter_mut().for_each(|x| *x /= scale);
        Ok(output)
    }
}

/// Richardson-Lucy deconvolution of `data` by the circular `kernel`.
///
/// Stops after 50 iterations or once the squared change of the estimate
/// relative to its sum drops to 1e-4. The result is normalized to a
/// maximum of one.
pub fn richardson_lucy_fft(kernel: &[f64], data: &[f64]) -> Result<Vec<f64>> {
    if kernel.len() != data.len() {
        return Err(UniDecError::ExpectedSlicesSameLength {
            expected: data.len(),
            other: kernel.len(),
            context: "kernel and data of the double deconvolution".to_string(),
        });
    }
    if data.is_empty() {
        return Err(UniDecError::ExpectedNonEmptyData {
            context: Some("double deconvolution".to_string()),
        });
    }
    let fft = FftPair::new(data.len());
    let kernel_ft = fft.transform(kernel)?;

    let mut estimate = data.to_vec();
    let mut iterations = 0;
    let mut change = 1.0f64;
    while iterations < MAX_ITERATIONS && change > MIN_RELATIVE_CHANGE {
        let estimate_ft = fft.transform(&estimate)?;
        let mut ratio = fft.multiply_inverse(&kernel_ft, &estimate_ft, false)?;
        ratio
            .iter_mut()
            .zip(data.iter())
            .filter(|(c, _)| **c != 0.0)
            .for_each(|(c, d)| *c = d / *c);

        let ratio_ft = fft.transform(&ratio)?;
        let correction = fft.multiply_inverse(&ratio_ft, &kernel_ft, true)?;

        let mut sum_diff = 0.0;
        let mut sum_est = 0.0;
        for (e, c) in estimate.iter_mut().zip(correction.iter()) {
            let next = c * *e;
            sum_diff += (*e - next).powi(2);
            sum_est += *e;
            *e = next;
        }
        change = if sum_est != 0.0 { sum_diff / sum_est } else { 0.0 };
        iterations += 1;
    }
    debug!(
        "Double deconvolution stopped after {} iterations, change {}",
        iterations, change
    );

    let top = estimate.iter().copied().fold(0.0f64, f64::max);
    if top > 0.0 {
        estimate.iter_mut().for_each(|x| *x /= top);
    }
    Ok(estimate)
}

/// Deconvolves the mass spectrum by `kernel` and keeps the part inside
/// `[masslb, massub]`. Returns the new mass axis and values.
pub fn double_deconvolve(
    kernel: &PointSpreadKernel,
    massaxis: &[f32],
    massaxisval: &[f32],
    masslb: f32,
    massub: f32,
) -> Result<(Vec<f32>, Vec<f32>)> {
    if massaxis.len() != massaxisval.len() {
        return Err(UniDecError::ExpectedSlicesSameLength {
            expected: massaxis.len(),
            other: massaxisval.len(),
            context: "mass axis of the double deconvolution".to_string(),
        });
    }
    if massaxis.len() < 2 {
        return Err(UniDecError::ExpectedNonEmptyData {
            context: Some("double deconvolution needs at least two mass bins".to_string()),
        });
    }
    let st = Instant::now();
    let spacing = massaxis[1] - massaxis[0];
    let resampled = kernel.resample(spacing);
    let length = resampled.len().max(massaxis.len());

    // Kernel normalized to its apex, apex rotated to index 0.
    let (apex, top) = resampled
        .iter()
        .enumerate()
        .fold((0, 0.0f32), |acc, (i, &v)| if v > acc.1 { (i, v) } else { acc });
    let mut real_kernel = vec![0.0f64; length];
    for (i, &v) in resampled.iter().enumerate() {
        real_kernel[(i + length - apex) % length] = (v / top) as f64;
    }

    let data_top = massaxisval.iter().copied().fold(0.0f32, f32::max);
    let mut data = vec![0.0f64; length];
    for (d, &v) in data.iter_mut().zip(massaxisval.iter()) {
        *d = if data_top > 0.0 { (v / data_top) as f64 } else { 0.0 };
    }

    let sharpened = richardson_lucy_fft(&real_kernel, &data)?;

    let first = massaxis[0];
    let (axis, values): (Vec<f32>, Vec<f32>) = (0..length)
        .map(|i| (first + i as f32 * spacing, sharpened[i] as f32))
        .filter(|(m, _)| *m >= masslb && *m <= massub)
        .unzip();
    info!(
        "Double deconvolution over {} bins ({} kept), took {:?}",
        length,
        axis.len(),
        st.elapsed()
    );
    Ok((axis, values))
}
