//! Peak detection on the mass spectrum and the quality score of a run.
use crate::config::{
    NormalizedConfig,
    PeakNormalization,
};
use crate::decon::Decon;
use crate::input::Input;

/// Scores a finished deconvolution.
///
/// `threshold` is the minimum per peak score for a peak to count.
pub trait Scorer: Send + Sync {
    fn score(&self, config: &NormalizedConfig, decon: &Decon, input: &Input, threshold: f32) -> f32;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    pub mass: f32,
    pub height: f32,
}

/// Whether point `i` is the highest point within `window` of its mass and
/// at least `thresh` high. Ties go to the first point.
pub fn is_peak(massaxis: &[f32], values: &[f32], i: usize, window: f32, thresh: f32) -> bool {
    let y = values[i];
    if y < thresh {
        return false;
    }
    let x = massaxis[i];
    let start = massaxis.partition_point(|&m| m < x - window);
    let end = massaxis.partition_point(|&m| m <= x + window);
    (start..end).all(|k| values[k] < y || (values[k] == y && k >= i))
}

/// Local maxima of the mass spectrum above `peakthresh` times its maximum.
pub fn peak_detect(massaxis: &[f32], values: &[f32], peakwin: f32, peakthresh: f32) -> Vec<Peak> {
    let top = values.iter().copied().fold(0.0f32, f32::max);
    let thresh = peakthresh * top;
    (0..values.len())
        .filter(|&i| values[i] > 0.0 && is_peak(massaxis, values, i, peakwin, thresh))
        .map(|i| Peak {
            mass: massaxis[i],
            height: values[i],
        })
        .collect()
}

pub fn peak_norm(peaks: &mut [Peak], norm: PeakNormalization) {
    let divisor = match norm {
        PeakNormalization::None => return,
        PeakNormalization::Max => peaks.iter().map(|p| p.height).fold(0.0f32, f32::max),
        PeakNormalization::Sum => peaks.iter().map(|p| p.height).sum(),
    };
    if divisor != 0.0 {
        peaks.iter_mut().for_each(|p| p.height /= divisor);
    }
}

/// Half maximum crossings of a peak on the mass axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fwhm {
    pub low: f32,
    pub high: f32,
    /// Whether both crossings were found before the spectrum (or a deeper
    /// valley) ended.
    pub complete: bool,
}

/// Walks out from the apex at `index` until the signal drops below half
/// the apex height. A missing side mirrors the side that was found.
pub fn fwhm(massaxis: &[f32], values: &[f32], index: usize, fallback_width: f32) -> Fwhm {
    let peak = massaxis[index];
    let half = values[index] / 2.0;
    let crossing = |k: usize, inner: usize| {
        let (x0, y0, x1, y1) = (massaxis[inner], values[inner], massaxis[k], values[k]);
        if y0 == y1 { x1 } else { x0 + (half - y0) * (x1 - x0) / (y1 - y0) }
    };
    let low = (0..index)
        .rev()
        .find(|&k| values[k] < half)
        .map(|k| crossing(k, k + 1));
    let high = (index + 1..values.len())
        .find(|&k| values[k] < half)
        .map(|k| crossing(k, k - 1));
    match (low, high) {
        (Some(low), Some(high)) => Fwhm {
            low,
            high,
            complete: true,
        },
        (Some(low), None) => Fwhm {
            low,
            high: peak + (peak - low),
            complete: false,
        },
        (None, Some(high)) => Fwhm {
            low: peak - (high - peak),
            high,
            complete: false,
        },
        (None, None) => Fwhm {
            low: peak - fallback_width,
            high: peak + fallback_width,
            complete: false,
        },
    }
}

/// Score of a single detected peak.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakScore {
    pub peak: Peak,
    pub fwhm: Fwhm,
    /// Agreement between the fit and the data under the peak.
    pub uscore: f32,
    /// Peak shape quality, 1 for a fully resolved peak.
    pub fscore: f32,
    pub dscore: f32,
}

/// Default scorer: the R² of the fit, weighted by how well every detected
/// peak is explained by the data under it.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniScorer;

/// The score window covers twice the half width on each side of the apex.
const FWHM_WINDOW_FACTOR: f32 = 2.0;

impl UniScorer {
    /// Per charge relative fit error in the m/z range a mass window
    /// occupies, weighted by the intensity of that charge in the range.
    fn uscore(config: &NormalizedConfig, decon: &Decon, input: &Input, mlow: f32, mhigh: f32) -> f32 {
        let data_mz = input.data_mz();
        let data_int = input.data_int();
        let lengthmz = data_mz.len();
        if lengthmz == 0 || decon.fitdat.len() != lengthmz {
            return 0.0;
        }
        let mut weighted_error = 0.0f32;
        let mut total_weight = 0.0f32;
        for (j, &z) in input.nztab().iter().enumerate() {
            let z = z as f32;
            let mza = (mlow + z * config.adductmass) / z;
            let mzb = (mhigh + z * config.adductmass) / z;
            let (lmz, hmz) = if mza <= mzb { (mza, mzb) } else { (mzb, mza) };
            if hmz < data_mz[0] || lmz > data_mz[lengthmz - 1] {
                continue;
            }
            let start = data_mz.partition_point(|&x| x < lmz);
            let end = data_mz.partition_point(|&x| x <= hmz);
            if start >= end {
                continue;
            }
            let weight: f32 = (start..end).map(|k| decon.blur.get(k, j)).sum();
            if weight <= 0.0 {
                continue;
            }
            let data_sum: f32 = data_int[start..end].iter().map(|d| d.abs()).sum();
            let error = if data_sum > 0.0 {
                let diff: f32 = (start..end)
                    .map(|k| (data_int[k] - decon.fitdat[k]).abs())
                    .sum();
                (diff / data_sum).min(1.0)
            } else {
                1.0
            };
            weighted_error += weight * error;
            total_weight += weight;
        }
        if total_weight > 0.0 {
            1.0 - weighted_error / total_weight
        } else {
            0.0
        }
    }

    pub fn peak_scores(&self, config: &NormalizedConfig, decon: &Decon, input: &Input) -> Vec<PeakScore> {
        let massaxis = &decon.massaxis;
        let values = &decon.massaxisval;
        if massaxis.is_empty() || massaxis.len() != values.len() {
            return Vec::new();
        }
        let mut peaks = peak_detect(massaxis, values, config.peakwin, config.peakthresh);
        peak_norm(&mut peaks, config.peaknorm);

        peaks
            .into_iter()
            .map(|peak| {
                let index = massaxis.partition_point(|&m| m < peak.mass).min(massaxis.len() - 1);
                let fwhm = fwhm(massaxis, values, index, config.massbins);
                let mlow = peak.mass - (peak.mass - fwhm.low) * FWHM_WINDOW_FACTOR;
                let mhigh = peak.mass + (fwhm.high - peak.mass) * FWHM_WINDOW_FACTOR;
                let uscore = Self::uscore(config, decon, input, mlow, mhigh);
                let fscore = if fwhm.complete { 1.0 } else { 0.5 };
                PeakScore {
                    peak,
                    fwhm,
                    uscore,
                    fscore,
                    dscore: uscore * fscore,
                }
            })
            .collect()
    }
}

impl Scorer for UniScorer {
    fn score(&self, config: &NormalizedConfig, decon: &Decon, input: &Input, threshold: f32) -> f32 {
        let scores = self.peak_scores(config, decon, input);
        let (numerator, denominator) = scores
            .iter()
            .filter(|s| s.dscore > threshold)
            .fold((0.0f32, 0.0f32), |(n, d), s| {
                let h2 = s.peak.height * s.peak.height;
                (n + h2 * s.dscore, d + h2)
            });
        if denominator != 0.0 {
            decon.rsquared * numerator / denominator
        } else {
            0.0
        }
    }
}
