//! Parametric isotope envelopes.
//!
//! The envelope of a molecule of mass `m` is modeled as an exponential tail
//! plus a Gaussian, both with mass dependent coefficients (see
//! [`IsotopeParams`]). For every accepted (point, charge) cell the isotope
//! peaks are mapped to the nearest spectrum points, which lets the
//! Richardson-Lucy update collapse and redistribute whole envelopes instead
//! of single points.
use rayon::prelude::*;
use tracing::debug;

use crate::config::IsotopeParams;
use crate::errors::{
    Result,
    UniDecError,
};
use crate::grid::{
    Grid2D,
    Grid3D,
};
use crate::utils::nearfast;

/// Mass difference between consecutive isotope peaks.
pub const ISOTOPE_MASS_DIFF: f32 = 1.0026;
const SQRT_2PI: f32 = 2.506_628_3;
const MIN_ISOTOPE_LENGTH: usize = 4;

impl IsotopeParams {
    pub fn mid(&self, mass: f32) -> f32 {
        self.0[4] + self.0[5] * mass.powf(self.0[6])
    }

    pub fn sig(&self, mass: f32) -> f32 {
        self.0[7] + self.0[8] * mass.powf(self.0[9])
    }

    pub fn alpha(&self, mass: f32) -> f32 {
        self.0[0] * (-mass * self.0[1]).exp()
    }

    pub fn beta(&self, mass: f32) -> f32 {
        self.0[2] * (-mass * self.0[3]).exp()
    }

    /// Relative abundances of the first `isolength` isotope peaks of `mass`,
    /// normalized to sum to one.
    pub fn envelope(&self, mass: f32, isolength: usize) -> Result<Vec<f32>> {
        let mass = mass.abs();
        let mid = self.mid(mass);
        let sig = self.sig(mass);
        if sig == 0.0 {
            return Err(UniDecError::ZeroIsotopeSigma { mass });
        }
        let alpha = self.alpha(mass);
        let beta = self.beta(mass);

        let mut out: Vec<f32> = (0..isolength)
            .map(|k| {
                let k = k as f32;
                let tail = alpha * (-k * beta).exp();
                let gauss = (1.0 - alpha) / (sig.abs() * SQRT_2PI)
                    * (-(k - mid).powi(2) / (2.0 * sig * sig)).exp();
                tail + gauss
            })
            .collect();
        crate::utils::simp_norm_sum(&mut out);
        Ok(out)
    }

    /// Number of isotope peaks needed to cover every mass in `masses`.
    pub fn isotope_length(&self, masses: impl Iterator<Item = f32>) -> usize {
        let (maxmid, maxsig) = masses.fold((0.0f32, 0.0f32), |(mid, sig), m| {
            let m = m.abs();
            (mid.max(self.mid(m)), sig.max(self.sig(m)))
        });
        ((maxmid + 4.0 * maxsig) as usize).max(MIN_ISOTOPE_LENGTH)
    }
}

/// Isotope positions and weights for every (point, charge) cell.
#[derive(Debug, Clone)]
pub struct IsotopeTable {
    isolength: usize,
    pos: Grid3D<usize>,
    val: Grid3D<f32>,
}

impl IsotopeTable {
    pub fn build(
        data_mz: &[f32],
        nztab: &[i32],
        mtab: &Grid2D<f32>,
        barr: &Grid2D<bool>,
        params: &IsotopeParams,
    ) -> Result<Self> {
        let lengthmz = data_mz.len();
        let numz = nztab.len();
        let isolength = params.isotope_length(
            barr.as_slice()
                .iter()
                .zip(mtab.as_slice().iter())
                .filter(|(b, _)| **b)
                .map(|(_, m)| *m),
        );
        debug!("Isotope length: {}", isolength);

        let dims = (lengthmz, numz, isolength);
        let mut pos = Grid3D::new_filled(dims, 0usize);
        let mut val = Grid3D::new_filled(dims, 0.0f32);

        pos.par_planes_mut()
            .zip(val.par_planes_mut())
            .try_for_each(|((i, pos_plane), (_, val_plane))| -> Result<()> {
                for j in 0..numz {
                    if !barr.get(i, j) {
                        continue;
                    }
                    let z = nztab[j].unsigned_abs() as f32;
                    let envelope = params.envelope(mtab.get(i, j), isolength)?;
                    let lane = j * isolength..(j + 1) * isolength;
                    for ((k, p), v) in pos_plane[lane.clone()]
                        .iter_mut()
                        .enumerate()
                        .zip(val_plane[lane].iter_mut())
                    {
                        let mz = data_mz[i] + k as f32 * ISOTOPE_MASS_DIFF / z;
                        *p = nearfast(data_mz, mz);
                        *v = envelope[k];
                    }
                }
                Ok(())
            })?;

        Ok(IsotopeTable {
            isolength,
            pos,
            val,
        })
    }

    pub fn isolength(&self) -> usize {
        self.isolength
    }

    /// Spectrum positions and weights of the isotope peaks of cell `(i, j)`.
    pub fn peaks(&self, i: usize, j: usize) -> impl Iterator<Item = (usize, f32)> + '_ {
        self.pos
            .lane(i, j)
            .iter()
            .copied()
            .zip(self.val.lane(i, j).iter().copied())
    }

    /// Collapses the grid into a 1D signal, spreading every cell over its
    /// isotope peaks.
    pub fn scatter_deltas(&self, blur: &Grid2D<f32>, barr: &Grid2D<bool>) -> Vec<f32> {
        let lengthmz = blur.nrows();
        blur.par_rows()
            .fold(
                || vec![0.0f32; lengthmz],
                |mut acc, (i, row)| {
                    for (j, &b) in row.iter().enumerate() {
                        if !barr.get(i, j) {
                            continue;
                        }
                        for (pos, val) in self.peaks(i, j) {
                            acc[pos] += b * val;
                        }
                    }
                    acc
                },
            )
            .reduce(
                || vec![0.0f32; lengthmz],
                |mut a, b| {
                    a.iter_mut().zip(b.iter()).for_each(|(x, y)| *x += y);
                    a
                },
            )
    }

    /// Multiplies every accepted cell by the isotope weighted sum of the
    /// ratios at its peaks.
    pub fn gather_ratios(
        &self,
        blur: &Grid2D<f32>,
        barr: &Grid2D<bool>,
        ratios: &[f32],
        out: &mut Grid2D<f32>,
    ) {
        out.par_rows_mut().for_each(|(i, row)| {
            for (j, x) in row.iter_mut().enumerate() {
                *x = if barr.get(i, j) {
                    let factor: f32 = self.peaks(i, j).map(|(pos, val)| val * ratios[pos]).sum();
                    blur.get(i, j) * factor
                } else {
                    0.0
                };
            }
        });
    }

    /// Moves each cell's intensity from the monoisotopic position onto the
    /// whole envelope, turning monoisotopic masses into average masses.
    pub fn monotopic_to_average(&self, blur: &mut Grid2D<f32>, barr: &Grid2D<bool>) {
        let lengthmz = blur.nrows();
        let numz = blur.ncols();
        let columns: Vec<Vec<f32>> = (0..numz)
            .into_par_iter()
            .map(|j| {
                let mut column = vec![0.0f32; lengthmz];
                for i in 0..lengthmz {
                    if !barr.get(i, j) {
                        continue;
                    }
                    let top = blur.get(i, j);
                    for (pos, val) in self.peaks(i, j) {
                        column[pos] += top * val;
                    }
                }
                column
            })
            .collect();

        blur.par_rows_mut().for_each(|(i, row)| {
            for (j, x) in row.iter_mut().enumerate() {
                *x = columns[j][i];
            }
        });
    }

    /// Whether any significant isotope peak of `(i, j)` sits on a point with
    /// intensity at or below `intthresh`.
    pub fn has_weak_peak(&self, i: usize, j: usize, data_int: &[f32], intthresh: f32) -> bool {
        let top = self
            .val
            .lane(i, j)
            .iter()
            .copied()
            .fold(0.0f32, f32::max);
        self.peaks(i, j)
            .any(|(pos, val)| val > 0.5 * top && data_int[pos] <= intthresh)
    }
}
