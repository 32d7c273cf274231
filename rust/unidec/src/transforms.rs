//! Projection of the (point x charge) grid onto a uniform mass axis.
//!
//! Every projection fills a `mlen x numz` mass grid, the per bin sum over
//! charges is the mass spectrum (`massaxisval`).
use rayon::prelude::*;

use crate::config::PoolingMode;
use crate::grid::Grid2D;
use crate::utils::{
    cubic_interpolate,
    linear_interpolate,
    linear_interpolate_position,
    nearfast,
};

/// Minimum number of spectrum points a mass bin has to span before the
/// smart projection integrates instead of interpolating.
const SMART_INTEGRATION_POINTS: usize = 5;

/// Shared inputs of the projections.
#[derive(Debug, Clone, Copy)]
pub struct Projection<'a> {
    pub data_mz: &'a [f32],
    pub nztab: &'a [i32],
    pub mtab: &'a Grid2D<f32>,
    pub adductmass: f32,
    pub massaxis: &'a [f32],
    /// Exclusive mass bounds of the cells the integration considers.
    pub massmin: f32,
    pub massmax: f32,
}

#[derive(Debug, Clone)]
pub struct MassSpectrum {
    pub massaxisval: Vec<f32>,
    pub massgrid: Grid2D<f32>,
}

impl MassSpectrum {
    fn from_grid(massgrid: Grid2D<f32>) -> Self {
        let massaxisval = massgrid.row_apply(|row| row.iter().sum()).collect();
        MassSpectrum {
            massaxisval,
            massgrid,
        }
    }
}

impl Projection<'_> {
    pub fn project(&self, mode: PoolingMode, blur: &Grid2D<f32>) -> MassSpectrum {
        match mode {
            PoolingMode::Integrate => self.integrate(blur),
            PoolingMode::Interpolate => self.interpolate(blur),
            PoolingMode::Smart => self.smart(blur),
        }
    }

    #[inline]
    fn mz_of(&self, mass: f32, z: i32) -> f32 {
        let z = z as f32;
        (mass + z * self.adductmass) / z
    }

    /// Splits every cell between the two mass bins around its mass. Cells
    /// past the last bin are deposited whole on it, so the total is kept.
    pub fn integrate(&self, blur: &Grid2D<f32>) -> MassSpectrum {
        let mlen = self.massaxis.len();
        let numz = blur.ncols();
        if mlen == 0 {
            return MassSpectrum::from_grid(Grid2D::new_filled(0, numz, 0.0));
        }
        let flat = blur
            .par_rows()
            .fold(
                || vec![0.0f32; mlen * numz],
                |mut acc, (i, row)| {
                    for (j, &value) in row.iter().enumerate() {
                        let testmass = self.mtab.get(i, j);
                        if value == 0.0 || testmass <= self.massmin || testmass >= self.massmax {
                            continue;
                        }
                        let index = nearfast(self.massaxis, testmass);
                        let at = self.massaxis[index];
                        let neighbor = if at < testmass && index + 1 < mlen {
                            Some(index + 1)
                        } else if at > testmass && index > 0 {
                            Some(index - 1)
                        } else {
                            None
                        };
                        match neighbor {
                            Some(other) => {
                                let pos = linear_interpolate_position(at, self.massaxis[other], testmass);
                                acc[index * numz + j] += (1.0 - pos) * value;
                                acc[other * numz + j] += pos * value;
                            }
                            None => acc[index * numz + j] += value,
                        }
                    }
                    acc
                },
            )
            .reduce(
                || vec![0.0f32; mlen * numz],
                |mut a, b| {
                    a.iter_mut().zip(b.iter()).for_each(|(x, y)| *x += y);
                    a
                },
            );
        let massgrid = Grid2D::from_flat_vector(flat, mlen, numz)
            .unwrap_or_else(|_| Grid2D::new_filled(mlen, numz, 0.0));
        MassSpectrum::from_grid(massgrid)
    }

    /// Cubic interpolation of the grid at the m/z every mass bin implies,
    /// linear at the two outermost intervals.
    fn interpolate_at(&self, blur: &Grid2D<f32>, j: usize, mztest: f32) -> f32 {
        let data_mz = self.data_mz;
        let lengthmz = data_mz.len();
        if lengthmz < 2 || !(mztest > data_mz[0] && mztest < data_mz[lengthmz - 1]) {
            return 0.0;
        }
        let upper = data_mz.partition_point(|&x| x < mztest);
        if data_mz[upper] == mztest {
            return blur.get(upper, j).max(0.0);
        }
        let lower = upper - 1;
        let mu = linear_interpolate_position(data_mz[lower], data_mz[upper], mztest);
        let y1 = blur.get(lower, j);
        let y2 = blur.get(upper, j);
        let value = if lower >= 1 && upper + 1 < lengthmz {
            cubic_interpolate(blur.get(lower - 1, j), y1, y2, blur.get(upper + 1, j), mu)
        } else {
            linear_interpolate(y1, y2, mu)
        };
        value.max(0.0)
    }

    pub fn interpolate(&self, blur: &Grid2D<f32>) -> MassSpectrum {
        let numz = blur.ncols();
        let mut massgrid = Grid2D::new_filled(self.massaxis.len(), numz, 0.0f32);
        massgrid.par_rows_mut().for_each(|(i, row)| {
            for (j, x) in row.iter_mut().enumerate() {
                let mztest = self.mz_of(self.massaxis[i], self.nztab[j]);
                *x = self.interpolate_at(blur, j, mztest);
            }
        });
        MassSpectrum::from_grid(massgrid)
    }

    /// Interpolates where a mass bin spans few spectrum points and
    /// integrates (weighted by the overlap with the neighboring bins)
    /// where it spans many.
    pub fn smart(&self, blur: &Grid2D<f32>) -> MassSpectrum {
        let numz = blur.ncols();
        let mlen = self.massaxis.len();
        let data_mz = self.data_mz;
        let lengthmz = data_mz.len();
        let mut massgrid = Grid2D::new_filled(mlen, numz, 0.0f32);
        if lengthmz == 0 {
            return MassSpectrum::from_grid(massgrid);
        }
        let startmz = data_mz[0];
        let endmz = data_mz[lengthmz - 1];

        massgrid.par_rows_mut().for_each(|(i, row)| {
            let mtest = self.massaxis[i];
            let mlower = if i > 0 { self.massaxis[i - 1] } else { mtest };
            let mupper = if i + 1 < mlen { self.massaxis[i + 1] } else { mtest };
            for (j, x) in row.iter_mut().enumerate() {
                let z = self.nztab[j];
                let mztest = self.mz_of(mtest, z);
                let mzlower = self.mz_of(mlower, z);
                let mzupper = self.mz_of(mupper, z);
                // Negative charges flip the m/z order of the neighbors.
                let (mzlow, mzhigh) = if mzlower <= mzupper {
                    (mzlower, mzupper)
                } else {
                    (mzupper, mzlower)
                };
                if !(mzhigh > startmz && mzlow < endmz) {
                    continue;
                }
                let index1 = nearfast(data_mz, mzlow);
                let index2 = nearfast(data_mz, mzhigh);
                *x = if index2 - index1 < SMART_INTEGRATION_POINTS {
                    self.smart_interpolate(blur, j, mztest)
                } else {
                    let mut total = 0.0f32;
                    let mut weight = 0.0f32;
                    for k in index1..=index2 {
                        let kmz = data_mz[k];
                        let km = (kmz - self.adductmass) * z as f32;
                        let scale = if mztest < kmz && km < mupper {
                            linear_interpolate_position(mupper, mtest, km)
                        } else if kmz < mztest && km > mlower {
                            linear_interpolate_position(mlower, mtest, km)
                        } else if kmz == mztest {
                            1.0
                        } else {
                            0.0
                        };
                        total += scale * blur.get(k, j);
                        weight += scale;
                    }
                    if weight != 0.0 {
                        total /= weight;
                    }
                    total.max(0.0)
                };
            }
        });
        MassSpectrum::from_grid(massgrid)
    }

    /// Interpolation used by the smart projection. Past the last spectrum
    /// point the value decays linearly to zero over one point spacing.
    fn smart_interpolate(&self, blur: &Grid2D<f32>, j: usize, mztest: f32) -> f32 {
        let data_mz = self.data_mz;
        let lengthmz = data_mz.len();
        if lengthmz < 2 {
            return 0.0;
        }
        if mztest > data_mz[0] && mztest < data_mz[lengthmz - 1] {
            return self.interpolate_at(blur, j, mztest);
        }
        let (edge, inner) = if mztest <= data_mz[0] {
            (0, 1)
        } else {
            (lengthmz - 1, lengthmz - 2)
        };
        if data_mz[edge] == mztest {
            return blur.get(edge, j).max(0.0);
        }
        let spacing = (data_mz[edge] - data_mz[inner]).abs();
        if spacing == 0.0 {
            return 0.0;
        }
        let mu = ((mztest - data_mz[edge]).abs() / spacing).min(1.0);
        linear_interpolate(blur.get(edge, j), 0.0, mu).max(0.0)
    }
}
