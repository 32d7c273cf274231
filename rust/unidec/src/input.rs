//! One spectrum and the tables derived from it before a run.
//!
//! Building an [`Input`] validates the spectrum, computes the mass of every
//! (point, charge) cell and decides which cells may hold intensity at all
//! (the acceptance grid). Cells are accepted when their mass is inside the
//! configured bounds and their charge is plausible for that mass. An
//! optional list of reference masses narrows the acceptance further.
use rayon::prelude::*;
use std::time::Instant;
use tracing::{
    debug,
    info,
};

use crate::config::NormalizedConfig;
use crate::double_decon::PointSpreadKernel;
use crate::errors::{
    Result,
    UniDecError,
};
use crate::grid::Grid2D;
use crate::isotopes::IsotopeTable;
use crate::utils::{
    native_charge,
    nearfast,
};

#[derive(Debug, Clone)]
pub struct Input {
    data_mz: Vec<f32>,
    data_int: Vec<f32>,
    nztab: Vec<i32>,
    mtab: Grid2D<f32>,
    barr: Grid2D<bool>,
    isotopes: Option<IsotopeTable>,
    test_masses: Option<Vec<f32>>,
    kernel: Option<PointSpreadKernel>,
}

#[derive(Debug, Clone)]
pub struct InputBuilder {
    data_mz: Vec<f32>,
    data_int: Vec<f32>,
    test_masses: Option<Vec<f32>>,
    kernel: Option<PointSpreadKernel>,
}

impl InputBuilder {
    /// Restricts the accepted cells to the neighborhood of these masses.
    pub fn with_test_masses(mut self, test_masses: Vec<f32>) -> Self {
        self.test_masses = Some(test_masses);
        self
    }

    /// Kernel used by the double deconvolution pass.
    pub fn with_kernel(mut self, kernel: PointSpreadKernel) -> Self {
        self.kernel = Some(kernel);
        self
    }

    pub fn build(self, config: &NormalizedConfig) -> Result<Input> {
        let st = Instant::now();
        validate_spectrum(&self.data_mz, &self.data_int)?;

        let nztab: Vec<i32> = config.charge_states().collect();
        if nztab.contains(&0) {
            return Err(UniDecError::ZeroChargeState);
        }

        let lengthmz = self.data_mz.len();
        let numz = nztab.len();
        let mut mtab = Grid2D::new_filled(lengthmz, numz, 0.0f32);
        mtab.par_rows_mut().for_each(|(i, row)| {
            for (m, &z) in row.iter_mut().zip(nztab.iter()) {
                *m = self.data_mz[i] * z as f32 - config.adductmass * z as f32;
            }
        });

        let limits = Limits::new(config);
        let barr = match &self.test_masses {
            Some(masses) if config.mtabsig > 0.0 => {
                limits.windowed(&mtab, &nztab, masses, config.mtabsig)
            }
            Some(masses) => limits.nearest_points(&self.data_mz, &mtab, &nztab, masses, config.adductmass),
            None => limits.bounds(&mtab, &nztab),
        };

        let isotopes = if config.isotopemode.is_active() {
            Some(IsotopeTable::build(
                &self.data_mz,
                &nztab,
                &mtab,
                &barr,
                &config.isotope_params,
            )?)
        } else {
            None
        };

        let accepted = barr.as_slice().iter().filter(|b| **b).count();
        info!(
            "Input prepared: {} points, {} charge states, {} accepted cells, took {:?}",
            lengthmz,
            numz,
            accepted,
            st.elapsed()
        );

        Ok(Input {
            data_mz: self.data_mz,
            data_int: self.data_int,
            nztab,
            mtab,
            barr,
            isotopes,
            test_masses: self.test_masses,
            kernel: self.kernel,
        })
    }
}

fn validate_spectrum(data_mz: &[f32], data_int: &[f32]) -> Result<()> {
    if data_mz.len() != data_int.len() {
        return Err(UniDecError::ExpectedSlicesSameLength {
            expected: data_mz.len(),
            other: data_int.len(),
            context: "m/z and intensity arrays".to_string(),
        });
    }
    if data_mz.is_empty() {
        return Err(UniDecError::ExpectedNonEmptyData {
            context: Some("spectrum".to_string()),
        });
    }
    for (i, w) in data_mz.windows(2).enumerate() {
        if w[1] == w[0] {
            return Err(UniDecError::DuplicateMz {
                index: i + 1,
                mz: w[1],
            });
        }
        if w[1] < w[0] {
            return Err(UniDecError::UnsortedMz { index: i + 1 });
        }
    }
    Ok(())
}

/// Mass bounds and native charge limits of the accepted cells.
struct Limits {
    masslb: f32,
    massub: f32,
    nativezlb: f32,
    nativezub: f32,
}

impl Limits {
    fn new(config: &NormalizedConfig) -> Self {
        Limits {
            masslb: config.masslb,
            massub: config.massub,
            nativezlb: config.nativezlb,
            nativezub: config.nativezub,
        }
    }

    fn accepts(&self, mass: f32, z: i32) -> bool {
        let native = native_charge(mass);
        let z = z as f32;
        mass < self.massub
            && mass > self.masslb
            && z < native + self.nativezub
            && z > native + self.nativezlb
    }

    fn bounds(&self, mtab: &Grid2D<f32>, nztab: &[i32]) -> Grid2D<bool> {
        let mut barr = Grid2D::new_filled(mtab.nrows(), mtab.ncols(), false);
        barr.par_rows_mut().for_each(|(i, row)| {
            for (j, b) in row.iter_mut().enumerate() {
                *b = self.accepts(mtab.get(i, j), nztab[j]);
            }
        });
        barr
    }

    /// Accepts cells within `window` of the closest reference mass.
    fn windowed(&self, mtab: &Grid2D<f32>, nztab: &[i32], masses: &[f32], window: f32) -> Grid2D<bool> {
        let mut sorted = masses.to_vec();
        sorted.sort_unstable_by(|a, b| a.total_cmp(b));
        let mut barr = self.bounds(mtab, nztab);
        if sorted.is_empty() {
            barr.fill(false);
            return barr;
        }
        barr.par_rows_mut().for_each(|(i, row)| {
            for (j, b) in row.iter_mut().enumerate() {
                if *b {
                    let mass = mtab.get(i, j);
                    let closest = sorted[nearfast(&sorted, mass)];
                    *b = (closest - mass).abs() < window;
                }
            }
        });
        debug!("Reference masses restrict acceptance to a {} Da window", window);
        barr
    }

    /// Accepts only the point closest to every reference mass at every
    /// charge.
    fn nearest_points(
        &self,
        data_mz: &[f32],
        mtab: &Grid2D<f32>,
        nztab: &[i32],
        masses: &[f32],
        adductmass: f32,
    ) -> Grid2D<bool> {
        let mut barr = Grid2D::new_filled(mtab.nrows(), mtab.ncols(), false);
        for &mass in masses {
            for (j, &z) in nztab.iter().enumerate() {
                let mztest = (mass + adductmass * z as f32) / z as f32;
                let k = nearfast(data_mz, mztest);
                if self.accepts(mtab.get(k, j), z) {
                    barr.insert(k, j, true);
                }
            }
        }
        debug!("Reference masses restrict acceptance to their closest points");
        barr
    }
}

impl Input {
    pub fn builder(data_mz: Vec<f32>, data_int: Vec<f32>) -> InputBuilder {
        InputBuilder {
            data_mz,
            data_int,
            test_masses: None,
            kernel: None,
        }
    }

    /// Input without reference masses or kernel.
    pub fn new(config: &NormalizedConfig, data_mz: Vec<f32>, data_int: Vec<f32>) -> Result<Self> {
        Self::builder(data_mz, data_int).build(config)
    }

    pub fn len(&self) -> usize {
        self.data_mz.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data_mz.is_empty()
    }

    pub fn data_mz(&self) -> &[f32] {
        &self.data_mz
    }

    pub fn data_int(&self) -> &[f32] {
        &self.data_int
    }

    pub fn nztab(&self) -> &[i32] {
        &self.nztab
    }

    /// Mass of every (point, charge) cell.
    pub fn mtab(&self) -> &Grid2D<f32> {
        &self.mtab
    }

    /// Acceptance grid before any run specific pruning.
    pub fn barr(&self) -> &Grid2D<bool> {
        &self.barr
    }

    pub fn isotopes(&self) -> Option<&IsotopeTable> {
        self.isotopes.as_ref()
    }

    pub fn test_masses(&self) -> Option<&[f32]> {
        self.test_masses.as_deref()
    }

    pub fn kernel(&self) -> Option<&PointSpreadKernel> {
        self.kernel.as_ref()
    }
}

/// Rejects every cell that relies on a point at or below `intthresh`.
///
/// Without isotopes a weak point rejects all of its charge states, with
/// isotopes a cell is rejected when any of its main isotope peaks is weak.
pub fn kill_below_threshold(
    barr: &mut Grid2D<bool>,
    data_int: &[f32],
    intthresh: f32,
    isotopes: Option<&IsotopeTable>,
) {
    barr.par_rows_mut().for_each(|(i, row)| {
        for (j, b) in row.iter_mut().enumerate() {
            let weak = match isotopes {
                Some(table) => table.has_weak_peak(i, j, data_int, intthresh),
                None => data_int[i] <= intthresh,
            };
            if weak {
                *b = false;
            }
        }
    });
}
