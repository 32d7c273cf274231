//! Neighborhood blur.
//!
//! The blur is the smoothing prior of the deconvolution: every (point,
//! charge) cell is pulled toward the cells that would hold the same mass at
//! neighboring charge states, and optionally toward neighboring oligomer
//! masses. The neighbor of each offset is resolved once per run by
//! predicting its m/z and snapping it to the closest spectrum point
//! ([`SparseBlur::build`]). Every iteration then averages the current grid
//! over those links ([`SparseBlur::apply`]).
//!
//! Neighborhood layout: `zlength` charge offsets times `mlength` mass
//! offsets, flattened as `charge_offset * mlength + mass_offset`.
use rayon::prelude::*;
use std::time::Instant;
use tracing::{
    debug,
    info,
};

use crate::config::NormalizedConfig;
use crate::grid::Grid2D;
use crate::utils::{
    nearfast,
    simp_norm_sum,
};

/// Link from a cell to one of its neighbors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NeighborLink {
    /// `index` is the flat index of the neighbor in the (point x charge) grid.
    Live { index: usize, weight: f32 },
    /// The neighbor is inside the charge table but its predicted m/z has no
    /// close enough point, or that point is not accepted.
    Absent,
    /// The offset leaves the charge table (or lands on charge zero).
    OutsideCharges,
}

impl NeighborLink {
    #[inline]
    fn value(&self, blur: &[f32]) -> Option<f32> {
        match self {
            NeighborLink::Live { index, weight } => Some(blur[*index] * weight),
            NeighborLink::Absent => Some(0.0),
            NeighborLink::OutsideCharges => None,
        }
    }

    /// Log of the weighted neighbor, `zerolog` when it carries nothing.
    /// Every link counts in the log averages, including the ones outside
    /// the charge table.
    #[inline]
    fn log_value(&self, blur: &[f32], zerolog: f32) -> f32 {
        match self {
            NeighborLink::Live { index, weight } => {
                let v = blur[*index] * weight;
                if v > 0.0 { v.ln() } else { zerolog }
            }
            NeighborLink::Absent | NeighborLink::OutsideCharges => zerolog,
        }
    }
}

/// Averaging flavor of the blur, selected by the signs of `zsig` and `msig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlurMode {
    /// Weighted sum over all neighbors.
    Linear,
    /// Geometric mean over all neighbors.
    LogMean,
    /// Geometric mean across charges, Gaussian weighted sum across masses.
    ChargeLog,
    /// Gaussian weighted sum across charges, geometric mean across masses.
    MassLog,
}

impl BlurMode {
    pub fn select(zsig: f32, msig: f32) -> Self {
        if zsig >= 0.0 && msig >= 0.0 {
            BlurMode::LogMean
        } else if zsig > 0.0 && msig < 0.0 {
            BlurMode::ChargeLog
        } else if zsig < 0.0 && msig > 0.0 {
            BlurMode::MassLog
        } else {
            BlurMode::Linear
        }
    }
}

fn axis_length(sig: f32, both_positive: bool) -> usize {
    if both_positive {
        1 + 2 * (sig as usize)
    } else if sig != 0.0 {
        1 + 2 * ((3.0 * sig.abs() + 0.5) as usize)
    } else {
        1
    }
}

/// Gaussian weights of `length` offsets centered at zero.
fn axis_weights(sig: f32, length: usize) -> (Vec<i32>, Vec<f32>) {
    let center = (length / 2) as i32;
    let offsets: Vec<i32> = (0..length as i32).map(|i| i - center).collect();
    let mut weights: Vec<f32> = offsets
        .iter()
        .map(|&d| (-((d * d) as f32) / (2.0 * sig * sig)).exp())
        .collect();
    simp_norm_sum(&mut weights);
    (offsets, weights)
}

/// Offsets and weights of the neighborhood shared by every cell.
#[derive(Debug, Clone)]
pub struct BlurOffsets {
    pub mlength: usize,
    pub zlength: usize,
    pub mdist: Vec<f32>,
    pub zdist: Vec<f32>,
    pub closemind: Vec<i32>,
    pub closezind: Vec<i32>,
    pub closeval: Vec<f32>,
}

impl BlurOffsets {
    pub fn new(zsig: f32, msig: f32) -> Self {
        let both_positive = zsig >= 0.0 && msig >= 0.0;
        let zlength = axis_length(zsig, both_positive);
        let mlength = axis_length(msig, both_positive);
        let (zind, zdist) = axis_weights(zsig, zlength);
        let (mind, mdist) = axis_weights(msig, mlength);

        let numclose = zlength * mlength;
        let mut closemind = Vec::with_capacity(numclose);
        let mut closezind = Vec::with_capacity(numclose);
        let mut closeval = Vec::with_capacity(numclose);
        for (zi, zw) in zind.iter().zip(zdist.iter()) {
            for (mi, mw) in mind.iter().zip(mdist.iter()) {
                closezind.push(*zi);
                closemind.push(*mi);
                closeval.push(zw * mw);
            }
        }
        simp_norm_sum(&mut closeval);

        BlurOffsets {
            mlength,
            zlength,
            mdist,
            zdist,
            closemind,
            closezind,
            closeval,
        }
    }

    pub fn numclose(&self) -> usize {
        self.zlength * self.mlength
    }
}

/// Resolved neighbor links of every cell of one spectrum.
#[derive(Debug, Clone)]
pub struct SparseBlur {
    offsets: BlurOffsets,
    mode: BlurMode,
    numz: usize,
    links: Vec<NeighborLink>,
}

impl SparseBlur {
    /// Resolves the neighbors of every accepted cell and prunes the cells
    /// that are not supported by any other cell.
    ///
    /// A cell is kept when it has at least two live links, or when every
    /// link it could possibly have (the ones inside the charge table) is
    /// live. Pruning is skipped in isotope mode.
    pub fn build(
        config: &NormalizedConfig,
        data_mz: &[f32],
        nztab: &[i32],
        mtab: &Grid2D<f32>,
        barr: &mut Grid2D<bool>,
    ) -> Self {
        let st = Instant::now();
        let offsets = BlurOffsets::new(config.zsig, config.msig);
        let mode = BlurMode::select(config.zsig, config.msig);
        let numclose = offsets.numclose();
        let lengthmz = data_mz.len();
        let numz = nztab.len();
        let last = lengthmz - 1;

        let mut links = vec![NeighborLink::Absent; numclose * lengthmz * numz];
        let accepted: &Grid2D<bool> = barr;

        let prune: Vec<bool> = links
            .par_chunks_mut((numclose * numz).max(1))
            .enumerate()
            .flat_map_iter(|(i, row_links)| {
                let mzsig = if config.mzsig != 0.0 {
                    config.mzsig.abs()
                } else {
                    let i1 = i.saturating_sub(1);
                    let i2 = (i + 1).min(last);
                    let adaptive = 2.0 * (data_mz[i2] - data_mz[i1]).abs();
                    if adaptive > config.massbins || adaptive == 0.0 {
                        config.massbins * 2.0
                    } else {
                        adaptive
                    }
                };
                let threshold = mzsig * 2.0;

                let mut row_prune = vec![false; numz];
                for (j, cell_links) in row_links.chunks_mut(numclose).enumerate() {
                    if !accepted.get(i, j) {
                        cell_links.fill(NeighborLink::OutsideCharges);
                        continue;
                    }
                    let mut live = 0usize;
                    let mut possible = 0usize;
                    for (k, link) in cell_links.iter_mut().enumerate() {
                        let indz = j as i64 + offsets.closezind[k] as i64;
                        let z = nztab[j] + offsets.closezind[k];
                        if indz < 0 || indz >= numz as i64 || z == 0 {
                            *link = NeighborLink::OutsideCharges;
                            continue;
                        }
                        possible += 1;
                        let indz = indz as usize;
                        let mass = mtab.get(i, j) + offsets.closemind[k] as f32 * config.molig;
                        let point = (mass + config.adductmass * z as f32) / z as f32;
                        if point < data_mz[0] - threshold || point > data_mz[last] + threshold {
                            *link = NeighborLink::Absent;
                            continue;
                        }
                        let ind = nearfast(data_mz, point);
                        let closepoint = data_mz[ind];
                        *link = if accepted.get(ind, indz) && (point - closepoint).abs() < threshold
                        {
                            live += 1;
                            NeighborLink::Live {
                                index: accepted.index(ind, indz),
                                weight: offsets.closeval[k]
                                    * config.psfun.evaluate(point, closepoint, mzsig),
                            }
                        } else {
                            NeighborLink::Absent
                        };
                    }
                    row_prune[j] = live < possible.min(2) && !config.isotopemode.is_active();
                }
                row_prune
            })
            .collect();

        let mut pruned = 0usize;
        barr.as_mut_slice()
            .iter_mut()
            .zip(prune.iter())
            .filter(|(_, p)| **p)
            .for_each(|(b, _)| {
                if *b {
                    pruned += 1;
                }
                *b = false;
            });

        info!(
            "Blur neighborhood built: {} neighbors per cell, {:?} mode, {} cells pruned, took {:?}",
            numclose,
            mode,
            pruned,
            st.elapsed()
        );

        SparseBlur {
            offsets,
            mode,
            numz,
            links,
        }
    }

    pub fn numclose(&self) -> usize {
        self.offsets.numclose()
    }

    pub fn links(&self, i: usize, j: usize) -> &[NeighborLink] {
        let numclose = self.numclose();
        let start = (i * self.numz + j) * numclose;
        &self.links[start..start + numclose]
    }

    /// One blur pass, `out` receives the blurred `blur`. Rejected cells are 0.
    pub fn apply(&self, blur: &Grid2D<f32>, barr: &Grid2D<bool>, zerolog: f32, out: &mut Grid2D<f32>) {
        if self.numclose() == 1 {
            out.copy_from(blur);
            return;
        }
        let st = Instant::now();
        let values = blur.as_slice();
        out.par_rows_mut().for_each(|(i, row)| {
            for (j, x) in row.iter_mut().enumerate() {
                *x = if barr.get(i, j) {
                    self.blur_cell(values, self.links(i, j), zerolog)
                } else {
                    0.0
                };
            }
        });
        debug!("Blur pass took {:?}", st.elapsed());
    }

    fn blur_cell(&self, blur: &[f32], links: &[NeighborLink], zerolog: f32) -> f32 {
        let mlength = self.offsets.mlength;
        let zlength = self.offsets.zlength;

        match self.mode {
            BlurMode::Linear => links.iter().filter_map(|l| l.value(blur)).sum(),
            BlurMode::LogMean => {
                let total: f32 = links.iter().map(|l| l.log_value(blur, zerolog)).sum();
                (total / links.len() as f32).exp()
            }
            BlurMode::ChargeLog => (0..mlength)
                .map(|n| {
                    let total: f32 = (0..zlength)
                        .map(|k| links[k * mlength + n].log_value(blur, zerolog))
                        .sum();
                    (total / zlength as f32).exp() * self.offsets.mdist[n]
                })
                .sum(),
            BlurMode::MassLog => {
                let total: f32 = (0..mlength)
                    .map(|n| {
                        let charge_sum: f32 = (0..zlength)
                            .filter_map(|k| {
                                links[k * mlength + n]
                                    .value(blur)
                                    .map(|v| v * self.offsets.zdist[k])
                            })
                            .sum();
                        if charge_sum > 0.0 { charge_sum.ln() } else { zerolog }
                    })
                    .sum();
                (total / mlength as f32).exp()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn setup(config: &Config, data_mz: &[f32]) -> (NormalizedConfig, Vec<i32>, Grid2D<f32>) {
        let config = config.normalize().unwrap();
        let nztab: Vec<i32> = config.charge_states().collect();
        let mut mtab = Grid2D::new_filled(data_mz.len(), nztab.len(), 0.0f32);
        mtab.par_rows_mut().for_each(|(i, row)| {
            for (j, m) in row.iter_mut().enumerate() {
                *m = (data_mz[i] - config.adductmass) * nztab[j] as f32;
            }
        });
        (config, nztab, mtab)
    }

    #[test]
    fn test_offsets_are_normalized() {
        let offsets = BlurOffsets::new(1.0, 0.00001);
        assert_eq!(offsets.zlength, 3);
        assert_eq!(offsets.mlength, 1);
        let total: f32 = offsets.closeval.iter().sum();
        assert!((total - 1.0).abs() < 1e-6);
        assert_eq!(offsets.closezind, vec![-1, 0, 1]);

        let hybrid = BlurOffsets::new(1.0, -1.0);
        assert_eq!(hybrid.zlength, 7);
        assert_eq!(hybrid.mlength, 7);
        assert_eq!(hybrid.numclose(), 49);
    }

    #[test]
    fn test_mode_selection() {
        assert_eq!(BlurMode::select(1.0, 0.0), BlurMode::LogMean);
        assert_eq!(BlurMode::select(1.0, -1.0), BlurMode::ChargeLog);
        assert_eq!(BlurMode::select(-1.0, 1.0), BlurMode::MassLog);
        assert_eq!(BlurMode::select(-1.0, -1.0), BlurMode::Linear);
        assert_eq!(BlurMode::select(0.0, -1.0), BlurMode::Linear);
    }

    #[test]
    fn test_single_charge_cells_survive() {
        let data_mz: Vec<f32> = (0..50).map(|i| 500.0 + i as f32 * 0.2).collect();
        let config = Config {
            startz: 1,
            endz: 1,
            mzsig: 1.0,
            ..Config::default()
        };
        let (config, nztab, mtab) = setup(&config, &data_mz);
        let mut barr = Grid2D::new_filled(50, 1, true);
        let blur = SparseBlur::build(&config, &data_mz, &nztab, &mtab, &mut barr);
        assert!(barr.as_slice().iter().all(|x| *x));
        let links = blur.links(10, 0);
        assert_eq!(links[0], NeighborLink::OutsideCharges);
        assert!(matches!(links[1], NeighborLink::Live { index: 10, .. }));
        assert_eq!(links[2], NeighborLink::OutsideCharges);
    }

    #[test]
    fn test_unsupported_cells_are_pruned() {
        // Charges 1 and 2 but the spectrum only covers the charge 1 region of
        // each mass, so the charge 2 partner never exists.
        let data_mz: Vec<f32> = (0..50).map(|i| 1000.0 + i as f32 * 0.2).collect();
        let config = Config {
            startz: 1,
            endz: 2,
            mzsig: 1.0,
            ..Config::default()
        };
        let (config, nztab, mtab) = setup(&config, &data_mz);
        let mut barr = Grid2D::new_filled(50, 2, true);
        SparseBlur::build(&config, &data_mz, &nztab, &mtab, &mut barr);
        assert!(barr.as_slice().iter().all(|x| !*x));
    }

    #[test]
    fn test_partners_link_across_charges() {
        let data_mz: Vec<f32> = (0..3001).map(|i| 450.0 + i as f32 * 0.2).collect();
        let config = Config {
            startz: 1,
            endz: 2,
            mzsig: 1.0,
            ..Config::default()
        };
        let (config, nztab, mtab) = setup(&config, &data_mz);
        let mut barr = Grid2D::new_filled(data_mz.len(), 2, true);
        let blur = SparseBlur::build(&config, &data_mz, &nztab, &mtab, &mut barr);

        // Mass ~1000 at charge 1 is ~1001.007, at charge 2 ~501.007.
        let i1 = nearfast(&data_mz, 1001.0);
        assert!(barr.get(i1, 0));
        let links = blur.links(i1, 0);
        match links[2] {
            NeighborLink::Live { index, .. } => {
                let i2 = index / 2;
                assert!((data_mz[i2] - 501.0).abs() < 0.2);
                assert_eq!(index % 2, 1);
            }
            other => panic!("Expected a live link, got {:?}", other),
        }
    }

    #[test]
    fn test_blur_variants() {
        let data_mz: Vec<f32> = (0..3001).map(|i| 450.0 + i as f32 * 0.2).collect();
        let mut grid_config = Config {
            startz: 1,
            endz: 2,
            mzsig: 1.0,
            ..Config::default()
        };
        for (zsig, msig) in [(1.0, 0.0), (-1.0, -1.0)] {
            grid_config.zsig = zsig;
            grid_config.msig = msig;
            let (config, nztab, mtab) = setup(&grid_config, &data_mz);
            let mut barr = Grid2D::new_filled(data_mz.len(), 2, true);
            let sparse = SparseBlur::build(&config, &data_mz, &nztab, &mtab, &mut barr);
            let blur = Grid2D::new_filled(data_mz.len(), 2, 1.0f32);
            let mut out = Grid2D::new_filled(data_mz.len(), 2, 0.0f32);
            sparse.apply(&blur, &barr, config.zerolog, &mut out);
            for (x, b) in out.as_slice().iter().zip(barr.as_slice().iter()) {
                assert!(*x >= 0.0);
                if !*b {
                    assert_eq!(*x, 0.0);
                }
            }
            let i1 = nearfast(&data_mz, 1001.0);
            assert!(out.get(i1, 0) > 0.0);
        }
    }

    #[test]
    fn test_edge_charges_are_attenuated() {
        // Mass 1500 at charges 1, 2 and 3 is fully covered, so every partner
        // is live and only the charges outside the table differ.
        let data_mz: Vec<f32> = (0..5751).map(|i| 450.0 + i as f32 * 0.2).collect();
        let config = Config {
            startz: 1,
            endz: 3,
            mzsig: 1.0,
            ..Config::default()
        };
        let (config, nztab, mtab) = setup(&config, &data_mz);
        let mut barr = Grid2D::new_filled(data_mz.len(), 3, true);
        let sparse = SparseBlur::build(&config, &data_mz, &nztab, &mtab, &mut barr);
        let blur = Grid2D::new_filled(data_mz.len(), 3, 1.0f32);
        let mut out = Grid2D::new_filled(data_mz.len(), 3, 0.0f32);
        sparse.apply(&blur, &barr, config.zerolog, &mut out);

        let edge_low = nearfast(&data_mz, 1501.0);
        let interior = nearfast(&data_mz, 751.0);
        let edge_high = nearfast(&data_mz, 501.0);
        assert!(barr.get(edge_low, 0) && barr.get(interior, 1) && barr.get(edge_high, 2));
        let middle = out.get(interior, 1);
        assert!(middle > 0.0);
        assert!(out.get(edge_low, 0) < 0.1 * middle, "{} vs {}", out.get(edge_low, 0), middle);
        assert!(out.get(edge_high, 2) < 0.1 * middle, "{} vs {}", out.get(edge_high, 2), middle);

        // Summing modes skip the missing charges instead.
        let linear = Config {
            startz: 1,
            endz: 3,
            mzsig: 1.0,
            zsig: -1.0,
            msig: -1.0,
            ..Config::default()
        };
        let (linear, nztab, mtab) = setup(&linear, &data_mz);
        let mut barr = Grid2D::new_filled(data_mz.len(), 3, true);
        let sparse = SparseBlur::build(&linear, &data_mz, &nztab, &mtab, &mut barr);
        sparse.apply(&blur, &barr, linear.zerolog, &mut out);
        assert!(out.get(edge_low, 0) > 0.1 * out.get(interior, 1));
    }

    #[test]
    fn test_single_neighbor_is_a_copy() {
        let data_mz: Vec<f32> = (0..20).map(|i| 500.0 + i as f32).collect();
        let config = Config {
            startz: 1,
            endz: 1,
            zsig: 0.0,
            mzsig: 1.0,
            ..Config::default()
        };
        let (config, nztab, mtab) = setup(&config, &data_mz);
        let mut barr = Grid2D::new_filled(20, 1, true);
        let sparse = SparseBlur::build(&config, &data_mz, &nztab, &mtab, &mut barr);
        assert_eq!(sparse.numclose(), 1);
        let blur = Grid2D::from_flat_vector((0..20).map(|x| x as f32).collect(), 20, 1).unwrap();
        let mut out = Grid2D::new_filled(20, 1, 0.0f32);
        sparse.apply(&blur, &barr, config.zerolog, &mut out);
        assert_eq!(out, blur);
    }
}
