//! The deconvolution driver.
//!
//! A run prepares the per run tables once (acceptance grid, peak shape,
//! blur neighborhood, optional baseline), then alternates a blur pass and a
//! Richardson-Lucy update until the grid stops changing or the iteration
//! budget runs out. The final grid is optionally reconvolved, projected on
//! a mass axis and scored.
//!
//! Example:
//! ```
//! use unidec::config::Config;
//! use unidec::{run_unidec, Input};
//!
//! let config = Config {
//!     startz: 1,
//!     endz: 1,
//!     mzsig: 1.0,
//!     massbins: 1.0,
//!     numit: 20,
//!     ..Config::default()
//! }
//! .normalize()
//! .unwrap();
//! let mz: Vec<f32> = (0..201).map(|i| 500.0 + i as f32 * 0.5).collect();
//! let intensity: Vec<f32> = mz
//!     .iter()
//!     .map(|x| (-(x - 550.0).powi(2) / 8.0).exp())
//!     .collect();
//! let input = Input::new(&config, mz, intensity).unwrap();
//! let decon = run_unidec(&config, &input).unwrap();
//! assert!(decon.rsquared > 0.9);
//! ```
use rayon::prelude::*;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{
    AtomicBool,
    Ordering,
};
use std::time::Instant;
use tracing::{
    debug,
    info,
    warn,
};

use crate::baseline::deconvolve_baseline;
use crate::blur::SparseBlur;
use crate::config::{
    BaselineMode,
    IsotopeMode,
    NormalizedConfig,
};
use crate::convolution::{
    UpdateContext,
    deconvolve_iteration_speedy,
    reconvolve,
};
use crate::double_decon::double_deconvolve;
use crate::errors::{
    Result,
    UniDecError,
};
use crate::fit::{
    charge_scaling,
    errfun_speedy,
    zero_fit_at_gaps,
};
use crate::grid::Grid2D;
use crate::input::{
    Input,
    kill_below_threshold,
};
use crate::peak_shape::PeakShape;
use crate::scoring::{
    Scorer,
    UniScorer,
};
use crate::sharpen::{
    point_smoothing,
    point_smoothing_peak_width,
    softargmax,
    softargmax_transposed,
};
use crate::transforms::Projection;
use crate::utils::{
    apply_cutoff,
    max,
};

/// Value reported as the convergence metric when the grid sums to zero.
pub const CONVERGENCE_SENTINEL: f32 = 12_345_678.0;
/// Fraction of the grid maximum below which cells are cleared at the end.
const FINAL_CUTOFF: f32 = 1e-6;
/// Extra baseline passes in subtraction mode.
const SUBTRACT_BASELINE_PASSES: usize = 10;

/// Recoverable numeric events of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    /// The grid summed to zero at a convergence check.
    ZeroConvergenceDenominator { iteration: usize },
    /// The detected mass range was narrower than one bin, the configured
    /// bounds were used and nothing was projected.
    MassAxisFallback { massmin: f32, massmax: f32 },
    /// Baseline estimation needs a peak width.
    BaselineSkipped,
    /// The run was cancelled before `iteration`.
    Cancelled { iteration: usize },
}

/// Results of one deconvolution.
#[derive(Debug, Clone)]
pub struct Decon {
    /// Final (point x charge) grid.
    pub blur: Grid2D<f32>,
    /// Grid read out on the mass axis: `blur` reconvolved for profile
    /// readouts, a copy of it otherwise.
    pub newblur: Grid2D<f32>,
    pub baseline: Vec<f32>,
    pub noise: Vec<f32>,
    pub fitdat: Vec<f32>,
    pub massaxis: Vec<f32>,
    pub massaxisval: Vec<f32>,
    pub massgrid: Grid2D<f32>,
    pub error: f32,
    pub rsquared: f32,
    pub conv: f32,
    pub iterations: usize,
    pub uniscore: f32,
    pub converged: bool,
    pub diagnostics: Vec<Diagnostic>,
}

impl Decon {
    pub fn mlen(&self) -> usize {
        self.massaxis.len()
    }
}

/// Two step convergence test: the run converges once two consecutive checks
/// fall below the threshold.
#[derive(Debug, Clone)]
pub struct ConvergenceTracker {
    threshold: f32,
    armed: bool,
    converged: bool,
}

impl ConvergenceTracker {
    pub fn new(threshold: f32) -> Self {
        ConvergenceTracker {
            threshold,
            armed: false,
            converged: false,
        }
    }

    /// Records a check, returns whether the run has converged.
    pub fn check(&mut self, conv: f32) -> bool {
        if conv < self.threshold {
            if self.armed {
                self.converged = true;
            }
            self.armed = true;
        } else {
            self.armed = false;
        }
        self.converged
    }

    pub fn is_converged(&self) -> bool {
        self.converged
    }
}

/// Relative squared change between two grids over the accepted cells.
/// `None` when the grid sums to zero.
fn convergence(blur: &Grid2D<f32>, oldblur: &Grid2D<f32>, barr: &Grid2D<bool>) -> Option<f32> {
    let (diff, total) = blur
        .as_slice()
        .iter()
        .zip(oldblur.as_slice().iter())
        .zip(barr.as_slice().iter())
        .filter(|(_, b)| **b)
        .fold((0.0f64, 0.0f64), |(d, t), ((&x, &o), _)| {
            let delta = (x - o) as f64;
            (d + delta * delta, t + x as f64)
        });
    if total == 0.0 {
        None
    } else {
        Some((diff / total) as f32)
    }
}

fn is_checked_iteration(budget: usize, it: usize) -> bool {
    budget < 10 || it % 10 < 2 || it as f32 > 0.9 * budget as f32
}

/// Scratch state of a run, dropped when the run ends.
struct Workspace {
    barr: Grid2D<bool>,
    shape: Option<PeakShape>,
    neighbors: SparseBlur,
    /// Observed intensities, baseline subtracted in subtraction mode.
    data_int: Vec<f32>,
    betafactor: f32,
}

fn ensure_accepted(barr: &Grid2D<bool>) -> Result<()> {
    if barr.as_slice().iter().any(|b| *b) {
        Ok(())
    } else {
        Err(UniDecError::InfeasibleSetup)
    }
}

impl Workspace {
    fn prepare(config: &NormalizedConfig, input: &Input) -> Result<Self> {
        let data_mz = input.data_mz();
        let mut barr = input.barr().clone();
        ensure_accepted(&barr)?;

        let shape = if config.mzsig != 0.0 {
            Some(PeakShape::build(
                data_mz,
                config,
                config.mzsig < 0.0 || config.beta < 0.0,
            )?)
        } else {
            None
        };

        let neighbors = SparseBlur::build(config, data_mz, input.nztab(), input.mtab(), &mut barr);
        ensure_accepted(&barr)?;

        let top = max(input.data_int());
        let betafactor = if top > 1.0 { top } else { 1.0 };

        if config.intthresh != -1.0 {
            kill_below_threshold(&mut barr, input.data_int(), config.intthresh, input.isotopes());
        }

        Ok(Workspace {
            barr,
            shape,
            neighbors,
            data_int: input.data_int().to_vec(),
            betafactor,
        })
    }
}

/// Configurable deconvolution run.
pub struct Deconvolver<'a> {
    config: &'a NormalizedConfig,
    scorer: Box<dyn Scorer + 'a>,
    cancel: Option<Arc<AtomicBool>>,
}

impl<'a> Deconvolver<'a> {
    pub fn new(config: &'a NormalizedConfig) -> Self {
        Deconvolver {
            config,
            scorer: Box::new(UniScorer),
            cancel: None,
        }
    }

    pub fn with_scorer(mut self, scorer: impl Scorer + 'a) -> Self {
        self.scorer = Box::new(scorer);
        self
    }

    /// Flag polled between iterations. Once set the iterations stop and
    /// the partial grid is finalized.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    pub fn run(&self, input: &Input) -> Result<Decon> {
        let config = self.config;
        let st = Instant::now();
        if config.doubledec && input.kernel().is_none() {
            return Err(UniDecError::MissingKernel);
        }
        let lengthmz = input.len();
        let numz = config.numz;
        let isotopes = input.isotopes();
        info!(
            "Deconvolving {} points over {} charge states ({} iterations max)",
            lengthmz,
            numz,
            config.iteration_budget()
        );

        let mut ws = Workspace::prepare(config, input)?;
        let mut diagnostics = Vec::new();

        let seed: Vec<f32> = if config.isotopemode.is_active() {
            vec![1.0; lengthmz]
        } else {
            ws.data_int.iter().map(|d| d / (numz + 2) as f32).collect()
        };
        let mut blur = Grid2D::new_filled(lengthmz, numz, 0.0f32);
        blur.par_rows_mut().for_each(|(i, row)| {
            for (j, x) in row.iter_mut().enumerate() {
                if ws.barr.get(i, j) {
                    *x = seed[i];
                }
            }
        });
        let mut baseline = seed.clone();
        let noise = seed;

        if config.baseline_enabled() {
            if config.mzsig != 0.0 {
                deconvolve_baseline(&ws.data_int, &mut baseline);
                if config.aggressiveflag == BaselineMode::Subtract {
                    for _ in 0..SUBTRACT_BASELINE_PASSES {
                        deconvolve_baseline(&ws.data_int, &mut baseline);
                    }
                    ws.data_int
                        .iter_mut()
                        .zip(baseline.iter())
                        .filter(|(_, b)| **b > 0.0)
                        .for_each(|(d, b)| *d -= b);
                }
            } else {
                warn!("Baseline estimation needs a peak width, skipping it");
                diagnostics.push(Diagnostic::BaselineSkipped);
            }
        }

        let mut newblur = Grid2D::new_filled(lengthmz, numz, 0.0f32);
        let mut oldblur = blur.clone();
        let budget = config.iteration_budget();
        let mut tracker = ConvergenceTracker::new(config.convergence_threshold);
        let mut conv = 0.0f32;
        let mut iterations = 0usize;
        {
            let ctx = UpdateContext {
                config,
                data_mz: input.data_mz(),
                data_int: &ws.data_int,
                barr: &ws.barr,
                shape: ws.shape.as_ref(),
                isotopes,
            };
            for it in 0..budget {
                if self.cancelled() {
                    warn!("Deconvolution cancelled before iteration {}", it);
                    diagnostics.push(Diagnostic::Cancelled { iteration: it });
                    break;
                }
                if it > 0 {
                    if config.beta > 0.0 {
                        softargmax(&mut blur, config.beta / ws.betafactor);
                    } else if config.beta < 0.0 {
                        softargmax_transposed(
                            &mut blur,
                            &ws.barr,
                            (config.beta / ws.betafactor).abs(),
                            ws.shape.as_ref(),
                            isotopes,
                        );
                    }

                    if config.psig >= 1.0 {
                        point_smoothing(&mut blur, &ws.barr, config.psig.abs() as usize);
                    } else if config.psig < 0.0 {
                        if let Some(shape) = ws.shape.as_ref() {
                            point_smoothing_peak_width(&mut blur, &ws.barr, shape);
                        }
                    }
                }

                ws.neighbors.apply(&blur, &ws.barr, config.zerolog, &mut newblur);
                deconvolve_iteration_speedy(&ctx, &newblur, &mut blur, &mut baseline);
                iterations = it + 1;

                if is_checked_iteration(budget, it) {
                    conv = match convergence(&blur, &oldblur, &ws.barr) {
                        Some(conv) => conv,
                        None => {
                            warn!("Grid sums to zero at iteration {}", it);
                            diagnostics.push(Diagnostic::ZeroConvergenceDenominator { iteration: it });
                            CONVERGENCE_SENTINEL
                        }
                    };
                    debug!("Iteration {}: convergence {}", it, conv);
                    if tracker.check(conv) && config.numit > 0 {
                        info!("Converged after {} iterations", iterations);
                        break;
                    }
                    oldblur.copy_from(&blur);
                }
            }
        }

        // Drop the peak shape inflation before the fit is computed.
        let shape = match ws.shape.take() {
            Some(shape) if config.peakshapeinflate != 1.0 => {
                Some(shape.with_sigma(input.data_mz(), config.mzsig.abs())?)
            }
            shape => shape,
        };

        let blurmax = max(blur.as_slice());
        apply_cutoff(blur.as_mut_slice(), blurmax * FINAL_CUTOFF);

        // Scored against the spectrum as loaded, before any baseline subtraction.
        let fit = errfun_speedy(
            config,
            &blur,
            &ws.barr,
            input.data_int(),
            &baseline,
            shape.as_ref(),
            isotopes,
        );
        let mut fitdat = fit.fitdat;
        if config.intthresh != -1.0 {
            zero_fit_at_gaps(&mut fitdat, input.data_int());
        }

        if config.orbimode {
            charge_scaling(&mut blur, input.nztab());
        }
        if config.isotopemode == IsotopeMode::Average {
            if let Some(table) = isotopes {
                table.monotopic_to_average(&mut blur, &ws.barr);
            }
        }

        match shape.as_ref() {
            Some(shape) if config.rawflag.is_profile() => {
                reconvolve(shape, &blur, &mut newblur);
            }
            _ => newblur.copy_from(&blur),
        }

        let mut decon = Decon {
            blur,
            newblur,
            baseline,
            noise,
            fitdat,
            massaxis: Vec::new(),
            massaxisval: Vec::new(),
            massgrid: Grid2D::new_filled(0, numz, 0.0),
            error: fit.error,
            rsquared: fit.rsquared,
            conv,
            iterations,
            uniscore: 0.0,
            converged: tracker.is_converged(),
            diagnostics,
        };

        match mass_range(config, input, &decon.newblur, &ws.barr) {
            Some((massmin, massmax)) => {
                let mlen = ((massmax - massmin) / config.massbins) as usize;
                decon.massaxis = (0..mlen)
                    .map(|i| massmin + i as f32 * config.massbins)
                    .collect();
                let projection = Projection {
                    data_mz: input.data_mz(),
                    nztab: input.nztab(),
                    mtab: input.mtab(),
                    adductmass: config.adductmass,
                    massaxis: &decon.massaxis,
                    massmin,
                    massmax,
                };
                let spectrum = projection.project(config.poolflag, &decon.newblur);
                decon.massaxisval = spectrum.massaxisval;
                decon.massgrid = spectrum.massgrid;

                decon.uniscore = self.scorer.score(config, &decon, input, 0.0);

                if config.doubledec {
                    let kernel = input.kernel().ok_or(UniDecError::MissingKernel)?;
                    let (massaxis, massaxisval) = double_deconvolve(
                        kernel,
                        &decon.massaxis,
                        &decon.massaxisval,
                        config.masslb,
                        config.massub,
                    )?;
                    decon.massaxis = massaxis;
                    decon.massaxisval = massaxisval;
                }
            }
            None => {
                let (massmin, massmax) = (config.masslb, config.massub);
                warn!(
                    "Mass range is narrower than one bin, falling back to {} - {}",
                    massmin, massmax
                );
                let mlen = ((massmax - massmin) / config.massbins).max(0.0) as usize;
                decon.massaxis = (0..mlen)
                    .map(|i| massmin + i as f32 * config.massbins)
                    .collect();
                decon.massaxisval = vec![0.0; mlen];
                decon.massgrid = Grid2D::new_filled(mlen, numz, 0.0);
                decon
                    .diagnostics
                    .push(Diagnostic::MassAxisFallback { massmin, massmax });
            }
        }

        info!(
            "Deconvolution done: {} iterations, R² {:.4}, uniscore {:.4}, {} mass bins, took {:?}",
            decon.iterations,
            decon.rsquared,
            decon.uniscore,
            decon.mlen(),
            st.elapsed()
        );
        Ok(decon)
    }
}

/// Mass range covered by the significant cells of the readout grid, or the
/// configured bounds for a fixed axis. `None` when it spans less than a bin.
fn mass_range(
    config: &NormalizedConfig,
    input: &Input,
    readout: &Grid2D<f32>,
    barr: &Grid2D<bool>,
) -> Option<(f32, f32)> {
    let (massmin, massmax) = if config.fixed_mass_axis {
        (config.masslb, config.massub)
    } else {
        let threshold = config.peak_window_threshold();
        let cutoff = max(readout.as_slice()) * FINAL_CUTOFF;
        let round = |m: f32| (m / config.massbins).round() * config.massbins;
        let mtab = input.mtab();
        let nztab = input.nztab();
        readout
            .par_rows()
            .map(|(i, row)| {
                let mut range = (config.massub, config.masslb);
                for (j, &value) in row.iter().enumerate() {
                    if barr.get(i, j) && value > cutoff {
                        let z = nztab[j].unsigned_abs() as f32;
                        let mass = mtab.get(i, j);
                        range.0 = range.0.min(round(mass - threshold * z));
                        range.1 = range.1.max(round(mass + threshold * z + config.massbins));
                    }
                }
                range
            })
            .reduce(
                || (config.massub, config.masslb),
                |a, b| (a.0.min(b.0), a.1.max(b.1)),
            )
    };
    if (massmax - massmin) / config.massbins < 1.0 {
        None
    } else {
        Some((massmin, massmax))
    }
}

/// Runs a deconvolution with the default scorer.
pub fn run_unidec(config: &NormalizedConfig, input: &Input) -> Result<Decon> {
    Deconvolver::new(config).run(input)
}
