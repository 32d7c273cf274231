use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use unidec::config::{
    BaselineMode,
    PoolingMode,
};
use unidec::scoring::{
    Scorer,
    UniScorer,
};
use unidec::{
    Config,
    Deconvolver,
    Diagnostic,
    Input,
    PointSpreadKernel,
    UniDecError,
    run_unidec,
};

const PROTON: f32 = 1.007_276_5;

fn gaussian_spectrum(start: f32, step: f32, n: usize, peaks: &[(f32, f32, f32)]) -> (Vec<f32>, Vec<f32>) {
    let mz: Vec<f32> = (0..n).map(|i| start + i as f32 * step).collect();
    let intensity = mz
        .iter()
        .map(|x| {
            peaks
                .iter()
                .map(|(center, sigma, height)| height * (-(x - center).powi(2) / (2.0 * sigma * sigma)).exp())
                .sum()
        })
        .collect();
    (mz, intensity)
}

fn single_charge_config() -> Config {
    Config {
        startz: 1,
        endz: 1,
        mzsig: 1.0,
        massbins: 1.0,
        numit: 50,
        ..Config::default()
    }
}

fn top_mass(massaxis: &[f32], values: &[f32]) -> f32 {
    let (index, _) = values
        .iter()
        .enumerate()
        .fold((0, f32::MIN), |best, (i, v)| if *v > best.1 { (i, *v) } else { best });
    massaxis[index]
}

#[test]
fn test_single_charge_peak() {
    let config = single_charge_config().normalize().unwrap();
    let (mz, intensity) = gaussian_spectrum(500.0, 0.2, 501, &[(550.0, 2.0, 1.0)]);
    let input = Input::new(&config, mz, intensity).unwrap();
    let decon = run_unidec(&config, &input).unwrap();

    assert!(decon.rsquared > 0.99, "R² {}", decon.rsquared);
    assert!(decon.uniscore > 0.95, "uniscore {}", decon.uniscore);
    assert!(decon.uniscore <= 1.0);
    assert_eq!(decon.massaxis.len(), decon.massaxisval.len());
    assert_eq!(decon.massgrid.nrows(), decon.massaxis.len());
    let mass = top_mass(&decon.massaxis, &decon.massaxisval);
    assert!((mass - (550.0 - PROTON)).abs() <= 1.5, "mass {}", mass);
    assert!(decon.diagnostics.is_empty(), "{:?}", decon.diagnostics);
}

#[test]
fn test_mass_axis_is_uniform() {
    let config = single_charge_config().normalize().unwrap();
    let (mz, intensity) = gaussian_spectrum(500.0, 0.2, 501, &[(550.0, 2.0, 1.0)]);
    let input = Input::new(&config, mz, intensity).unwrap();
    let decon = run_unidec(&config, &input).unwrap();
    assert!(decon.massaxis.len() > 2);
    for w in decon.massaxis.windows(2) {
        assert!((w[1] - w[0] - config.massbins).abs() < 1e-3);
    }
    // Masses are rounded to the bin size.
    assert!((decon.massaxis[0] / config.massbins).fract().abs() < 1e-3);
}

#[test]
fn test_two_charge_states_of_one_mass() {
    let config = Config {
        startz: 1,
        endz: 3,
        mzsig: 1.2,
        massbins: 1.0,
        numit: 50,
        ..Config::default()
    }
    .normalize()
    .unwrap();
    let mass = 3000.0f32;
    let mz2 = (mass + 2.0 * PROTON) / 2.0;
    let mz3 = (mass + 3.0 * PROTON) / 3.0;
    let (mz, intensity) = gaussian_spectrum(900.0, 0.1, 7001, &[(mz2, 0.5, 1.0), (mz3, 0.5, 0.6)]);
    let input = Input::new(&config, mz, intensity).unwrap();
    let decon = run_unidec(&config, &input).unwrap();

    assert!(decon.rsquared > 0.9, "R² {}", decon.rsquared);
    let found = top_mass(&decon.massaxis, &decon.massaxisval);
    assert!((found - mass).abs() <= 2.0, "mass {}", found);
    // Both charge columns contribute to the mass.
    let index = decon.massaxis.partition_point(|m| *m < found);
    let row = decon.massgrid.get_row(index).unwrap();
    assert!(row[1] > 0.0 && row[2] > 0.0, "{:?}", row);
    assert_eq!(row[0], 0.0);
}

#[test]
fn test_charge_one_and_two_of_one_mass() {
    let config = Config {
        startz: 1,
        endz: 2,
        mzsig: 1.2,
        massbins: 1.0,
        numit: 50,
        ..Config::default()
    }
    .normalize()
    .unwrap();
    let mass = 1500.0f32;
    let mz1 = mass + PROTON;
    let mz2 = (mass + 2.0 * PROTON) / 2.0;
    let (mz, intensity) = gaussian_spectrum(700.0, 0.1, 8501, &[(mz1, 0.5, 1.0), (mz2, 0.5, 0.6)]);
    let input = Input::new(&config, mz, intensity).unwrap();
    let decon = run_unidec(&config, &input).unwrap();

    assert!(decon.rsquared > 0.9, "R² {}", decon.rsquared);
    let found = top_mass(&decon.massaxis, &decon.massaxisval);
    assert!((found - mass).abs() <= 2.0, "mass {}", found);
    let index = decon.massaxis.partition_point(|m| *m < found);
    let row = decon.massgrid.get_row(index).unwrap();
    assert!(row[0] > 0.0 && row[1] > 0.0, "{:?}", row);
}

#[test]
fn test_exact_peak_shape_converges_early() {
    let config = single_charge_config().normalize().unwrap();
    let (mz, intensity) = gaussian_spectrum(500.0, 0.2, 501, &[(550.0, 2.0, 1.0)]);
    let input = Input::new(&config, mz, intensity).unwrap();
    let decon = run_unidec(&config, &input).unwrap();
    assert!(decon.converged);
    assert!(decon.iterations < 50, "{}", decon.iterations);
    assert!(decon.conv < config.convergence_threshold);
}

#[test]
fn test_fit_is_scored_against_the_loaded_spectrum() {
    let config = Config {
        aggressiveflag: BaselineMode::Subtract,
        ..single_charge_config()
    }
    .normalize()
    .unwrap();
    let (mz, intensity) = gaussian_spectrum(500.0, 0.2, 501, &[(550.0, 2.0, 1.0)]);
    let intensity: Vec<f32> = intensity.iter().map(|v| v + 0.2).collect();
    let input = Input::new(&config, mz, intensity).unwrap();
    let decon = run_unidec(&config, &input).unwrap();
    assert!(decon.baseline.iter().any(|b| *b > 0.0));

    let raw = input.data_int();
    let error: f64 = decon
        .fitdat
        .iter()
        .zip(raw.iter())
        .map(|(f, d)| ((f - d) as f64).powi(2))
        .sum();
    assert!(
        (decon.error as f64 - error).abs() <= 1e-3 * error.max(1e-3),
        "{} vs {}",
        decon.error,
        error
    );
}

#[test]
fn test_duplicate_mz_is_rejected() {
    let config = single_charge_config().normalize().unwrap();
    let mz = vec![500.0, 500.5, 500.5, 501.0];
    let intensity = vec![1.0, 2.0, 3.0, 1.0];
    match Input::new(&config, mz, intensity) {
        Err(UniDecError::DuplicateMz { index, .. }) => assert_eq!(index, 2),
        other => panic!("Expected a duplicate m/z error, got {:?}", other),
    }
}

#[test]
fn test_mismatched_lengths_are_rejected() {
    let config = single_charge_config().normalize().unwrap();
    let result = Input::new(&config, vec![500.0, 501.0], vec![1.0]);
    assert!(matches!(
        result,
        Err(UniDecError::ExpectedSlicesSameLength { .. })
    ));
}

#[test]
fn test_infeasible_mass_bounds() {
    let config = Config {
        masslb: 10_000.0,
        massub: 20_000.0,
        ..single_charge_config()
    }
    .normalize()
    .unwrap();
    let (mz, intensity) = gaussian_spectrum(500.0, 0.2, 501, &[(550.0, 2.0, 1.0)]);
    let input = Input::new(&config, mz, intensity).unwrap();
    assert!(matches!(
        run_unidec(&config, &input),
        Err(UniDecError::InfeasibleSetup)
    ));
}

#[test]
fn test_identity_kernel_converges_early() {
    let config = Config {
        mzsig: 0.0,
        psig: 0.0,
        ..single_charge_config()
    }
    .normalize()
    .unwrap();
    let (mz, intensity) = gaussian_spectrum(500.0, 0.2, 501, &[(550.0, 2.0, 1.0)]);
    let input = Input::new(&config, mz, intensity).unwrap();
    let decon = run_unidec(&config, &input).unwrap();
    assert!(decon.converged);
    assert!(decon.iterations < 50, "{}", decon.iterations);
    assert!(decon.conv < config.convergence_threshold);
    assert!((decon.rsquared - 1.0).abs() < 1e-4, "R² {}", decon.rsquared);
}

#[test]
fn test_negative_budget_runs_every_iteration() {
    let config = Config {
        mzsig: 0.0,
        psig: 0.0,
        numit: -20,
        ..single_charge_config()
    }
    .normalize()
    .unwrap();
    let (mz, intensity) = gaussian_spectrum(500.0, 0.2, 501, &[(550.0, 2.0, 1.0)]);
    let input = Input::new(&config, mz, intensity).unwrap();
    let decon = run_unidec(&config, &input).unwrap();
    assert_eq!(decon.iterations, 20);
}

#[test]
fn test_cancelled_run_returns_partial_result() {
    let config = single_charge_config().normalize().unwrap();
    let (mz, intensity) = gaussian_spectrum(500.0, 0.2, 501, &[(550.0, 2.0, 1.0)]);
    let input = Input::new(&config, mz, intensity).unwrap();
    let flag = Arc::new(AtomicBool::new(true));
    let decon = Deconvolver::new(&config)
        .with_cancel_flag(flag)
        .run(&input)
        .unwrap();
    assert_eq!(decon.iterations, 0);
    assert!(!decon.converged);
    assert!(decon.diagnostics.contains(&Diagnostic::Cancelled { iteration: 0 }));
}

#[test]
fn test_double_deconvolution_needs_a_kernel() {
    let config = Config {
        doubledec: true,
        ..single_charge_config()
    }
    .normalize()
    .unwrap();
    let (mz, intensity) = gaussian_spectrum(500.0, 0.2, 501, &[(550.0, 2.0, 1.0)]);
    let input = Input::new(&config, mz, intensity).unwrap();
    assert!(matches!(
        run_unidec(&config, &input),
        Err(UniDecError::MissingKernel)
    ));
}

#[test]
fn test_double_deconvolution_with_kernel() {
    let config = Config {
        doubledec: true,
        ..single_charge_config()
    }
    .normalize()
    .unwrap();
    let (mz, intensity) = gaussian_spectrum(500.0, 0.2, 501, &[(550.0, 2.0, 1.0)]);
    let kx: Vec<f32> = (0..21).map(|i| i as f32).collect();
    let ky: Vec<f32> = kx.iter().map(|x| (-(x - 10.0).powi(2) / 2.0).exp()).collect();
    let kernel = PointSpreadKernel::new(kx, ky).unwrap();
    let input = Input::builder(mz, intensity)
        .with_kernel(kernel)
        .build(&config)
        .unwrap();
    let decon = run_unidec(&config, &input).unwrap();
    assert_eq!(decon.massaxis.len(), decon.massaxisval.len());
    assert!(!decon.massaxis.is_empty());
    let top = decon.massaxisval.iter().copied().fold(0.0f32, f32::max);
    assert!((top - 1.0).abs() < 1e-4, "{}", top);
    assert!(decon.massaxis.iter().all(|m| *m >= config.masslb && *m <= config.massub));
}

#[test]
fn test_integration_conserves_intensity() {
    let config = Config {
        poolflag: PoolingMode::Integrate,
        ..single_charge_config()
    }
    .normalize()
    .unwrap();
    let (mz, intensity) = gaussian_spectrum(500.0, 0.2, 501, &[(550.0, 2.0, 1.0)]);
    let input = Input::new(&config, mz, intensity).unwrap();
    let decon = run_unidec(&config, &input).unwrap();
    let grid_total: f32 = decon.newblur.as_slice().iter().sum();
    let spectrum_total: f32 = decon.massaxisval.iter().sum();
    assert!(
        (grid_total - spectrum_total).abs() <= 1e-3 * grid_total,
        "{} vs {}",
        grid_total,
        spectrum_total
    );
}

struct ConstantScorer(f32);

impl Scorer for ConstantScorer {
    fn score(&self, _: &unidec::NormalizedConfig, _: &unidec::Decon, _: &Input, _: f32) -> f32 {
        self.0
    }
}

#[test]
fn test_custom_scorer() {
    let config = single_charge_config().normalize().unwrap();
    let (mz, intensity) = gaussian_spectrum(500.0, 0.2, 501, &[(550.0, 2.0, 1.0)]);
    let input = Input::new(&config, mz, intensity).unwrap();
    let decon = Deconvolver::new(&config)
        .with_scorer(ConstantScorer(0.25))
        .run(&input)
        .unwrap();
    assert_eq!(decon.uniscore, 0.25);

    let scores = UniScorer.peak_scores(&config, &decon, &input);
    assert_eq!(scores.len(), 1);
    assert!(scores[0].fwhm.complete);
}
