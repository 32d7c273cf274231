use indicatif::{
    ParallelProgressIterator,
    ProgressStyle,
};
use rayon::prelude::*;
use serde::Serialize;
use std::fs::File;
use std::io::{
    BufRead,
    BufReader,
    BufWriter,
    Write,
};
use std::path::{
    Path,
    PathBuf,
};
use std::time::Instant;
use tracing::{
    debug,
    info,
};
use unidec::scoring::{
    PeakScore,
    UniScorer,
};
use unidec::{
    Decon,
    Deconvolver,
    Diagnostic,
    Input,
    NormalizedConfig,
    PointSpreadKernel,
};

use crate::config::OutputConfig;
use crate::errors::CliError;

/// Parses whitespace (or comma) separated two column text. Blank lines and
/// lines starting with `#` are skipped, extra columns are ignored.
pub fn read_two_columns(reader: impl BufRead, source: &str) -> Result<(Vec<f32>, Vec<f32>), CliError> {
    let mut first = Vec::new();
    let mut second = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| CliError::Io {
            source: e.to_string(),
            path: Some(source.to_string()),
        })?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|f| !f.is_empty());
        let parse = |field: Option<&str>| -> Result<f32, CliError> {
            field
                .and_then(|f| f.parse::<f32>().ok())
                .ok_or_else(|| CliError::ParseError {
                    msg: format!("{}:{}: expected two numeric columns, got {:?}", source, lineno + 1, line),
                })
        };
        first.push(parse(fields.next())?);
        second.push(parse(fields.next())?);
    }
    Ok((first, second))
}

/// Reads the first column of every non empty line.
pub fn read_mass_list(reader: impl BufRead, source: &str) -> Result<Vec<f32>, CliError> {
    let mut masses = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| CliError::Io {
            source: e.to_string(),
            path: Some(source.to_string()),
        })?;
        let Some(field) = line.split_whitespace().next() else {
            continue;
        };
        if field.starts_with('#') {
            continue;
        }
        let mass = field.parse::<f32>().map_err(|e| CliError::ParseError {
            msg: format!("{}:{}: {}", source, lineno + 1, e),
        })?;
        masses.push(mass);
    }
    Ok(masses)
}

fn open(path: &Path) -> Result<BufReader<File>, CliError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| CliError::io(e, path))
}

pub fn load_spectrum(path: &Path) -> Result<(Vec<f32>, Vec<f32>), CliError> {
    read_two_columns(open(path)?, &path.to_string_lossy())
}

pub fn load_kernel(path: &Path) -> Result<PointSpreadKernel, CliError> {
    let (x, y) = read_two_columns(open(path)?, &path.to_string_lossy())?;
    PointSpreadKernel::new(x, y).map_err(|e| CliError::from(e).with_path(path))
}

pub fn load_mass_list(path: &Path) -> Result<Vec<f32>, CliError> {
    read_mass_list(open(path)?, &path.to_string_lossy())
}

fn write_columns(path: &Path, rows: impl Iterator<Item = String>) -> Result<(), CliError> {
    let file = File::create(path).map_err(|e| CliError::io(e, path))?;
    let mut writer = BufWriter::new(file);
    for row in rows {
        writeln!(writer, "{}", row).map_err(|e| CliError::io(e, path))?;
    }
    writer.flush().map_err(|e| CliError::io(e, path))
}

#[derive(Debug, Serialize)]
pub struct PeakSummary {
    pub mass: f32,
    pub height: f32,
    pub fwhm_low: f32,
    pub fwhm_high: f32,
    pub dscore: f32,
}

impl From<&PeakScore> for PeakSummary {
    fn from(score: &PeakScore) -> Self {
        PeakSummary {
            mass: score.peak.mass,
            height: score.peak.height,
            fwhm_low: score.fwhm.low,
            fwhm_high: score.fwhm.high,
            dscore: score.dscore,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub spectrum: PathBuf,
    pub iterations: usize,
    pub converged: bool,
    pub conv: f32,
    pub error: f32,
    pub rsquared: f32,
    pub uniscore: f32,
    pub peaks: Vec<PeakSummary>,
    pub diagnostics: Vec<Diagnostic>,
}

impl RunSummary {
    pub fn new(spectrum: PathBuf, config: &NormalizedConfig, decon: &Decon, input: &Input) -> Self {
        let peaks = UniScorer
            .peak_scores(config, decon, input)
            .iter()
            .map(PeakSummary::from)
            .collect();
        RunSummary {
            spectrum,
            iterations: decon.iterations,
            converged: decon.converged,
            conv: decon.conv,
            error: decon.error,
            rsquared: decon.rsquared,
            uniscore: decon.uniscore,
            peaks,
            diagnostics: decon.diagnostics.clone(),
        }
    }
}

fn output_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "spectrum".to_string())
}

pub fn write_outputs(
    stem: &str,
    config: &NormalizedConfig,
    decon: &Decon,
    input: &Input,
    summary: &RunSummary,
    output: &OutputConfig,
) -> Result<(), CliError> {
    let dir = &output.directory;
    write_columns(
        &dir.join(format!("{}_mass.txt", stem)),
        decon
            .massaxis
            .iter()
            .zip(decon.massaxisval.iter())
            .map(|(m, v)| format!("{} {}", m, v)),
    )?;
    write_columns(
        &dir.join(format!("{}_fitdat.txt", stem)),
        input
            .data_mz()
            .iter()
            .zip(decon.fitdat.iter())
            .map(|(mz, f)| format!("{} {}", mz, f)),
    )?;
    if config.rawflag.writes_grids() {
        write_columns(
            &dir.join(format!("{}_grid.txt", stem)),
            (0..decon.massgrid.nrows()).filter_map(|i| {
                let row = decon.massgrid.get_row(i)?;
                let values: Vec<String> = row.iter().map(|v| v.to_string()).collect();
                Some(format!("{} {}", decon.massaxis.get(i)?, values.join(" ")))
            }),
        )?;
    }

    let path = dir.join(format!("{}_summary.json", stem));
    let file = File::create(&path).map_err(|e| CliError::io(e, &path))?;
    serde_json::to_writer_pretty(BufWriter::new(file), summary)
        .map_err(|e| CliError::ParseError { msg: e.to_string() })
}

/// Deconvolves a single spectrum file and writes its outputs.
pub fn process_spectrum(
    path: &Path,
    config: &NormalizedConfig,
    kernel: Option<&PointSpreadKernel>,
    masses: Option<&[f32]>,
    output: &OutputConfig,
) -> Result<RunSummary, CliError> {
    let st = Instant::now();
    let (mz, intensity) = load_spectrum(path)?;
    debug!("Read {} points from {}", mz.len(), path.display());

    let mut builder = Input::builder(mz, intensity);
    if let Some(kernel) = kernel {
        builder = builder.with_kernel(kernel.clone());
    }
    if let Some(masses) = masses {
        builder = builder.with_test_masses(masses.to_vec());
    }
    let input = builder
        .build(config)
        .map_err(|e| CliError::from(e).with_path(path))?;
    let decon = Deconvolver::new(config)
        .run(&input)
        .map_err(|e| CliError::from(e).with_path(path))?;

    let summary = RunSummary::new(path.to_path_buf(), config, &decon, &input);
    write_outputs(&output_stem(path), config, &decon, &input, &summary, output)?;
    info!(
        "{}: {} peaks, uniscore {:.3}, took {:?}",
        path.display(),
        summary.peaks.len(),
        summary.uniscore,
        st.elapsed()
    );
    Ok(summary)
}

/// Processes every spectrum in parallel, returns the per file outcomes in
/// input order.
pub fn main_loop(
    spectra: &[PathBuf],
    config: &NormalizedConfig,
    kernel: Option<&PointSpreadKernel>,
    masses: Option<&[f32]>,
    output: &OutputConfig,
) -> Vec<Result<RunSummary, CliError>> {
    let start = Instant::now();
    let style = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta})",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    let results: Vec<_> = spectra
        .par_iter()
        .progress_with_style(style)
        .map(|path| process_spectrum(path, config, kernel, masses, output))
        .collect();
    let failed = results.iter().filter(|r| r.is_err()).count();
    info!(
        "Processed {} spectra ({} failed) in {:?}",
        spectra.len(),
        failed,
        start.elapsed()
    );
    results
}
