mod cli;
mod config;
mod errors;
mod processing;

use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing::{
    error,
    info,
};
use tracing_subscriber::EnvFilter;

use cli::Cli;
use config::Config;

#[cfg(target_os = "windows")]
use mimalloc::MiMalloc;

#[cfg(target_os = "windows")]
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> std::result::Result<(), errors::CliError> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        ) // This uses RUST_LOG environment variable
        .init();

    let args = Cli::parse();
    let config = Config::with_cli_args(&args)?;
    info!("Parsed configuration: {:#?}", config);

    let normalized = config.deconvolution.normalize()?;
    let Some(output_config) = config.output else {
        return Err(errors::CliError::Config {
            source: "No output directory provided".to_string(),
        });
    };
    if let Err(e) = std::fs::create_dir_all(&output_config.directory) {
        return Err(errors::CliError::io(e, &output_config.directory));
    }

    let input_config = config.input.unwrap_or_default();
    let kernel = match &input_config.kernel {
        Some(path) => Some(processing::load_kernel(path)?),
        None => None,
    };
    let masses = match &input_config.mass_list {
        Some(path) => {
            let masses = processing::load_mass_list(path)?;
            info!("Loaded {} masses from {}", masses.len(), path.display());
            Some(masses)
        }
        None => None,
    };

    let results = processing::main_loop(
        &args.spectra,
        &normalized,
        kernel.as_ref(),
        masses.as_deref(),
        &output_config,
    );

    let mut first_error = None;
    for result in results {
        if let Err(e) = result {
            error!("{}", e);
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
