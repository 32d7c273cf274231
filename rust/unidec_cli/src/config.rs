use serde::{
    Deserialize,
    Serialize,
};
use std::path::{
    Path,
    PathBuf,
};

use crate::cli::Cli;
use crate::errors::CliError;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub deconvolution: unidec::Config,
    pub input: Option<InputConfig>,
    pub output: Option<OutputConfig>,
}

/// Auxiliary inputs shared by every spectrum of a batch.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct InputConfig {
    pub kernel: Option<PathBuf>,
    pub mass_list: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OutputConfig {
    pub directory: PathBuf,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, CliError> {
        let file = std::fs::File::open(path).map_err(|e| CliError::io(e, path))?;
        serde_json::from_reader(std::io::BufReader::new(file))
            .map_err(|e| CliError::ParseError { msg: e.to_string() })
    }

    /// Loads the config file (if any) and applies the command line overrides.
    pub fn with_cli_args(args: &Cli) -> Result<Self, CliError> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Config::default(),
        };

        let input = config.input.get_or_insert_with(InputConfig::default);
        if let Some(kernel) = &args.kernel {
            input.kernel = Some(kernel.clone());
        }
        if let Some(mass_list) = &args.mass_list {
            input.mass_list = Some(mass_list.clone());
        }
        if let Some(output_dir) = &args.output_dir {
            config.output = Some(OutputConfig {
                directory: output_dir.clone(),
            });
        }
        if config.output.is_none() {
            return Err(CliError::Config {
                source: "No output directory provided, please provide one in either the config file or with the --output-dir flag".to_string(),
            });
        }
        if config.deconvolution.doubledec
            && config.input.as_ref().is_none_or(|i| i.kernel.is_none())
        {
            return Err(CliError::Config {
                source: "Double deconvolution is enabled, please provide a kernel with the --kernel flag".to_string(),
            });
        }
        Ok(config)
    }
}
