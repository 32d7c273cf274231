#[derive(Debug)]
pub enum CliError {
    Config {
        source: String,
    },
    ParseError {
        msg: String,
    },
    Io {
        source: String,
        path: Option<String>,
    },
    Deconvolution {
        source: unidec::UniDecError,
        path: Option<String>,
    },
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Config { source } => write!(f, "Error interpreting the config: {}", source),
            CliError::ParseError { msg } => write!(f, "Error parsing input: {}", msg),
            CliError::Io { source, path } => {
                if let Some(path) = path {
                    write!(f, "Error reading file {}: {}", path, source)
                } else {
                    write!(f, "Error reading file: {}", source)
                }
            }
            CliError::Deconvolution { source, path } => {
                if let Some(path) = path {
                    write!(f, "Error deconvolving {}: {}", path, source)
                } else {
                    write!(f, "Error deconvolving: {}", source)
                }
            }
        }
    }
}

impl std::error::Error for CliError {}

impl From<unidec::UniDecError> for CliError {
    fn from(e: unidec::UniDecError) -> Self {
        CliError::Deconvolution {
            source: e,
            path: None,
        }
    }
}

impl CliError {
    pub fn io(e: std::io::Error, path: &std::path::Path) -> Self {
        CliError::Io {
            source: e.to_string(),
            path: Some(path.to_string_lossy().to_string()),
        }
    }

    pub fn with_path(self, path: &std::path::Path) -> Self {
        match self {
            CliError::Deconvolution { source, .. } => CliError::Deconvolution {
                source,
                path: Some(path.to_string_lossy().to_string()),
            },
            other => other,
        }
    }
}
