use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the JSON configuration file, missing keys use the defaults
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Whitespace separated (m/z, intensity) spectra to deconvolve
    #[arg(required = true)]
    pub spectra: Vec<PathBuf>,

    /// Path to the output directory (will over-write the config file)
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Whitespace separated (mass, intensity) kernel for the double deconvolution
    #[arg(short, long)]
    pub kernel: Option<PathBuf>,

    /// One mass per line, only the cells close to these masses are deconvolved
    #[arg(short, long)]
    pub mass_list: Option<PathBuf>,
}
