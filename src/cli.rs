use clap::Parser;
use std::path::PathBuf;

/// Command-line interface for the usage service.
#[derive(Debug, Parser)]
#[command(author, version, about = "AI usage and cost tracking service", long_about = None)]
pub struct Cli {
    /// Path to a TOML configuration file (defaults to ./cost-guardian.toml if present).
    #[arg(long, value_name = "FILE")]
    pub config_path: Option<PathBuf>,
    /// Listen address override, e.g. 0.0.0.0:4810.
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<String>,
}
