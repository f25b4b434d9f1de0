//! Uses clap to define the CLI interface declaratively.
use std::path::PathBuf;

use clap::{command, Parser};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// TOML file listing the paths to watch and how to watch them
    #[arg(short, default_value = "tripwire.toml", long, value_name = "FILE")]
    pub config: PathBuf,

    /// never use the kernel notification facility
    #[arg(long)]
    pub polling: bool,

    /// overrides the config's log_level (RUST_LOG still wins)
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// extra paths, watched in addition to the configured ones
    pub paths: Vec<PathBuf>,
}
