use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "sshlure",
    version,
    about = "SSH honeypot that fabricates a convincing server and audits everything"
)]
pub struct Cli {
    /// Path to configuration file (also settable via SSHLURE_CONFIG env var).
    /// Without one, every setting takes its default.
    #[arg(short, long, env = "SSHLURE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory for generated host keys and relative paths
    #[arg(short, long, default_value = "data", env = "SSHLURE_DATA_DIR")]
    pub data_dir: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate configuration file and host keys, then print the listen addresses
    CheckConfig,
}
