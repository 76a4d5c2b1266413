use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct CliOptions {
    /// Personal-data export archive (zip)
    #[arg(short, long)]
    pub package: PathBuf,

    /// Device id (e.g. p6a) or a custom WIDTHxHEIGHT resolution
    #[arg(short, long)]
    pub device: String,

    /// Number of recovery worker threads
    #[arg(short, long, default_value_t = num_cpus::get())]
    pub threads: usize,

    /// Directory for downloaded and recovered images
    #[arg(short, long, default_value = "./download")]
    pub output: PathBuf,

    /// Append-only error log (JSON lines)
    #[arg(short, long, default_value = "cropsalvage.log")]
    pub log: PathBuf,

    /// Local recovery module; fetched from the configured URL when omitted
    #[arg(long)]
    pub module: Option<PathBuf>,

    /// Optional path to config file (YAML)
    #[arg(long)]
    pub config_path: Option<PathBuf>,
}

pub fn parse() -> CliOptions {
    CliOptions::parse()
}
