use std::{path::PathBuf, sync::OnceLock};

use clap::Parser;

/// Ships the logs of local containers to stdout, one JSON event per line.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to the config file.
    #[arg(short, long, default_value = "dockerlog.toml")]
    pub config: PathBuf,
    /// Validate the config and the checkpoint file, then exit.
    #[arg(long)]
    pub check: bool,
}

static ARGS: OnceLock<Args> = OnceLock::new();

pub fn get_cli_args() -> &'static Args {
    ARGS.get_or_init(Args::parse)
}
