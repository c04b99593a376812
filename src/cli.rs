//! Command line model

use clap::{ArgAction, Parser};
use std::path::PathBuf;

/// Download files from a BiNinja server
#[derive(Clone, Debug, Parser)]
#[command(name = "bininja", version, about)]
pub struct Args {
    /// Server to connect to on startup (host[:port])
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Server port when --host does not name one
    #[arg(short, long)]
    pub port: Option<u16>,

    /// No interactive prompts; downloads without a target are skipped
    #[arg(short = 'c', long, action = ArgAction::SetTrue)]
    pub headless: bool,

    /// Run one console command, wait for downloads, exit
    #[arg(long, conflicts_with = "script")]
    pub command: Option<String>,

    /// Run console commands from a file (one per line), wait, exit
    #[arg(short = 'f', long)]
    pub script: Option<PathBuf>,

    /// Server public key (hex); enables the encrypted session
    #[arg(long)]
    pub public_key: Option<PathBuf>,

    /// Default directory for downloads
    #[arg(long)]
    pub download_dir: Option<PathBuf>,

    /// Config file (default: <config dir>/client.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, action = ArgAction::SetTrue)]
    pub verbose: bool,
}
