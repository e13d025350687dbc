//! memfs shell: runs a command script against an in-memory file system
//!
//! The file system lives only for the duration of the run. Commands are read
//! one per line from a script file, or from stdin when none is given.

mod commands;

use anyhow::{Context, Result};
use clap::Parser;
use memfs_core::{FsConfig, MemoryFileSystem};
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Args {
    /// Script to run; reads stdin when omitted
    script: Option<PathBuf>,

    /// Configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Keep running after a failing line
    #[arg(short, long)]
    keep_going: bool,
}

fn load_config(config_path: Option<PathBuf>) -> Result<FsConfig> {
    match config_path {
        Some(path) => {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config: FsConfig = serde_json::from_str(&content)?;
            Ok(config)
        }
        None => {
            // Default configuration
            Ok(FsConfig::default())
        }
    }
}

fn read_script(script: Option<PathBuf>) -> Result<String> {
    match script {
        Some(path) => {
            fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))
        }
        None => {
            let mut script = String::new();
            io::stdin().read_to_string(&mut script)?;
            Ok(script)
        }
    }
}

fn main() -> Result<()> {
    // stdout carries command output, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    let config = load_config(args.config)?;
    info!("Configuration loaded: {:?}", config);
    let filesystem = MemoryFileSystem::new(config)?;

    let script = read_script(args.script)?;
    let failures = commands::run_script(
        &filesystem,
        &script,
        args.keep_going,
        &mut io::stdout().lock(),
        &mut io::stderr().lock(),
    )?;
    if failures > 0 {
        warn!(failures, "script finished with failing lines");
        std::process::exit(1);
    }
    Ok(())
}
