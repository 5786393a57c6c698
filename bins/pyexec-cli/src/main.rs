mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pyexec-cli")]
#[command(about = "pyexec CLI - Run and screen Python submissions without the HTTP service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a source file against one or more stdin cases
    Run {
        /// Python source file
        #[arg(short, long)]
        file: PathBuf,

        /// Stdin for a test case (repeatable, one test per value)
        #[arg(short, long)]
        stdin: Vec<String>,

        /// Expected stdout, matched positionally against --stdin
        #[arg(short, long)]
        expect: Vec<String>,

        /// Per-test timeout in milliseconds
        #[arg(short, long)]
        timeout_ms: Option<u64>,

        /// Skip Docker and run as a local subprocess
        #[arg(long, default_value = "false")]
        local: bool,
    },

    /// Apply the admission screening checks to a source file
    Scan {
        /// Python source file
        #[arg(short, long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            stdin,
            expect,
            timeout_ms,
            local,
        } => {
            let passed = commands::run_file(&file, stdin, expect, timeout_ms, local).await?;
            if !passed {
                std::process::exit(1);
            }
        }
        Commands::Scan { file } => {
            if !commands::scan_file(&file)? {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
