//! piperun-wrapper
//!
//! Started by the engine on the wrapped spawn path. Reads one launch request line
//! from stdin, connects back to the engine, runs the requested command and exits
//! with the command's exit code. Diagnostics go to stderr, which the engine keeps.

use anyhow::Context;
use clap::Parser;
use piperun::wrapper::{LaunchRequest, agent};
use std::io;
use std::process::ExitCode;
use tracing::debug;

/// Exit code for failures of the wrapper itself, before or outside the target.
const WRAPPER_FAILURE_EXIT: u8 = 70;

#[derive(Parser, Debug)]
#[command(
    name = "piperun-wrapper",
    version,
    about = "Runs a command on behalf of the piperun engine and relays its streams"
)]
struct Cli {
    /// Log protocol activity to stderr
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = piperun::init_tracing(cli.verbose) {
        eprintln!("piperun-wrapper: logging unavailable: {e}");
    }

    match run() {
        Ok(code) => ExitCode::from(exit_byte(code)),
        Err(e) => {
            eprintln!("piperun-wrapper: {e:#}");
            ExitCode::from(WRAPPER_FAILURE_EXIT)
        }
    }
}

fn run() -> anyhow::Result<i32> {
    let request = LaunchRequest::read_from(io::stdin().lock())?;
    debug!(
        address = %request.address,
        program = %request.command.program,
        args = request.command.args.len(),
        "launch request received"
    );
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")?;
    let code = runtime.block_on(agent::run(request))?;
    Ok(code)
}

// `ExitCode` carries a single byte; keep the low one like the shell does.
const fn exit_byte(code: i32) -> u8 {
    (code & 0xff) as u8
}
