//! watch-live: run a command and print its output as chunks arrive
//!
//! ```text
//! watch-live [--wrapper] [--config FILE] -- sh -c 'for i in 1 2 3; do echo $i; sleep 1; done'
//! ```
//!
//! Each chunk is printed with the stream it came from and the time since start,
//! which makes the one-chunk-per-read delivery visible.

use anyhow::Context;
use clap::Parser;
use piperun::{CommandSpec, EngineConfig, Launcher, ProcessInputStream, Reactor, SpawnMode};
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(name = "watch-live", about = "Print a command's output chunk by chunk")]
struct Cli {
    /// Spawn through piperun-wrapper even where direct spawning works
    #[arg(long)]
    wrapper: bool,

    /// Engine configuration file (TOML)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,

    /// Command and arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if let Err(e) = piperun::init_tracing(cli.verbose) {
        eprintln!("watch-live: logging unavailable: {e}");
    }

    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_path(path)?,
        None => EngineConfig::default(),
    }
    .with_env_overrides()?;
    if cli.wrapper {
        config.spawn_mode = SpawnMode::Wrapper;
    }

    let (program, args) = cli
        .command
        .split_first()
        .context("no command given")?;
    let spec = CommandSpec::new(program).args(args);
    let launcher = Launcher::new(Reactor::from_current()?, config);

    let clock = Instant::now();
    let mut process = launcher.start(&spec).await?;
    println!("[{:>7.3}s] started {}", clock.elapsed().as_secs_f64(), spec.display());
    let pid = process.started().await?;
    println!("[{:>7.3}s] pid {pid} ({})", clock.elapsed().as_secs_f64(), process.status());

    if let Some(stdin) = process.take_stdin() {
        stdin.close().await;
    }
    let stdout = process.take_stdout().context("stdout already taken")?;
    let stderr = process.take_stderr().context("stderr already taken")?;
    let (out, err) = tokio::join!(
        echo("stdout", &stdout, clock),
        echo("stderr", &stderr, clock)
    );
    out?;
    err?;

    let status = process.wait().await?;
    println!("[{:>7.3}s] {status}", clock.elapsed().as_secs_f64());
    Ok(())
}

async fn echo(name: &str, stream: &ProcessInputStream, clock: Instant) -> anyhow::Result<()> {
    while let Some(chunk) = stream.read().await? {
        println!(
            "[{:>7.3}s] {name} {} bytes: {:?}",
            clock.elapsed().as_secs_f64(),
            chunk.len(),
            String::from_utf8_lossy(&chunk)
        );
    }
    println!("[{:>7.3}s] {name} closed", clock.elapsed().as_secs_f64());
    Ok(())
}
