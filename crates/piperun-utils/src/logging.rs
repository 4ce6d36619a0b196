//! Tracing setup for the piperun binaries
//!
//! Library code only emits `tracing` events; installing a subscriber is left to the
//! host application. The `piperun-wrapper` binary and the demo call
//! [`init_tracing`] so their diagnostics end up on stderr, which for the wrapper is
//! the side channel captured by the engine.

use std::io::IsTerminal;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Environment variable consulted before the built-in filter defaults.
pub const LOG_ENV: &str = "PIPERUN_LOG";

fn use_color() -> bool {
    std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none()
}

fn default_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| {
            if verbose {
                EnvFilter::try_new("piperun=debug,info")
            } else {
                EnvFilter::try_new("piperun=info,warn")
            }
        })
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install a stderr subscriber.
///
/// Verbose mode adds targets and span close events; the default is compact and
/// human-readable.
pub fn init_tracing(verbose: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = default_filter(verbose);

    if verbose {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(use_color())
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_line_number(false)
                    .with_file(false)
                    .with_span_events(FmtSpan::CLOSE)
                    .compact(),
            )
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(use_color())
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_line_number(false)
                    .with_file(false)
                    .compact(),
            )
            .try_init()?;
    }

    Ok(())
}

/// Span wrapping everything done on behalf of one spawned process.
pub fn process_span(program: &str, mode: &str) -> tracing::Span {
    tracing::info_span!("process", program = %program, mode = %mode)
}
