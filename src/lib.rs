//! piperun - asynchronous child processes with backpressure-aware pipes
//!
//! piperun spawns child processes and exposes their standard streams as async
//! objects driven by a [`Reactor`]. Reads deliver one chunk at a time and the
//! underlying readiness watcher is only enabled while a read is outstanding, so a
//! consumer that stops reading stops the engine from pulling data off the pipe.
//!
//! Two spawn paths exist:
//!
//! - **Direct** (unix): the command is spawned with native pipes; signals go
//!   straight to the kernel pid.
//! - **Wrapper** (all platforms, required on Windows): the engine starts the
//!   `piperun-wrapper` executable, which connects back over four authenticated
//!   loopback connections, launches the real command and relays its streams,
//!   pid, signal requests and exit status.
//!
//! # Quick Start
//!
//! ```no_run
//! use piperun::{CommandSpec, EngineConfig, Launcher, Reactor};
//!
//! # async fn demo() -> Result<(), piperun::ProcessError> {
//! let launcher = Launcher::new(Reactor::from_current()?, EngineConfig::default());
//! let process = launcher
//!     .start(&CommandSpec::new("sh").arg("-c").arg("echo hello; exit 3"))
//!     .await?;
//!
//! if let Some(stdout) = process.stdout() {
//!     while let Some(chunk) = stdout.read().await? {
//!         print!("{}", String::from_utf8_lossy(&chunk));
//!     }
//! }
//! let status = process.wait().await?;
//! assert_eq!(status.code(), Some(3));
//! # Ok(())
//! # }
//! ```
//!
//! # Crates
//!
//! | Crate | Contents |
//! |-------|----------|
//! | `piperun-utils` | errors, configuration, tracing setup, ring buffer |
//! | `piperun-reactor` | watcher registry over a tokio runtime |
//! | `piperun-stream` | [`ProcessInputStream`] and [`ProcessOutputStream`] |
//! | `piperun-wrapper` | wrapper protocol, handshake server, wrapper agent |
//! | `piperun-process` | [`ProcessHandle`], [`Process`] and [`Launcher`] |

pub use piperun_process::{
    CommandSpec, ExitStatus, Launcher, PosixHandle, Process, ProcessHandle, ProcessStatus,
    SIGKILL, WindowsHandle,
};
pub use piperun_reactor::{Reactor, ReadableSource, WatcherId, WatcherKind};
pub use piperun_stream::{ProcessInputStream, ProcessOutputStream, RawStream, ResourceState};
pub use piperun_utils::logging::init_tracing;
pub use piperun_utils::{ConfigError, EngineConfig, ProcessError, SpawnMode, WrapperConfig};

/// Wrapper protocol types and the wrapper-side agent.
pub mod wrapper {
    pub use piperun_wrapper::agent;
    pub use piperun_wrapper::{
        AgentError, Channel, ChannelTokens, HandshakeServer, LaunchCommand, LaunchRequest, Message,
        ProtocolError, SecurityToken, WireExit,
    };
}
