//! Engine ⇄ wrapper control protocol
//!
//! On platforms without usable exit notification or signals the engine launches
//! `piperun-wrapper` instead of the target. The wrapper connects back over four
//! loopback connections (control plus one per stdio stream), authenticates each
//! with a per-spawn token, starts the target and reports its real pid. Later the
//! engine asks for signals and the wrapper reports the exit status.
//!
//! - [`protocol`]: framing, messages and the launch request
//! - [`token`]: security tokens
//! - [`server`]: engine-side handshake
//! - [`agent`]: wrapper-side loop
//! - [`link`]: cancel-safe control connection shared by both sides

pub mod agent;
pub mod link;
pub mod protocol;
pub mod server;
pub mod token;

#[cfg(windows)]
mod windows_job;

pub use agent::{AgentError, SPAWN_FAILED_EXIT};
pub use link::{ControlEvent, ControlLink};
pub use protocol::{Channel, LaunchCommand, LaunchRequest, Message, ProtocolError, WireExit};
pub use server::{Established, HandshakeServer};
pub use token::{ChannelTokens, SecurityToken};
