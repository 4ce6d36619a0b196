//! Foundation utilities for piperun
//!
//! Shared by every piperun crate: the [`error::ProcessError`] taxonomy, engine
//! configuration, tracing setup for the binaries, and the bounded ring buffer used
//! to capture wrapper diagnostics.

pub mod config;
pub mod error;
pub mod logging;
pub mod ring_buffer;

pub use config::{EngineConfig, SpawnMode, WrapperConfig};
pub use error::{ConfigError, ProcessError};
pub use ring_buffer::RingBuffer;
