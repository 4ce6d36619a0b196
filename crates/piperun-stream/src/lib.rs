//! Process stream wrappers
//!
//! [`ProcessInputStream`] and [`ProcessOutputStream`] wrap one raw endpoint of a
//! child process. Both accept a future yielding the endpoint, so they can be handed
//! out before the endpoint exists (the wrapper path only learns its sockets after
//! the handshake) and are usable immediately.

mod input;
mod output;
mod raw;

pub use input::{ProcessInputStream, ResourceState};
pub use output::ProcessOutputStream;
pub use raw::RawStream;

use piperun_utils::ProcessError;
use std::future::Future;
use std::pin::Pin;

/// Future that eventually yields the raw endpoint backing a stream.
pub type ResourceFuture = Pin<Box<dyn Future<Output = Result<RawStream, ProcessError>> + Send>>;
