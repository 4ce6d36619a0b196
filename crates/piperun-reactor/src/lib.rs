//! Reactor interface consumed by the piperun engine
//!
//! The engine never talks to the runtime directly. It registers readable sources and
//! timers with a [`Reactor`], toggles them on and off, and marks whether each one
//! should keep the host's loop alive. The implementation here drives every watcher as
//! a task on a tokio runtime handle supplied by the host.

mod reactor;
mod source;

pub use reactor::{Reactor, WatcherId, WatcherKind};
pub use source::ReadableSource;
