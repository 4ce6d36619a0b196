//! Spawning processes and driving them to completion
//!
//! [`Launcher::start`] spawns a [`CommandSpec`] either directly (native pipes and
//! signals, unix only) or through the `piperun-wrapper` executable (the only
//! option on Windows, available everywhere). Either way the caller gets a
//! [`Process`] whose streams are usable immediately and whose
//! [`wait`](Process::wait) resolves once, after the status reached
//! [`ProcessStatus::Ended`].

mod command_spec;
mod handle;
#[cfg(unix)]
mod posix;
mod process;
mod status;
mod wrapped;

pub use command_spec::CommandSpec;
pub use handle::{Endpoints, HandleCore, PosixHandle, ProcessHandle, WindowsHandle};
pub use process::{Launcher, Process, SIGKILL};
pub use status::{ExitStatus, ProcessStatus};
