//! Per-process control record
//!
//! A [`ProcessHandle`] is created with status `Starting` when a spawn is requested
//! and filled in as the platform spawn sequence completes: right away on the
//! direct path, after the wrapper handshake on the wrapped path. It is owned by
//! the [`Process`](crate::Process) façade and mutated only by it and by the
//! background task driving that process.

use piperun_reactor::WatcherId;
use piperun_stream::RawStream;
use piperun_utils::RingBuffer;
use piperun_wrapper::ChannelTokens;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::warn;

use crate::status::ProcessStatus;

/// Engine-side endpoints of the child's three standard streams.
#[derive(Debug)]
pub struct Endpoints {
    pub stdin: RawStream,
    pub stdout: RawStream,
    pub stderr: RawStream,
}

/// State every variant carries.
#[derive(Debug)]
pub struct HandleCore {
    // Endpoints stay here only until they are handed to their stream wrappers.
    stdin: Option<RawStream>,
    stdout: Option<RawStream>,
    stderr: Option<RawStream>,
    pid: Option<u32>,
    status: ProcessStatus,
    // Signal requests for whichever task owns the live child; `None` unless running.
    signals: Option<mpsc::UnboundedSender<i32>>,
}

impl HandleCore {
    fn new() -> Self {
        Self {
            stdin: None,
            stdout: None,
            stderr: None,
            pid: None,
            status: ProcessStatus::Starting,
            signals: None,
        }
    }

    /// Real pid of the target, once known.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[must_use]
    pub const fn status(&self) -> ProcessStatus {
        self.status
    }

    /// Whether the endpoints arrived and have not been handed off yet.
    #[cfg(test)]
    const fn holds_endpoints(&self) -> bool {
        self.stdin.is_some() || self.stdout.is_some() || self.stderr.is_some()
    }

    pub(crate) fn set_pid(&mut self, pid: u32) {
        self.pid = Some(pid);
    }

    /// Move to `next` if that is the following state. Returns whether it moved.
    pub(crate) fn advance(&mut self, next: ProcessStatus) -> bool {
        if self.status.can_advance_to(next) {
            self.status = next;
            true
        } else {
            warn!(from = %self.status, to = %next, "ignored out-of-order status change");
            false
        }
    }

    pub(crate) fn set_signals(&mut self, signals: Option<mpsc::UnboundedSender<i32>>) {
        self.signals = signals;
    }

    pub(crate) fn signals(&self) -> Option<&mpsc::UnboundedSender<i32>> {
        self.signals.as_ref()
    }

    pub(crate) fn attach(&mut self, endpoints: Endpoints) {
        self.stdin = Some(endpoints.stdin);
        self.stdout = Some(endpoints.stdout);
        self.stderr = Some(endpoints.stderr);
    }

    pub(crate) fn take_endpoints(&mut self) -> Option<Endpoints> {
        match (self.stdin.take(), self.stdout.take(), self.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => Some(Endpoints {
                stdin,
                stdout,
                stderr,
            }),
            _ => None,
        }
    }
}

/// Direct spawn: the pid is the kernel pid from the moment of spawn.
#[derive(Debug)]
pub struct PosixHandle {
    core: HandleCore,
}

/// Spawn through the wrapper executable. Always used on Windows.
#[derive(Debug)]
pub struct WindowsHandle {
    core: HandleCore,
    wrapper_pid: Option<u32>,
    wrapper_stderr: Arc<Mutex<RingBuffer>>,
    listen_address: Option<SocketAddr>,
    // Dropped once the handshake has used them.
    security_tokens: Option<ChannelTokens>,
    connect_timeout_watcher: Option<WatcherId>,
}

impl WindowsHandle {
    /// Pid of the wrapper process itself, not of the target.
    #[must_use]
    pub const fn wrapper_pid(&self) -> Option<u32> {
        self.wrapper_pid
    }

    /// Loopback address the wrapper connects back to.
    #[must_use]
    pub const fn listen_address(&self) -> Option<SocketAddr> {
        self.listen_address
    }

    /// Reactor timer bounding the handshake, while it is armed.
    #[must_use]
    pub const fn connect_timeout_watcher(&self) -> Option<WatcherId> {
        self.connect_timeout_watcher
    }

    #[must_use]
    pub const fn awaiting_handshake(&self) -> bool {
        self.security_tokens.is_some()
    }

    /// What the wrapper wrote to its own stderr so far.
    #[must_use]
    pub fn wrapper_diagnostics(&self) -> String {
        self.wrapper_stderr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .summary()
    }

    pub(crate) fn wrapper_stderr(&self) -> Arc<Mutex<RingBuffer>> {
        Arc::clone(&self.wrapper_stderr)
    }

    pub(crate) fn begin_handshake(
        &mut self,
        wrapper_pid: Option<u32>,
        listen_address: SocketAddr,
        tokens: ChannelTokens,
        watchdog: WatcherId,
    ) {
        self.wrapper_pid = wrapper_pid;
        self.listen_address = Some(listen_address);
        self.security_tokens = Some(tokens);
        self.connect_timeout_watcher = Some(watchdog);
    }

    /// Handshake over, successfully or not. Returns the watchdog to cancel.
    pub(crate) fn end_handshake(&mut self) -> Option<WatcherId> {
        self.security_tokens = None;
        self.connect_timeout_watcher.take()
    }
}

#[derive(Debug)]
pub enum ProcessHandle {
    Posix(PosixHandle),
    Windows(WindowsHandle),
}

impl ProcessHandle {
    #[must_use]
    pub fn posix() -> Self {
        Self::Posix(PosixHandle {
            core: HandleCore::new(),
        })
    }

    #[must_use]
    pub fn windows() -> Self {
        Self::Windows(WindowsHandle {
            core: HandleCore::new(),
            wrapper_pid: None,
            wrapper_stderr: Arc::new(Mutex::new(RingBuffer::default())),
            listen_address: None,
            security_tokens: None,
            connect_timeout_watcher: None,
        })
    }

    #[must_use]
    pub const fn core(&self) -> &HandleCore {
        match self {
            Self::Posix(handle) => &handle.core,
            Self::Windows(handle) => &handle.core,
        }
    }

    pub(crate) fn core_mut(&mut self) -> &mut HandleCore {
        match self {
            Self::Posix(handle) => &mut handle.core,
            Self::Windows(handle) => &mut handle.core,
        }
    }

    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.core().pid()
    }

    #[must_use]
    pub const fn status(&self) -> ProcessStatus {
        self.core().status()
    }

    #[must_use]
    pub const fn as_windows(&self) -> Option<&WindowsHandle> {
        match self {
            Self::Windows(handle) => Some(handle),
            Self::Posix(_) => None,
        }
    }

    pub(crate) fn as_windows_mut(&mut self) -> Option<&mut WindowsHandle> {
        match self {
            Self::Windows(handle) => Some(handle),
            Self::Posix(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn endpoints() -> Endpoints {
        let (stdin, _) = std::io::pipe().unwrap();
        let (stdout, _) = std::io::pipe().unwrap();
        let (stderr, _) = std::io::pipe().unwrap();
        Endpoints {
            stdin: stdin.into(),
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    #[test]
    fn test_new_handles_start_empty() {
        for handle in [ProcessHandle::posix(), ProcessHandle::windows()] {
            assert_eq!(handle.status(), ProcessStatus::Starting);
            assert_eq!(handle.pid(), None);
            assert!(!handle.core().holds_endpoints());
        }
    }

    #[test]
    fn test_status_never_moves_backwards() {
        let mut handle = ProcessHandle::posix();
        let core = handle.core_mut();

        assert!(!core.advance(ProcessStatus::Ended));
        assert!(core.advance(ProcessStatus::Running));
        assert!(core.advance(ProcessStatus::Ended));
        assert!(!core.advance(ProcessStatus::Running));
        assert!(!core.advance(ProcessStatus::Starting));
        assert_eq!(core.status(), ProcessStatus::Ended);
    }

    #[cfg(unix)]
    #[test]
    fn test_endpoints_are_handed_off_once() {
        let mut handle = ProcessHandle::posix();
        handle.core_mut().attach(endpoints());
        assert!(handle.core().holds_endpoints());

        assert!(handle.core_mut().take_endpoints().is_some());
        assert!(handle.core_mut().take_endpoints().is_none());
        assert!(!handle.core().holds_endpoints());
    }

    #[test]
    fn test_handshake_bookkeeping() {
        let mut handle = ProcessHandle::windows();
        let windows = handle.as_windows_mut().unwrap();
        windows.begin_handshake(
            Some(100),
            "127.0.0.1:5000".parse().unwrap(),
            ChannelTokens::generate(),
            7,
        );
        assert!(windows.awaiting_handshake());
        assert_eq!(windows.connect_timeout_watcher(), Some(7));
        assert_eq!(windows.wrapper_pid(), Some(100));

        assert_eq!(windows.end_handshake(), Some(7));
        assert!(!windows.awaiting_handshake());
        assert_eq!(windows.end_handshake(), None);
        assert!(ProcessHandle::posix().as_windows().is_none());
    }
}
