use piperun_reactor::Reactor;
use piperun_stream::{ProcessInputStream, ProcessOutputStream, RawStream};
use piperun_utils::logging::process_span;
use piperun_utils::{EngineConfig, ProcessError, SpawnMode};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{oneshot, watch};
use tracing::{Instrument, debug};

use crate::command_spec::CommandSpec;
use crate::handle::{Endpoints, ProcessHandle};
use crate::status::{ExitStatus, ProcessStatus};

/// Signal sent by [`Process::kill`].
pub const SIGKILL: i32 = 9;

type Slot = oneshot::Sender<Result<RawStream, ProcessError>>;

/// State shared between a [`Process`] and the task driving it.
pub(crate) struct Shared {
    handle: Mutex<ProcessHandle>,
    started: watch::Sender<Option<Result<u32, ProcessError>>>,
    exited: watch::Sender<Option<Result<ExitStatus, ProcessError>>>,
}

impl Shared {
    pub(crate) fn new(handle: ProcessHandle) -> Arc<Self> {
        Arc::new(Self {
            handle: Mutex::new(handle),
            started: watch::Sender::new(None),
            exited: watch::Sender::new(None),
        })
    }

    pub(crate) fn handle(&self) -> MutexGuard<'_, ProcessHandle> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the real pid and move to `Running`.
    pub(crate) fn mark_running(&self, pid: u32) {
        {
            let mut handle = self.handle();
            let core = handle.core_mut();
            core.set_pid(pid);
            core.advance(ProcessStatus::Running);
        }
        debug!(pid, "process running");
        self.started.send_replace(Some(Ok(pid)));
    }

    /// Move to `Ended`, then publish the outcome. Waiters never see an exit
    /// status while the handle still says `Running`.
    pub(crate) fn mark_ended(&self, outcome: Result<ExitStatus, ProcessError>) {
        {
            let mut handle = self.handle();
            let core = handle.core_mut();
            core.set_signals(None);
            core.advance(ProcessStatus::Ended);
        }
        match &outcome {
            Ok(status) => debug!(%status, "process ended"),
            Err(e) => debug!(error = %e, "lost track of process"),
        }
        self.exited.send_replace(Some(outcome));
    }

    /// The process never started. Status stays `Starting`.
    pub(crate) fn fail_start(&self, error: &ProcessError) {
        debug!(error = %error, "process failed to start");
        self.started.send_replace(Some(Err(error.clone())));
        self.exited.send_replace(Some(Err(error.clone())));
    }
}

/// Senders that complete the three stream resource futures.
pub(crate) struct EndpointSlots {
    stdin: Slot,
    stdout: Slot,
    stderr: Slot,
}

impl EndpointSlots {
    pub(crate) fn deliver(self, endpoints: Endpoints) {
        let _ = self.stdin.send(Ok(endpoints.stdin));
        let _ = self.stdout.send(Ok(endpoints.stdout));
        let _ = self.stderr.send(Ok(endpoints.stderr));
    }

    /// Hand the endpoints held by `shared`'s handle to the streams.
    pub(crate) fn deliver_from(self, shared: &Shared) {
        match shared.handle().core_mut().take_endpoints() {
            Some(endpoints) => self.deliver(endpoints),
            None => self.fail(&ProcessError::ResourceNotAcquired),
        }
    }

    pub(crate) fn fail(self, error: &ProcessError) {
        let _ = self.stdin.send(Err(error.clone()));
        let _ = self.stdout.send(Err(error.clone()));
        let _ = self.stderr.send(Err(error.clone()));
    }
}

fn slot() -> (Slot, impl Future<Output = Result<RawStream, ProcessError>> + Send + 'static) {
    let (tx, rx) = oneshot::channel();
    let resource = async move {
        rx.await
            .unwrap_or_else(|_| Err(ProcessError::handshake("process start was abandoned")))
    };
    (tx, resource)
}

/// A spawned child process.
///
/// The streams are usable as soon as this is returned, even while a wrapped
/// process is still completing its handshake.
pub struct Process {
    shared: Arc<Shared>,
    program: String,
    stdin: Option<ProcessOutputStream>,
    stdout: Option<ProcessInputStream>,
    stderr: Option<ProcessInputStream>,
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("program", &self.program)
            .field("pid", &self.pid())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Process {
    pub(crate) fn assemble(
        reactor: &Reactor,
        chunk_size: usize,
        shared: Arc<Shared>,
        program: String,
    ) -> (Self, EndpointSlots) {
        let (stdin_slot, stdin) = slot();
        let (stdout_slot, stdout) = slot();
        let (stderr_slot, stderr) = slot();

        let process = Self {
            shared,
            program,
            stdin: Some(ProcessOutputStream::new(reactor, stdin)),
            stdout: Some(ProcessInputStream::with_chunk_size(reactor, stdout, chunk_size)),
            stderr: Some(ProcessInputStream::with_chunk_size(reactor, stderr, chunk_size)),
        };
        let slots = EndpointSlots {
            stdin: stdin_slot,
            stdout: stdout_slot,
            stderr: stderr_slot,
        };
        (process, slots)
    }

    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    #[must_use]
    pub const fn stdin(&self) -> Option<&ProcessOutputStream> {
        self.stdin.as_ref()
    }

    #[must_use]
    pub const fn stdout(&self) -> Option<&ProcessInputStream> {
        self.stdout.as_ref()
    }

    #[must_use]
    pub const fn stderr(&self) -> Option<&ProcessInputStream> {
        self.stderr.as_ref()
    }

    pub fn take_stdin(&mut self) -> Option<ProcessOutputStream> {
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ProcessInputStream> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ProcessInputStream> {
        self.stderr.take()
    }

    /// Resolves with the real pid once the process is running.
    pub async fn started(&self) -> Result<u32, ProcessError> {
        let mut rx = self.shared.started.subscribe();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ProcessError::WrapperLost {
                reason: "process driver stopped".to_string(),
            })?;
        outcome.clone().unwrap_or(Err(ProcessError::NotRunning))
    }

    /// Real pid of the target; `None` until it is running.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.shared.handle().pid()
    }

    #[must_use]
    pub fn status(&self) -> ProcessStatus {
        self.shared.handle().status()
    }

    /// Wait for termination. The result is cached; later calls return it again.
    pub async fn wait(&self) -> Result<ExitStatus, ProcessError> {
        let mut rx = self.shared.exited.subscribe();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ProcessError::WrapperLost {
                reason: "process driver stopped".to_string(),
            })?;
        outcome.clone().unwrap_or(Err(ProcessError::NotRunning))
    }

    /// Exit status if the process has already ended.
    #[must_use]
    pub fn try_wait(&self) -> Option<Result<ExitStatus, ProcessError>> {
        self.shared.exited.borrow().clone()
    }

    /// Send `signal` to the running process.
    ///
    /// The request is handed to the task that owns the child, which delivers it
    /// only while the child has not been reaped.
    pub fn signal(&self, signal: i32) -> Result<(), ProcessError> {
        let handle = self.shared.handle();
        if handle.status() != ProcessStatus::Running {
            return Err(ProcessError::NotRunning);
        }
        #[cfg(unix)]
        if matches!(&*handle, ProcessHandle::Posix(_)) {
            crate::posix::check_signal(signal)?;
        }
        debug!(signal, "queueing signal");
        handle
            .core()
            .signals()
            .ok_or(ProcessError::NotRunning)?
            .send(signal)
            .map_err(|_| ProcessError::NotRunning)
    }

    pub fn kill(&self) -> Result<(), ProcessError> {
        self.signal(SIGKILL)
    }

    /// Pid of the wrapper process, on the wrapped path.
    #[must_use]
    pub fn wrapper_pid(&self) -> Option<u32> {
        self.shared
            .handle()
            .as_windows()
            .and_then(|windows| windows.wrapper_pid())
    }

    /// Captured wrapper stderr, on the wrapped path.
    #[must_use]
    pub fn wrapper_diagnostics(&self) -> Option<String> {
        self.shared
            .handle()
            .as_windows()
            .map(|windows| windows.wrapper_diagnostics())
    }

    /// Inspect the underlying handle.
    pub fn with_handle<R>(&self, inspect: impl FnOnce(&ProcessHandle) -> R) -> R {
        inspect(&self.shared.handle())
    }
}

/// Starts processes with one reactor and configuration.
#[derive(Debug, Clone)]
pub struct Launcher {
    reactor: Reactor,
    config: EngineConfig,
}

impl Launcher {
    #[must_use]
    pub const fn new(reactor: Reactor, config: EngineConfig) -> Self {
        Self { reactor, config }
    }

    #[must_use]
    pub const fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Spawn `spec`.
    ///
    /// Failures the OS reports at spawn time are returned here. On the wrapped path
    /// handshake failures surface through [`Process::started`], the streams and
    /// [`Process::wait`] instead.
    pub async fn start(&self, spec: &CommandSpec) -> Result<Process, ProcessError> {
        let mode = self.config.spawn_mode;
        let span = process_span(&spec.program_name(), mode.as_str());
        match mode {
            SpawnMode::Direct => span.in_scope(|| self.start_direct(spec)),
            SpawnMode::Wrapper => {
                crate::wrapped::start(&self.reactor, &self.config, spec, span.clone())
                    .instrument(span)
                    .await
            }
        }
    }

    #[cfg(unix)]
    fn start_direct(&self, spec: &CommandSpec) -> Result<Process, ProcessError> {
        crate::posix::start(&self.reactor, &self.config, spec)
    }

    #[cfg(not(unix))]
    fn start_direct(&self, spec: &CommandSpec) -> Result<Process, ProcessError> {
        Err(ProcessError::Spawn {
            program: spec.program_name(),
            reason: "direct spawning needs POSIX pipes; use spawn_mode = \"wrapper\"".to_string(),
        })
    }
}
