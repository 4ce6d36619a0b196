//! Direct spawn path: native pipes, native pid, `waitpid` for exit

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use piperun_reactor::Reactor;
use piperun_stream::RawStream;
use piperun_utils::{EngineConfig, ProcessError};
use std::io;
use std::process::Stdio;
use tokio::process::Child;
use tokio::sync::mpsc;
use tracing::{Instrument, Span, debug, warn};

use crate::command_spec::CommandSpec;
use crate::handle::{Endpoints, ProcessHandle};
use crate::process::{Process, SIGKILL, Shared};
use crate::status::ExitStatus;

pub(crate) fn start(
    reactor: &Reactor,
    config: &EngineConfig,
    spec: &CommandSpec,
) -> Result<Process, ProcessError> {
    let program = spec.program_name();
    let spawn_failed = |e: io::Error| ProcessError::Spawn {
        program: program.clone(),
        reason: e.to_string(),
    };

    let (stdin_child, stdin_ours) = io::pipe().map_err(spawn_failed)?;
    let (stdout_ours, stdout_child) = io::pipe().map_err(spawn_failed)?;
    let (stderr_ours, stderr_child) = io::pipe().map_err(spawn_failed)?;

    // The command owns the child's ends; dropping it right after spawn closes
    // them here so the child holds the only copies.
    let mut child = {
        let mut cmd = spec.to_tokio_command();
        cmd.stdin(Stdio::from(stdin_child))
            .stdout(Stdio::from(stdout_child))
            .stderr(Stdio::from(stderr_child));
        cmd.spawn().map_err(spawn_failed)?
    };
    let pid = child
        .id()
        .ok_or_else(|| spawn_failed(io::Error::other("child was reaped before its pid was read")))?;

    let (signal_tx, signals) = mpsc::unbounded_channel();
    let shared = Shared::new(ProcessHandle::posix());
    {
        let mut handle = shared.handle();
        let core = handle.core_mut();
        core.attach(Endpoints {
            stdin: RawStream::from(stdin_ours),
            stdout: RawStream::from(stdout_ours),
            stderr: RawStream::from(stderr_ours),
        });
        core.set_signals(Some(signal_tx));
    }

    let (process, slots) = Process::assemble(reactor, config.chunk_size, shared.clone(), program);
    slots.deliver_from(&shared);
    shared.mark_running(pid);

    reactor.spawn(
        async move {
            let outcome = supervise(&mut child, signals).await;
            shared.mark_ended(outcome);
        }
        .instrument(Span::current()),
    );

    debug!(pid, command = %spec.display(), "spawned directly");
    Ok(process)
}

enum Step {
    Exited(io::Result<std::process::ExitStatus>),
    Signal(Option<i32>),
}

/// Own the child until it is reaped. Signals are only delivered from here, while
/// `wait` has not yet returned, so the pid they target is still ours.
async fn supervise(
    child: &mut Child,
    mut signals: mpsc::UnboundedReceiver<i32>,
) -> Result<ExitStatus, ProcessError> {
    let mut signals_open = true;
    loop {
        let step = tokio::select! {
            biased;
            status = child.wait() => Step::Exited(status),
            signal = signals.recv(), if signals_open => Step::Signal(signal),
        };
        match step {
            Step::Exited(status) => {
                return status
                    .map(Into::into)
                    .map_err(|e| ProcessError::io("wait for child", &e));
            }
            Step::Signal(None) => signals_open = false,
            Step::Signal(Some(signal)) => deliver(child, signal),
        }
    }
}

fn deliver(child: &mut Child, signal: i32) {
    let outcome = match child.id() {
        None => return,
        Some(_) if signal == SIGKILL => child
            .start_kill()
            .map_err(|e| ProcessError::io("kill child", &e)),
        Some(pid) => send_signal(pid, signal),
    };
    if let Err(e) = outcome {
        warn!(signal, error = %e, "signal not delivered");
    }
}

/// Map a raw signal number, rejecting numbers the platform does not know.
pub(crate) fn check_signal(signal: i32) -> Result<Signal, ProcessError> {
    Signal::try_from(signal).map_err(|e| ProcessError::Io {
        operation: format!("send signal {signal}"),
        reason: e.to_string(),
    })
}

fn send_signal(pid: u32, signal: i32) -> Result<(), ProcessError> {
    let signo = check_signal(signal)?;
    let failed = |reason: String| ProcessError::Io {
        operation: format!("send signal {signal} to {pid}"),
        reason,
    };
    let pid = i32::try_from(pid).map_err(|e| failed(e.to_string()))?;
    kill(Pid::from_raw(pid), signo).map_err(|e| failed(e.to_string()))
}
