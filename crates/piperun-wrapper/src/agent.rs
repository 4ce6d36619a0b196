//! Wrapper side of the protocol
//!
//! Runs inside the `piperun-wrapper` executable: connects back to the engine,
//! starts the real command, relays its stdio and signals, and reports how it ended.

use std::io;
use std::net::SocketAddr;
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::link::{ControlEvent, ControlLink};
use crate::protocol::{Channel, LaunchCommand, LaunchRequest, Message, ProtocolError, WireExit, write_frame};

/// Exit code of the wrapper when the target could not be started.
pub const SPAWN_FAILED_EXIT: i32 = 127;

#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

#[cfg(windows)]
const SIGINT: i32 = 2;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("failed to connect the {channel} channel to {address}: {source}")]
    Connect {
        channel: Channel,
        address: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("control protocol failure: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("failed to wait for the target: {0}")]
    Wait(#[source] io::Error),
}

enum Step {
    Exited(io::Result<ExitStatus>),
    Control(ControlEvent),
}

struct DataChannels {
    stdin: TcpStream,
    stdout: TcpStream,
    stderr: TcpStream,
}

/// Serve one launch request to completion.
///
/// Returns the code the wrapper itself should exit with: the target's exit code,
/// `128 + signal` when it was killed by a signal, or [`SPAWN_FAILED_EXIT`].
pub async fn run(request: LaunchRequest) -> Result<i32, AgentError> {
    let (control, data) = connect(&request).await?;
    let mut control = ControlLink::new(control);

    let mut child = match spawn_target(&request.command) {
        Ok(child) => child,
        Err(e) => {
            warn!(program = %request.command.program, error = %e, "target failed to start");
            control
                .send(&Message::Error {
                    reason: e.to_string(),
                })
                .await?;
            return Ok(SPAWN_FAILED_EXIT);
        }
    };

    let Some(pid) = child.id() else {
        control
            .send(&Message::Error {
                reason: "target exited before its pid could be read".to_string(),
            })
            .await?;
        return Ok(SPAWN_FAILED_EXIT);
    };

    #[cfg(windows)]
    let _job = match crate::windows_job::create_job_object()
        .and_then(|job| crate::windows_job::assign_to_job(&job, pid).map(|()| job))
    {
        Ok(job) => Some(job),
        Err(e) => {
            warn!(pid, error = %e, "target not placed in a job object");
            None
        }
    };

    control.send(&Message::Pid { pid }).await?;
    info!(pid, program = %request.command.program, "target started");

    let stdin_pump = child.stdin.take().map(|sink| pump("stdin", data.stdin, sink));
    let stdout_pump = child.stdout.take().map(|source| pump("stdout", source, data.stdout));
    let stderr_pump = child.stderr.take().map(|source| pump("stderr", source, data.stderr));

    let mut engine_gone = false;
    let status = loop {
        let step = tokio::select! {
            status = child.wait() => Step::Exited(status),
            event = control.next_event(), if !engine_gone => Step::Control(event),
        };
        match step {
            Step::Exited(status) => break status.map_err(AgentError::Wait)?,
            Step::Control(ControlEvent::Message(Message::Signal { signal })) => {
                deliver_signal(&mut child, pid, signal);
            }
            Step::Control(ControlEvent::Message(other)) => {
                warn!(kind = other.kind(), "ignoring unexpected control message");
            }
            Step::Control(ControlEvent::Closed | ControlEvent::Failed(_)) => {
                warn!(pid, "engine went away; terminating target");
                engine_gone = true;
                if let Err(e) = child.start_kill() {
                    debug!(error = %e, "target already gone");
                }
            }
        }
    };

    // Output must be flushed to the engine before `exit` is reported.
    for pump in [stdout_pump, stderr_pump].into_iter().flatten() {
        let _ = pump.await;
    }
    if let Some(pump) = stdin_pump {
        pump.abort();
    }

    let wire = wire_exit(status);
    debug!(pid, ?wire, "target exited");
    if !engine_gone {
        control.send(&Message::Exit { status: wire }).await?;
    }

    Ok(match wire {
        WireExit::Code(code) => code,
        WireExit::Signal(signal) => 128 + signal,
    })
}

async fn connect(request: &LaunchRequest) -> Result<(TcpStream, DataChannels), AgentError> {
    let address = request.address;
    let open = |channel: Channel| async move {
        let mut stream = TcpStream::connect(address)
            .await
            .map_err(|source| AgentError::Connect {
                channel,
                address,
                source,
            })?;
        write_frame(
            &mut stream,
            &Message::Hello {
                channel,
                token: request.token_for(channel).clone(),
            },
        )
        .await?;
        Ok::<_, AgentError>(stream)
    };

    let control = open(Channel::Control).await?;
    let data = DataChannels {
        stdin: open(Channel::Stdin).await?,
        stdout: open(Channel::Stdout).await?,
        stderr: open(Channel::Stderr).await?,
    };
    debug!(%address, "all channels authenticated");
    Ok((control, data))
}

fn spawn_target(command: &LaunchCommand) -> io::Result<Child> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .envs(&command.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &command.cwd {
        cmd.current_dir(cwd);
    }
    #[cfg(windows)]
    cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);

    cmd.spawn()
}

fn pump<R, W>(name: &'static str, mut from: R, mut to: W) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        match tokio::io::copy(&mut from, &mut to).await {
            Ok(bytes) => debug!(channel = name, bytes, "relay finished"),
            Err(e) => debug!(channel = name, error = %e, "relay stopped"),
        }
        let _ = to.shutdown().await;
    })
}

#[cfg(unix)]
fn deliver_signal(_child: &mut Child, pid: u32, signal: i32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let outcome = Signal::try_from(signal).and_then(|sig| {
        let pid = i32::try_from(pid).map_err(|_| nix::errno::Errno::ESRCH)?;
        kill(Pid::from_raw(pid), sig)
    });
    match outcome {
        Ok(()) => debug!(pid, signal, "signal delivered"),
        Err(e) => warn!(pid, signal, error = %e, "signal not delivered"),
    }
}

#[cfg(windows)]
fn deliver_signal(child: &mut Child, pid: u32, signal: i32) {
    let outcome = if signal == SIGINT {
        crate::windows_job::send_ctrl_break(pid)
    } else {
        child.start_kill()
    };
    match outcome {
        Ok(()) => debug!(pid, signal, "signal delivered"),
        Err(e) => warn!(pid, signal, error = %e, "signal not delivered"),
    }
}

#[cfg(unix)]
fn wire_exit(status: ExitStatus) -> WireExit {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => WireExit::Code(code),
        (None, Some(signal)) => WireExit::Signal(signal),
        (None, None) => WireExit::Code(-1),
    }
}

#[cfg(not(unix))]
fn wire_exit(status: ExitStatus) -> WireExit {
    WireExit::Code(status.code().unwrap_or(-1))
}
