//! Wrapped spawn path
//!
//! The engine starts `piperun-wrapper`, which connects back, authenticates,
//! starts the real command and reports its pid. A supervisor task owns the wrapper
//! child and the control link for the lifetime of the process.

use piperun_reactor::Reactor;
use piperun_stream::RawStream;
use piperun_utils::config::WRAPPER_BINARY_NAME;
use piperun_utils::{EngineConfig, ProcessError, RingBuffer};
use piperun_wrapper::{ControlEvent, ControlLink, Established, HandshakeServer, LaunchRequest, Message};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{Instrument, Span, debug, warn};

use crate::command_spec::CommandSpec;
use crate::handle::{Endpoints, ProcessHandle};
use crate::process::{EndpointSlots, Process, Shared};
use crate::status::ExitStatus;

/// How long a handshake may keep going after the wrapper itself exited. Frames
/// it wrote before exiting are still in flight.
const WRAPPER_EXIT_GRACE: Duration = Duration::from_millis(250);

/// How long to wait for the wrapper to exit on its own after reporting `exit`.
const WRAPPER_REAP_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) async fn start(
    reactor: &Reactor,
    config: &EngineConfig,
    spec: &CommandSpec,
    span: Span,
) -> Result<Process, ProcessError> {
    let target = spec.program_name();
    let command = spec.to_launch_command()?;
    let wrapper_program = config
        .resolve_wrapper_program()
        .map_err(|e| ProcessError::Spawn {
            program: WRAPPER_BINARY_NAME.to_string(),
            reason: e.to_string(),
        })?;

    let server = HandshakeServer::bind()
        .await?
        .on_runtime(reactor.handle().clone());
    let request = server.launch_request(command);

    let mut wrapper = Command::new(&wrapper_program)
        .args(&config.wrapper.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ProcessError::Spawn {
            program: wrapper_program.display().to_string(),
            reason: e.to_string(),
        })?;
    let wrapper_pid = wrapper.id();

    let shared = Shared::new(ProcessHandle::windows());
    let (timeout_tx, timeout_rx) = oneshot::channel();
    let watchdog = reactor.delay(config.handshake_timeout(), move || {
        let _ = timeout_tx.send(());
    });

    let stderr_capture = {
        let mut handle = shared.handle();
        let Some(windows) = handle.as_windows_mut() else {
            return Err(ProcessError::handshake("wrapped process got a direct handle"));
        };
        windows.begin_handshake(wrapper_pid, server.address(), server.tokens().clone(), watchdog);
        windows.wrapper_stderr()
    };
    let stderr_drain = wrapper
        .stderr
        .take()
        .map(|stderr| drain_stderr(reactor, stderr, Arc::clone(&stderr_capture)));

    let (process, slots) = Process::assemble(reactor, config.chunk_size, shared.clone(), target.clone());

    let supervisor = Supervisor {
        reactor: reactor.clone(),
        shared,
        wrapper,
        wrapper_program,
        target,
        stderr_capture,
        stderr_drain,
        timeout_ms: config.handshake_timeout_ms,
    };
    reactor.spawn(supervisor.run(server, request, timeout_rx, slots).instrument(span));

    debug!(?wrapper_pid, command = %spec.display(), "spawned through wrapper");
    Ok(process)
}

fn drain_stderr(
    reactor: &Reactor,
    mut stderr: ChildStderr,
    capture: Arc<Mutex<RingBuffer>>,
) -> JoinHandle<()> {
    reactor.spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match stderr.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => capture
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .write(&buf[..n]),
            }
        }
    })
}

struct Supervisor {
    reactor: Reactor,
    shared: Arc<Shared>,
    wrapper: Child,
    wrapper_program: PathBuf,
    target: String,
    stderr_capture: Arc<Mutex<RingBuffer>>,
    stderr_drain: Option<JoinHandle<()>>,
    timeout_ms: u64,
}

impl Supervisor {
    async fn run(
        mut self,
        server: HandshakeServer,
        request: LaunchRequest,
        timeout: oneshot::Receiver<()>,
        slots: EndpointSlots,
    ) {
        let handshake = self.handshake(server, &request, timeout).await;

        let watchdog = self
            .shared
            .handle()
            .as_windows_mut()
            .and_then(|windows| windows.end_handshake());
        if let Some(watchdog) = watchdog {
            self.reactor.cancel(watchdog);
        }

        match handshake {
            Ok(established) => self.supervise(established, slots).await,
            Err(error) => {
                warn!(error = %error, "wrapper handshake failed");
                slots.fail(&error);
                self.shared.fail_start(&error);
                self.terminate_wrapper().await;
            }
        }
    }

    async fn handshake(
        &mut self,
        server: HandshakeServer,
        request: &LaunchRequest,
        mut timeout: oneshot::Receiver<()>,
    ) -> Result<Established, ProcessError> {
        self.send_request(request).await;

        let target = self.target.clone();
        let timeout_ms = self.timeout_ms;
        let establish = server.establish(&target);
        tokio::pin!(establish);

        let exit_status = tokio::select! {
            biased;
            result = &mut establish => return result,
            Ok(()) = &mut timeout => {
                return Err(ProcessError::HandshakeTimeout { timeout_ms });
            }
            status = self.wrapper.wait() => status,
        };

        // The wrapper is gone; anything it managed to send is already buffered.
        if let Ok(result) = tokio::time::timeout(WRAPPER_EXIT_GRACE, &mut establish).await {
            return result;
        }

        self.finish_stderr_drain().await;
        let status = match exit_status {
            Ok(status) => status.to_string(),
            Err(e) => e.to_string(),
        };
        let diagnostics = self.diagnostics();
        Err(ProcessError::handshake(if diagnostics.is_empty() {
            format!("wrapper exited ({status}) before completing the handshake")
        } else {
            format!("wrapper exited ({status}) before completing the handshake: {diagnostics}")
        }))
    }

    async fn send_request(&mut self, request: &LaunchRequest) {
        let Some(mut stdin) = self.wrapper.stdin.take() else {
            return;
        };
        let line = match request.to_line() {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "launch request could not be encoded");
                return;
            }
        };
        // A wrapper that died early shows up as a failed handshake instead.
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            debug!(error = %e, "wrapper stdin closed before the launch request was written");
        }
        drop(stdin);
    }

    async fn supervise(mut self, established: Established, slots: EndpointSlots) {
        let Established {
            pid,
            control,
            stdin,
            stdout,
            stderr,
        } = established;

        let (signal_tx, signals) = mpsc::unbounded_channel();
        {
            let mut handle = self.shared.handle();
            handle.core_mut().attach(Endpoints {
                stdin: RawStream::from(stdin),
                stdout: RawStream::from(stdout),
                stderr: RawStream::from(stderr),
            });
            handle.core_mut().set_signals(Some(signal_tx));
        }
        slots.deliver_from(&self.shared);
        self.shared.mark_running(pid);

        let outcome = relay(control, signals).await;

        self.shared.mark_ended(outcome);

        match tokio::time::timeout(WRAPPER_REAP_TIMEOUT, self.wrapper.wait()).await {
            Ok(Ok(status)) => debug!(%status, "wrapper exited"),
            Ok(Err(e)) => debug!(error = %e, "wrapper could not be reaped"),
            Err(_) => {
                warn!(program = %self.wrapper_program.display(), "wrapper lingered after exit report");
                self.terminate_wrapper().await;
            }
        }
        self.finish_stderr_drain().await;
        let diagnostics = self.diagnostics();
        if !diagnostics.is_empty() {
            debug!(stderr = %diagnostics, "wrapper diagnostics");
        }
    }

    async fn terminate_wrapper(&mut self) {
        if let Err(e) = self.wrapper.start_kill() {
            debug!(error = %e, "wrapper already gone");
        }
        let _ = self.wrapper.wait().await;
    }

    async fn finish_stderr_drain(&mut self) {
        if let Some(drain) = self.stderr_drain.take() {
            if tokio::time::timeout(WRAPPER_EXIT_GRACE, drain).await.is_err() {
                debug!("wrapper stderr still open");
            }
        }
    }

    fn diagnostics(&self) -> String {
        self.stderr_capture
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .summary()
    }
}

enum Step {
    Signal(Option<i32>),
    Control(ControlEvent),
}

/// Forward signal requests until the wrapper reports how the target ended.
async fn relay(
    mut control: ControlLink,
    mut signals: mpsc::UnboundedReceiver<i32>,
) -> Result<ExitStatus, ProcessError> {
    let mut signals_open = true;
    loop {
        let step = tokio::select! {
            signal = signals.recv(), if signals_open => Step::Signal(signal),
            event = control.next_event() => Step::Control(event),
        };
        match step {
            Step::Signal(Some(signal)) => {
                if let Err(e) = control.send(&Message::Signal { signal }).await {
                    warn!(signal, error = %e, "signal request not delivered to wrapper");
                }
            }
            Step::Signal(None) => signals_open = false,
            Step::Control(ControlEvent::Message(Message::Exit { status })) => {
                return Ok(status.into());
            }
            Step::Control(ControlEvent::Message(other)) => {
                warn!(kind = other.kind(), "ignoring unexpected message from wrapper");
            }
            Step::Control(ControlEvent::Closed) => {
                return Err(ProcessError::WrapperLost {
                    reason: "control connection closed before an exit report".to_string(),
                });
            }
            Step::Control(ControlEvent::Failed(reason)) => {
                return Err(ProcessError::WrapperLost { reason });
            }
        }
    }
}
