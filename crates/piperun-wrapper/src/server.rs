//! Engine side of the wrapper handshake

use piperun_utils::ProcessError;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::link::{ControlEvent, ControlLink};
use crate::protocol::{Channel, LaunchCommand, LaunchRequest, Message, read_frame};
use crate::token::{ChannelTokens, SecurityToken};

/// Listener and secrets for one wrapped spawn.
pub struct HandshakeServer {
    listener: TcpListener,
    address: SocketAddr,
    tokens: ChannelTokens,
    // Where the control link's reader task runs.
    runtime: Handle,
}

impl std::fmt::Debug for HandshakeServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeServer")
            .field("address", &self.address)
            .field("tokens", &self.tokens)
            .finish_non_exhaustive()
    }
}

/// Everything a completed handshake yields.
#[derive(Debug)]
pub struct Established {
    /// Pid of the real child, not of the wrapper.
    pub pid: u32,
    pub control: ControlLink,
    pub stdin: std::net::TcpStream,
    pub stdout: std::net::TcpStream,
    pub stderr: std::net::TcpStream,
}

impl HandshakeServer {
    /// Listen on an ephemeral loopback port with fresh tokens.
    pub async fn bind() -> Result<Self, ProcessError> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(|e| ProcessError::io("bind wrapper control listener", &e))?;
        let address = listener
            .local_addr()
            .map_err(|e| ProcessError::io("query wrapper control listener", &e))?;
        debug!(%address, "wrapper control listener ready");

        Ok(Self {
            listener,
            address,
            tokens: ChannelTokens::generate(),
            runtime: Handle::current(),
        })
    }

    /// Run the control reader on `runtime` instead of the one `bind` ran on.
    #[must_use]
    pub fn on_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = runtime;
        self
    }

    #[must_use]
    pub const fn address(&self) -> SocketAddr {
        self.address
    }

    #[must_use]
    pub const fn tokens(&self) -> &ChannelTokens {
        &self.tokens
    }

    /// The request to hand to the wrapper on its stdin.
    #[must_use]
    pub fn launch_request(&self, command: LaunchCommand) -> LaunchRequest {
        LaunchRequest {
            address: self.address,
            tokens: self.tokens.clone(),
            command,
        }
    }

    /// Authenticate all four connections and wait for the child's pid.
    ///
    /// Any connection that does not open with a valid `hello` aborts the
    /// handshake; each token is accepted once. Has no timeout of its own.
    pub async fn establish(self, program: &str) -> Result<Established, ProcessError> {
        let Self {
            listener,
            tokens,
            runtime,
            ..
        } = self;

        let mut expected: HashMap<Channel, SecurityToken> = Channel::ALL
            .into_iter()
            .map(|channel| (channel, tokens.get(channel).clone()))
            .collect();
        let mut connected: HashMap<Channel, TcpStream> = HashMap::new();

        while !expected.is_empty() {
            let (mut stream, peer) = listener
                .accept()
                .await
                .map_err(|e| ProcessError::io("accept wrapper connection", &e))?;

            let first = read_frame(&mut stream)
                .await
                .map_err(|e| ProcessError::handshake(format!("bad frame from {peer}: {e}")))?;

            match first {
                Some(Message::Hello { channel, token }) => {
                    let Some(wanted) = expected.remove(&channel) else {
                        warn!(%peer, %channel, "second hello for an authenticated channel");
                        return Err(ProcessError::handshake(format!(
                            "{channel} channel was already authenticated"
                        )));
                    };
                    if !wanted.matches(&token) {
                        warn!(%peer, %channel, "wrapper presented a wrong token");
                        return Err(ProcessError::handshake(format!(
                            "token mismatch on {channel} channel"
                        )));
                    }
                    debug!(%channel, "wrapper channel authenticated");
                    connected.insert(channel, stream);
                }
                Some(other) => {
                    return Err(ProcessError::handshake(format!(
                        "expected hello from {peer}, got {}",
                        other.kind()
                    )));
                }
                None => {
                    return Err(ProcessError::handshake(format!(
                        "{peer} disconnected before hello"
                    )));
                }
            }
        }
        drop(listener);

        let mut take = |channel: Channel| {
            connected
                .remove(&channel)
                .ok_or_else(|| ProcessError::handshake(format!("{channel} channel missing")))
        };
        let mut control = ControlLink::spawn_on(take(Channel::Control)?, &runtime);
        let stdin = into_std(take(Channel::Stdin)?)?;
        let stdout = into_std(take(Channel::Stdout)?)?;
        let stderr = into_std(take(Channel::Stderr)?)?;

        let pid = match control.next_event().await {
            ControlEvent::Message(Message::Pid { pid }) => pid,
            ControlEvent::Message(Message::Error { reason }) => {
                return Err(ProcessError::Spawn {
                    program: program.to_string(),
                    reason,
                });
            }
            ControlEvent::Message(other) => {
                return Err(ProcessError::handshake(format!(
                    "expected pid, got {}",
                    other.kind()
                )));
            }
            ControlEvent::Closed => {
                return Err(ProcessError::handshake(
                    "wrapper closed the control channel before reporting a pid",
                ));
            }
            ControlEvent::Failed(reason) => return Err(ProcessError::handshake(reason)),
        };

        debug!(pid, "wrapper reported child pid");
        Ok(Established {
            pid,
            control,
            stdin,
            stdout,
            stderr,
        })
    }
}

fn into_std(stream: TcpStream) -> Result<std::net::TcpStream, ProcessError> {
    stream
        .into_std()
        .map_err(|e| ProcessError::io("detach wrapper data channel", &e))
}
