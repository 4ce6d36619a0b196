use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::protocol::{Message, ProtocolError, read_frame, write_frame};

/// Something that happened on the control connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    Message(Message),
    /// The peer closed the connection between frames.
    Closed,
    /// The connection broke or carried an invalid frame.
    Failed(String),
}

/// Authenticated control connection, usable from either side.
///
/// Frames are read by a dedicated task, so [`ControlLink::next_event`] can be raced
/// against other futures without tearing a frame in half.
pub struct ControlLink {
    writer: OwnedWriteHalf,
    events: mpsc::UnboundedReceiver<ControlEvent>,
    reader: JoinHandle<()>,
    finished: bool,
}

impl std::fmt::Debug for ControlLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlLink")
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl ControlLink {
    /// Take over `stream` after its `hello` was exchanged, reading on the current
    /// runtime.
    #[must_use]
    pub fn new(stream: TcpStream) -> Self {
        Self::spawn_on(stream, &Handle::current())
    }

    /// Like [`ControlLink::new`], with the reader task on `runtime`.
    #[must_use]
    pub fn spawn_on(stream: TcpStream, runtime: &Handle) -> Self {
        let (mut read_half, writer) = stream.into_split();
        let (tx, events) = mpsc::unbounded_channel();

        let reader = runtime.spawn(async move {
            loop {
                let event = match read_frame(&mut read_half).await {
                    Ok(Some(message)) => ControlEvent::Message(message),
                    Ok(None) => ControlEvent::Closed,
                    Err(e) => ControlEvent::Failed(e.to_string()),
                };
                let terminal = !matches!(event, ControlEvent::Message(_));
                if tx.send(event).is_err() || terminal {
                    break;
                }
            }
            trace!("control reader finished");
        });

        Self {
            writer,
            events,
            reader,
            finished: false,
        }
    }

    pub async fn send(&mut self, message: &Message) -> Result<(), ProtocolError> {
        write_frame(&mut self.writer, message).await
    }

    /// Next event from the peer. Cancel-safe.
    ///
    /// After `Closed` or `Failed` has been returned once, keeps returning `Closed`.
    pub async fn next_event(&mut self) -> ControlEvent {
        if self.finished {
            return ControlEvent::Closed;
        }
        let event = self.events.recv().await.unwrap_or(ControlEvent::Closed);
        if !matches!(event, ControlEvent::Message(_)) {
            self.finished = true;
        }
        event
    }

    /// Whether the peer side has already gone away.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Drop for ControlLink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
