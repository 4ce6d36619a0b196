use async_trait::async_trait;
use piperun_reactor::ReadableSource;
use piperun_utils::ProcessError;
use std::io;
use std::net::Shutdown;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;

#[cfg(unix)]
use std::os::fd::OwnedFd;
#[cfg(unix)]
use tokio::net::unix::pipe;

/// An owned, engine-side endpoint of a child's standard stream.
///
/// Exactly one stream wrapper takes ownership of each endpoint; dropping the
/// endpoint closes the descriptor.
#[derive(Debug)]
pub enum RawStream {
    /// Anonymous pipe end. Unidirectional.
    #[cfg(unix)]
    Pipe(OwnedFd),
    /// Wrapper data socket. Bidirectional, so closing shuts down one half.
    Socket(std::net::TcpStream),
}

impl RawStream {
    #[must_use]
    pub const fn is_bidirectional(&self) -> bool {
        matches!(self, Self::Socket(_))
    }

    pub(crate) fn into_read_source(self) -> Result<ReadSource, ProcessError> {
        match self {
            #[cfg(unix)]
            Self::Pipe(fd) => pipe::Receiver::from_owned_fd(fd)
                .map(ReadSource::Pipe)
                .map_err(|e| ProcessError::InvalidStream {
                    reason: format!("expected a readable pipe: {e}"),
                }),
            Self::Socket(socket) => socket_to_tokio(socket).map(ReadSource::Socket),
        }
    }

    pub(crate) fn into_writer(self) -> Result<Writer, ProcessError> {
        match self {
            #[cfg(unix)]
            Self::Pipe(fd) => pipe::Sender::from_owned_fd(fd)
                .map(|sender| Box::new(sender) as Writer)
                .map_err(|e| ProcessError::InvalidStream {
                    reason: format!("expected a writable pipe: {e}"),
                }),
            Self::Socket(socket) => socket_to_tokio(socket).map(|stream| Box::new(stream) as Writer),
        }
    }
}

#[cfg(unix)]
impl From<io::PipeReader> for RawStream {
    fn from(reader: io::PipeReader) -> Self {
        Self::Pipe(OwnedFd::from(reader))
    }
}

#[cfg(unix)]
impl From<io::PipeWriter> for RawStream {
    fn from(writer: io::PipeWriter) -> Self {
        Self::Pipe(OwnedFd::from(writer))
    }
}

impl From<std::net::TcpStream> for RawStream {
    fn from(socket: std::net::TcpStream) -> Self {
        Self::Socket(socket)
    }
}

fn socket_to_tokio(socket: std::net::TcpStream) -> Result<TcpStream, ProcessError> {
    socket
        .set_nonblocking(true)
        .and_then(|()| TcpStream::from_std(socket))
        .map_err(|e| ProcessError::InvalidStream {
            reason: format!("socket cannot be registered with the runtime: {e}"),
        })
}

pub(crate) type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// A raw endpoint registered with the runtime for read readiness.
pub(crate) enum ReadSource {
    #[cfg(unix)]
    Pipe(pipe::Receiver),
    Socket(TcpStream),
}

impl ReadSource {
    pub(crate) fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            Self::Pipe(receiver) => receiver.try_read(buf),
            Self::Socket(stream) => stream.try_read(buf),
        }
    }

    /// Stop reading without closing the descriptor.
    ///
    /// Pipes have no read half to shut down; they are closed when the last owner
    /// drops them.
    pub(crate) fn shutdown_read(&self) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            Self::Pipe(_) => Ok(()),
            Self::Socket(stream) => socket2::SockRef::from(stream).shutdown(Shutdown::Read),
        }
    }
}

#[async_trait]
impl ReadableSource for ReadSource {
    async fn readable(&self) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            Self::Pipe(receiver) => receiver.readable().await,
            Self::Socket(stream) => stream.readable().await,
        }
    }
}
