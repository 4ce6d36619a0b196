use piperun_reactor::Reactor;
use piperun_utils::ProcessError;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, watch};
use tracing::debug;

use crate::raw::{RawStream, Writer};

enum Sink {
    Pending,
    Ready(Writer),
    Failed(ProcessError),
    Closed,
}

/// Writable end of a child's stdin.
///
/// Writes issued before the endpoint exists wait for it. Writes are serialized;
/// each one completes only when all of its bytes were handed to the OS.
pub struct ProcessOutputStream {
    sink: Arc<Mutex<Sink>>,
    resolved: watch::Receiver<bool>,
}

impl std::fmt::Debug for ProcessOutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessOutputStream")
            .field("resolved", &*self.resolved.borrow())
            .finish_non_exhaustive()
    }
}

impl ProcessOutputStream {
    pub fn new<F>(reactor: &Reactor, resource: F) -> Self
    where
        F: Future<Output = Result<RawStream, ProcessError>> + Send + 'static,
    {
        let sink = Arc::new(Mutex::new(Sink::Pending));
        let (done, resolved) = watch::channel(false);

        let weak = Arc::downgrade(&sink);
        reactor.spawn(async move {
            let outcome = resource.await.and_then(RawStream::into_writer);
            settle(&weak, outcome).await;
            done.send_replace(true);
        });

        Self { sink, resolved }
    }

    pub fn from_raw(reactor: &Reactor, raw: RawStream) -> Self {
        Self::new(reactor, std::future::ready(Ok(raw)))
    }

    async fn wait_resolved(&self) {
        let mut resolved = self.resolved.clone();
        // A dropped sender means the resolver task is gone; the sink says why.
        let _ = resolved.wait_for(|done| *done).await;
    }

    /// Write all of `data` to the child.
    pub async fn write(&self, data: &[u8]) -> Result<(), ProcessError> {
        self.wait_resolved().await;
        let mut sink = self.sink.lock().await;
        match &mut *sink {
            Sink::Ready(writer) => {
                if data.is_empty() {
                    return Ok(());
                }
                writer
                    .write_all(data)
                    .await
                    .map_err(|e| ProcessError::io("write to child stdin", &e))?;
                writer
                    .flush()
                    .await
                    .map_err(|e| ProcessError::io("flush child stdin", &e))
            }
            Sink::Failed(e) => Err(e.clone()),
            Sink::Closed => Err(ProcessError::StreamClosed),
            Sink::Pending => Err(ProcessError::ResourceNotAcquired),
        }
    }

    /// Close the child's stdin. Idempotent; waits for an in-flight write.
    ///
    /// Before the endpoint exists the close is recorded and the endpoint is closed
    /// as soon as it arrives.
    pub async fn close(&self) {
        let mut sink = self.sink.lock().await;
        if let Sink::Ready(writer) = &mut *sink {
            if let Err(e) = writer.shutdown().await {
                debug!(error = %e, "stdin shutdown failed; child already gone");
            }
        }
        *sink = Sink::Closed;
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sink
            .try_lock()
            .is_ok_and(|sink| matches!(*sink, Sink::Closed))
    }
}

async fn settle(weak: &Weak<Mutex<Sink>>, outcome: Result<Writer, ProcessError>) {
    let Some(sink) = weak.upgrade() else {
        return;
    };
    let mut sink = sink.lock().await;
    let still_pending = matches!(*sink, Sink::Pending);
    match (still_pending, outcome) {
        (true, Ok(writer)) => *sink = Sink::Ready(writer),
        (true, Err(e)) => {
            debug!(error = %e, "stdin resource failed to resolve");
            *sink = Sink::Failed(e);
        }
        // Closed while pending.
        (false, Ok(mut writer)) => {
            let _ = writer.shutdown().await;
        }
        (false, Err(_)) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Read};
    use std::time::Duration;
    use tokio::sync::oneshot;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_write_then_close_delivers_bytes_and_eof() {
        let reactor = Reactor::from_current().unwrap();
        let (mut reader, writer) = io::pipe().unwrap();
        let stdin = ProcessOutputStream::from_raw(&reactor, RawStream::from(writer));

        tokio::time::timeout(WAIT, stdin.write(b"line one\n")).await.unwrap().unwrap();
        stdin.write(b"line two\n").await.unwrap();
        stdin.close().await;
        assert!(stdin.is_closed());

        // The engine held the only write end, so the reader now sees EOF.
        let received = tokio::task::spawn_blocking(move || {
            let mut out = String::new();
            reader.read_to_string(&mut out).map(|_| out)
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(received, "line one\nline two\n");
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let reactor = Reactor::from_current().unwrap();
        let (_reader, writer) = io::pipe().unwrap();
        let stdin = ProcessOutputStream::from_raw(&reactor, RawStream::from(writer));

        stdin.close().await;
        stdin.close().await;
        assert_eq!(stdin.write(b"late").await, Err(ProcessError::StreamClosed));
    }

    #[tokio::test]
    async fn test_write_waits_for_pending_resource() {
        let reactor = Reactor::from_current().unwrap();
        let (tx, rx) = oneshot::channel::<Result<RawStream, ProcessError>>();
        let stdin = Arc::new(ProcessOutputStream::new(&reactor, async move {
            rx.await.unwrap_or(Err(ProcessError::StreamClosed))
        }));

        let pending = {
            let stdin = stdin.clone();
            tokio::spawn(async move { stdin.write(b"early").await })
        };
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        let (mut reader, writer) = io::pipe().unwrap();
        tx.send(Ok(RawStream::from(writer))).unwrap();
        tokio::time::timeout(WAIT, pending).await.unwrap().unwrap().unwrap();

        let mut buf = [0u8; 5];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"early");
    }

    #[tokio::test]
    async fn test_resolution_failure_propagates_to_writes() {
        let reactor = Reactor::from_current().unwrap();
        let failure = ProcessError::Spawn {
            program: "missing".to_string(),
            reason: "not found".to_string(),
        };
        let stdin = ProcessOutputStream::new(&reactor, std::future::ready(Err(failure.clone())));

        assert_eq!(stdin.write(b"x").await, Err(failure));
    }

    #[tokio::test]
    async fn test_close_while_pending_closes_resource_on_arrival() {
        let reactor = Reactor::from_current().unwrap();
        let (tx, rx) = oneshot::channel::<Result<RawStream, ProcessError>>();
        let stdin = ProcessOutputStream::new(&reactor, async move {
            rx.await.unwrap_or(Err(ProcessError::StreamClosed))
        });

        stdin.close().await;

        let (mut reader, writer) = io::pipe().unwrap();
        tx.send(Ok(RawStream::from(writer))).unwrap();

        let read = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            reader.read_to_end(&mut out).map(|_| out)
        });
        let out = tokio::time::timeout(WAIT, read).await.unwrap().unwrap().unwrap();
        assert!(out.is_empty());
        assert_eq!(stdin.write(b"x").await, Err(ProcessError::StreamClosed));
    }

    #[tokio::test]
    async fn test_read_end_is_rejected_as_unwritable() {
        let reactor = Reactor::from_current().unwrap();
        let (reader, _writer) = io::pipe().unwrap();
        let stdin = ProcessOutputStream::from_raw(&reactor, RawStream::from(reader));

        let result = tokio::time::timeout(WAIT, stdin.write(b"x")).await.unwrap();
        assert!(
            matches!(result, Err(ProcessError::InvalidStream { .. })),
            "got {result:?}"
        );
    }
}
