use piperun_reactor::{Reactor, WatcherId};
use piperun_utils::ProcessError;
use piperun_utils::config::DEFAULT_CHUNK_SIZE;
use std::future::Future;
use std::io;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::raw::{RawStream, ReadSource};

type ReadResult = Result<Option<Vec<u8>>, ProcessError>;

/// Where a stream's backing resource is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    /// The resource future has not resolved yet.
    Pending,
    /// Registered with the reactor and readable.
    Acquired,
    /// The resource future failed; reads surface that failure.
    Failed,
    /// Closed, exhausted, or released.
    Freed,
}

enum Backing {
    Pending,
    Failed(ProcessError),
    Ready {
        source: Arc<ReadSource>,
        watcher: WatcherId,
    },
    Freed,
}

/// Operations requested before the resource resolved, replayed in order.
#[derive(Debug)]
enum Deferred {
    Close,
    Reference,
    Unreference,
}

struct Inner {
    backing: Backing,
    pending_read: Option<oneshot::Sender<ReadResult>>,
    deferred: Vec<Deferred>,
    close_requested: bool,
    /// At most one chunk that arrived while no read was outstanding.
    stash: Option<Vec<u8>>,
    chunk_size: usize,
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn watcher(&self) -> Option<WatcherId> {
        match self.backing {
            Backing::Ready { watcher, .. } => Some(watcher),
            _ => None,
        }
    }

    /// Drop the resource and its watcher, and end any outstanding read.
    fn free(&mut self, reactor: &Reactor) {
        if let Backing::Ready { watcher, .. } = mem::replace(&mut self.backing, Backing::Freed) {
            reactor.cancel(watcher);
        }
        if let Some(tx) = self.pending_read.take() {
            let _ = tx.send(Ok(None));
        }
    }

    fn close_now(&mut self, reactor: &Reactor) {
        if let Backing::Ready { source, .. } = &self.backing {
            if let Err(e) = source.shutdown_read() {
                debug!(error = %e, "read-half shutdown failed; descriptor already gone");
            }
        }
        self.stash = None;
        self.free(reactor);
    }

    fn set_referenced(&self, reactor: &Reactor, referenced: bool) -> Result<(), ProcessError> {
        match &self.backing {
            Backing::Ready { watcher, .. } if referenced => reactor.reference(*watcher),
            Backing::Ready { watcher, .. } => reactor.unreference(*watcher),
            Backing::Failed(e) => Err(e.clone()),
            Backing::Freed => Err(ProcessError::ResourceAlreadyFreed),
            Backing::Pending => Err(ProcessError::ResourceNotAcquired),
        }
    }

    fn deliver(&mut self, chunk: Vec<u8>) {
        match self.pending_read.take() {
            Some(tx) => {
                if let Err(Ok(Some(chunk))) = tx.send(Ok(Some(chunk))) {
                    // The reader gave up on this read; keep the bytes for the next one.
                    self.stash = Some(chunk);
                }
            }
            None => self.stash = Some(chunk),
        }
    }
}

enum ReadClaim {
    Done(ReadResult),
    Wait(oneshot::Receiver<ReadResult>),
}

/// Readable end of a child's stdout or stderr.
///
/// At most one read may be outstanding; a second one fails with
/// [`ProcessError::PendingRead`]. The reactor watcher is enabled only while a read
/// is outstanding, so nothing beyond a single chunk is ever buffered here.
pub struct ProcessInputStream {
    inner: Arc<Mutex<Inner>>,
    reactor: Reactor,
}

impl std::fmt::Debug for ProcessInputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessInputStream")
            .field("state", &self.resource_state())
            .field("watcher", &self.watcher())
            .finish()
    }
}

impl ProcessInputStream {
    /// Create a stream backed by whatever `resource` eventually yields.
    pub fn new<F>(reactor: &Reactor, resource: F) -> Self
    where
        F: Future<Output = Result<RawStream, ProcessError>> + Send + 'static,
    {
        Self::with_chunk_size(reactor, resource, DEFAULT_CHUNK_SIZE)
    }

    /// Create a stream over an endpoint that already exists.
    pub fn from_raw(reactor: &Reactor, raw: RawStream) -> Self {
        Self::new(reactor, std::future::ready(Ok(raw)))
    }

    pub fn with_chunk_size<F>(reactor: &Reactor, resource: F, chunk_size: usize) -> Self
    where
        F: Future<Output = Result<RawStream, ProcessError>> + Send + 'static,
    {
        let inner = Arc::new(Mutex::new(Inner {
            backing: Backing::Pending,
            pending_read: None,
            deferred: Vec::new(),
            close_requested: false,
            stash: None,
            chunk_size: chunk_size.max(1),
        }));

        let weak = Arc::downgrade(&inner);
        let resolver = reactor.clone();
        reactor.spawn(async move {
            let outcome = resource.await.and_then(RawStream::into_read_source);
            resolve(&weak, &resolver, outcome);
        });

        Self {
            inner,
            reactor: reactor.clone(),
        }
    }

    /// Read the next chunk.
    ///
    /// Resolves with `Some(bytes)` (never empty) or `None` at end of stream. The
    /// single-read check happens when this is called, not when the future is first
    /// polled.
    pub fn read(&self) -> impl Future<Output = ReadResult> + Send + 'static {
        let claim = self.claim_read();
        async move {
            match claim? {
                ReadClaim::Done(result) => result,
                ReadClaim::Wait(rx) => rx.await.unwrap_or(Ok(None)),
            }
        }
    }

    fn claim_read(&self) -> Result<ReadClaim, ProcessError> {
        let mut state = lock(&self.inner);

        if state.close_requested && matches!(state.backing, Backing::Pending) {
            return Ok(ReadClaim::Done(Ok(None)));
        }
        if state.pending_read.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return Err(ProcessError::PendingRead);
        }
        state.pending_read = None;

        if let Some(chunk) = state.stash.take() {
            return Ok(ReadClaim::Done(Ok(Some(chunk))));
        }

        match &state.backing {
            Backing::Pending => {
                let (tx, rx) = oneshot::channel();
                state.pending_read = Some(tx);
                Ok(ReadClaim::Wait(rx))
            }
            Backing::Ready { watcher, .. } => {
                let watcher = *watcher;
                let (tx, rx) = oneshot::channel();
                state.pending_read = Some(tx);
                self.reactor.enable(watcher);
                Ok(ReadClaim::Wait(rx))
            }
            Backing::Failed(e) => Err(e.clone()),
            Backing::Freed => Ok(ReadClaim::Done(Ok(None))),
        }
    }

    /// Stop reading. Idempotent.
    ///
    /// Before the resource resolves the close is recorded and carried out on
    /// resolution; reads issued after this call see end of stream either way.
    pub fn close(&self) {
        let mut state = lock(&self.inner);
        match state.backing {
            Backing::Pending => {
                if !state.close_requested {
                    state.close_requested = true;
                    state.deferred.push(Deferred::Close);
                }
            }
            Backing::Ready { .. } => state.close_now(&self.reactor),
            Backing::Failed(_) => state.backing = Backing::Freed,
            Backing::Freed => state.stash = None,
        }
    }

    /// Let an outstanding read keep the host loop alive.
    pub fn reference(&self) -> Result<(), ProcessError> {
        self.set_referenced(true)
    }

    /// Stop an outstanding read from keeping the host loop alive.
    pub fn unreference(&self) -> Result<(), ProcessError> {
        self.set_referenced(false)
    }

    fn set_referenced(&self, referenced: bool) -> Result<(), ProcessError> {
        let mut state = lock(&self.inner);
        if matches!(state.backing, Backing::Pending) {
            state.deferred.push(if referenced {
                Deferred::Reference
            } else {
                Deferred::Unreference
            });
            return Ok(());
        }
        state.set_referenced(&self.reactor, referenced)
    }

    #[must_use]
    pub fn resource_state(&self) -> ResourceState {
        match lock(&self.inner).backing {
            Backing::Pending => ResourceState::Pending,
            Backing::Failed(_) => ResourceState::Failed,
            Backing::Ready { .. } => ResourceState::Acquired,
            Backing::Freed => ResourceState::Freed,
        }
    }

    /// Reactor watcher currently serving this stream, if the resource is live.
    #[must_use]
    pub fn watcher(&self) -> Option<WatcherId> {
        lock(&self.inner).watcher()
    }

    #[must_use]
    pub fn chunk_size(&self) -> usize {
        lock(&self.inner).chunk_size
    }
}

impl Drop for ProcessInputStream {
    fn drop(&mut self) {
        let mut state = lock(&self.inner);
        if matches!(state.backing, Backing::Ready { .. }) {
            state.free(&self.reactor);
        }
    }
}

fn resolve(weak: &Weak<Mutex<Inner>>, reactor: &Reactor, outcome: Result<ReadSource, ProcessError>) {
    // Stream discarded while pending: dropping `outcome` releases the descriptor.
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let mut state = lock(&inner);
    let deferred = mem::take(&mut state.deferred);

    let source = match outcome {
        Ok(source) => Arc::new(source),
        Err(e) => {
            debug!(error = %e, "stream resource failed to resolve");
            for op in deferred.iter().filter(|op| !matches!(op, Deferred::Close)) {
                warn!(?op, error = %e, "deferred stream operation could not be applied");
            }
            if let Some(tx) = state.pending_read.take() {
                let _ = tx.send(Err(e.clone()));
            }
            state.backing = if state.close_requested {
                Backing::Freed
            } else {
                Backing::Failed(e)
            };
            return;
        }
    };

    let watcher = reactor.on_readable(source.clone(), readable_callback(weak.clone(), reactor.clone()));
    reactor.disable(watcher);
    state.backing = Backing::Ready { source, watcher };

    for op in deferred {
        let applied = match op {
            Deferred::Close => {
                state.close_now(reactor);
                Ok(())
            }
            Deferred::Reference => state.set_referenced(reactor, true),
            Deferred::Unreference => state.set_referenced(reactor, false),
        };
        if let Err(e) = applied {
            warn!(error = %e, "deferred stream operation could not be applied");
        }
    }

    if state.pending_read.is_some() {
        if let Some(watcher) = state.watcher() {
            reactor.enable(watcher);
        }
    }
}

fn readable_callback(
    weak: Weak<Mutex<Inner>>,
    reactor: Reactor,
) -> impl FnMut(WatcherId, &ReadSource) + Send + 'static {
    move |id, source| {
        let Some(inner) = weak.upgrade() else {
            reactor.cancel(id);
            return;
        };
        let mut state = lock(&inner);
        if state.watcher() != Some(id) {
            reactor.cancel(id);
            return;
        }

        let mut buf = vec![0u8; state.chunk_size];
        let chunk = match source.try_read(&mut buf) {
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                return;
            }
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some(buf)
            }
            Err(e) => {
                debug!(error = %e, "stream read failed; treating as end of stream");
                None
            }
        };

        match chunk {
            Some(chunk) => state.deliver(chunk),
            None => state.free(&reactor),
        }

        if state.pending_read.is_none() {
            if let Some(watcher) = state.watcher() {
                reactor.disable(watcher);
            }
        }
    }
}
