use async_trait::async_trait;
use std::io;

/// Something the reactor can wait on for read readiness.
///
/// `readable` only reports readiness; the watcher callback performs the actual
/// non-blocking read and is expected to treat `WouldBlock` as a spurious wakeup.
#[async_trait]
pub trait ReadableSource: Send + Sync + 'static {
    async fn readable(&self) -> io::Result<()>;
}
