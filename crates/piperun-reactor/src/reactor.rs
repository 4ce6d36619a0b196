use piperun_utils::ProcessError;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::source::ReadableSource;

/// Identifier of a registered watcher. Never reused within one reactor.
pub type WatcherId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherKind {
    Readable,
    Timer,
}

struct Watcher {
    kind: WatcherKind,
    enabled: watch::Sender<bool>,
    referenced: bool,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Registry {
    next_id: WatcherId,
    watchers: HashMap<WatcherId, Watcher>,
}

/// Handle to the event loop shared by all engine components.
///
/// Cloning is cheap; clones share the same registry. The host creates one reactor
/// per runtime and passes it to every launcher and stream.
#[derive(Clone)]
pub struct Reactor {
    runtime: Handle,
    registry: Arc<Mutex<Registry>>,
    changed: Arc<Notify>,
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("watchers", &self.watcher_count())
            .field("keeps_alive", &self.keeps_alive())
            .finish()
    }
}

impl Reactor {
    #[must_use]
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            registry: Arc::new(Mutex::new(Registry::default())),
            changed: Arc::new(Notify::new()),
        }
    }

    /// Build a reactor on the runtime the caller is currently running in.
    pub fn from_current() -> Result<Self, ProcessError> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| ProcessError::Runtime {
                reason: e.to_string(),
            })
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runtime every task of this reactor runs on.
    #[must_use]
    pub const fn handle(&self) -> &Handle {
        &self.runtime
    }

    /// Schedule a continuation on the reactor's runtime.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime.spawn(future)
    }

    fn insert(&self, kind: WatcherKind) -> (WatcherId, watch::Receiver<bool>) {
        let (enabled, rx) = watch::channel(true);
        let id = {
            let mut registry = self.lock();
            registry.next_id += 1;
            let id = registry.next_id;
            registry.watchers.insert(
                id,
                Watcher {
                    kind,
                    enabled,
                    referenced: true,
                    task: None,
                },
            );
            id
        };
        self.changed.notify_waiters();
        (id, rx)
    }

    fn attach(&self, id: WatcherId, task: JoinHandle<()>) {
        let mut registry = self.lock();
        match registry.watchers.get_mut(&id) {
            Some(watcher) => watcher.task = Some(task),
            // Cancelled before the task handle was stored.
            None => task.abort(),
        }
    }

    /// Invoke `callback` each time `source` becomes readable while the watcher is
    /// enabled. Watchers start enabled and referenced.
    pub fn on_readable<S, F>(&self, source: Arc<S>, mut callback: F) -> WatcherId
    where
        S: ReadableSource,
        F: FnMut(WatcherId, &S) + Send + 'static,
    {
        let (id, rx) = self.insert(WatcherKind::Readable);
        let task = self.runtime.spawn(async move {
            let mut wait_on = rx.clone();
            let mut wait_off = rx;
            loop {
                if wait_on.wait_for(|enabled| *enabled).await.is_err() {
                    break;
                }
                tokio::select! {
                    biased;
                    off = wait_off.wait_for(|enabled| !*enabled) => {
                        if off.is_err() {
                            break;
                        }
                    }
                    ready = source.readable() => {
                        if let Err(e) = ready {
                            trace!(watcher = id, error = %e, "readiness wait failed");
                        }
                        callback(id, source.as_ref());
                    }
                }
            }
        });
        self.attach(id, task);
        debug!(watcher = id, "registered readable watcher");
        id
    }

    /// Invoke `callback` once after `delay`, unless cancelled or disabled first.
    pub fn delay<F>(&self, delay: Duration, callback: F) -> WatcherId
    where
        F: FnOnce() + Send + 'static,
    {
        let (id, rx) = self.insert(WatcherKind::Timer);
        let reactor = self.clone();
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let fire = *rx.borrow();
            reactor.remove(id);
            if fire {
                callback();
            }
        });
        self.attach(id, task);
        id
    }

    fn remove(&self, id: WatcherId) -> Option<Watcher> {
        let removed = self.lock().watchers.remove(&id);
        if removed.is_some() {
            self.changed.notify_waiters();
        }
        removed
    }

    fn set_enabled(&self, id: WatcherId, on: bool) {
        let updated = {
            let registry = self.lock();
            registry.watchers.get(&id).map(|watcher| {
                watcher.enabled.send_if_modified(|enabled| {
                    let modified = *enabled != on;
                    *enabled = on;
                    modified
                })
            })
        };
        if updated == Some(true) {
            self.changed.notify_waiters();
        }
    }

    /// Resume delivering readiness. No-op for unknown or cancelled watchers.
    pub fn enable(&self, id: WatcherId) {
        self.set_enabled(id, true);
    }

    /// Stop delivering readiness until re-enabled. No-op for unknown watchers.
    pub fn disable(&self, id: WatcherId) {
        self.set_enabled(id, false);
    }

    /// Remove the watcher for good. Safe to call repeatedly and from inside the
    /// watcher's own callback.
    pub fn cancel(&self, id: WatcherId) {
        if let Some(watcher) = self.remove(id) {
            if let Some(task) = watcher.task {
                task.abort();
            }
            debug!(watcher = id, kind = ?watcher.kind, "cancelled watcher");
        }
    }

    fn set_referenced(&self, id: WatcherId, referenced: bool) -> Result<(), ProcessError> {
        {
            let mut registry = self.lock();
            let watcher = registry
                .watchers
                .get_mut(&id)
                .ok_or(ProcessError::InvalidWatcher { id })?;
            watcher.referenced = referenced;
        }
        self.changed.notify_waiters();
        Ok(())
    }

    /// Let this watcher keep the loop alive while enabled.
    pub fn reference(&self, id: WatcherId) -> Result<(), ProcessError> {
        self.set_referenced(id, true)
    }

    /// Stop this watcher from keeping the loop alive on its own.
    pub fn unreference(&self, id: WatcherId) -> Result<(), ProcessError> {
        self.set_referenced(id, false)
    }

    #[must_use]
    pub fn is_enabled(&self, id: WatcherId) -> bool {
        self.lock()
            .watchers
            .get(&id)
            .is_some_and(|watcher| *watcher.enabled.borrow())
    }

    #[must_use]
    pub fn is_referenced(&self, id: WatcherId) -> bool {
        self.lock()
            .watchers
            .get(&id)
            .is_some_and(|watcher| watcher.referenced)
    }

    #[cfg(test)]
    fn contains(&self, id: WatcherId) -> bool {
        self.lock().watchers.contains_key(&id)
    }

    #[must_use]
    pub fn watcher_count(&self) -> usize {
        self.lock().watchers.len()
    }

    /// True while at least one enabled, referenced watcher is registered.
    #[must_use]
    pub fn keeps_alive(&self) -> bool {
        self.lock()
            .watchers
            .values()
            .any(|watcher| watcher.referenced && *watcher.enabled.borrow())
    }

    /// Resolve once nothing registered keeps the loop alive.
    pub async fn idle(&self) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.keeps_alive() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Becomes readable once per `poke`.
    #[derive(Default)]
    struct Doorbell {
        rings: Notify,
    }

    impl Doorbell {
        fn poke(&self) {
            self.rings.notify_one();
        }
    }

    #[async_trait]
    impl ReadableSource for Doorbell {
        async fn readable(&self) -> io::Result<()> {
            self.rings.notified().await;
            Ok(())
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_enabled_watcher_receives_readiness() {
        let reactor = Reactor::from_current().unwrap();
        let bell = Arc::new(Doorbell::default());
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        let id = reactor.on_readable(bell.clone(), move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bell.poke();
        tokio::time::timeout(Duration::from_secs(2), async {
            while hits.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert!(reactor.is_enabled(id));
        reactor.cancel(id);
    }

    #[tokio::test]
    async fn test_disabled_watcher_is_silent_until_enabled() {
        let reactor = Reactor::from_current().unwrap();
        let bell = Arc::new(Doorbell::default());
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        let id = reactor.on_readable(bell.clone(), move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        reactor.disable(id);
        settle().await;

        bell.poke();
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        reactor.enable(id);
        tokio::time::timeout(Duration::from_secs(2), async {
            while hits.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        reactor.cancel(id);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_forgets_watcher() {
        let reactor = Reactor::from_current().unwrap();
        let id = reactor.on_readable(Arc::new(Doorbell::default()), |_, _| {});
        assert!(reactor.contains(id));

        reactor.cancel(id);
        reactor.cancel(id);
        assert!(!reactor.contains(id));
        assert_eq!(reactor.watcher_count(), 0);

        // Toggling a cancelled watcher is harmless.
        reactor.enable(id);
        reactor.disable(id);
        assert!(!reactor.is_enabled(id));
    }

    #[tokio::test]
    async fn test_reference_unknown_watcher_fails() {
        let reactor = Reactor::from_current().unwrap();
        assert_eq!(
            reactor.reference(42),
            Err(ProcessError::InvalidWatcher { id: 42 })
        );
        assert_eq!(
            reactor.unreference(42),
            Err(ProcessError::InvalidWatcher { id: 42 })
        );
    }

    #[tokio::test]
    async fn test_keeps_alive_tracks_enabled_and_referenced() {
        let reactor = Reactor::from_current().unwrap();
        assert!(!reactor.keeps_alive());

        let id = reactor.on_readable(Arc::new(Doorbell::default()), |_, _| {});
        assert!(reactor.keeps_alive());

        reactor.unreference(id).unwrap();
        assert!(!reactor.is_referenced(id));
        assert!(!reactor.keeps_alive());

        reactor.reference(id).unwrap();
        assert!(reactor.keeps_alive());

        reactor.disable(id);
        assert!(!reactor.keeps_alive());

        reactor.cancel(id);
    }

    #[tokio::test]
    async fn test_idle_resolves_after_last_watcher_goes_away() {
        let reactor = Reactor::from_current().unwrap();
        let id = reactor.on_readable(Arc::new(Doorbell::default()), |_, _| {});

        let waiter = reactor.clone();
        let idle = tokio::spawn(async move { waiter.idle().await });
        settle().await;
        assert!(!idle.is_finished());

        reactor.cancel(id);
        tokio::time::timeout(Duration::from_secs(2), idle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_delay_fires_once_and_unregisters() {
        let reactor = Reactor::from_current().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let id = reactor.delay(Duration::from_millis(10), move || {
            let _ = tx.send(());
        });
        assert!(reactor.contains(id));

        tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(!reactor.contains(id));
    }

    #[tokio::test]
    async fn test_cancelled_delay_never_fires() {
        let reactor = Reactor::from_current().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let flag = fired.clone();
        let id = reactor.delay(Duration::from_millis(20), move || {
            flag.fetch_add(1, Ordering::SeqCst);
        });
        reactor.cancel(id);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_from_current_without_runtime_fails() {
        assert!(matches!(
            Reactor::from_current(),
            Err(ProcessError::Runtime { .. })
        ));
    }

    #[tokio::test]
    async fn test_tasks_run_on_the_reactor_runtime() {
        let other = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("reactor-worker")
            .enable_all()
            .build()
            .unwrap();
        let reactor = Reactor::new(other.handle().clone());

        let ran_on = reactor
            .spawn(async { std::thread::current().name().map(str::to_owned) })
            .await
            .unwrap();
        assert_eq!(ran_on.as_deref(), Some("reactor-worker"));
        other.shutdown_background();
    }
}
