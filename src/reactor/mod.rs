//! Scheduler handle and watcher bookkeeping.
//!
//! Readiness, timers and task execution are provided by the tokio runtime.
//! [`Reactor`] adds the part tokio does not track: which watchers keep the
//! process alive. Every component receives a `Reactor` at construction; a
//! program typically creates one at startup and awaits [`Reactor::idle`]
//! before shutting down.
//!
//! A [`Watcher`] counts towards [`Reactor::referenced_watchers`] while it is
//! enabled, referenced and not cancelled.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Unique watcher identifier.
pub type WatcherId = u64;

/// Shared scheduler handle. Cheap to clone.
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<ReactorInner>,
}

struct ReactorInner {
    referenced: watch::Sender<usize>,
    next_id: AtomicU64,
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("referenced_watchers", &self.referenced_watchers())
            .finish()
    }
}

impl Reactor {
    pub fn new() -> Self {
        let (referenced, _) = watch::channel(0);
        Self {
            inner: Arc::new(ReactorInner {
                referenced,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Number of watchers currently keeping the scheduler alive.
    pub fn referenced_watchers(&self) -> usize {
        *self.inner.referenced.borrow()
    }

    /// Resolves once no referenced watcher remains.
    pub async fn idle(&self) {
        let mut rx = self.inner.referenced.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    /// Creates a readiness watcher. It starts disabled and referenced.
    pub fn watch(&self) -> Watcher {
        Watcher::new(self.clone(), false)
    }

    /// Runs `callback` once after `after` has elapsed.
    ///
    /// The watcher starts enabled. Disabling it suspends the timer;
    /// enabling it again re-arms the full duration. Referencing or
    /// unreferencing leaves the deadline alone. Must be called from
    /// within a tokio runtime.
    pub fn delay<F>(&self, after: Duration, callback: F) -> Watcher
    where
        F: FnOnce() + Send + 'static,
    {
        let watcher = Watcher::new(self.clone(), true);
        let mut control = watcher.shared.subscribe();
        let shared = Arc::clone(&watcher.shared);
        let reactor = self.clone();
        let id = watcher.id;
        let mut callback = Some(callback);

        tokio::spawn(async move {
            loop {
                let armed = *control.borrow_and_update();
                if armed.cancelled {
                    return;
                }
                if !armed.enabled {
                    if control.changed().await.is_err() {
                        return;
                    }
                    continue;
                }

                let sleep = tokio::time::sleep(after);
                tokio::pin!(sleep);
                loop {
                    tokio::select! {
                        _ = &mut sleep => {
                            if fire(&shared, &reactor, armed.epoch) {
                                tracing::trace!(watcher = id, "delay watcher fired");
                                if let Some(callback) = callback.take() {
                                    callback();
                                }
                                return;
                            }
                            break;
                        }
                        changed = control.changed() => {
                            if changed.is_err() {
                                return;
                            }
                            // Reference changes keep the running timer.
                            let state = *control.borrow();
                            if state.cancelled || !state.enabled || state.epoch != armed.epoch {
                                break;
                            }
                        }
                    }
                }
            }
        });

        watcher
    }

    /// Runs `callback` on a later scheduler turn.
    pub fn defer<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            callback();
        });
    }

    fn next_id(&self) -> WatcherId {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn adjust(&self, delta: isize) {
        if delta == 0 {
            return;
        }
        self.inner.referenced.send_modify(|count| {
            *count = count.saturating_add_signed(delta);
        });
    }
}

/// Marks a timer as fired if it is still armed with `epoch`.
fn fire(shared: &watch::Sender<WatcherState>, reactor: &Reactor, epoch: u64) -> bool {
    let mut fired = false;
    let mut delta = 0;
    shared.send_if_modified(|state| {
        if state.cancelled || !state.enabled || state.epoch != epoch {
            return false;
        }
        let before = state.keeps_alive();
        state.cancelled = true;
        delta = state.keeps_alive() as isize - before as isize;
        fired = true;
        true
    });
    reactor.adjust(delta);
    fired
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WatcherState {
    enabled: bool,
    referenced: bool,
    cancelled: bool,
    epoch: u64,
}

impl WatcherState {
    fn keeps_alive(&self) -> bool {
        self.enabled && self.referenced && !self.cancelled
    }
}

/// Handle to a registration with the [`Reactor`]. Dropping it cancels it.
pub struct Watcher {
    id: WatcherId,
    reactor: Reactor,
    shared: Arc<watch::Sender<WatcherState>>,
}

impl fmt::Debug for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = *self.shared.borrow();
        f.debug_struct("Watcher")
            .field("id", &self.id)
            .field("enabled", &state.enabled)
            .field("referenced", &state.referenced)
            .field("cancelled", &state.cancelled)
            .finish()
    }
}

impl Watcher {
    fn new(reactor: Reactor, enabled: bool) -> Self {
        let state = WatcherState {
            enabled,
            referenced: true,
            cancelled: false,
            epoch: 0,
        };
        let (shared, _) = watch::channel(state);
        reactor.adjust(state.keeps_alive() as isize);
        Self {
            id: reactor.next_id(),
            reactor,
            shared: Arc::new(shared),
        }
    }

    pub fn id(&self) -> WatcherId {
        self.id
    }

    /// Enables the watcher. Re-arms delay watchers.
    pub fn enable(&self) {
        self.update(|state| {
            state.enabled = true;
            state.epoch += 1;
        });
    }

    pub fn disable(&self) {
        self.update(|state| state.enabled = false);
    }

    /// Permanently deactivates the watcher. Idempotent.
    pub fn cancel(&self) {
        self.update(|state| state.cancelled = true);
    }

    /// Lets this watcher keep the scheduler alive while enabled.
    pub fn reference(&self) {
        self.update(|state| state.referenced = true);
    }

    /// Excludes this watcher from keepalive accounting.
    pub fn unreference(&self) {
        self.update(|state| state.referenced = false);
    }

    pub fn is_enabled(&self) -> bool {
        let state = self.shared.borrow();
        state.enabled && !state.cancelled
    }

    pub fn is_referenced(&self) -> bool {
        self.shared.borrow().referenced
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.borrow().cancelled
    }

    fn update(&self, change: impl FnOnce(&mut WatcherState)) {
        let mut delta = 0;
        self.shared.send_if_modified(|state| {
            if state.cancelled {
                return false;
            }
            let old = *state;
            change(state);
            delta = state.keeps_alive() as isize - old.keeps_alive() as isize;
            *state != old
        });
        self.reactor.adjust(delta);
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_watch_accounting() {
        let reactor = Reactor::new();
        let watcher = reactor.watch();
        assert_eq!(reactor.referenced_watchers(), 0);

        watcher.enable();
        assert_eq!(reactor.referenced_watchers(), 1);

        watcher.unreference();
        assert_eq!(reactor.referenced_watchers(), 0);

        watcher.reference();
        assert_eq!(reactor.referenced_watchers(), 1);

        watcher.cancel();
        assert_eq!(reactor.referenced_watchers(), 0);

        // Cancelled watchers ignore further transitions.
        watcher.enable();
        assert!(!watcher.is_enabled());
        assert_eq!(reactor.referenced_watchers(), 0);
    }

    #[test]
    fn test_drop_cancels() {
        let reactor = Reactor::new();
        let watcher = reactor.watch();
        watcher.enable();
        assert_eq!(reactor.referenced_watchers(), 1);
        drop(watcher);
        assert_eq!(reactor.referenced_watchers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_fires_once() {
        let reactor = Reactor::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let watcher = reactor.delay(Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(reactor.referenced_watchers(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(watcher.is_cancelled());
        assert_eq!(reactor.referenced_watchers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_delay_does_not_fire() {
        let reactor = Reactor::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let watcher = reactor.delay(Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        watcher.disable();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        // Re-enabling re-arms the full duration.
        watcher.enable();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reference_changes_keep_delay_deadline() {
        let reactor = Reactor::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let watcher = reactor.delay(Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        watcher.unreference();
        assert_eq!(reactor.referenced_watchers(), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        watcher.reference();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(watcher.is_cancelled());
    }

    #[tokio::test]
    async fn test_idle_resolves_when_unreferenced() {
        let reactor = Reactor::new();
        let watcher = reactor.watch();
        watcher.enable();

        let waiter = reactor.clone();
        let idle = tokio::spawn(async move { waiter.idle().await });
        tokio::task::yield_now().await;
        assert!(!idle.is_finished());

        watcher.unreference();
        idle.await.unwrap();
    }

    #[tokio::test]
    async fn test_defer_runs_later() {
        let reactor = Reactor::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        reactor.defer(move || {
            let _ = tx.send(());
        });
        rx.await.unwrap();
    }
}
