//! Binary latch signals for the coordinator handshake
//!
//! A `Signal` is a two-state latch: waiters suspend while it is closed and
//! are all released when it opens. `open` is idempotent; `close` re-arms the
//! latch. The four protocol latches (Ready, Handler, Done, Exit) live in a
//! `SignalSet` owned by the coordinator — there is no process-global state.

use std::sync::Arc;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// A binary latch with multi-waiter wakeup
#[derive(Debug, Clone)]
pub struct Signal {
    inner: Arc<SignalInner>,
}

#[derive(Debug)]
struct SignalInner {
    /// Human-readable latch name, used in trace output
    name: &'static str,
    open: Mutex<bool>,
    notify: Notify,
}

impl Signal {
    /// Create a latch in the closed state
    pub fn closed(name: &'static str) -> Self {
        Self::with_state(name, false)
    }

    /// Create a latch in the open state
    pub fn open_latch(name: &'static str) -> Self {
        Self::with_state(name, true)
    }

    fn with_state(name: &'static str, open: bool) -> Self {
        Self {
            inner: Arc::new(SignalInner {
                name,
                open: Mutex::new(open),
                notify: Notify::new(),
            }),
        }
    }

    /// Suspend until the latch is open
    ///
    /// The notified future is registered before the state re-check, so an
    /// `open` that races with `wait` can never be missed.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if *self.inner.open.lock() {
                return;
            }
            notified.await;
        }
    }

    /// Open the latch, waking all waiters. Idempotent.
    pub fn open(&self) {
        let mut open = self.inner.open.lock();
        if !*open {
            *open = true;
            tracing::trace!(signal = self.inner.name, "latch opened");
        }
        drop(open);
        self.inner.notify.notify_waiters();
    }

    /// Reset the latch to closed
    pub fn close(&self) {
        let mut open = self.inner.open.lock();
        if *open {
            *open = false;
            tracing::trace!(signal = self.inner.name, "latch closed");
        }
        drop(open);
        self.inner.notify.notify_waiters();
    }

    /// Suspend until the latch is closed
    ///
    /// The inverse edge: used by the daemon to observe that a trigger has
    /// consumed the Done latch before re-opening Ready.
    pub async fn wait_closed(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if !*self.inner.open.lock() {
                return;
            }
            notified.await;
        }
    }

    /// Check whether the latch is currently open
    pub fn is_open(&self) -> bool {
        *self.inner.open.lock()
    }
}

/// The four coordinator latches
///
/// | Signal  | Initial | Meaning when open                       |
/// |---------|---------|-----------------------------------------|
/// | ready   | open    | Loop is idle; accepting a trigger       |
/// | handler | closed  | A trigger has been requested            |
/// | done    | closed  | Current iteration's work has completed  |
/// | exit    | closed  | Process may terminate                   |
#[derive(Debug, Clone)]
pub struct SignalSet {
    /// Loop is idle and accepting a trigger
    pub ready: Signal,
    /// A trigger has been requested
    pub handler: Signal,
    /// Current iteration's work has completed
    pub done: Signal,
    /// Process may terminate
    pub exit: Signal,
}

impl SignalSet {
    /// Create the protocol latches in their initial states
    pub fn new() -> Self {
        Self {
            ready: Signal::open_latch("ready"),
            handler: Signal::closed("handler"),
            done: Signal::closed("done"),
            exit: Signal::closed("exit"),
        }
    }
}

impl Default for SignalSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_returns_immediately_when_open() {
        let signal = Signal::open_latch("test");
        // Must not hang
        tokio::time::timeout(Duration::from_millis(100), signal.wait())
            .await
            .expect("wait on an open latch must complete immediately");
    }

    #[tokio::test]
    async fn test_open_wakes_all_waiters() {
        let signal = Signal::closed("test");

        let mut handles = Vec::new();
        for _ in 0..4 {
            let s = signal.clone();
            handles.push(tokio::spawn(async move { s.wait().await }));
        }

        // Let the waiters park
        tokio::time::sleep(Duration::from_millis(20)).await;
        signal.open();

        for handle in handles {
            tokio::time::timeout(Duration::from_millis(200), handle)
                .await
                .expect("waiter must be released")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let signal = Signal::closed("test");
        signal.open();
        signal.open();
        assert!(signal.is_open());
    }

    #[tokio::test]
    async fn test_close_rearms_the_latch() {
        let signal = Signal::open_latch("test");
        signal.close();
        assert!(!signal.is_open());

        let s = signal.clone();
        let waiter = tokio::spawn(async move { s.wait().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "waiter must block on a closed latch");

        signal.open();
        tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_open_racing_wait_is_not_missed() {
        // Interleave many open/wait pairs; the registration-before-recheck
        // ordering in wait() must never lose a wakeup.
        for _ in 0..50 {
            let signal = Signal::closed("race");
            let s = signal.clone();
            let waiter = tokio::spawn(async move { s.wait().await });
            signal.open();
            tokio::time::timeout(Duration::from_millis(200), waiter)
                .await
                .expect("wakeup lost")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_wait_closed_observes_reset() {
        let signal = Signal::open_latch("test");

        let s = signal.clone();
        let waiter = tokio::spawn(async move { s.wait_closed().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        signal.close();
        tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_signal_set_initial_states() {
        let set = SignalSet::new();
        assert!(set.ready.is_open());
        assert!(!set.handler.is_open());
        assert!(!set.done.is_open());
        assert!(!set.exit.is_open());
    }
}
