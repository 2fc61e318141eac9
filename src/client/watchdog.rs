//! Server-idle watchdog.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// One-shot rearmable timer. Every inbound frame pushes the deadline out by
/// the configured server timeout; if the deadline is ever reached the
/// timeout action runs once and the timer stops.
///
/// A watchdog is only armed when the transport has no keep-alive of its
/// own; otherwise it stays idle for the whole session.
pub(crate) struct Watchdog {
    deadline: Option<watch::Sender<Option<Instant>>>,
    timeout_ms: Arc<AtomicU64>,
    disposed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Watchdog {
    pub(crate) fn new(
        needed: bool,
        timeout_ms: Arc<AtomicU64>,
        on_timeout: impl FnOnce(Duration) + Send + 'static,
    ) -> Self {
        if !needed {
            return Self {
                deadline: None,
                timeout_ms,
                disposed: AtomicBool::new(false),
                task: Mutex::new(None),
            };
        }
        let (deadline_tx, deadline_rx) = watch::channel(None);
        let task = tokio::spawn(Self::run(
            deadline_rx,
            Arc::clone(&timeout_ms),
            on_timeout,
        ));
        Self {
            deadline: Some(deadline_tx),
            timeout_ms,
            disposed: AtomicBool::new(false),
            task: Mutex::new(Some(task)),
        }
    }

    /// Pushes the deadline to now + server timeout. Silently absorbed when
    /// the watchdog is idle or already disposed.
    pub(crate) fn rearm(&self) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        let Some(deadline) = &self.deadline else {
            return;
        };
        let timeout =
            Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed));
        let _ = deadline.send(Some(Instant::now() + timeout));
    }

    /// Stops the timer for good. Safe to call more than once and safe to
    /// race with a late rearm.
    pub(crate) fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        if let Some(task) = self
            .task
            .lock()
            .expect("watchdog lock poisoned")
            .take()
        {
            task.abort();
        }
    }

    async fn run(
        mut deadline: watch::Receiver<Option<Instant>>,
        timeout_ms: Arc<AtomicU64>,
        on_timeout: impl FnOnce(Duration) + Send + 'static,
    ) {
        loop {
            let current = *deadline.borrow_and_update();
            match current {
                None => {
                    if deadline.changed().await.is_err() {
                        return;
                    }
                }
                Some(at) => {
                    tokio::select! {
                        () = tokio::time::sleep_until(at) => {
                            let timeout = Duration::from_millis(
                                timeout_ms.load(Ordering::Relaxed),
                            );
                            on_timeout(timeout);
                            return;
                        }
                        changed = deadline.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn fired() -> (Arc<AtomicUsize>, impl FnOnce(Duration) + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let hook = {
            let count = Arc::clone(&count);
            move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            }
        };
        (count, hook)
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_the_timeout() {
        let timeout_ms = Arc::new(AtomicU64::new(50));
        let (count, hook) = fired();
        let watchdog = Watchdog::new(true, timeout_ms, hook);
        watchdog.rearm();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_postpones_the_deadline() {
        let timeout_ms = Arc::new(AtomicU64::new(50));
        let (count, hook) = fired();
        let watchdog = Watchdog::new(true, timeout_ms, hook);
        watchdog.rearm();
        tokio::time::sleep(Duration::from_millis(30)).await;
        watchdog.rearm();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn not_needed_watchdog_never_fires() {
        let timeout_ms = Arc::new(AtomicU64::new(10));
        let (count, hook) = fired();
        let watchdog = Watchdog::new(false, timeout_ms, hook);
        watchdog.rearm();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_after_dispose_is_absorbed() {
        let timeout_ms = Arc::new(AtomicU64::new(10));
        let (count, hook) = fired();
        let watchdog = Watchdog::new(true, timeout_ms, hook);
        watchdog.dispose();
        watchdog.rearm();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn new_timeout_applies_at_the_next_rearm() {
        let timeout_ms = Arc::new(AtomicU64::new(1_000));
        let (count, hook) = fired();
        let watchdog = Watchdog::new(true, Arc::clone(&timeout_ms), hook);
        watchdog.rearm();
        timeout_ms.store(20, Ordering::Relaxed);
        watchdog.rearm();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
