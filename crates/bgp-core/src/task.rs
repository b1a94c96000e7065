use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// A cancel-on-drop handle to a spawned unit of background work: the
/// deletion sweep, a dump-replay step, a queued nexthop push. Dropping it is
/// how a peer's background tasks are torn down when its FSM stops.
pub struct Task<T> {
    handle: JoinHandle<T>,
}

impl<T: Send + 'static> Task<T> {
    pub fn spawn(fut: impl Future<Output = T> + Send + 'static) -> Self {
        Self { handle: tokio::spawn(fut) }
    }

    pub fn abort(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A cancel-on-drop timer that fires `f` on an interval (`repeat`) or once
/// (`once`), sending its own event back into the owning event loop rather
/// than returning a value directly — the single-threaded pipeline has no
/// other way to react to a timer firing.
///
/// `refresh()` restarts a one-shot timer's countdown in place (used by the
/// hold timer on receipt of a keepalive) without cancelling and
/// re-submitting the task, which would otherwise race a fire that's already
/// past the point of no return.
pub struct Timer {
    handle: JoinHandle<()>,
    reset: Arc<Notify>,
    duration: Arc<Mutex<Duration>>,
}

impl Timer {
    pub fn once<F, Fut>(secs: u64, f: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let reset = Arc::new(Notify::new());
        let duration = Arc::new(Mutex::new(Duration::from_secs(secs)));
        let reset_task = reset.clone();
        let duration_task = duration.clone();
        let handle = tokio::spawn(async move {
            loop {
                let sleep_for = *duration_task.lock().unwrap();
                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {
                        f().await;
                        break;
                    }
                    _ = reset_task.notified() => continue,
                }
            }
        });
        Self { handle, reset, duration }
    }

    pub fn repeat<F, Fut>(secs: u64, f: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let reset = Arc::new(Notify::new());
        let duration = Arc::new(Mutex::new(Duration::from_secs(secs.max(1))));
        let reset_task = reset.clone();
        let duration_task = duration.clone();
        let handle = tokio::spawn(async move {
            loop {
                let sleep_for = *duration_task.lock().unwrap();
                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => f().await,
                    _ = reset_task.notified() => continue,
                }
            }
        });
        Self { handle, reset, duration }
    }

    /// Restarts the countdown from now, at the same configured duration.
    pub fn refresh(&self) {
        self.reset.notify_one();
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
