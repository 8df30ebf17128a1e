//! Cancellable scheduled tasks.
//!
//! Every timer in the engine runs behind a [`TaskHandle`]: starting a task
//! returns the handle, canceling takes it. A task observes its own
//! [`Liveness`] and must check it before publishing anything, so a tick that
//! was already scheduled when `cancel` ran never leaks a stale value.

use std::future::Future;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, Interval, MissedTickBehavior};

const MIN_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug)]
struct LivenessInner {
    alive: AtomicBool,
    notify: Notify,
}

/// Shared cancel flag between a task and its handle.
#[derive(Debug, Clone)]
pub struct Liveness {
    inner: Arc<LivenessInner>,
}

impl Liveness {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LivenessInner {
                alive: AtomicBool::new(true),
                notify: Notify::new(),
            }),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.inner.alive.store(false, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        loop {
            // Created before the check so a concurrent cancel can't be missed.
            let notified = self.inner.notify.notified();
            if !self.is_alive() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// Token for a spawned task. Dropping it cancels the task.
#[derive(Debug)]
pub struct TaskHandle {
    liveness: Liveness,
    join: Option<JoinHandle<()>>,
}

impl TaskHandle {
    pub fn spawn<F, Fut>(task: F) -> Self
    where
        F: FnOnce(Liveness) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let liveness = Liveness::new();
        let join = tokio::spawn(task(liveness.clone()));
        Self {
            liveness,
            join: Some(join),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, |j| j.is_finished())
    }

    /// Alive means not canceled and not yet run to completion.
    pub fn is_alive(&self) -> bool {
        self.liveness.is_alive() && !self.is_finished()
    }

    /// Idempotent. The task stops at its next suspension point at the latest.
    pub fn cancel(&mut self) {
        self.liveness.cancel();
        if let Some(join) = &self.join {
            join.abort();
        }
    }

    /// Cooperative stop: signal the task, give it `grace` to release what it
    /// holds, then abort.
    pub async fn shutdown(mut self, grace: Duration) {
        self.liveness.cancel();
        if let Some(mut join) = self.join.take() {
            if tokio::time::timeout(grace, &mut join).await.is_err() {
                join.abort();
            }
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Interval whose first tick fires one `period` from now.
pub fn delayed_interval(period: Duration) -> Interval {
    let period = period.max(MIN_PERIOD);
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Run `tick(n)` every `period` (n starting at 1) until it breaks or the
/// handle is canceled.
pub fn spawn_interval<F>(period: Duration, mut tick: F) -> TaskHandle
where
    F: FnMut(u64) -> ControlFlow<()> + Send + 'static,
{
    TaskHandle::spawn(move |live| async move {
        let mut ticker = delayed_interval(period);
        let mut n = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = live.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !live.is_alive() {
                break;
            }
            n += 1;
            if tick(n).is_break() {
                break;
            }
        }
    })
}
