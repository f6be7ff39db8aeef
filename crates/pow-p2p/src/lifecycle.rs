//! Start/stop bookkeeping for a component's periodic loops.
//!
//! A [`LoopSet`] moves through `Stopped → Running → Stopping → Stopped`.
//! Workers sleep between ticks inside a `select!` on a shared
//! [`CancellationToken`], so a stop request wakes idle workers at once and a
//! worker mid-tick exits after its (timeout-bounded) tick finishes.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::P2pError;

/// Lifecycle state of a loop set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    /// No workers exist.
    Stopped,
    /// Workers are running.
    Running,
    /// Stop was requested and workers are being joined.
    Stopping,
}

impl LoopState {
    /// Returns true if workers are running.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// A spawned background worker.
#[derive(Debug)]
pub(crate) struct Worker {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl Worker {
    pub(crate) const fn new(name: &'static str, handle: JoinHandle<()>) -> Self {
        Self { name, handle }
    }
}

#[derive(Debug)]
struct LoopSetInner {
    state: LoopState,
    token: CancellationToken,
    workers: Vec<Worker>,
}

/// The set of workers owned by one component.
#[derive(Debug)]
pub(crate) struct LoopSet {
    component: &'static str,
    inner: Mutex<LoopSetInner>,
}

impl LoopSet {
    pub(crate) fn new(component: &'static str) -> Self {
        Self {
            component,
            inner: Mutex::new(LoopSetInner {
                state: LoopState::Stopped,
                token: CancellationToken::new(),
                workers: Vec::new(),
            }),
        }
    }

    pub(crate) fn state(&self) -> LoopState {
        self.inner.lock().state
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.inner.lock().workers.len()
    }

    /// Spawns workers unless already running.
    ///
    /// Returns `true` if the set is running afterwards. A second call while
    /// running spawns nothing. Returns `false` if a stop is in progress, if
    /// there is no tokio runtime, or if `spawn` fails.
    pub(crate) fn start<F>(&self, spawn: F) -> bool
    where
        F: FnOnce(&CancellationToken) -> Result<Vec<Worker>, P2pError>,
    {
        let mut inner = self.inner.lock();
        match inner.state {
            LoopState::Running => {
                debug!(component = self.component, "already running, start ignored");
                return true;
            }
            LoopState::Stopping => {
                warn!(component = self.component, "start requested while stopping");
                return false;
            }
            LoopState::Stopped => {}
        }

        if tokio::runtime::Handle::try_current().is_err() {
            warn!(component = self.component, "cannot start loops outside a tokio runtime");
            return false;
        }

        let token = CancellationToken::new();
        match spawn(&token) {
            Ok(workers) => {
                info!(
                    component = self.component,
                    workers = workers.len(),
                    "loops started"
                );
                inner.token = token;
                inner.workers = workers;
                inner.state = LoopState::Running;
                true
            }
            Err(e) => {
                warn!(component = self.component, error = %e, "failed to start loops");
                token.cancel();
                false
            }
        }
    }

    /// Cancels and joins all workers, waiting at most `join_timeout` in total.
    ///
    /// Workers that do not exit in time are aborted and abandoned. Calling
    /// this when not running does nothing.
    pub(crate) async fn stop(&self, join_timeout: Duration) {
        let workers = {
            let mut inner = self.inner.lock();
            if inner.state != LoopState::Running {
                debug!(component = self.component, state = ?inner.state, "stop ignored");
                return;
            }
            inner.state = LoopState::Stopping;
            inner.token.cancel();
            std::mem::take(&mut inner.workers)
        };

        let deadline = tokio::time::Instant::now() + join_timeout;
        for mut worker in workers {
            match tokio::time::timeout_at(deadline, &mut worker.handle).await {
                Ok(Ok(())) => debug!(component = self.component, worker = worker.name, "joined"),
                Ok(Err(e)) => warn!(
                    component = self.component,
                    worker = worker.name,
                    error = %e,
                    "worker ended abnormally"
                ),
                Err(_) => {
                    warn!(
                        component = self.component,
                        worker = worker.name,
                        "worker did not exit in time, abandoning"
                    );
                    worker.handle.abort();
                }
            }
        }

        self.inner.lock().state = LoopState::Stopped;
        info!(component = self.component, "loops stopped");
    }
}

/// Spawns a worker that runs `tick`, then sleeps for `cadence()`, until
/// `token` is cancelled.
pub(crate) fn spawn_periodic<C, F, Fut>(
    name: &'static str,
    token: CancellationToken,
    cadence: C,
    mut tick: F,
) -> Worker
where
    C: Fn() -> Duration + Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(async move {
        debug!(worker = name, "loop started");
        while !token.is_cancelled() {
            tick().await;
            let delay = cadence();
            tokio::select! {
                () = token.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }
        debug!(worker = name, "loop exited");
    });
    Worker::new(name, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_worker(token: &CancellationToken, ticks: &Arc<AtomicUsize>) -> Worker {
        let ticks = Arc::clone(ticks);
        spawn_periodic(
            "counter",
            token.clone(),
            || Duration::from_millis(5),
            move || {
                let ticks = Arc::clone(&ticks);
                async move {
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
            },
        )
    }

    #[test]
    fn loop_state_is_running() {
        assert!(LoopState::Running.is_running());
        assert!(!LoopState::Stopping.is_running());
        assert!(!LoopState::Stopped.is_running());
    }

    #[test]
    fn start_outside_runtime_fails() {
        let set = LoopSet::new("test");
        assert!(!set.start(|_| Ok(vec![])));
        assert_eq!(set.state(), LoopState::Stopped);
    }

    #[tokio::test]
    async fn start_runs_workers_and_stop_joins_them() {
        let set = LoopSet::new("test");
        let ticks = Arc::new(AtomicUsize::new(0));

        assert!(set.start(|token| Ok(vec![counting_worker(token, &ticks)])));
        assert_eq!(set.state(), LoopState::Running);
        assert_eq!(set.worker_count(), 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        set.stop(Duration::from_secs(1)).await;

        assert_eq!(set.state(), LoopState::Stopped);
        assert_eq!(set.worker_count(), 0);
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen, "worker kept ticking");
    }

    #[tokio::test]
    async fn double_start_spawns_nothing() {
        let set = LoopSet::new("test");
        let ticks = Arc::new(AtomicUsize::new(0));
        let spawns = AtomicUsize::new(0);

        for _ in 0..2 {
            assert!(set.start(|token| {
                spawns.fetch_add(1, Ordering::SeqCst);
                Ok(vec![counting_worker(token, &ticks)])
            }));
        }

        assert_eq!(spawns.load(Ordering::SeqCst), 1);
        assert_eq!(set.worker_count(), 1);
        set.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn stop_before_start_and_twice_is_noop() {
        let set = LoopSet::new("test");
        set.stop(Duration::from_millis(10)).await;
        assert_eq!(set.state(), LoopState::Stopped);

        assert!(set.start(|_| Ok(vec![])));
        set.stop(Duration::from_millis(10)).await;
        set.stop(Duration::from_millis(10)).await;
        assert_eq!(set.state(), LoopState::Stopped);
    }

    #[tokio::test]
    async fn failed_spawn_leaves_set_stopped() {
        let set = LoopSet::new("test");
        assert!(!set.start(|_| Err(P2pError::Config("no".into()))));
        assert_eq!(set.state(), LoopState::Stopped);
    }

    #[tokio::test]
    async fn stuck_worker_is_abandoned() {
        let set = LoopSet::new("test");
        assert!(set.start(|_| {
            let handle = tokio::spawn(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
            });
            Ok(vec![Worker::new("stuck", handle)])
        }));

        let started = std::time::Instant::now();
        set.stop(Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(set.state(), LoopState::Stopped);
    }

    #[tokio::test]
    async fn restart_after_stop() {
        let set = LoopSet::new("test");
        let ticks = Arc::new(AtomicUsize::new(0));

        assert!(set.start(|token| Ok(vec![counting_worker(token, &ticks)])));
        set.stop(Duration::from_secs(1)).await;
        assert!(set.start(|token| Ok(vec![counting_worker(token, &ticks)])));
        assert_eq!(set.state(), LoopState::Running);
        set.stop(Duration::from_secs(1)).await;
    }
}
