//! Keep-alive probing.
//!
//! A [`KeepaliveTask`] runs a probe on a fixed period (in a session the probe
//! is a `keepalive@openssh.com` global request bounded by the keep-alive
//! timeout). The first failed probe ends the task and hands its error to
//! the failure callback, which tears the connection down.

use skiff_platform::{SkiffError, SkiffResult};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Background keep-alive prober.
///
/// Stopped explicitly with [`stop`](Self::stop) or when dropped.
#[derive(Debug)]
pub struct KeepaliveTask {
    period: Duration,
    answered: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl KeepaliveTask {
    /// Creates an idle task probing every `period` once started.
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            answered: Arc::new(AtomicU64::new(0)),
            handle: None,
        }
    }

    /// Probe period.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Probes answered so far.
    pub fn answered(&self) -> u64 {
        self.answered.load(Ordering::Relaxed)
    }

    /// Spawns the probing loop, replacing any previous one.
    ///
    /// ```rust,ignore
    /// let mut task = KeepaliveTask::new(Duration::from_secs(60));
    /// task.start(
    ///     move || { let mux = mux.clone(); async move { mux.ping().await } },
    ///     move |e| transport.fail(&e),
    /// );
    /// ```
    pub fn start<P, Fut, F>(&mut self, probe: P, on_failure: F)
    where
        P: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = SkiffResult<()>> + Send + 'static,
        F: FnOnce(SkiffError) + Send + 'static,
    {
        self.stop();
        let period = self.period;
        let answered = Arc::clone(&self.answered);

        self.handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick fires immediately
            ticker.tick().await;
            debug!(period_ms = period.as_millis() as u64, "Keep-alive started");

            loop {
                ticker.tick().await;
                match probe().await {
                    Ok(()) => {
                        answered.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        warn!(error = %e, "Keep-alive probe failed");
                        on_failure(e);
                        return;
                    }
                }
            }
        }));
    }

    /// Stops probing. Does nothing when not running.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            debug!("Keep-alive stopped");
        }
    }

    /// True while the probing loop is alive.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for KeepaliveTask {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_new_task_is_idle() {
        let task = KeepaliveTask::new(Duration::from_secs(60));
        assert!(!task.is_running());
        assert_eq!(task.answered(), 0);
        assert_eq!(task.period(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_probes_until_stopped() {
        let mut task = KeepaliveTask::new(Duration::from_millis(100));
        task.start(|| async { Ok(()) }, |_| panic!("probe never fails"));
        assert!(task.is_running());

        tokio::time::sleep(Duration::from_millis(350)).await;
        task.stop();

        // at 100ms, 200ms, 300ms
        let answered = task.answered();
        assert!((3..=4).contains(&answered), "expected 3-4 probes, got {}", answered);
        assert!(!task.is_running());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(task.answered(), answered);
    }

    #[tokio::test]
    async fn test_failed_probe_runs_callback_once() {
        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&failures);

        let mut task = KeepaliveTask::new(Duration::from_millis(50));
        task.start(
            || async { Err(SkiffError::timeout("keep-alive unanswered")) },
            move |e| sink.lock().unwrap().push(e.is_timeout()),
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!task.is_running());
        assert_eq!(*failures.lock().unwrap(), vec![true]);
    }
}
