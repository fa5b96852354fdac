//! Lock and wait helpers shared by the transport and connection layers.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

tokio::task_local! {
    /// Set for the lifetime of the task that owns the socket.
    pub(crate) static REACTOR_TASK: ();
}

/// True when called from the reactor task.
pub(crate) fn in_reactor() -> bool {
    REACTOR_TASK.try_with(|_| ()).is_ok()
}

/// Locks a mutex, recovering the guard if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Waits until `check` yields a value.
///
/// `check` runs once up front and again after every wake-up of `notify` or
/// every `poll_interval`, whichever comes first. Returns `None` once
/// `deadline` passes without `check` succeeding.
pub(crate) async fn wait_until<T>(
    notify: &Notify,
    poll_interval: Duration,
    deadline: Option<Instant>,
    mut check: impl FnMut() -> Option<T>,
) -> Option<T> {
    loop {
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(value) = check() {
            return Some(value);
        }

        let mut wait = poll_interval;
        if let Some(deadline) = deadline {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            wait = wait.min(deadline - now);
        }
        let _ = tokio::time::timeout(wait, notified).await;
    }
}
