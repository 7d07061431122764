//! Coalesces bursts of change signals into rate-limited runs of an action.
//!
//! A [`Debouncer`] owns a background task that waits for signals. With the
//! leading edge enabled the first signal after an idle period runs the action
//! right away; every signal that lands while the window is open marks the
//! debouncer dirty and is serviced by exactly one trailing run once the
//! interval elapses. The window re-arms after each trailing run for as long as
//! signals keep arriving, so the last signal of a burst is always serviced.
//!
//! The action is awaited inline by the background task, so two runs never
//! overlap.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Default minimum spacing between tail passes of one file.
pub const DEFAULT_DEBOUNCE_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Default)]
struct Signal {
    dirty: AtomicBool,
    notify: Notify,
}

/// Handle to a running debounce task.
#[derive(Debug)]
pub struct Debouncer {
    signal: Arc<Signal>,
    cancel_token: CancellationToken,
}

impl Debouncer {
    /// Spawn the debounce task bound to `action`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<F, Fut>(action: F, interval: Duration, leading: bool) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let signal = Arc::new(Signal::default());
        let cancel_token = CancellationToken::new();

        tokio::spawn(run_debounce_loop(
            action,
            interval,
            leading,
            signal.clone(),
            cancel_token.clone(),
        ));

        Self {
            signal,
            cancel_token,
        }
    }

    /// Record that something changed. Never runs the action on the caller's task.
    ///
    /// Signals that land before a run starts are serviced by that run, so a burst that
    /// arrives while the debouncer is idle costs a single leading run.
    pub fn signal(&self) {
        self.signal.dirty.store(true, Ordering::Release);
        self.signal.notify.notify_one();
    }

    /// Cancel any pending trailing run and all future runs.
    ///
    /// A run already in progress is allowed to finish.
    pub fn stop(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

async fn sleep_or_cancel(duration: Duration, cancel_token: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel_token.cancelled() => true,
        _ = sleep(duration) => false,
    }
}

async fn run_debounce_loop<F, Fut>(
    mut action: F,
    interval: Duration,
    leading: bool,
    signal: Arc<Signal>,
    cancel_token: CancellationToken,
) where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => return,
            _ = signal.notify.notified() => {}
        }

        // A stored permit can outlive the dirty flag it announced once a
        // trailing run has already consumed it.
        if !signal.dirty.swap(false, Ordering::AcqRel) {
            continue;
        }

        let mut pending = !leading;
        if leading {
            action().await;
        }

        loop {
            if sleep_or_cancel(interval, &cancel_token).await {
                return;
            }
            let fire = signal.dirty.swap(false, Ordering::AcqRel) | std::mem::take(&mut pending);
            if !fire {
                break;
            }
            action().await;
        }
    }
}
