//! Cooperative cancellation for blocking waits.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, signal) = &*self.inner;
        let mut cancelled = match flag.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *cancelled = true;
        signal.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let (flag, _) = &*self.inner;
        match flag.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Sleep until `deadline` or cancellation. Returns `true` if cancelled.
    pub fn sleep_until(&self, deadline: Instant) -> bool {
        let (flag, signal) = &*self.inner;
        let mut cancelled = match flag.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        loop {
            if *cancelled {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            cancelled = match signal.wait_timeout(cancelled, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    pub fn sleep(&self, duration: Duration) -> bool {
        self.sleep_until(Instant::now() + duration)
    }
}

/// Cancel `token` on SIGINT/SIGTERM. Only one handler can exist per process;
/// a second install is logged and ignored.
pub fn install_signal_handler(token: &CancellationToken) {
    let token = token.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        tracing::warn!("termination signal received, cancelling");
        token.cancel();
    }) {
        tracing::debug!(error = %err, "signal handler not installed");
    }
}
