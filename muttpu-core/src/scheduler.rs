//! Periodic mailbox refresh.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use log::debug;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Snapshot of the auto-refresh loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AutoRefreshStatus {
    /// Minutes between refreshes, if a loop is scheduled.
    pub interval_minutes: Option<u64>,
    /// Loops whose task is still alive.
    pub active_loops: usize,
}

/// Owns at most one refresh loop.
///
/// Starting a loop always cancels the previous one first.
#[derive(Debug, Default)]
pub struct AutoRefresh {
    current: Option<(u64, CancellationToken)>,
    alive: Arc<AtomicUsize>,
}

struct AliveGuard(Arc<AtomicUsize>);

impl AliveGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AutoRefresh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the running loop with one firing every `minutes`.
    ///
    /// `tick` runs on every wake-up; returning `false` ends the loop. With no
    /// interval (or zero) no loop is started. Must be called inside a tokio
    /// runtime.
    pub fn restart<F>(&mut self, minutes: Option<u64>, tick: F) -> bool
    where
        F: Fn() -> bool + Send + 'static,
    {
        self.stop();
        let Some(minutes) = minutes.filter(|m| *m > 0) else {
            return false;
        };

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let guard = AliveGuard::new(self.alive.clone());
        // Saved settings may hold any positive interval.
        let period = Duration::from_secs(minutes.saturating_mul(60));
        tokio::spawn(async move {
            let _guard = guard;
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
                if cancelled.is_cancelled() || !tick() {
                    break;
                }
            }
            debug!("auto-refresh loop ({minutes} min) stopped");
        });

        self.current = Some((minutes, token));
        true
    }

    /// Cancel the running loop. Returns whether one was running.
    pub fn stop(&mut self) -> bool {
        match self.current.take() {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn interval(&self) -> Option<u64> {
        self.current.as_ref().map(|(minutes, _)| *minutes)
    }

    pub fn status(&self) -> AutoRefreshStatus {
        AutoRefreshStatus {
            interval_minutes: self.interval(),
            active_loops: self.alive.load(Ordering::SeqCst),
        }
    }
}

impl Drop for AutoRefresh {
    fn drop(&mut self) {
        self.stop();
    }
}
