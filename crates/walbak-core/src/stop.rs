//! Per-volume stop protocol.
//!
//! `stop` CASes the stop state from `NotStopping` to `Stopping` (or
//! `ForceStopping`); exactly one caller wins the CAS and drives the
//! role-specific rest transition. Long transfers poll `is_force_stopping`
//! at their loop checkpoints and bail out promptly on force.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use walbak_types::error::{Result, WalbakError};

const NOT_STOPPING: u8 = 0;
const STOPPING: u8 = 1;
const FORCE_STOPPING: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopState {
    NotStopping,
    Stopping,
    ForceStopping,
}

#[derive(Debug, Default)]
pub struct AtomicStopState(AtomicU8);

impl AtomicStopState {
    pub fn new() -> Self {
        AtomicStopState(AtomicU8::new(NOT_STOPPING))
    }

    pub fn get(&self) -> StopState {
        match self.0.load(Ordering::Acquire) {
            STOPPING => StopState::Stopping,
            FORCE_STOPPING => StopState::ForceStopping,
            _ => StopState::NotStopping,
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.get() != StopState::NotStopping
    }

    pub fn is_force_stopping(&self) -> bool {
        self.get() == StopState::ForceStopping
    }
}

/// Reject a new operation while a stop is in progress.
pub fn verify_not_stopping(st: &AtomicStopState, vol: &str) -> Result<()> {
    if st.is_stopping() {
        return Err(WalbakError::Stopping(vol.to_string()));
    }
    Ok(())
}

/// CAS guard for the stop protocol. The winning caller holds the stop state
/// for the duration of the stop and releases it on drop, so a later `start`
/// is possible again.
pub struct Stopper<'a> {
    st: &'a AtomicStopState,
    success: bool,
}

impl<'a> Stopper<'a> {
    pub fn new(st: &'a AtomicStopState, is_force: bool) -> Self {
        let success = if is_force {
            // Force may upgrade an in-progress graceful stop.
            st.0
                .compare_exchange(NOT_STOPPING, FORCE_STOPPING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
                || st
                    .0
                    .compare_exchange(STOPPING, FORCE_STOPPING, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
        } else {
            st.0
                .compare_exchange(NOT_STOPPING, STOPPING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        };
        Stopper { st, success }
    }

    /// True grants the caller the right to run the stop.
    pub fn is_success(&self) -> bool {
        self.success
    }
}

impl Drop for Stopper<'_> {
    fn drop(&mut self) {
        if self.success {
            self.st.0.store(NOT_STOPPING, Ordering::Release);
        }
    }
}

/// Wakes waiters whenever per-volume state or counters change.
///
/// The predicate passed to `wait_until` reads state under the volume's own
/// short locks; setters bump the generation after releasing theirs, so there
/// is no lock ordering between them.
#[derive(Debug)]
pub struct Notifier {
    gen: Mutex<u64>,
    cond: Condvar,
}

impl Notifier {
    pub fn new() -> Self {
        Notifier {
            gen: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub fn notify(&self) {
        let mut gen = self.gen.lock().unwrap();
        *gen += 1;
        drop(gen);
        self.cond.notify_all();
    }

    /// Wait until `pred` holds, or fail after `timeout`.
    pub fn wait_until<F>(&self, mut pred: F, timeout: Duration, what: &str) -> Result<()>
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut gen = self.gen.lock().unwrap();
        loop {
            if pred() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(WalbakError::Other(format!("timeout waiting for {what}")));
            }
            let (g, _) = self
                .cond
                .wait_timeout(gen, deadline - now)
                .unwrap();
            gen = g;
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn exactly_one_caller_wins_the_cas() {
        let st = AtomicStopState::new();
        let a = Stopper::new(&st, false);
        let b = Stopper::new(&st, false);
        assert!(a.is_success());
        assert!(!b.is_success());
    }

    #[test]
    fn force_upgrades_graceful() {
        let st = AtomicStopState::new();
        let a = Stopper::new(&st, false);
        assert!(a.is_success());
        assert_eq!(st.get(), StopState::Stopping);
        let b = Stopper::new(&st, true);
        assert!(b.is_success());
        assert_eq!(st.get(), StopState::ForceStopping);
    }

    #[test]
    fn released_on_drop() {
        let st = AtomicStopState::new();
        {
            let s = Stopper::new(&st, true);
            assert!(s.is_success());
            assert!(st.is_force_stopping());
        }
        assert_eq!(st.get(), StopState::NotStopping);
    }

    #[test]
    fn wait_until_sees_notification() {
        let n = Arc::new(Notifier::new());
        let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let (n2, f2) = (Arc::clone(&n), Arc::clone(&flag));
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            f2.store(true, Ordering::Release);
            n2.notify();
        });
        n.wait_until(
            || flag.load(Ordering::Acquire),
            Duration::from_secs(5),
            "test flag",
        )
        .unwrap();
        t.join().unwrap();
    }

    #[test]
    fn wait_until_times_out() {
        let n = Notifier::new();
        let err = n
            .wait_until(|| false, Duration::from_millis(30), "never")
            .unwrap_err();
        assert!(err.to_string().contains("timeout"));
    }
}
