//! Operator control latches.
//!
//! [`ControlSignals`] holds four independent boolean latches that the
//! keyboard listener sets asynchronously and the loop clears synchronously
//! once it has acted on them:
//!
//! ```text
//! keyboard listener ──set──► [pause | stop | gutter | intervene] ──take──► executor / controller
//! ```
//!
//! A latch stays set until the consumer clears it, so a key press is never
//! lost even if it lands while a tool is running.
//!
//! The context also carries a `suspended` flag. While the loop is blocked on
//! operator input (intervention text, structured questions) the keyboard
//! listener stops sampling so it does not steal keystrokes.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

/// One operator-issued control signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// Stop after the current iteration and save resumable state.
    Pause,
    /// Abandon the run after the current iteration.
    Stop,
    /// Discard the current context and start a fresh session.
    Gutter,
    /// Interrupt the agent and inject an operator message.
    Intervene,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Pause => write!(f, "pause"),
            Signal::Stop => write!(f, "stop"),
            Signal::Gutter => write!(f, "gutter"),
            Signal::Intervene => write!(f, "intervene"),
        }
    }
}

#[derive(Debug, Default)]
struct Latches {
    pause: AtomicBool,
    stop: AtomicBool,
    gutter: AtomicBool,
    intervene: AtomicBool,
    suspended: AtomicBool,
}

/// Point-in-time view of the latches, used by the transition function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalSnapshot {
    pub pause: bool,
    pub stop: bool,
    pub gutter: bool,
    pub intervene: bool,
}

/// Shared latch context passed to the listener, executor, and controller.
///
/// Cloning is cheap and every clone refers to the same latches.
///
/// # Example
///
/// ```
/// use ralph::signals::{ControlSignals, Signal};
///
/// let signals = ControlSignals::new();
/// signals.set(Signal::Pause);
/// assert!(signals.is_set(Signal::Pause));
/// assert!(signals.take(Signal::Pause));
/// assert!(!signals.is_set(Signal::Pause));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ControlSignals {
    inner: Arc<Latches>,
}

impl ControlSignals {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn latch(&self, signal: Signal) -> &AtomicBool {
        match signal {
            Signal::Pause => &self.inner.pause,
            Signal::Stop => &self.inner.stop,
            Signal::Gutter => &self.inner.gutter,
            Signal::Intervene => &self.inner.intervene,
        }
    }

    /// Set a latch.
    pub fn set(&self, signal: Signal) {
        if !self.latch(signal).swap(true, Ordering::SeqCst) {
            debug!("Control signal raised: {signal}");
        }
    }

    #[must_use]
    pub fn is_set(&self, signal: Signal) -> bool {
        self.latch(signal).load(Ordering::SeqCst)
    }

    /// Clear a latch without reading it.
    pub fn clear(&self, signal: Signal) {
        self.latch(signal).store(false, Ordering::SeqCst);
    }

    /// Clear a latch, returning whether it was set.
    ///
    /// This is the at-most-once consumption point: two concurrent callers
    /// cannot both observe `true` for the same assertion.
    pub fn take(&self, signal: Signal) -> bool {
        let was_set = self.latch(signal).swap(false, Ordering::SeqCst);
        if was_set {
            debug!("Control signal consumed: {signal}");
        }
        was_set
    }

    /// Clear every latch.
    pub fn clear_all(&self) {
        for signal in [Signal::Pause, Signal::Stop, Signal::Gutter, Signal::Intervene] {
            self.clear(signal);
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> SignalSnapshot {
        SignalSnapshot {
            pause: self.is_set(Signal::Pause),
            stop: self.is_set(Signal::Stop),
            gutter: self.is_set(Signal::Gutter),
            intervene: self.is_set(Signal::Intervene),
        }
    }

    /// Mark the loop as blocked on operator input until the guard drops.
    #[must_use = "suspension ends when the guard is dropped"]
    pub fn suspend(&self) -> SuspendGuard {
        self.inner.suspended.store(true, Ordering::SeqCst);
        SuspendGuard {
            signals: self.clone(),
        }
    }

    /// Whether the loop is currently waiting on operator input.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.inner.suspended.load(Ordering::SeqCst)
    }
}

/// Ends an operator suspension when dropped.
#[derive(Debug)]
pub struct SuspendGuard {
    signals: ControlSignals,
}

impl Drop for SuspendGuard {
    fn drop(&mut self) {
        self.signals.inner.suspended.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latches_are_independent() {
        let signals = ControlSignals::new();
        signals.set(Signal::Stop);
        assert!(signals.is_set(Signal::Stop));
        assert!(!signals.is_set(Signal::Pause));
        assert!(!signals.is_set(Signal::Gutter));
        assert!(!signals.is_set(Signal::Intervene));
    }

    #[test]
    fn test_latch_persists_until_cleared() {
        let signals = ControlSignals::new();
        signals.set(Signal::Gutter);
        signals.set(Signal::Gutter);
        assert!(signals.is_set(Signal::Gutter));
        assert!(signals.is_set(Signal::Gutter));
        signals.clear(Signal::Gutter);
        assert!(!signals.is_set(Signal::Gutter));
    }

    #[test]
    fn test_take_consumes_once() {
        let signals = ControlSignals::new();
        signals.set(Signal::Intervene);
        assert!(signals.take(Signal::Intervene));
        assert!(!signals.take(Signal::Intervene));
    }

    #[test]
    fn test_clones_share_latches() {
        let signals = ControlSignals::new();
        let listener = signals.clone();
        listener.set(Signal::Pause);
        assert_eq!(
            signals.snapshot(),
            SignalSnapshot {
                pause: true,
                ..SignalSnapshot::default()
            }
        );
        signals.clear_all();
        assert!(!listener.is_set(Signal::Pause));
    }

    #[test]
    fn test_suspend_guard_restores() {
        let signals = ControlSignals::new();
        {
            let _guard = signals.suspend();
            assert!(signals.is_suspended());
        }
        assert!(!signals.is_suspended());
    }

    #[test]
    fn test_concurrent_take_observed_once() {
        let signals = ControlSignals::new();
        signals.set(Signal::Stop);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = signals.clone();
                std::thread::spawn(move || s.take(Signal::Stop))
            })
            .collect();
        let taken = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .filter(|t| *t)
            .count();
        assert_eq!(taken, 1);
    }
}
