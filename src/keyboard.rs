//! Keyboard control-signal source.
//!
//! While a loop runs, a background task samples the terminal for single key
//! presses every [`POLL_INTERVAL`] and raises the matching latch on
//! [`ControlSignals`]:
//!
//! | Key | Signal |
//! |-----|--------|
//! | `p` | pause |
//! | `g` | gutter (fresh context) |
//! | `s`, `q`, Ctrl+C | stop |
//! | `i` | intervene |
//!
//! Sampling needs raw mode. When stdin is not a terminal, or raw mode cannot
//! be enabled, the listener quietly does nothing and no latch is ever set.
//!
//! Raw mode is owned by a guard inside the sampling task, so the terminal is
//! restored when the task ends for any reason. [`KeyboardListener::stop`]
//! waits for that task to finish.

use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::signals::{ControlSignals, Signal};

/// How often the terminal is sampled for key presses.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Map a key press to a control signal.
///
/// # Example
///
/// ```
/// use crossterm::event::{KeyCode, KeyModifiers};
/// use ralph::keyboard::signal_for_key;
/// use ralph::signals::Signal;
///
/// assert_eq!(signal_for_key(KeyCode::Char('p'), KeyModifiers::NONE), Some(Signal::Pause));
/// assert_eq!(signal_for_key(KeyCode::Char('c'), KeyModifiers::CONTROL), Some(Signal::Stop));
/// assert_eq!(signal_for_key(KeyCode::Char('x'), KeyModifiers::NONE), None);
/// ```
#[must_use]
pub fn signal_for_key(code: KeyCode, modifiers: KeyModifiers) -> Option<Signal> {
    let KeyCode::Char(c) = code else {
        return None;
    };
    if modifiers.contains(KeyModifiers::CONTROL) {
        return (c == 'c').then_some(Signal::Stop);
    }
    match c.to_ascii_lowercase() {
        'p' => Some(Signal::Pause),
        'g' => Some(Signal::Gutter),
        's' | 'q' => Some(Signal::Stop),
        'i' => Some(Signal::Intervene),
        _ => None,
    }
}

/// Whether the terminal is currently in raw mode.
///
/// Raw mode disables output post-processing, so printed lines need an
/// explicit carriage return.
#[must_use]
pub fn raw_mode_active() -> bool {
    terminal::is_raw_mode_enabled().unwrap_or(false)
}

/// Line terminator suitable for the current terminal mode.
#[must_use]
pub fn line_ending() -> &'static str {
    if raw_mode_active() {
        "\r\n"
    } else {
        "\n"
    }
}

/// Leave raw mode if it is on. Used before reading a full line from the
/// operator.
pub fn leave_raw_mode() {
    if raw_mode_active() {
        if let Err(e) = terminal::disable_raw_mode() {
            warn!("Failed to leave raw mode: {e}");
        }
    }
}

/// Where the sampler gets key presses from.
trait KeySource {
    fn acquire(&mut self) -> std::io::Result<()>;
    fn release(&mut self);
    /// Wait up to `timeout` for one key press.
    fn poll_key(&mut self, timeout: Duration) -> std::io::Result<Option<KeyEvent>>;
}

/// Owns raw mode for the sampling task.
struct RawModeGuard {
    enabled: bool,
}

impl RawModeGuard {
    fn new() -> Self {
        Self { enabled: false }
    }
}

impl KeySource for RawModeGuard {
    fn acquire(&mut self) -> std::io::Result<()> {
        if !self.enabled || !raw_mode_active() {
            terminal::enable_raw_mode()?;
            self.enabled = true;
        }
        Ok(())
    }

    fn release(&mut self) {
        if self.enabled {
            if let Err(e) = terminal::disable_raw_mode() {
                warn!("Failed to restore terminal mode: {e}");
            }
            self.enabled = false;
        }
    }

    fn poll_key(&mut self, timeout: Duration) -> std::io::Result<Option<KeyEvent>> {
        if !event::poll(timeout)? {
            return Ok(None);
        }
        match event::read()? {
            Event::Key(key) if key.kind == KeyEventKind::Press => Ok(Some(key)),
            _ => Ok(None),
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        self.release();
    }
}

fn sample(signals: &ControlSignals, cancel: &AtomicBool, source: &mut impl KeySource) {
    while !cancel.load(Ordering::SeqCst) {
        if signals.is_suspended() {
            source.release();
            std::thread::sleep(POLL_INTERVAL);
            continue;
        }

        if let Err(e) = source.acquire() {
            debug!("Raw mode unavailable, keyboard control disabled: {e}");
            return;
        }

        // The operator may have taken the terminal while raw mode was acquired.
        if signals.is_suspended() {
            source.release();
            continue;
        }

        match source.poll_key(POLL_INTERVAL) {
            Ok(Some(key)) => {
                if let Some(signal) = signal_for_key(key.code, key.modifiers) {
                    signals.set(signal);
                }
            }
            Ok(None) => {}
            Err(e) => {
                debug!("Keyboard read failed, stopping listener: {e}");
                return;
            }
        }
    }
}

/// Background keyboard sampler for one loop run.
pub struct KeyboardListener {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl KeyboardListener {
    /// Start sampling if stdin is an interactive terminal.
    #[must_use]
    pub fn start(signals: ControlSignals) -> Self {
        if !std::io::stdin().is_terminal() {
            debug!("stdin is not a terminal, keyboard control disabled");
            return Self::disabled();
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let task_cancel = Arc::clone(&cancel);
        let handle = tokio::task::spawn_blocking(move || {
            sample(&signals, &task_cancel, &mut RawModeGuard::new());
        });

        Self {
            cancel,
            handle: Some(handle),
        }
    }

    /// A listener that never samples.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            cancel: Arc::new(AtomicBool::new(true)),
            handle: None,
        }
    }

    /// Whether a sampling task was started.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.handle.is_some()
    }

    /// Cancel sampling and wait for the terminal to be restored.
    pub async fn stop(mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("Keyboard listener ended abnormally: {e}");
            }
        }
    }
}

impl Drop for KeyboardListener {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}

/// Run `fut` with keyboard sampling active, stopping the listener afterwards.
///
/// When `enabled` is false the future runs without a listener.
pub async fn with_keyboard<F, T>(signals: &ControlSignals, enabled: bool, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    let listener = if enabled {
        KeyboardListener::start(signals.clone())
    } else {
        KeyboardListener::disabled()
    };
    let output = fut.await;
    listener.stop().await;
    output
}
