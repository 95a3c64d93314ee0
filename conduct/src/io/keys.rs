//! Raw terminal key source for the pause listener.

use std::time::Duration;

use anyhow::{Context, Result};
use crossterm::event::{self, Event, KeyEvent, KeyCode, KeyModifiers};
use crossterm::terminal;
use tracing::warn;

/// Control keys the pause listener reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKey {
    /// Ctrl-P or Ctrl-D: pause the run.
    Pause,
    /// Ctrl-C: pause on the first press, terminate on a quick second press.
    Interrupt,
    /// Anything else; ignored.
    Other,
}

/// Source of control keys. `next_key` blocks for at most `timeout` and
/// returns `None` when no key arrived.
pub trait KeySource {
    fn next_key(&mut self, timeout: Duration) -> Result<Option<ControlKey>>;
}

/// Puts the terminal in raw mode and restores it on drop, covering every
/// exit path of the listener thread.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Result<Self> {
        terminal::enable_raw_mode().context("enable raw mode")?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(err) = terminal::disable_raw_mode() {
            warn!(error = %err, "failed to restore terminal mode");
        }
    }
}

/// Keyboard input in raw mode via crossterm. Raw mode lasts exactly as long
/// as this value lives.
pub struct TerminalKeys {
    _raw: RawModeGuard,
}

impl TerminalKeys {
    pub fn new() -> Result<Self> {
        Ok(Self {
            _raw: RawModeGuard::enable()?,
        })
    }
}

impl KeySource for TerminalKeys {
    fn next_key(&mut self, timeout: Duration) -> Result<Option<ControlKey>> {
        if !event::poll(timeout).context("poll terminal events")? {
            return Ok(None);
        }
        let Event::Key(key) = event::read().context("read terminal event")? else {
            return Ok(Some(ControlKey::Other));
        };
        Ok(Some(classify(key)))
    }
}

fn classify(key: KeyEvent) -> ControlKey {
    let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
    match key.code {
        KeyCode::Char('p') | KeyCode::Char('d') if ctrl => ControlKey::Pause,
        KeyCode::Char('c') if ctrl => ControlKey::Interrupt,
        _ => ControlKey::Other,
    }
}
