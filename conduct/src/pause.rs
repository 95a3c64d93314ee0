//! Background key listener turning raw keystrokes into pause and terminate
//! signals while a run is in flight.
//!
//! One listener covers exactly one run: start it before calling into the
//! backend, stop it when the call returns, then inspect the flags. The key
//! source moves into the watcher thread and is dropped (closing the raw input
//! handle) on every exit path.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, warn};

use crate::io::keys::{ControlKey, KeySource};

/// Listener tuning. The interrupt window bounds how long a first Ctrl-C keeps
/// the watcher alive waiting for the terminating second press.
#[derive(Debug, Clone)]
pub struct PauseListenerConfig {
    pub double_interrupt_window: Duration,
    pub poll_interval: Duration,
}

impl Default for PauseListenerConfig {
    fn default() -> Self {
        Self {
            double_interrupt_window: Duration::from_millis(2000),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Callbacks fired from the watcher thread, each at most once per listener.
/// Callback errors are logged and swallowed; a failing callback must never
/// take the run down with it.
pub struct PauseCallbacks {
    pub on_pause: Box<dyn Fn() -> Result<()> + Send>,
    pub on_terminate: Box<dyn Fn() -> Result<()> + Send>,
}

impl PauseCallbacks {
    pub fn noop() -> Self {
        Self {
            on_pause: Box::new(|| Ok(())),
            on_terminate: Box::new(|| Ok(())),
        }
    }
}

#[derive(Default)]
struct Signals {
    paused: AtomicBool,
    terminated: AtomicBool,
    stopped: AtomicBool,
}

pub struct PauseListener {
    signals: Arc<Signals>,
    watcher: Option<JoinHandle<()>>,
}

impl PauseListener {
    /// Spawn the watcher thread for one run cycle.
    pub fn start<S>(source: S, callbacks: PauseCallbacks, config: PauseListenerConfig) -> Self
    where
        S: KeySource + Send + 'static,
    {
        let signals = Arc::new(Signals::default());
        let thread_signals = Arc::clone(&signals);
        let watcher = thread::spawn(move || watch(source, &callbacks, &config, &thread_signals));
        Self {
            signals,
            watcher: Some(watcher),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.signals.paused.load(Ordering::SeqCst)
    }

    pub fn is_terminated(&self) -> bool {
        self.signals.terminated.load(Ordering::SeqCst)
    }

    /// Stop watching and join the watcher thread. Idempotent; also invoked
    /// on drop so an early return cannot leak the thread or the raw-mode
    /// terminal handle.
    pub fn stop(&mut self) {
        self.signals.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.watcher.take()
            && handle.join().is_err()
        {
            warn!("pause listener thread panicked");
        }
    }
}

impl Drop for PauseListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn watch<S: KeySource>(
    mut source: S,
    callbacks: &PauseCallbacks,
    config: &PauseListenerConfig,
    signals: &Signals,
) {
    let mut first_interrupt: Option<Instant> = None;
    let mut pause_fired = false;
    loop {
        if signals.stopped.load(Ordering::SeqCst) || signals.terminated.load(Ordering::SeqCst) {
            return;
        }
        if let Some(at) = first_interrupt
            && at.elapsed() > config.double_interrupt_window
        {
            // The escalation chance expired; the pause stands and a later
            // Ctrl-C counts as a fresh first press in the next listener.
            debug!("interrupt window expired; pause stands");
            return;
        }
        let key = match source.next_key(config.poll_interval) {
            Ok(key) => key,
            Err(err) => {
                warn!(error = %err, "key source failed; stopping listener");
                return;
            }
        };
        match key {
            None | Some(ControlKey::Other) => {}
            Some(ControlKey::Pause) => {
                signals.paused.store(true, Ordering::SeqCst);
                fire_once(&callbacks.on_pause, "on_pause", &mut pause_fired);
                return;
            }
            Some(ControlKey::Interrupt) => {
                let now = Instant::now();
                if first_interrupt
                    .is_some_and(|at| now.duration_since(at) <= config.double_interrupt_window)
                {
                    signals.terminated.store(true, Ordering::SeqCst);
                    let mut terminate_fired = false;
                    fire_once(&callbacks.on_terminate, "on_terminate", &mut terminate_fired);
                    return;
                }
                first_interrupt = Some(now);
                signals.paused.store(true, Ordering::SeqCst);
                fire_once(&callbacks.on_pause, "on_pause", &mut pause_fired);
                // Keep reading until the window closes: a second Ctrl-C
                // escalates to terminate.
            }
        }
    }
}

fn fire_once(callback: &(dyn Fn() -> Result<()> + Send), name: &str, fired: &mut bool) {
    if *fired {
        return;
    }
    *fired = true;
    if let Err(err) = callback() {
        warn!(callback = name, error = %err, "listener callback failed");
    }
}
