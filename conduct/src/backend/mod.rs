//! Execution strategies hosting a [`ConversationRunner`].
//!
//! Three interchangeable strategies: [`DirectBackend`] calls the runner
//! inline, [`thread::ThreadBackend`] drives it on a worker thread, and
//! [`process::ProcessBackend`] isolates it in a child OS process behind a
//! strict request/response protocol. Process isolation is the option to reach
//! for when termination must actually work.

pub mod process;
pub mod protocol;
pub mod thread;
pub mod worker;

use anyhow::Result;

use crate::core::types::StatusReport;
use crate::pause::PauseCallbacks;
use crate::runner::ConversationRunner;

/// Control surface shared by all hosting strategies.
///
/// `Ok(false)` / `Ok(None)` means the outcome is unknown (for example an IPC
/// timeout), never that the command definitely failed: callers must not
/// assume the command was lost.
pub trait ExecutionBackend {
    /// Deliver a message (or `None` to just run) and drive the conversation
    /// to its next resting point.
    fn process_message(&mut self, message: Option<&str>) -> Result<bool>;

    /// Request a cooperative pause.
    fn pause(&mut self) -> Result<bool>;

    /// Resume a paused conversation; equivalent to a message-less run.
    fn resume(&mut self) -> Result<bool>;

    /// Flip confirmation mode, reconstructing the conversation. The returned
    /// bool is an acknowledgement; query `get_status` for the resulting mode.
    fn toggle_confirmation_mode(&mut self) -> Result<bool>;

    fn get_status(&mut self) -> Result<Option<StatusReport>>;

    /// Tear the backend down. Idempotent.
    fn stop(&mut self) -> Result<()>;
}

/// Inline strategy: the runner executes on the caller's thread.
///
/// A pause during a run must come from another thread holding the
/// conversation handle (the pause listener does exactly that); calling
/// [`ExecutionBackend::pause`] between runs marks the next run.
pub struct DirectBackend {
    runner: ConversationRunner,
}

impl DirectBackend {
    pub fn new(runner: ConversationRunner) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> &ConversationRunner {
        &self.runner
    }

    /// Listener callbacks that pause the live conversation from another
    /// thread while the caller is blocked inside a run. Build these fresh per
    /// run: the runner swaps conversations on a confirmation-mode toggle, so
    /// a handle cached across runs goes stale.
    pub fn pause_callbacks(&self) -> PauseCallbacks {
        let conversation = self.runner.conversation();
        PauseCallbacks {
            on_pause: Box::new(move || {
                conversation.pause();
                Ok(())
            }),
            on_terminate: Box::new(|| Ok(())),
        }
    }
}

impl ExecutionBackend for DirectBackend {
    fn process_message(&mut self, message: Option<&str>) -> Result<bool> {
        self.runner.process_message(message)?;
        Ok(true)
    }

    fn pause(&mut self) -> Result<bool> {
        self.runner.conversation().pause();
        Ok(true)
    }

    fn resume(&mut self) -> Result<bool> {
        self.runner.process_message(None)?;
        Ok(true)
    }

    fn toggle_confirmation_mode(&mut self) -> Result<bool> {
        self.runner.toggle_confirmation_mode()?;
        Ok(true)
    }

    fn get_status(&mut self) -> Result<Option<StatusReport>> {
        Ok(Some(self.runner.status_report()))
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}
