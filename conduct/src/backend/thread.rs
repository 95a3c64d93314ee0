//! Thread-hosted strategy.
//!
//! A worker thread cannot be forcibly interrupted: Rust has no asynchronous
//! thread-cancellation mechanism, and injecting one would be unsound.
//! Termination here is cooperative and best-effort; reach for
//! [`super::process::ProcessBackend`] when a kill must actually work.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::backend::ExecutionBackend;
use crate::conversation::Conversation;
use crate::core::types::StatusReport;
use crate::runner::ConversationRunner;

pub struct ThreadBackend {
    runner: Arc<Mutex<ConversationRunner>>,
    /// Pause handle onto the conversation the current run is driving.
    conversation: Arc<dyn Conversation>,
    worker: Option<JoinHandle<()>>,
    done: Option<Receiver<Result<()>>>,
}

impl ThreadBackend {
    pub fn new(runner: ConversationRunner) -> Self {
        let conversation = runner.conversation();
        Self {
            runner: Arc::new(Mutex::new(runner)),
            conversation,
            worker: None,
            done: None,
        }
    }

    /// Start a step loop on a worker thread. No-op while a run is in flight.
    #[instrument(skip_all, fields(has_message = message.is_some()))]
    pub fn run_agent(&mut self, message: Option<&str>) -> Result<()> {
        if self.is_running() {
            debug!("run already in flight; ignoring");
            return Ok(());
        }
        self.reap_finished_worker();
        self.refresh_conversation_handle()?;

        let message = message.map(str::to_string);
        let runner = Arc::clone(&self.runner);
        let (tx, rx) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("conversation-runner".to_string())
            .spawn(move || {
                let result = match runner.lock() {
                    Ok(mut guard) => guard.process_message(message.as_deref()),
                    Err(_) => Err(anyhow!("runner mutex poisoned")),
                };
                // Receiver may be gone after terminate_immediately.
                let _ = tx.send(result);
            })
            .context("spawn runner thread")?;
        self.worker = Some(worker);
        self.done = Some(rx);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Block until the current run completes or `timeout` elapses.
    ///
    /// A timeout is not an error; callers re-check [`is_running`]. Returns
    /// `true` once the run has completed. A run error is delivered exactly
    /// once, to the first caller that observes completion.
    ///
    /// [`is_running`]: ThreadBackend::is_running
    pub fn wait_for_completion(&mut self, timeout: Option<Duration>) -> Result<bool> {
        let Some(done) = &self.done else {
            return Ok(true);
        };
        let received = match timeout {
            Some(timeout) => match done.recv_timeout(timeout) {
                Ok(result) => Some(result),
                Err(RecvTimeoutError::Timeout) => return Ok(false),
                Err(RecvTimeoutError::Disconnected) => None,
            },
            None => done.recv().ok(),
        };
        self.done = None;
        if let Some(handle) = self.worker.take()
            && handle.join().is_err()
        {
            return Err(anyhow!("runner thread panicked"));
        }
        match received {
            Some(result) => result.map(|()| true),
            None => Err(anyhow!("runner thread exited without reporting a result")),
        }
    }

    /// Best-effort cancellation: request a cooperative pause and detach the
    /// worker. An in-flight step cannot be interrupted and the detached
    /// thread may run until its next step boundary.
    #[instrument(skip_all)]
    pub fn terminate_immediately(&mut self) {
        warn!("terminate is best-effort on the thread backend: pausing and detaching the run");
        self.conversation.pause();
        self.worker = None;
        self.done = None;
    }

    fn reap_finished_worker(&mut self) {
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("previous runner thread panicked");
            }
            if let Some(done) = self.done.take()
                && let Ok(Err(err)) = done.try_recv()
            {
                warn!(error = %format!("{err:#}"), "dropping unobserved run error");
            }
        }
    }

    /// The runner swaps conversations on toggle; keep the pause handle
    /// pointing at the live one.
    fn refresh_conversation_handle(&mut self) -> Result<()> {
        let guard = self
            .runner
            .lock()
            .map_err(|_| anyhow!("runner mutex poisoned"))?;
        self.conversation = guard.conversation();
        Ok(())
    }
}

impl ExecutionBackend for ThreadBackend {
    /// Runs synchronously from the caller's view: starts the worker thread
    /// and waits for it, so errors surface here rather than on a later wait.
    fn process_message(&mut self, message: Option<&str>) -> Result<bool> {
        self.run_agent(message)?;
        self.wait_for_completion(None)
    }

    fn pause(&mut self) -> Result<bool> {
        self.conversation.pause();
        Ok(true)
    }

    fn resume(&mut self) -> Result<bool> {
        self.run_agent(None)?;
        self.wait_for_completion(None)
    }

    fn toggle_confirmation_mode(&mut self) -> Result<bool> {
        if self.is_running() {
            return Err(anyhow!("cannot toggle confirmation mode while a run is in flight"));
        }
        {
            let mut guard = self
                .runner
                .lock()
                .map_err(|_| anyhow!("runner mutex poisoned"))?;
            guard.toggle_confirmation_mode()?;
        }
        self.refresh_conversation_handle()?;
        Ok(true)
    }

    /// Reads through the conversation handle, so it answers even while a run
    /// holds the runner lock.
    fn get_status(&mut self) -> Result<Option<StatusReport>> {
        Ok(Some(StatusReport {
            agent_status: self.conversation.status(),
            confirmation_mode: self.conversation.confirmation_mode(),
        }))
    }

    fn stop(&mut self) -> Result<()> {
        self.terminate_immediately();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use crate::conversation::ConversationFactory;
    use crate::core::types::AgentStatus;
    use crate::runner::NonInteractivePrompter;
    use crate::sim::{SimConfig, SimulatedFactory};
    use crate::test_support::{ScriptedConversation, ScriptedFactory};

    fn sim_backend(config: SimConfig) -> (ThreadBackend, Arc<dyn Conversation>) {
        let factory = Arc::new(SimulatedFactory::new(config));
        let conversation = factory
            .setup_conversation("thread-test", false)
            .expect("setup");
        let runner = ConversationRunner::new(
            Arc::clone(&conversation),
            factory,
            Arc::new(NonInteractivePrompter),
        );
        (ThreadBackend::new(runner), conversation)
    }

    #[test]
    fn run_completes_and_reports_status() {
        let (mut backend, _) = sim_backend(SimConfig {
            finish_on_step: Some(2),
            ..SimConfig::default()
        });

        assert!(backend.process_message(Some("go")).expect("process"));
        let report = backend.get_status().expect("status").expect("known");
        assert_eq!(report.agent_status, AgentStatus::Finished);
    }

    #[test]
    fn run_agent_is_noop_while_running() {
        let (mut backend, conversation) = sim_backend(SimConfig {
            finish_on_step: None,
            max_iterations_per_run: u32::MAX,
            step_delay: Duration::from_millis(1),
            ..SimConfig::default()
        });

        backend.run_agent(Some("spin")).expect("start");
        // Second start while the first is in flight is ignored.
        backend.run_agent(Some("ignored")).expect("noop");
        assert!(backend.is_running());

        // Timeout on an endless run is not an error.
        let completed = backend
            .wait_for_completion(Some(Duration::from_millis(50)))
            .expect("wait");
        assert!(!completed);

        conversation.pause();
        assert!(backend.wait_for_completion(None).expect("wait"));
        assert_eq!(conversation.status(), AgentStatus::Paused);
    }

    /// A run error is re-delivered exactly once, on the wait that observes
    /// completion.
    #[test]
    fn run_error_delivered_once_on_wait() {
        let conversation = ScriptedConversation::failing_runs("thread-err");
        let runner = ConversationRunner::new(
            conversation,
            ScriptedFactory::new(),
            Arc::new(NonInteractivePrompter),
        );
        let mut backend = ThreadBackend::new(runner);

        backend.run_agent(Some("boom")).expect("start");
        let err = loop {
            match backend.wait_for_completion(Some(Duration::from_millis(100))) {
                Ok(false) => continue,
                Ok(true) => panic!("run should have failed"),
                Err(err) => break err,
            }
        };
        assert!(format!("{err:#}").contains("scripted run failure"));

        // The error was consumed; a later wait sees a quiet backend.
        assert!(backend.wait_for_completion(None).expect("idle"));
    }

    #[test]
    fn terminate_immediately_detaches_and_pauses() {
        let (mut backend, conversation) = sim_backend(SimConfig {
            finish_on_step: None,
            max_iterations_per_run: u32::MAX,
            step_delay: Duration::from_millis(1),
            ..SimConfig::default()
        });

        backend.run_agent(None).expect("start");
        backend.terminate_immediately();
        assert!(!backend.is_running());

        // The detached run observes the pause at its next step boundary.
        let deadline = Instant::now() + Duration::from_secs(2);
        while conversation.status() != AgentStatus::Paused && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(conversation.status(), AgentStatus::Paused);
    }

    #[test]
    fn toggle_rejected_while_running() {
        let (mut backend, conversation) = sim_backend(SimConfig {
            finish_on_step: None,
            max_iterations_per_run: u32::MAX,
            step_delay: Duration::from_millis(1),
            ..SimConfig::default()
        });

        backend.run_agent(None).expect("start");
        assert!(backend.toggle_confirmation_mode().is_err());

        conversation.pause();
        backend.wait_for_completion(None).expect("wait");
        assert!(backend.toggle_confirmation_mode().expect("toggle"));
    }
}
