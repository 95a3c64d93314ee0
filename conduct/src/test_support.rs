//! Scripted doubles for exercising the control plane without a real agent.
//!
//! Doubles follow a queued-script pattern: each expected interaction is
//! scripted up front and consumed in order, and `assert_drained` verifies the
//! code under test made exactly the scripted calls.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};

use crate::conversation::{Conversation, ConversationFactory};
use crate::core::policy::ConfirmationPolicy;
use crate::core::types::{AgentStatus, ConfirmationDecision, PendingAction, SecurityRisk};
use crate::io::keys::{ControlKey, KeySource};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shorthand for a scripted shell action.
pub fn command(command: &str, risk: Option<SecurityRisk>) -> PendingAction {
    PendingAction::Command {
        command: command.to_string(),
        risk,
    }
}

/// One scripted `run()` outcome: the status and pending set the conversation
/// exposes after the call.
#[derive(Debug, Clone)]
pub struct ScriptedRun {
    pub status_after: AgentStatus,
    pub pending_after: Vec<PendingAction>,
}

impl ScriptedRun {
    pub fn finishes() -> Self {
        Self {
            status_after: AgentStatus::Finished,
            pending_after: vec![],
        }
    }

    pub fn pauses() -> Self {
        Self {
            status_after: AgentStatus::Paused,
            pending_after: vec![],
        }
    }

    pub fn parks(pending: Vec<PendingAction>) -> Self {
        Self {
            status_after: AgentStatus::WaitingForConfirmation,
            pending_after: pending,
        }
    }
}

struct ScriptedState {
    status: AgentStatus,
    pending: Vec<PendingAction>,
    script: VecDeque<ScriptedRun>,
    messages: Vec<String>,
    rejections: Vec<String>,
    policy: ConfirmationPolicy,
    pause_requests: usize,
}

/// Conversation double driven by a queued script of run outcomes.
pub struct ScriptedConversation {
    id: String,
    confirmation_mode: bool,
    fail_runs: bool,
    run_calls: AtomicUsize,
    state: Mutex<ScriptedState>,
}

impl ScriptedConversation {
    /// Double without an analyzer attached.
    pub fn scripted(id: &str, initial_status: AgentStatus, script: Vec<ScriptedRun>) -> Arc<Self> {
        Self::build(id, initial_status, vec![], false, script, false)
    }

    /// Double with the analyzer attached and actions already parked.
    pub fn confirming(
        id: &str,
        initial_status: AgentStatus,
        initial_pending: Vec<PendingAction>,
        script: Vec<ScriptedRun>,
    ) -> Arc<Self> {
        Self::build(id, initial_status, initial_pending, true, script, false)
    }

    /// Double whose every `run()` fails.
    pub fn failing_runs(id: &str) -> Arc<Self> {
        Self::build(id, AgentStatus::Running, vec![], false, vec![], true)
    }

    fn build(
        id: &str,
        initial_status: AgentStatus,
        initial_pending: Vec<PendingAction>,
        confirmation_mode: bool,
        script: Vec<ScriptedRun>,
        fail_runs: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            confirmation_mode,
            fail_runs,
            run_calls: AtomicUsize::new(0),
            state: Mutex::new(ScriptedState {
                status: initial_status,
                pending: initial_pending,
                script: script.into(),
                messages: vec![],
                rejections: vec![],
                policy: ConfirmationPolicy::NeverConfirm,
                pause_requests: 0,
            }),
        })
    }

    pub fn run_calls(&self) -> usize {
        self.run_calls.load(Ordering::SeqCst)
    }

    pub fn messages(&self) -> Vec<String> {
        lock(&self.state).messages.clone()
    }

    pub fn rejections(&self) -> Vec<String> {
        lock(&self.state).rejections.clone()
    }

    pub fn pause_requests(&self) -> usize {
        lock(&self.state).pause_requests
    }

    pub fn policy(&self) -> ConfirmationPolicy {
        lock(&self.state).policy
    }

    /// Panics if scripted run outcomes were left unconsumed.
    pub fn assert_drained(&self) {
        let remaining = lock(&self.state).script.len();
        assert_eq!(remaining, 0, "{} scripted runs left for {}", remaining, self.id);
    }
}

impl Conversation for ScriptedConversation {
    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> AgentStatus {
        lock(&self.state).status
    }

    fn confirmation_mode(&self) -> bool {
        self.confirmation_mode
    }

    fn run(&self) -> Result<()> {
        self.run_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_runs {
            bail!("scripted run failure");
        }
        let mut state = lock(&self.state);
        let Some(outcome) = state.script.pop_front() else {
            bail!("run() called with no scripted outcome left for {}", self.id);
        };
        state.status = outcome.status_after;
        state.pending = outcome.pending_after;
        Ok(())
    }

    fn pause(&self) {
        let mut state = lock(&self.state);
        state.pause_requests += 1;
        state.status = AgentStatus::Paused;
    }

    fn send_message(&self, message: &str) -> Result<()> {
        lock(&self.state).messages.push(message.to_string());
        Ok(())
    }

    fn set_confirmation_policy(&self, policy: ConfirmationPolicy) {
        lock(&self.state).policy = policy;
    }

    fn pending_actions(&self) -> Vec<PendingAction> {
        lock(&self.state).pending.clone()
    }

    fn reject_pending(&self, reason: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.rejections.push(reason.to_string());
        state.pending.clear();
        state.status = AgentStatus::Running;
        Ok(())
    }
}

/// Factory double recording setup calls.
///
/// Hands out queued replacements when provided, otherwise fresh empty-script
/// doubles matching the requested id and analyzer attachment.
pub struct ScriptedFactory {
    calls: Mutex<Vec<(String, bool)>>,
    replacements: Mutex<VecDeque<Arc<dyn Conversation>>>,
    fail_all: bool,
}

impl ScriptedFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(vec![]),
            replacements: Mutex::new(VecDeque::new()),
            fail_all: false,
        })
    }

    pub fn with_replacements(replacements: Vec<Arc<dyn Conversation>>) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(vec![]),
            replacements: Mutex::new(replacements.into()),
            fail_all: false,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(vec![]),
            replacements: Mutex::new(VecDeque::new()),
            fail_all: true,
        })
    }

    pub fn calls(&self) -> Vec<(String, bool)> {
        lock(&self.calls).clone()
    }
}

impl ConversationFactory for ScriptedFactory {
    fn setup_conversation(
        &self,
        conversation_id: &str,
        include_security_analyzer: bool,
    ) -> Result<Arc<dyn Conversation>> {
        lock(&self.calls).push((conversation_id.to_string(), include_security_analyzer));
        if self.fail_all {
            bail!("scripted setup failure");
        }
        if let Some(replacement) = lock(&self.replacements).pop_front() {
            return Ok(replacement);
        }
        Ok(ScriptedConversation::build(
            conversation_id,
            AgentStatus::Running,
            vec![],
            include_security_analyzer,
            vec![],
            false,
        ))
    }
}

/// One scripted prompt outcome.
#[derive(Debug, Clone)]
pub enum ScriptedDecision {
    Decide(ConfirmationDecision),
    /// The prompt itself fails (EOF, closed terminal).
    Fail,
}

/// Prompter double returning queued decisions.
pub struct ScriptedPrompter {
    decisions: Mutex<VecDeque<ScriptedDecision>>,
    asks: AtomicUsize,
}

impl ScriptedPrompter {
    pub fn new(decisions: Vec<ScriptedDecision>) -> Arc<Self> {
        Arc::new(Self {
            decisions: Mutex::new(decisions.into()),
            asks: AtomicUsize::new(0),
        })
    }

    pub fn asks(&self) -> usize {
        self.asks.load(Ordering::SeqCst)
    }
}

impl crate::runner::ConfirmationPrompter for ScriptedPrompter {
    fn ask(&self, _pending: &[PendingAction]) -> Result<ConfirmationDecision> {
        self.asks.fetch_add(1, Ordering::SeqCst);
        match lock(&self.decisions).pop_front() {
            Some(ScriptedDecision::Decide(decision)) => Ok(decision),
            Some(ScriptedDecision::Fail) => Err(anyhow!("scripted prompt failure")),
            None => Err(anyhow!("prompter script exhausted")),
        }
    }
}

/// Key source double replaying `(delay, key)` pairs, then silence.
pub struct ScriptedKeys {
    events: VecDeque<(Duration, ControlKey)>,
}

impl ScriptedKeys {
    pub fn new(events: Vec<(Duration, ControlKey)>) -> Self {
        Self {
            events: events.into(),
        }
    }
}

impl KeySource for ScriptedKeys {
    fn next_key(&mut self, timeout: Duration) -> Result<Option<ControlKey>> {
        match self.events.pop_front() {
            Some((delay, key)) => {
                thread::sleep(delay);
                Ok(Some(key))
            }
            None => {
                thread::sleep(timeout);
                Ok(None)
            }
        }
    }
}
