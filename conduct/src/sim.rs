//! Deterministic in-memory conversation used by the shipped binary and the
//! end-to-end tests.
//!
//! The simulated agent proposes one shell-style action per step. With a
//! security analyzer attached, proposed actions carry risk levels; the
//! conversation's confirmation policy then decides whether a step executes
//! immediately or parks for approval. Pause requests are observed between
//! steps only.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing::debug;

use crate::conversation::{Conversation, ConversationFactory};
use crate::core::policy::{ConfirmationPolicy, PolicyVerdict};
use crate::core::types::{AgentStatus, PendingAction, SecurityRisk};

/// Tunables for the simulated agent.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Finish after this many executed steps. `None` runs until paused.
    pub finish_on_step: Option<u32>,
    /// Step budget for a single `run()` call; the conversation stays
    /// runnable when it is exhausted.
    pub max_iterations_per_run: u32,
    /// Start in `Paused` instead of `Running`.
    pub start_paused: bool,
    /// Start with one proposed action already parked for confirmation.
    pub start_waiting: bool,
    /// Steps whose proposed action is high risk (1-indexed).
    pub risky_steps: Vec<u32>,
    /// Simulated work per step. Keeps endless runs from spinning hot.
    pub step_delay: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            finish_on_step: Some(4),
            max_iterations_per_run: 8,
            start_paused: false,
            start_waiting: false,
            risky_steps: vec![],
            step_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug)]
struct SimState {
    status: AgentStatus,
    steps_executed: u32,
    history: Vec<String>,
    pending: Vec<PendingAction>,
    policy: ConfirmationPolicy,
    pause_requested: bool,
}

/// Conversation instance bound to shared per-id state.
///
/// The analyzer attachment lives on the instance, not the state, so
/// reconstruction on a confirmation-mode toggle swaps the analyzer while
/// history and step counts survive.
pub struct SimulatedConversation {
    id: String,
    config: SimConfig,
    analyzer_attached: bool,
    state: Arc<Mutex<SimState>>,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimulatedConversation {
    pub fn steps_executed(&self) -> u32 {
        lock(&self.state).steps_executed
    }

    pub fn history(&self) -> Vec<String> {
        lock(&self.state).history.clone()
    }

    fn propose(&self, step: u32) -> PendingAction {
        let risk = if self.analyzer_attached {
            if self.config.risky_steps.contains(&step) {
                Some(SecurityRisk::High)
            } else {
                Some(SecurityRisk::Low)
            }
        } else {
            None
        };
        PendingAction::Command {
            command: format!("echo step {step}"),
            risk,
        }
    }

    fn execute(state: &mut SimState, action: &PendingAction) {
        state.steps_executed += 1;
        let step = state.steps_executed;
        state.history.push(format!("step {step}: {}", action.summary()));
    }
}

impl Conversation for SimulatedConversation {
    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> AgentStatus {
        lock(&self.state).status
    }

    fn confirmation_mode(&self) -> bool {
        self.analyzer_attached
    }

    fn run(&self) -> Result<()> {
        let mut iterations = {
            let mut state = lock(&self.state);
            if state.status.is_terminal() {
                return Ok(());
            }
            state.status = AgentStatus::Running;

            // Approved actions execute first: acceptance is expressed by the
            // caller invoking run() again while actions are parked.
            let approved: Vec<PendingAction> = state.pending.drain(..).collect();
            for action in &approved {
                Self::execute(&mut state, action);
            }
            approved.len() as u32
        };
        loop {
            // The lock is released between steps so a pause request from
            // another thread can land at a step boundary.
            {
                let mut state = lock(&self.state);
                if state.pause_requested {
                    state.pause_requested = false;
                    state.status = AgentStatus::Paused;
                    debug!(id = %self.id, steps = state.steps_executed, "pause observed at step boundary");
                    return Ok(());
                }
                if let Some(limit) = self.config.finish_on_step
                    && state.steps_executed >= limit
                {
                    state.status = AgentStatus::Finished;
                    debug!(id = %self.id, steps = state.steps_executed, "conversation finished");
                    return Ok(());
                }
                if iterations >= self.config.max_iterations_per_run {
                    // Budget exhausted; stay runnable.
                    return Ok(());
                }
                let action = self.propose(state.steps_executed + 1);
                match state.policy.evaluate(std::slice::from_ref(&action)) {
                    PolicyVerdict::Prompt => {
                        state.pending = vec![action];
                        state.status = AgentStatus::WaitingForConfirmation;
                        return Ok(());
                    }
                    PolicyVerdict::AutoAccept => {
                        Self::execute(&mut state, &action);
                        iterations += 1;
                    }
                }
            }
            if !self.config.step_delay.is_zero() {
                thread::sleep(self.config.step_delay);
            }
        }
    }

    fn pause(&self) {
        lock(&self.state).pause_requested = true;
    }

    fn send_message(&self, message: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.history.push(format!("user: {message}"));
        // A fresh message makes a paused conversation runnable again.
        if state.status == AgentStatus::Paused {
            state.status = AgentStatus::Running;
        }
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
        state.pending.clear();
        state.history.push(format!("rejected: {reason}"));
        state.status = AgentStatus::Running;
        Ok(())
    }
}

/// Factory keeping per-id shared state, so rebinding an id on a
/// confirmation-mode toggle preserves history and step counts.
pub struct SimulatedFactory {
    config: SimConfig,
    states: Mutex<HashMap<String, Arc<Mutex<SimState>>>>,
}

impl SimulatedFactory {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    fn initial_state(&self, include_security_analyzer: bool) -> SimState {
        let status = if self.config.start_paused {
            AgentStatus::Paused
        } else if self.config.start_waiting {
            AgentStatus::WaitingForConfirmation
        } else {
            AgentStatus::Running
        };
        let pending = if self.config.start_waiting {
            let risk = include_security_analyzer.then_some(SecurityRisk::Low);
            vec![PendingAction::Command {
                command: "echo step 1".to_string(),
                risk,
            }]
        } else {
            vec![]
        };
        SimState {
            status,
            steps_executed: 0,
            history: vec![],
            pending,
            policy: ConfirmationPolicy::NeverConfirm,
            pause_requested: false,
        }
    }
}

impl ConversationFactory for SimulatedFactory {
    fn setup_conversation(
        &self,
        conversation_id: &str,
        include_security_analyzer: bool,
    ) -> Result<Arc<dyn Conversation>> {
        let state = {
            let mut states = self
                .states
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            Arc::clone(
                states
                    .entry(conversation_id.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(self.initial_state(include_security_analyzer)))),
            )
        };
        Ok(Arc::new(SimulatedConversation {
            id: conversation_id.to_string(),
            config: self.config.clone(),
            analyzer_attached: include_security_analyzer,
            state,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::runner::{ConversationRunner, NonInteractivePrompter};
    use crate::test_support::{ScriptedDecision, ScriptedPrompter};
    use crate::core::types::ConfirmationDecision;

    fn setup(config: SimConfig, analyzer: bool) -> (Arc<SimulatedFactory>, Arc<dyn Conversation>) {
        let factory = Arc::new(SimulatedFactory::new(config));
        let conversation = factory
            .setup_conversation("sim-test", analyzer)
            .expect("setup");
        (factory, conversation)
    }

    #[test]
    fn runs_to_finish_without_analyzer() {
        let (_, conversation) = setup(
            SimConfig {
                finish_on_step: Some(3),
                ..SimConfig::default()
            },
            false,
        );
        conversation.run().expect("run");
        assert_eq!(conversation.status(), AgentStatus::Finished);
    }

    /// A pause requested before the run is observed at the first step
    /// boundary; exactly the in-flight work completes.
    #[test]
    fn pause_request_stops_at_next_boundary() {
        let (factory, conversation) = setup(
            SimConfig {
                finish_on_step: None,
                max_iterations_per_run: 100,
                ..SimConfig::default()
            },
            false,
        );
        conversation.pause();
        conversation.run().expect("run");
        assert_eq!(conversation.status(), AgentStatus::Paused);

        // The session stays resumable: a fresh message runs again.
        drop(factory);
        conversation.send_message("keep going").expect("send");
        assert_eq!(conversation.status(), AgentStatus::Running);
    }

    #[test]
    fn budget_exhaustion_leaves_conversation_runnable() {
        let (_, conversation) = setup(
            SimConfig {
                finish_on_step: Some(10),
                max_iterations_per_run: 2,
                ..SimConfig::default()
            },
            false,
        );
        conversation.run().expect("run");
        assert_eq!(conversation.status(), AgentStatus::Running);
        conversation.run().expect("run");
        conversation.run().expect("run");
        conversation.run().expect("run");
        conversation.run().expect("run");
        assert_eq!(conversation.status(), AgentStatus::Finished);
    }

    #[test]
    fn always_confirm_parks_first_action_with_low_risk() {
        let (_, conversation) = setup(SimConfig::default(), true);
        conversation.set_confirmation_policy(ConfirmationPolicy::AlwaysConfirm);
        conversation.run().expect("run");
        assert_eq!(conversation.status(), AgentStatus::WaitingForConfirmation);
        let pending = conversation.pending_actions();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].risk(), Some(SecurityRisk::Low));
    }

    #[test]
    fn confirm_risky_only_parks_listed_steps() {
        let (_, conversation) = setup(
            SimConfig {
                finish_on_step: Some(3),
                risky_steps: vec![2],
                ..SimConfig::default()
            },
            true,
        );
        conversation.set_confirmation_policy(ConfirmationPolicy::ConfirmRisky {
            threshold: SecurityRisk::High,
        });
        conversation.run().expect("run");
        // Step 1 auto-ran; step 2 is parked as high risk.
        assert_eq!(conversation.status(), AgentStatus::WaitingForConfirmation);
        assert_eq!(conversation.pending_actions()[0].risk(), Some(SecurityRisk::High));

        // Approval executes the parked step and continues to the finish.
        conversation.run().expect("run");
        assert_eq!(conversation.status(), AgentStatus::Finished);
    }

    #[test]
    fn without_analyzer_actions_carry_no_risk() {
        let (_, conversation) = setup(SimConfig::default(), false);
        conversation.set_confirmation_policy(ConfirmationPolicy::AlwaysConfirm);
        conversation.run().expect("run");
        assert_eq!(conversation.pending_actions()[0].risk(), None);
    }

    /// Toggling confirmation mode rebinds the same id to a new instance with
    /// the opposite analyzer attachment while history survives.
    #[test]
    fn toggle_preserves_history_across_reconstruction() {
        let factory = Arc::new(SimulatedFactory::new(SimConfig {
            finish_on_step: Some(6),
            max_iterations_per_run: 2,
            ..SimConfig::default()
        }));
        let conversation = factory.setup_conversation("sim-t", false).expect("setup");
        let mut runner = ConversationRunner::new(
            conversation,
            Arc::clone(&factory) as Arc<dyn ConversationFactory>,
            Arc::new(NonInteractivePrompter),
        );

        runner.process_message(Some("start")).expect("process");
        assert_eq!(runner.status(), AgentStatus::Running);

        runner.toggle_confirmation_mode().expect("toggle");
        let toggled = runner.conversation();
        assert_eq!(toggled.id(), "sim-t");
        assert!(toggled.confirmation_mode());
        // The rebuilt handle still sees the shared per-id state.
        assert_eq!(toggled.status(), AgentStatus::Running);
        assert!(toggled.pending_actions().is_empty());
    }

    /// A conversation born paused resumes on a message-less run; a
    /// single-step budget then executes exactly one step per run.
    #[test]
    fn starts_paused_and_runs_one_step_per_budget() {
        let factory = Arc::new(SimulatedFactory::new(SimConfig {
            start_paused: true,
            finish_on_step: Some(2),
            max_iterations_per_run: 1,
            ..SimConfig::default()
        }));
        let conversation = factory.setup_conversation("sim-p", false).expect("setup");
        assert_eq!(conversation.status(), AgentStatus::Paused);

        let mut runner = ConversationRunner::new(
            Arc::clone(&conversation),
            Arc::clone(&factory) as Arc<dyn ConversationFactory>,
            Arc::new(NonInteractivePrompter),
        );
        runner.process_message(None).expect("resume");
        // One step ran; the budget yielded with the conversation runnable.
        assert_eq!(conversation.status(), AgentStatus::Running);

        runner.process_message(None).expect("second run");
        assert_eq!(conversation.status(), AgentStatus::Finished);
    }

    /// A conversation born waiting already has its first action parked;
    /// accepting it executes exactly that step.
    #[test]
    fn start_waiting_executes_parked_action_on_accept() {
        let factory = Arc::new(SimulatedFactory::new(SimConfig {
            start_waiting: true,
            finish_on_step: Some(1),
            ..SimConfig::default()
        }));
        let conversation = factory.setup_conversation("sim-w", true).expect("setup");
        assert_eq!(conversation.status(), AgentStatus::WaitingForConfirmation);

        let prompter = ScriptedPrompter::new(vec![ScriptedDecision::Decide(
            ConfirmationDecision::Accept,
        )]);
        let mut runner = ConversationRunner::new(
            conversation,
            Arc::clone(&factory) as Arc<dyn ConversationFactory>,
            Arc::clone(&prompter) as Arc<dyn crate::runner::ConfirmationPrompter>,
        );
        runner.process_message(None).expect("process");

        assert_eq!(runner.status(), AgentStatus::Finished);
        assert_eq!(prompter.asks(), 1);
    }

    /// End-to-end: runner + sim with an interactive script. Accept executes
    /// the parked step, then the next proposal parks again.
    #[test]
    fn accept_executes_parked_step_then_parks_next() {
        let factory = Arc::new(SimulatedFactory::new(SimConfig {
            finish_on_step: Some(2),
            ..SimConfig::default()
        }));
        let conversation = factory.setup_conversation("sim-a", true).expect("setup");
        let prompter = ScriptedPrompter::new(vec![
            ScriptedDecision::Decide(ConfirmationDecision::Accept),
            ScriptedDecision::Decide(ConfirmationDecision::Accept),
        ]);
        let mut runner = ConversationRunner::new(
            conversation,
            Arc::clone(&factory) as Arc<dyn ConversationFactory>,
            Arc::clone(&prompter) as Arc<dyn crate::runner::ConfirmationPrompter>,
        );

        runner.process_message(Some("do the work")).expect("process");

        assert_eq!(runner.status(), AgentStatus::Finished);
        assert_eq!(prompter.asks(), 2);
    }
}
