//! Step-loop orchestration for a single conversation.
//!
//! [`ConversationRunner`] owns the conversation handle exclusively; its
//! `&mut self` receivers guarantee at most one live step loop per
//! conversation without extra locking.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::conversation::{Conversation, ConversationFactory};
use crate::core::policy::{ConfirmationPolicy, PolicyVerdict};
use crate::core::types::{AgentStatus, ConfirmationDecision, PendingAction, StatusReport};

/// Interactive decision source consulted when the policy requires a prompt.
pub trait ConfirmationPrompter: Send + Sync {
    /// Ask the operator to resolve `pending`. Errors (EOF, interrupt, closed
    /// terminal) are mapped to [`ConfirmationDecision::Defer`] by the runner,
    /// never to a rejection.
    fn ask(&self, pending: &[PendingAction]) -> Result<ConfirmationDecision>;
}

/// Prompter for contexts with no terminal, such as the worker child process.
/// Always defers, leaving actions pending for the operator.
pub struct NonInteractivePrompter;

impl ConfirmationPrompter for NonInteractivePrompter {
    fn ask(&self, pending: &[PendingAction]) -> Result<ConfirmationDecision> {
        debug!(count = pending.len(), "no terminal available; deferring pending actions");
        Ok(ConfirmationDecision::Defer)
    }
}

pub struct ConversationRunner {
    conversation: Arc<dyn Conversation>,
    factory: Arc<dyn ConversationFactory>,
    prompter: Arc<dyn ConfirmationPrompter>,
    policy: ConfirmationPolicy,
    confirmation_mode: bool,
}

impl ConversationRunner {
    /// Wrap an existing conversation. Confirmation mode follows the
    /// conversation's analyzer attachment and seeds the matching policy.
    pub fn new(
        conversation: Arc<dyn Conversation>,
        factory: Arc<dyn ConversationFactory>,
        prompter: Arc<dyn ConfirmationPrompter>,
    ) -> Self {
        let confirmation_mode = conversation.confirmation_mode();
        let policy = if confirmation_mode {
            ConfirmationPolicy::AlwaysConfirm
        } else {
            ConfirmationPolicy::NeverConfirm
        };
        conversation.set_confirmation_policy(policy);
        Self {
            conversation,
            factory,
            prompter,
            policy,
            confirmation_mode,
        }
    }

    /// Handle to the current conversation (replaced on toggle).
    pub fn conversation(&self) -> Arc<dyn Conversation> {
        Arc::clone(&self.conversation)
    }

    pub fn is_confirmation_mode_active(&self) -> bool {
        self.confirmation_mode
    }

    pub fn status(&self) -> AgentStatus {
        self.conversation.status()
    }

    pub fn status_report(&self) -> StatusReport {
        StatusReport {
            agent_status: self.conversation.status(),
            confirmation_mode: self.confirmation_mode,
        }
    }

    /// Enqueue `message` (if any) and drive the conversation until it reaches
    /// a resting point.
    ///
    /// Resting points: a terminal status, a deferred confirmation, a
    /// rejection (the agent then waits for a fresh user message), or a run
    /// that ended without parking new actions (finished, paused, or budget
    /// exhausted).
    #[instrument(skip_all, fields(conversation_id = self.conversation.id(), has_message = message.is_some()))]
    pub fn process_message(&mut self, message: Option<&str>) -> Result<()> {
        if let Some(text) = message {
            self.conversation
                .send_message(text)
                .context("enqueue user message")?;
        }
        loop {
            let status = self.conversation.status();
            if status.is_terminal() {
                debug!(%status, "conversation reached terminal status");
                return Ok(());
            }
            if status == AgentStatus::WaitingForConfirmation {
                let pending = self.conversation.pending_actions();
                match self.decide(&pending) {
                    ConfirmationDecision::Defer => {
                        debug!("confirmation deferred; actions stay pending");
                        return Ok(());
                    }
                    ConfirmationDecision::Reject { reason } => {
                        info!(%reason, "rejecting pending actions");
                        self.conversation
                            .reject_pending(&reason)
                            .context("reject pending actions")?;
                        // No step on rejection: the agent sees the feedback
                        // with the next user message.
                        return Ok(());
                    }
                    ConfirmationDecision::AlwaysAccept => {
                        if self.confirmation_mode {
                            self.toggle_confirmation_mode()
                                .context("disable confirmation mode")?;
                        }
                        self.conversation.run().context("run conversation")?;
                    }
                    ConfirmationDecision::Accept => {
                        self.conversation.run().context("run conversation")?;
                    }
                }
            } else {
                self.conversation.run().context("run conversation")?;
            }
            if self.conversation.status() != AgentStatus::WaitingForConfirmation {
                return Ok(());
            }
        }
    }

    fn decide(&self, pending: &[PendingAction]) -> ConfirmationDecision {
        match self.policy.evaluate(pending) {
            PolicyVerdict::AutoAccept => ConfirmationDecision::Accept,
            PolicyVerdict::Prompt => match self.prompter.ask(pending) {
                Ok(decision) => decision,
                Err(err) => {
                    warn!(error = %err, "confirmation prompt failed; deferring");
                    ConfirmationDecision::Defer
                }
            },
        }
    }

    /// Flip confirmation mode by rebinding the conversation id with the
    /// opposite analyzer attachment.
    ///
    /// The analyzer is immutable post-construction, so toggling always goes
    /// through the factory. A failed reconstruction leaves the runner
    /// unchanged and propagates the error.
    #[instrument(skip_all, fields(conversation_id = self.conversation.id()))]
    pub fn toggle_confirmation_mode(&mut self) -> Result<bool> {
        let enable = !self.confirmation_mode;
        let id = self.conversation.id().to_string();
        let replacement = self
            .factory
            .setup_conversation(&id, enable)
            .with_context(|| format!("rebuild conversation {id} with analyzer={enable}"))?;
        self.conversation = replacement;
        self.confirmation_mode = enable;
        let policy = if enable {
            ConfirmationPolicy::AlwaysConfirm
        } else {
            ConfirmationPolicy::NeverConfirm
        };
        self.set_confirmation_policy(policy);
        info!(enabled = enable, "confirmation mode toggled");
        Ok(enable)
    }

    /// Replace the active policy without reconstructing the conversation.
    pub fn set_confirmation_policy(&mut self, policy: ConfirmationPolicy) {
        self.policy = policy;
        self.conversation.set_confirmation_policy(policy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::SecurityRisk;
    use crate::test_support::{
        ScriptedConversation, ScriptedDecision, ScriptedFactory, ScriptedPrompter, ScriptedRun,
        command,
    };

    fn runner_with(
        conversation: Arc<ScriptedConversation>,
        factory: Arc<ScriptedFactory>,
        prompter: Arc<ScriptedPrompter>,
    ) -> ConversationRunner {
        ConversationRunner::new(conversation, factory, prompter)
    }

    /// A run that finishes without parking actions needs no confirmation
    /// round and no prompt.
    #[test]
    fn plain_message_runs_once_to_finished() {
        let conversation = ScriptedConversation::scripted(
            "conv-a",
            AgentStatus::Running,
            vec![ScriptedRun::finishes()],
        );
        let prompter = ScriptedPrompter::new(vec![]);
        let mut runner = runner_with(
            Arc::clone(&conversation),
            ScriptedFactory::new(),
            Arc::clone(&prompter),
        );

        runner.process_message(Some("hello")).expect("process");

        assert_eq!(conversation.messages(), vec!["hello".to_string()]);
        assert_eq!(conversation.run_calls(), 1);
        assert_eq!(runner.status(), AgentStatus::Finished);
        assert_eq!(prompter.asks(), 0);
        conversation.assert_drained();
    }

    /// ACCEPT executes exactly one run and re-enters the loop; the follow-up
    /// run here finishes the conversation.
    #[test]
    fn accept_runs_pending_then_continues() {
        let conversation = ScriptedConversation::confirming(
            "conv-b",
            AgentStatus::WaitingForConfirmation,
            vec![command("touch a", Some(SecurityRisk::Low))],
            vec![ScriptedRun::finishes()],
        );
        let prompter = ScriptedPrompter::new(vec![ScriptedDecision::Decide(
            ConfirmationDecision::Accept,
        )]);
        let mut runner = runner_with(
            Arc::clone(&conversation),
            ScriptedFactory::new(),
            Arc::clone(&prompter),
        );

        runner.process_message(None).expect("process");

        assert_eq!(conversation.run_calls(), 1);
        assert_eq!(runner.status(), AgentStatus::Finished);
        assert_eq!(prompter.asks(), 1);
        conversation.assert_drained();
    }

    /// REJECT resolves the pending actions with the reason, takes no step,
    /// and returns; the conversation waits for a fresh user message.
    #[test]
    fn reject_resolves_pending_without_running() {
        let conversation = ScriptedConversation::confirming(
            "conv-c",
            AgentStatus::WaitingForConfirmation,
            vec![command("rm -rf /", Some(SecurityRisk::High))],
            vec![],
        );
        let prompter = ScriptedPrompter::new(vec![ScriptedDecision::Decide(
            ConfirmationDecision::Reject {
                reason: "too destructive".to_string(),
            },
        )]);
        let mut runner = runner_with(
            Arc::clone(&conversation),
            ScriptedFactory::new(),
            Arc::clone(&prompter),
        );

        runner.process_message(None).expect("process");

        assert_eq!(conversation.run_calls(), 0);
        assert_eq!(conversation.rejections(), vec!["too destructive".to_string()]);
        assert!(conversation.pending_actions().is_empty());
    }

    /// DEFER leaves everything untouched: no run, actions still pending,
    /// status unchanged.
    #[test]
    fn defer_leaves_actions_pending() {
        let pending = vec![command("curl http://x", None)];
        let conversation = ScriptedConversation::confirming(
            "conv-d",
            AgentStatus::WaitingForConfirmation,
            pending.clone(),
            vec![],
        );
        let prompter = ScriptedPrompter::new(vec![ScriptedDecision::Decide(
            ConfirmationDecision::Defer,
        )]);
        let mut runner = runner_with(
            Arc::clone(&conversation),
            ScriptedFactory::new(),
            Arc::clone(&prompter),
        );

        runner.process_message(None).expect("process");

        assert_eq!(conversation.run_calls(), 0);
        assert_eq!(conversation.pending_actions(), pending);
        assert_eq!(runner.status(), AgentStatus::WaitingForConfirmation);
    }

    /// A failing prompt (EOF, closed terminal) degrades to DEFER, never to a
    /// rejection.
    #[test]
    fn prompt_failure_maps_to_defer() {
        let pending = vec![command("make deploy", Some(SecurityRisk::Medium))];
        let conversation = ScriptedConversation::confirming(
            "conv-e",
            AgentStatus::WaitingForConfirmation,
            pending.clone(),
            vec![],
        );
        let prompter = ScriptedPrompter::new(vec![ScriptedDecision::Fail]);
        let mut runner = runner_with(
            Arc::clone(&conversation),
            ScriptedFactory::new(),
            Arc::clone(&prompter),
        );

        runner.process_message(None).expect("process");

        assert_eq!(conversation.run_calls(), 0);
        assert!(conversation.rejections().is_empty());
        assert_eq!(conversation.pending_actions(), pending);
    }

    /// ALWAYS_ACCEPT is a full mode toggle: the conversation is rebuilt
    /// without the analyzer, then the pending work runs.
    #[test]
    fn always_accept_disables_mode_then_runs() {
        let replacement = ScriptedConversation::scripted(
            "conv-f",
            AgentStatus::Running,
            vec![ScriptedRun::finishes()],
        );
        let factory =
            ScriptedFactory::with_replacements(vec![replacement.clone() as Arc<dyn Conversation>]);
        let conversation = ScriptedConversation::confirming(
            "conv-f",
            AgentStatus::WaitingForConfirmation,
            vec![command("ls", Some(SecurityRisk::Low))],
            vec![],
        );
        let prompter = ScriptedPrompter::new(vec![ScriptedDecision::Decide(
            ConfirmationDecision::AlwaysAccept,
        )]);
        let mut runner = runner_with(Arc::clone(&conversation), Arc::clone(&factory), prompter);
        assert!(runner.is_confirmation_mode_active());

        runner.process_message(None).expect("process");

        assert!(!runner.is_confirmation_mode_active());
        assert_eq!(factory.calls(), vec![("conv-f".to_string(), false)]);
        // The old instance is dropped without running; the rebuilt one runs.
        assert_eq!(conversation.run_calls(), 0);
        assert_eq!(replacement.run_calls(), 1);
        assert_eq!(runner.status(), AgentStatus::Finished);
    }

    /// Toggling reconstructs via the factory with the same id and the
    /// opposite analyzer attachment, and swaps the runner's handle.
    #[test]
    fn toggle_rebuilds_conversation_with_same_id() {
        let conversation = ScriptedConversation::scripted("conv-g", AgentStatus::Running, vec![]);
        let factory = ScriptedFactory::new();
        let mut runner = runner_with(
            conversation,
            Arc::clone(&factory),
            ScriptedPrompter::new(vec![]),
        );
        assert!(!runner.is_confirmation_mode_active());

        let enabled = runner.toggle_confirmation_mode().expect("toggle on");
        assert!(enabled);
        assert!(runner.is_confirmation_mode_active());
        assert_eq!(runner.conversation().id(), "conv-g");
        assert!(runner.conversation().confirmation_mode());

        let enabled = runner.toggle_confirmation_mode().expect("toggle off");
        assert!(!enabled);
        assert_eq!(
            factory.calls(),
            vec![("conv-g".to_string(), true), ("conv-g".to_string(), false)]
        );
    }

    /// Factory failure during toggle propagates and leaves the runner on the
    /// old conversation with its old mode.
    #[test]
    fn toggle_failure_propagates_and_preserves_state() {
        let conversation = ScriptedConversation::scripted("conv-h", AgentStatus::Running, vec![]);
        let factory = ScriptedFactory::failing();
        let mut runner = runner_with(
            Arc::clone(&conversation),
            factory,
            ScriptedPrompter::new(vec![]),
        );

        let err = runner.toggle_confirmation_mode().expect_err("must fail");
        assert!(format!("{err:#}").contains("conv-h"));
        assert!(!runner.is_confirmation_mode_active());
        assert_eq!(runner.conversation().id(), "conv-h");
    }

    /// Under NeverConfirm the gate auto-accepts without consulting the
    /// prompter even though actions are parked.
    #[test]
    fn auto_accept_skips_prompter() {
        let conversation = ScriptedConversation::confirming(
            "conv-i",
            AgentStatus::WaitingForConfirmation,
            vec![command("ls", Some(SecurityRisk::High))],
            vec![ScriptedRun::finishes()],
        );
        let prompter = ScriptedPrompter::new(vec![]);
        let mut runner = runner_with(
            Arc::clone(&conversation),
            ScriptedFactory::new(),
            Arc::clone(&prompter),
        );
        runner.set_confirmation_policy(ConfirmationPolicy::NeverConfirm);

        runner.process_message(None).expect("process");

        assert_eq!(prompter.asks(), 0);
        assert_eq!(conversation.run_calls(), 1);
        assert_eq!(runner.status(), AgentStatus::Finished);
    }

    /// A run error from the conversation propagates out of process_message.
    #[test]
    fn run_error_propagates() {
        let conversation = ScriptedConversation::failing_runs("conv-j");
        let mut runner = runner_with(
            conversation,
            ScriptedFactory::new(),
            ScriptedPrompter::new(vec![]),
        );

        let err = runner.process_message(Some("go")).expect_err("must fail");
        assert!(format!("{err:#}").contains("run conversation"));
    }
}
