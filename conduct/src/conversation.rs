//! Conversation boundary: the agent side as seen by the control plane.

use std::sync::Arc;

use anyhow::Result;

use crate::core::policy::ConfirmationPolicy;
use crate::core::types::{AgentStatus, PendingAction};

/// One live agent conversation.
///
/// Implementations own their synchronization. Every method takes `&self` so a
/// cooperative [`pause`](Conversation::pause) can be issued from another
/// thread while [`run`](Conversation::run) blocks.
pub trait Conversation: Send + Sync {
    fn id(&self) -> &str;

    fn status(&self) -> AgentStatus;

    /// True iff a security analyzer was attached at construction. Immutable
    /// for the lifetime of the instance; toggling reconstructs.
    fn confirmation_mode(&self) -> bool;

    /// Drive the agent until it finishes, errors, pauses, parks actions for
    /// confirmation, or exhausts its per-run iteration budget.
    fn run(&self) -> Result<()>;

    /// Request a pause. Observed at the next step boundary; in-flight steps
    /// complete.
    fn pause(&self);

    /// Enqueue a user message for the next run.
    fn send_message(&self, message: &str) -> Result<()>;

    fn set_confirmation_policy(&self, policy: ConfirmationPolicy);

    /// Actions currently parked for operator approval.
    fn pending_actions(&self) -> Vec<PendingAction>;

    /// Resolve all pending actions as rejected, feeding `reason` back to the
    /// agent.
    fn reject_pending(&self, reason: &str) -> Result<()>;
}

/// Builds (or rebinds) conversations by id.
pub trait ConversationFactory: Send + Sync {
    /// Set up a conversation for `conversation_id`, attaching a security
    /// analyzer when requested. Rebinding an existing id must preserve its
    /// history while swapping the analyzer.
    fn setup_conversation(
        &self,
        conversation_id: &str,
        include_security_analyzer: bool,
    ) -> Result<Arc<dyn Conversation>>;
}
