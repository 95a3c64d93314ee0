//! Confirmation policy: decides whether pending actions need operator
//! approval before they execute.

use serde::{Deserialize, Serialize};

use crate::core::types::{PendingAction, SecurityRisk};

/// Approval rule applied to a conversation's pending actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ConfirmationPolicy {
    /// Everything executes without asking.
    NeverConfirm,
    /// Every non-empty action set prompts.
    AlwaysConfirm,
    /// Prompt only when some action's risk is unknown or at/above `threshold`.
    ConfirmRisky { threshold: SecurityRisk },
}

/// Verdict of evaluating a policy against a set of pending actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyVerdict {
    AutoAccept,
    Prompt,
}

impl ConfirmationPolicy {
    /// Evaluate `pending` under this policy.
    ///
    /// An empty action set is always auto-accepted: there is nothing to
    /// confirm. Under `ConfirmRisky`, an action with no assigned risk counts
    /// as unknown and forces a prompt.
    pub fn evaluate(&self, pending: &[PendingAction]) -> PolicyVerdict {
        if pending.is_empty() {
            return PolicyVerdict::AutoAccept;
        }
        match self {
            ConfirmationPolicy::NeverConfirm => PolicyVerdict::AutoAccept,
            ConfirmationPolicy::AlwaysConfirm => PolicyVerdict::Prompt,
            ConfirmationPolicy::ConfirmRisky { threshold } => {
                let all_safely_below = pending
                    .iter()
                    .all(|action| matches!(action.risk(), Some(risk) if risk < *threshold));
                if all_safely_below {
                    PolicyVerdict::AutoAccept
                } else {
                    PolicyVerdict::Prompt
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(risk: Option<SecurityRisk>) -> PendingAction {
        PendingAction::Command {
            command: "echo hi".to_string(),
            risk,
        }
    }

    #[test]
    fn empty_action_set_is_auto_accepted_under_every_policy() {
        let policies = [
            ConfirmationPolicy::NeverConfirm,
            ConfirmationPolicy::AlwaysConfirm,
            ConfirmationPolicy::ConfirmRisky {
                threshold: SecurityRisk::Low,
            },
        ];
        for policy in policies {
            assert_eq!(policy.evaluate(&[]), PolicyVerdict::AutoAccept, "{policy:?}");
        }
    }

    #[test]
    fn never_confirm_auto_accepts_high_risk() {
        let policy = ConfirmationPolicy::NeverConfirm;
        let pending = [command(Some(SecurityRisk::High))];
        assert_eq!(policy.evaluate(&pending), PolicyVerdict::AutoAccept);
    }

    #[test]
    fn always_confirm_prompts_for_any_action() {
        let policy = ConfirmationPolicy::AlwaysConfirm;
        let pending = [command(Some(SecurityRisk::Low))];
        assert_eq!(policy.evaluate(&pending), PolicyVerdict::Prompt);
    }

    #[test]
    fn confirm_risky_accepts_only_when_all_risks_known_and_below_threshold() {
        let policy = ConfirmationPolicy::ConfirmRisky {
            threshold: SecurityRisk::High,
        };

        let safe = [command(Some(SecurityRisk::Low)), command(Some(SecurityRisk::Medium))];
        assert_eq!(policy.evaluate(&safe), PolicyVerdict::AutoAccept);

        let at_threshold = [command(Some(SecurityRisk::High))];
        assert_eq!(policy.evaluate(&at_threshold), PolicyVerdict::Prompt);

        let one_risky = [command(Some(SecurityRisk::Low)), command(Some(SecurityRisk::High))];
        assert_eq!(policy.evaluate(&one_risky), PolicyVerdict::Prompt);
    }

    #[test]
    fn confirm_risky_prompts_when_risk_missing_or_unknown() {
        let policy = ConfirmationPolicy::ConfirmRisky {
            threshold: SecurityRisk::High,
        };
        assert_eq!(policy.evaluate(&[command(None)]), PolicyVerdict::Prompt);
        assert_eq!(
            policy.evaluate(&[command(Some(SecurityRisk::Unknown))]),
            PolicyVerdict::Prompt
        );
    }
}
