//! Interactive confirmation prompt for pending agent actions.

use anyhow::{Context, Result};
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Input, Select};

use crate::core::types::{ConfirmationDecision, PendingAction};
use crate::runner::ConfirmationPrompter;

/// Terminal prompt backed by `dialoguer`.
///
/// EOF and interrupts surface as errors, which the runner maps to a deferral
/// so pending actions are never silently rejected.
pub struct TerminalPrompter;

impl ConfirmationPrompter for TerminalPrompter {
    fn ask(&self, pending: &[PendingAction]) -> Result<ConfirmationDecision> {
        println!("The agent wants to run {} action(s):", pending.len());
        for action in pending {
            match action.risk() {
                Some(risk) => println!("  [{risk}] {}: {}", action.tool_name(), action.summary()),
                None => println!("  {}: {}", action.tool_name(), action.summary()),
            }
        }
        let choice = Select::with_theme(&ColorfulTheme::default())
            .with_prompt("Proceed?")
            .items(&[
                "Yes, proceed",
                "No, reject",
                "Always proceed from now on",
                "Decide later",
            ])
            .default(0)
            .interact()
            .context("confirmation prompt")?;
        Ok(match choice {
            0 => ConfirmationDecision::Accept,
            1 => {
                let reason: String = Input::with_theme(&ColorfulTheme::default())
                    .with_prompt("Reason")
                    .allow_empty(true)
                    .interact_text()
                    .context("rejection reason prompt")?;
                ConfirmationDecision::Reject { reason }
            }
            2 => ConfirmationDecision::AlwaysAccept,
            _ => ConfirmationDecision::Defer,
        })
    }
}
