//! Operator confirmation prompts
//!
//! All unbounded waits in the workflow go through [`Prompter`] so the
//! state machine can be driven by a scripted provider in tests. The
//! terminal implementation blocks on stdin with no timeout; an
//! operator interrupt surfaces as an error and unwinds through the
//! normal cleanup path.

use color_eyre::eyre::{Context, Result};
use dialoguer::Confirm;

/// Confirmation provider for the workflow's interactive decisions.
pub trait Prompter {
    /// Ask a yes/no question, defaulting to "no".
    fn confirm(&self, prompt: &str) -> Result<bool>;

    /// Block until the operator acknowledges having performed a manual
    /// step. There is no timeout and no way to proceed without the ack
    /// short of declining (which aborts).
    fn wait_for_ack(&self, prompt: &str) -> Result<()>;
}

/// Interactive prompter for a live terminal.
pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn confirm(&self, prompt: &str) -> Result<bool> {
        Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .context("Reading confirmation from terminal")
    }

    fn wait_for_ack(&self, prompt: &str) -> Result<()> {
        loop {
            let done = Confirm::new()
                .with_prompt(prompt)
                .default(false)
                .interact()
                .context("Reading acknowledgment from terminal")?;
            if done {
                return Ok(());
            }
        }
    }
}
