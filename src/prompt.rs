//! Yes/no confirmation

use std::io::{self, IsTerminal, Write};

/// Asks the operator to confirm an action.
pub trait Confirm {
    fn confirm(&self, message: &str) -> io::Result<bool>;
}

/// Prompts on stderr and reads the answer from stdin.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn confirm(&self, message: &str) -> io::Result<bool> {
        if !io::stdin().is_terminal() || !io::stderr().is_terminal() {
            return Err(io::Error::other(
                "cannot prompt for confirmation without a terminal, use --nointeractive",
            ));
        }

        write!(io::stderr(), "{} [y/N] ", message)?;
        io::stderr().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        Ok(matches!(input.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
    }
}

/// Gives the same answer every time.
#[derive(Debug, Clone, Copy)]
pub struct FixedAnswer(pub bool);

impl Confirm for FixedAnswer {
    fn confirm(&self, message: &str) -> io::Result<bool> {
        tracing::debug!("{} -> {}", message, if self.0 { "yes" } else { "no" });
        Ok(self.0)
    }
}
