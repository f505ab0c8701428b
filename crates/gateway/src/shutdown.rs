//! Aggregated shutdown errors.
//!
//! Every close step runs even when an earlier one fails; failures are kept
//! in step order and reported together.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStep {
    RegistrationLoop,
    Relay,
    AppServer,
    AgentDialer,
}

impl fmt::Display for ShutdownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShutdownStep::RegistrationLoop => "registration loop",
            ShutdownStep::Relay => "relay",
            ShutdownStep::AppServer => "app server",
            ShutdownStep::AgentDialer => "agent dialer",
        };
        f.write_str(name)
    }
}

/// One or more close steps failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownError {
    failures: Vec<(ShutdownStep, String)>,
}

impl ShutdownError {
    /// Failed steps with their messages, in the order they ran.
    pub fn failures(&self) -> &[(ShutdownStep, String)] {
        &self.failures
    }

    pub fn failed(&self, step: ShutdownStep) -> bool {
        self.failures.iter().any(|(s, _)| *s == step)
    }
}

impl fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("shutdown failed: ")?;
        for (i, (step, msg)) in self.failures.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{step}: {msg}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ShutdownError {}

/// Collects per-step outcomes during close.
#[derive(Debug, Default)]
pub(crate) struct ShutdownReport {
    failures: Vec<(ShutdownStep, String)>,
}

impl ShutdownReport {
    pub(crate) fn record<E: fmt::Display>(&mut self, step: ShutdownStep, result: Result<(), E>) {
        if let Err(e) = result {
            tracing::warn!(step = %step, error = %e, "shutdown step failed");
            self.failures.push((step, e.to_string()));
        }
    }

    pub(crate) fn finish(self) -> Result<(), ShutdownError> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(ShutdownError {
                failures: self.failures,
            })
        }
    }
}
