use serde::{Deserialize, Serialize};

/// Outcome of the most recent completed run.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// No run has completed yet.
    #[default]
    Unknown,
    Failed,
    Passed,
}

/// What the scheduler should do after a run has been recorded.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Verdict {
    /// Nothing further; wait for the next change.
    Settle,
    /// A failing suite just went green. Re-run immediately with the base
    /// arguments only, since a scoped pass says nothing about the rest.
    Escalate,
}

/// Pass/fail history across runs of one watch session.
#[derive(Debug, Default)]
pub struct ResultTracker {
    last: Outcome,
}

impl ResultTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_outcome(&self) -> Outcome {
        self.last
    }

    /// Records the exit code of the run that just finished.
    pub fn record(&mut self, exit_code: i32) -> Verdict {
        let previous = self.last;
        if exit_code != 0 {
            self.last = Outcome::Failed;
            return Verdict::Settle;
        }

        self.last = Outcome::Passed;
        if previous == Outcome::Failed {
            Verdict::Escalate
        } else {
            Verdict::Settle
        }
    }
}
