use std::fmt;

use crate::scope::ChangeDescriptor;

/// Sequence number of a runner process. Each spawn gets a fresh one, so events
/// from a process that is no longer in flight can be recognised and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// The watcher saw something change under the root.
    Change(ChangeDescriptor),
    /// The runner wrote to stdout.
    Output { run: RunId },
    /// The runner exited. `code` is `None` when it was killed by a signal.
    Exited { run: RunId, code: Option<i32> },
    /// Ctrl+C received; stop the runner and leave the loop.
    Shutdown,
}
