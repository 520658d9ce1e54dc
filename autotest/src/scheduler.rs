/// The run-scheduling state machine.
///
/// ```text
///   Idle ──change──▶ WaitingToRun ──debounce──▶ Running ──exit──▶ Idle
///                        ▲   │                    │  ▲
///                        └───┘ change             │  └── pass after failure:
///                       (restarts timer)          │      full-suite rerun
///                                                 └── changes ignored
/// ```
///
/// Everything is driven from one task: watcher changes and runner
/// notifications arrive on a single channel, and the debounce and stall-kill
/// timers are deadlines owned by the current state. Leaving a state drops its
/// deadline, so a stale timer never fires.
use std::future;
use std::ops::ControlFlow;
use std::path::PathBuf;

use tokio::sync::mpsc;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, error, info};

use crate::event::{RunId, SchedulerEvent};
use crate::scope::{self, ChangeDescriptor};
use crate::status::{self, AutotestStatus, RunState};
use crate::supervisor::{Launcher, ProcessSupervisor};
use crate::tracker::{ResultTracker, Verdict};

/// Immutable inputs of one `watch` invocation.
#[derive(Debug, Clone)]
pub struct WatchSession {
    pub root: PathBuf,
    /// Arguments supplied by the user; every run starts from these.
    pub base_args: Vec<String>,
}

impl WatchSession {
    pub fn new(root: impl Into<PathBuf>, base_args: Vec<String>) -> Self {
        Self {
            root: root.into(),
            base_args,
        }
    }
}

enum State {
    Idle,
    WaitingToRun {
        change: ChangeDescriptor,
        deadline: Instant,
    },
    Running,
}

/// What woke the event loop.
enum Wake {
    Event(SchedulerEvent),
    DebounceElapsed,
    StallElapsed,
    Closed,
}

pub struct RunScheduler<L> {
    session: WatchSession,
    debounce: Duration,
    state: State,
    supervisor: ProcessSupervisor<L>,
    tracker: ResultTracker,
    status: AutotestStatus,
    status_path: Option<PathBuf>,
}

impl<L: Launcher> RunScheduler<L> {
    pub fn new(session: WatchSession, supervisor: ProcessSupervisor<L>, debounce: Duration) -> Self {
        Self {
            session,
            debounce,
            state: State::Idle,
            supervisor,
            tracker: ResultTracker::new(),
            status: AutotestStatus::new(),
            status_path: None,
        }
    }

    /// Writes an [`AutotestStatus`] snapshot to `path` after every transition.
    pub fn with_status_file(mut self, path: Option<PathBuf>) -> Self {
        self.status_path = path;
        self
    }

    pub fn run_state(&self) -> RunState {
        match self.state {
            State::Idle => RunState::Idle,
            State::WaitingToRun { .. } => RunState::WaitingToRun,
            State::Running => RunState::Running,
        }
    }

    fn debounce_deadline(&self) -> Option<Instant> {
        match self.state {
            State::WaitingToRun { deadline, .. } => Some(deadline),
            _ => None,
        }
    }

    /// Consumes events until `Shutdown` arrives or every sender is gone.
    pub async fn run(mut self, mut events: mpsc::Receiver<SchedulerEvent>) {
        self.publish_status();
        info!(root = %self.session.root.display(), "watching for changes");

        loop {
            let debounce = self.debounce_deadline();
            let stall = self.supervisor.stall_deadline();

            let wake = tokio::select! {
                evt = events.recv() => match evt {
                    Some(evt) => Wake::Event(evt),
                    None => Wake::Closed,
                },
                _ = sleep_until(debounce) => Wake::DebounceElapsed,
                _ = sleep_until(stall) => Wake::StallElapsed,
            };

            match wake {
                Wake::Event(evt) => {
                    if self.handle_event(evt, Instant::now()).is_break() {
                        break;
                    }
                }
                Wake::DebounceElapsed => self.on_debounce_elapsed(),
                Wake::StallElapsed => self.supervisor.on_stall_elapsed(),
                Wake::Closed => break,
            }
        }

        debug!("scheduler stopped");
    }

    /// Applies one event. Returns `Break` when the loop should stop.
    pub fn handle_event(&mut self, event: SchedulerEvent, now: Instant) -> ControlFlow<()> {
        match event {
            SchedulerEvent::Change(change) => self.on_change(change, now),
            SchedulerEvent::Output { run } => self.supervisor.on_output(run, now),
            SchedulerEvent::Exited { run, code } => self.on_exit(run, code),
            SchedulerEvent::Shutdown => {
                match self.supervisor.current_run() {
                    Some(run) => info!(run = %run, "shutting down; stopping test runner"),
                    None => info!("shutting down"),
                }
                self.supervisor.terminate();
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn on_change(&mut self, change: ChangeDescriptor, now: Instant) {
        if change.is_directory_creation() {
            debug!(change = %change, "ignoring directory creation");
            return;
        }

        match self.state {
            State::Running => {
                // Dropped, not queued: only a change after the exit starts a new run.
                debug!(change = %change, "change ignored while tests are running");
            }
            State::Idle | State::WaitingToRun { .. } => {
                debug!(change = %change, "change detected");
                self.state = State::WaitingToRun {
                    change,
                    deadline: now + self.debounce,
                };
                self.set_status_state();
            }
        }
    }

    /// Fires the pending debounce: resolve arguments and start the run.
    pub fn on_debounce_elapsed(&mut self) {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::WaitingToRun { change, .. } => {
                let args = scope::resolve_args(&self.session.base_args, &change);
                self.start_run(args);
            }
            other => self.state = other,
        }
    }

    fn on_exit(&mut self, run: RunId, code: Option<i32>) {
        let Some(code) = self.supervisor.on_exit(run, code) else {
            return;
        };

        self.state = State::Idle;
        let verdict = self.tracker.record(code);
        self.status.last_outcome = self.tracker.last_outcome();
        self.set_status_state();

        if verdict == Verdict::Escalate {
            info!("tests pass again; re-running with the original arguments");
            self.start_run(self.session.base_args.clone());
        }
    }

    fn start_run(&mut self, args: Vec<String>) {
        match self.supervisor.start(&args) {
            Ok(_) => {
                self.state = State::Running;
                self.status.run_started(&args);
                self.publish_status();
            }
            Err(e) => {
                error!("{e}");
                self.state = State::Idle;
                self.status.state = RunState::Idle;
                self.status.error = Some(e.to_string());
                self.publish_status();
            }
        }
    }

    fn set_status_state(&mut self) {
        self.status.state = self.run_state();
        self.publish_status();
    }

    fn publish_status(&self) {
        if let Some(path) = &self.status_path {
            status::write_status(path, &self.status);
        }
    }
}

/// Sleeps until `deadline`, or forever when there is none.
async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}
