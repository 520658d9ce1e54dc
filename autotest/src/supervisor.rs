/// Ownership of the single in-flight runner process.
///
/// The supervisor spawns the runner through a [`Launcher`], arms a stall-kill
/// deadline when the runner first writes to stdout, and releases the process
/// when its exit is reported. Output and exit notifications arrive on the
/// scheduler's event channel tagged with a [`RunId`]; notifications for any run
/// other than the active one are dropped here.
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::event::{RunId, SchedulerEvent};

/// Exit code recorded for a runner that was killed by a signal and therefore
/// reported no code of its own.
pub const SIGNALLED_EXIT_CODE: i32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("test runner `{program}` was not found on PATH")]
    NotFound { program: String },
    #[error("failed to start test runner `{program}`: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("test runner `{program}` started without a stdout pipe")]
    MissingStdout { program: String },
    #[error("run {0} is still in flight")]
    AlreadyRunning(RunId),
}

/// A running child process as seen by the supervisor.
pub trait ChildHandle: Send {
    /// Asks the child to stop. The exit itself is still reported through
    /// [`SchedulerEvent::Exited`].
    fn terminate(&mut self);
}

/// Starts runner processes.
///
/// Implementations must report the first stdout output as
/// [`SchedulerEvent::Output`] and the exit as [`SchedulerEvent::Exited`], both
/// tagged with `run`, on `events`.
pub trait Launcher: Send {
    fn launch(
        &mut self,
        program: &str,
        args: &[String],
        run: RunId,
        events: mpsc::Sender<SchedulerEvent>,
    ) -> Result<Box<dyn ChildHandle>, SpawnError>;
}

struct ActiveRun {
    id: RunId,
    child: Box<dyn ChildHandle>,
    stall_deadline: Option<Instant>,
    output_seen: bool,
    terminate_sent: bool,
}

pub struct ProcessSupervisor<L> {
    launcher: L,
    program: String,
    stall_timeout: Duration,
    events: mpsc::Sender<SchedulerEvent>,
    last_id: u64,
    active: Option<ActiveRun>,
}

impl<L: Launcher> ProcessSupervisor<L> {
    pub fn new(
        launcher: L,
        program: impl Into<String>,
        stall_timeout: Duration,
        events: mpsc::Sender<SchedulerEvent>,
    ) -> Self {
        Self {
            launcher,
            program: program.into(),
            stall_timeout,
            events,
            last_id: 0,
            active: None,
        }
    }

    pub fn current_run(&self) -> Option<RunId> {
        self.active.as_ref().map(|a| a.id)
    }

    /// Pending stall-kill deadline of the active run, if armed.
    pub fn stall_deadline(&self) -> Option<Instant> {
        self.active.as_ref().and_then(|a| a.stall_deadline)
    }

    /// Spawns the runner with `args`.
    ///
    /// Refuses to start while another run is active. A launch failure leaves
    /// the supervisor idle.
    pub fn start(&mut self, args: &[String]) -> Result<RunId, SpawnError> {
        if let Some(active) = &self.active {
            return Err(SpawnError::AlreadyRunning(active.id));
        }

        let id = RunId(self.last_id + 1);
        let child = self
            .launcher
            .launch(&self.program, args, id, self.events.clone())?;
        self.last_id = id.0;

        info!(run = %id, "running {} {}", self.program, args.join(" "));
        self.active = Some(ActiveRun {
            id,
            child,
            stall_deadline: None,
            output_seen: false,
            terminate_sent: false,
        });
        Ok(id)
    }

    /// Arms the stall-kill deadline on the first output of the active run.
    /// Later output leaves the deadline where it is.
    pub fn on_output(&mut self, run: RunId, now: Instant) {
        let Some(active) = self.active.as_mut().filter(|a| a.id == run) else {
            debug!(run = %run, "ignoring output from inactive run");
            return;
        };
        if active.output_seen {
            return;
        }
        active.output_seen = true;
        active.stall_deadline = Some(now + self.stall_timeout);
        debug!(run = %run, timeout_ms = self.stall_timeout.as_millis() as u64, "stall timer armed");
    }

    /// The stall deadline passed without an exit: terminate the runner once.
    pub fn on_stall_elapsed(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        active.stall_deadline = None;
        if active.terminate_sent {
            return;
        }
        warn!(
            run = %active.id,
            "no exit {}ms after first output; terminating {}",
            self.stall_timeout.as_millis(),
            self.program
        );
        active.terminate_sent = true;
        active.child.terminate();
    }

    /// Requests termination of the active run regardless of the stall timer.
    pub fn terminate(&mut self) {
        if let Some(active) = self.active.as_mut() {
            active.stall_deadline = None;
            if !active.terminate_sent {
                active.terminate_sent = true;
                active.child.terminate();
            }
        }
    }

    /// Releases the active run if `run` is it and returns its exit code.
    ///
    /// Returns `None` for a run that is not in flight, which covers duplicate
    /// exit notifications for a handle that was already released.
    pub fn on_exit(&mut self, run: RunId, code: Option<i32>) -> Option<i32> {
        match &self.active {
            Some(active) if active.id == run => {}
            _ => {
                debug!(run = %run, "dropping exit for inactive run");
                return None;
            }
        }

        self.active = None;
        let code = code.unwrap_or(SIGNALLED_EXIT_CODE);
        info!(run = %run, code, "{} exited", self.program);
        Some(code)
    }
}

// ── Production launcher ───────────────────────────────────────────────────────

/// Launches the runner as a real child process in the watch root.
///
/// Stdout is piped and copied through to our own stdout so the first chunk can
/// be observed; stderr is inherited.
pub struct CommandLauncher {
    working_dir: PathBuf,
}

impl CommandLauncher {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }
}

impl Launcher for CommandLauncher {
    fn launch(
        &mut self,
        program: &str,
        args: &[String],
        run: RunId,
        events: mpsc::Sender<SchedulerEvent>,
    ) -> Result<Box<dyn ChildHandle>, SpawnError> {
        let mut child = Command::new(program)
            .args(args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| match source.kind() {
                ErrorKind::NotFound => SpawnError::NotFound {
                    program: program.to_string(),
                },
                _ => SpawnError::Io {
                    program: program.to_string(),
                    source,
                },
            })?;

        let stdout = child.stdout.take().ok_or_else(|| SpawnError::MissingStdout {
            program: program.to_string(),
        })?;

        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(forward_output(stdout, run, events.clone()));
        tokio::spawn(wait_for_exit(child, stop_rx, run, events));

        Ok(Box::new(CommandHandle { stop_tx }))
    }
}

struct CommandHandle {
    /// Setting this to `true` makes the waiter task kill the child.
    stop_tx: watch::Sender<bool>,
}

impl ChildHandle for CommandHandle {
    fn terminate(&mut self) {
        let _ = self.stop_tx.send(true);
    }
}

/// Copies runner stdout to our stdout, reporting the first chunk.
async fn forward_output(stdout: ChildStdout, run: RunId, events: mpsc::Sender<SchedulerEvent>) {
    copy_output(stdout, tokio::io::stdout(), run, events).await;
}

async fn copy_output<R, W>(mut stdout: R, mut out: W, run: RunId, events: mpsc::Sender<SchedulerEvent>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 8192];
    let mut reported = false;
    // Once our stdout is gone the child's pipe is still drained so it never
    // blocks on a full buffer.
    let mut copying = true;

    loop {
        let n = match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(run = %run, "failed to read runner output: {e}");
                break;
            }
        };

        if !reported {
            reported = true;
            let _ = events.send(SchedulerEvent::Output { run }).await;
        }
        if copying {
            if let Err(e) = out.write_all(&buf[..n]).await {
                debug!(run = %run, "stopped copying runner output: {e}");
                copying = false;
                continue;
            }
            let _ = out.flush().await;
        }
    }
}

/// Waits for the child to exit, killing it first if a stop is requested.
async fn wait_for_exit(
    mut child: Child,
    mut stop_rx: watch::Receiver<bool>,
    run: RunId,
    events: mpsc::Sender<SchedulerEvent>,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        // Also fires when the handle is dropped.
        _ = stop_rx.changed() => None,
    };

    let status = match exited {
        Some(status) => status,
        None => {
            if let Err(e) = child.start_kill() {
                warn!(run = %run, "failed to kill runner: {e}");
            }
            child.wait().await
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(run = %run, "failed to wait for runner: {e}");
            None
        }
    };
    let _ = events.send(SchedulerEvent::Exited { run, code }).await;
}

#[cfg(test)]
pub mod testing {
    //! Recording launcher used by the supervisor and scheduler tests.
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Debug, Clone)]
    pub struct Spawn {
        pub program: String,
        pub args: Vec<String>,
        pub run: RunId,
    }

    #[derive(Default)]
    struct State {
        spawns: Vec<Spawn>,
        terminates: HashMap<RunId, usize>,
        fail_next: bool,
    }

    /// Records every launch instead of starting a process. Clones share state,
    /// so a test can keep one while the scheduler owns another.
    #[derive(Clone, Default)]
    pub struct FakeLauncher {
        state: Arc<Mutex<State>>,
    }

    impl FakeLauncher {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn spawns(&self) -> Vec<Spawn> {
            self.state.lock().unwrap().spawns.clone()
        }

        pub fn spawn_count(&self) -> usize {
            self.state.lock().unwrap().spawns.len()
        }

        pub fn last_run(&self) -> RunId {
            self.state.lock().unwrap().spawns.last().unwrap().run
        }

        pub fn terminate_count(&self, run: RunId) -> usize {
            self.state
                .lock()
                .unwrap()
                .terminates
                .get(&run)
                .copied()
                .unwrap_or(0)
        }

        /// Makes the next launch fail as if the executable were missing.
        pub fn fail_next_spawn(&self) {
            self.state.lock().unwrap().fail_next = true;
        }
    }

    struct FakeChild {
        run: RunId,
        state: Arc<Mutex<State>>,
    }

    impl ChildHandle for FakeChild {
        fn terminate(&mut self) {
            *self
                .state
                .lock()
                .unwrap()
                .terminates
                .entry(self.run)
                .or_insert(0) += 1;
        }
    }

    impl Launcher for FakeLauncher {
        fn launch(
            &mut self,
            program: &str,
            args: &[String],
            run: RunId,
            _events: mpsc::Sender<SchedulerEvent>,
        ) -> Result<Box<dyn ChildHandle>, SpawnError> {
            let mut state = self.state.lock().unwrap();
            if std::mem::take(&mut state.fail_next) {
                return Err(SpawnError::NotFound {
                    program: program.to_string(),
                });
            }
            state.spawns.push(Spawn {
                program: program.to_string(),
                args: args.to_vec(),
                run,
            });
            Ok(Box::new(FakeChild {
                run,
                state: Arc::clone(&self.state),
            }))
        }
    }
}
