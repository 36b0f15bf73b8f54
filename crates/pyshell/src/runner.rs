//! Child process execution with streamed output.
//!
//! [`ProcessRunner`] starts `<interpreter> -u <script>` and supervises the
//! child on a background task. Every stdout line is delivered to the run's
//! [`RunListener`] as it arrives; once the child has exited and both pipes are
//! drained, exactly one terminal event follows:
//!
//! - [`RunEvent::Failed`] if the script wrote anything to stderr (or was killed)
//! - [`RunEvent::Completed`] otherwise
//!
//! Before the terminal event reaches the listener the run is removed from the
//! shared [`InFlight`] set and its terminal hooks (scratch file removal,
//! instance release) have run.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::error::{Result, ShellError};
use crate::scratch::ScratchFile;

/// Opaque identifier of a started run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunId(u64);

impl RunId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric value of the identifier.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

/// Runs that have started but not yet delivered their terminal event.
///
/// Cloning shares the underlying set.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    runs: Arc<Mutex<HashSet<RunId>>>,
}

impl InFlight {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<RunId>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, id: RunId) -> bool {
        self.lock().insert(id)
    }

    /// Remove `id`, returning false if it was not present.
    fn remove(&self, id: RunId) -> bool {
        self.lock().remove(&id)
    }

    /// Whether `id` is still running.
    pub fn contains(&self, id: RunId) -> bool {
        self.lock().contains(&id)
    }

    /// Number of live runs.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when no run is live.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot of the live run identifiers, sorted.
    pub fn ids(&self) -> Vec<RunId> {
        let mut ids: Vec<_> = self.lock().iter().copied().collect();
        ids.sort();
        ids
    }
}

/// Why a run failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFailure {
    /// Everything the script wrote to stderr
    pub stderr: String,
    /// Exit code, if the process exited normally
    pub exit_code: Option<i32>,
    /// Whether the run was terminated through [`RunHandle::kill`]
    pub killed: bool,
}

impl RunFailure {
    /// Convert into [`ShellError::RunFailed`].
    pub fn into_error(self) -> ShellError {
        if self.killed && self.stderr.is_empty() {
            ShellError::RunFailed("process was killed".to_string())
        } else {
            ShellError::RunFailed(self.stderr)
        }
    }
}

/// Event delivered to a [`RunListener`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    /// One line of stdout, without the line terminator
    Output(String),
    /// Terminal: the script wrote to stderr or was killed
    Failed(RunFailure),
    /// Terminal: the script exited without writing to stderr
    Completed {
        /// Exit code, if the process exited normally
        exit_code: Option<i32>,
    },
}

impl RunEvent {
    /// Returns true for [`RunEvent::Failed`] and [`RunEvent::Completed`].
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunEvent::Output(_))
    }
}

/// Receives the events of a run.
///
/// Called from the run's supervisor task, so implementations must not block
/// for long.
pub trait RunListener: Send + Sync {
    /// Handle one event.
    fn on_event(&self, event: RunEvent);
}

/// Blanket implementation for closures.
impl<F> RunListener for F
where
    F: Fn(RunEvent) + Send + Sync,
{
    fn on_event(&self, event: RunEvent) {
        self(event)
    }
}

/// Forwards events into a channel. A closed receiver is ignored.
impl RunListener for mpsc::UnboundedSender<RunEvent> {
    fn on_event(&self, event: RunEvent) {
        let _ = self.send(event);
    }
}

/// A listener that discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl RunListener for NoopListener {
    fn on_event(&self, _event: RunEvent) {}
}

/// Lifecycle of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Requested but not started
    Pending,
    /// Child process is alive
    Running,
    /// Terminated without stderr output
    Completed,
    /// Terminated with stderr output or killed
    Failed,
}

impl RunState {
    /// Returns true for `Completed` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }
}

type TerminalHook = Box<dyn FnOnce() + Send>;

/// How long pipe readers may keep draining after a kill.
const KILL_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Everything needed to start a run except the script itself.
pub struct RunRequest {
    interpreter: PathBuf,
    working_dir: Option<PathBuf>,
    echo: bool,
    hooks: Vec<TerminalHook>,
}

impl fmt::Debug for RunRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunRequest")
            .field("interpreter", &self.interpreter)
            .field("working_dir", &self.working_dir)
            .field("echo", &self.echo)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

impl RunRequest {
    /// Run with `interpreter`, inheriting the working directory, without echo.
    pub fn new(interpreter: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
            working_dir: None,
            echo: false,
            hooks: Vec::new(),
        }
    }

    /// Set the child's working directory.
    pub fn working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }

    /// Echo each stdout line to this process's stdout.
    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Run `hook` once the run terminates, before the listener sees the
    /// terminal event. Hooks also run if the process fails to start.
    pub fn on_terminal(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }

    /// Interpreter that will run the script.
    pub fn interpreter(&self) -> &Path {
        &self.interpreter
    }

    fn run_hooks(hooks: Vec<TerminalHook>) {
        for hook in hooks {
            hook();
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// See [`RunEvent::Completed`]
    Completed {
        /// Exit code, if the process exited normally
        exit_code: Option<i32>,
    },
    /// See [`RunEvent::Failed`]
    Failed(RunFailure),
}

/// Summary returned once a run has terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Run identifier
    pub id: RunId,
    /// OS process id
    pub pid: Option<u32>,
    /// Terminal outcome
    pub outcome: RunOutcome,
}

impl RunReport {
    /// Returns true if the run completed.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RunOutcome::Completed { .. })
    }

    /// `Ok(())` on completion, [`ShellError::RunFailed`] otherwise.
    pub fn into_result(self) -> Result<()> {
        match self.outcome {
            RunOutcome::Completed { .. } => Ok(()),
            RunOutcome::Failed(failure) => Err(failure.into_error()),
        }
    }
}

/// Handle to a started run.
///
/// Dropping the handle does not stop the run; events keep flowing to the
/// listener until it terminates.
pub struct RunHandle {
    id: RunId,
    pid: Option<u32>,
    state: watch::Receiver<RunState>,
    kill: Option<oneshot::Sender<()>>,
    task: JoinHandle<RunReport>,
}

impl fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunHandle")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl RunHandle {
    /// Run identifier.
    pub fn id(&self) -> RunId {
        self.id
    }

    /// OS process id of the child.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Ask the supervisor to kill the child. Returns false if already requested.
    ///
    /// The run still ends through the normal terminal path, as a failure.
    pub fn kill(&mut self) -> bool {
        match self.kill.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Wait for the run to terminate.
    pub async fn wait(self) -> Result<RunReport> {
        self.task
            .await
            .map_err(|e| ShellError::Supervisor(e.to_string()))
    }
}

/// Spawns scripts and tracks them in an [`InFlight`] set.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    in_flight: InFlight,
}

impl ProcessRunner {
    /// Create a runner with its own in-flight set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a runner that records runs in `in_flight`.
    pub fn with_in_flight(in_flight: InFlight) -> Self {
        Self { in_flight }
    }

    /// The shared in-flight set.
    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    /// True when no run started by this runner is live.
    pub fn is_resolved(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// Start `script` and return immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<L>(
        &self,
        script: impl AsRef<Path>,
        request: RunRequest,
        listener: L,
    ) -> Result<RunHandle>
    where
        L: RunListener + 'static,
    {
        let RunRequest {
            interpreter,
            working_dir,
            echo,
            hooks,
        } = request;

        let (state_tx, state_rx) = watch::channel(RunState::Pending);
        let child = match spawn_child(script.as_ref(), &interpreter, working_dir.as_deref()) {
            Ok(child) => child,
            Err(e) => {
                RunRequest::run_hooks(hooks);
                return Err(e);
            }
        };

        let id = RunId::next();
        let pid = child.id();
        self.in_flight.insert(id);
        tracing::debug!(
            "Started {} (pid {:?}): {} -u {}",
            id,
            pid,
            interpreter.display(),
            script.as_ref().display()
        );

        state_tx.send_replace(RunState::Running);
        let (kill_tx, kill_rx) = oneshot::channel();
        let supervisor = Supervisor {
            id,
            pid,
            echo,
            hooks,
            in_flight: self.in_flight.clone(),
            listener: Arc::new(listener),
            state: state_tx,
        };
        let task = tokio::spawn(supervisor.run(child, kill_rx));

        Ok(RunHandle {
            id,
            pid,
            state: state_rx,
            kill: Some(kill_tx),
            task,
        })
    }

    /// Run `script` to completion.
    ///
    /// Script failures are reported through the listener and the returned
    /// [`RunReport`]; `Err` means the run could not be started.
    pub async fn run_file<L>(
        &self,
        script: impl AsRef<Path>,
        request: RunRequest,
        listener: L,
    ) -> Result<RunReport>
    where
        L: RunListener + 'static,
    {
        self.start(script, request, listener)?.wait().await
    }

    /// Write `code` to a scratch file in `scratch_dir` and start it.
    ///
    /// The scratch file is removed when the run terminates, or immediately if
    /// it cannot be started.
    pub fn start_string<L>(
        &self,
        code: &str,
        scratch_dir: &Path,
        request: RunRequest,
        listener: L,
    ) -> Result<RunHandle>
    where
        L: RunListener + 'static,
    {
        let scratch = ScratchFile::create(scratch_dir, "py", code)?;
        let script = scratch.path().to_path_buf();
        let request = request.on_terminal(move || drop(scratch));
        self.start(script, request, listener)
    }

    /// Write `code` to a scratch file in `scratch_dir` and run it to completion.
    pub async fn run_string<L>(
        &self,
        code: &str,
        scratch_dir: &Path,
        request: RunRequest,
        listener: L,
    ) -> Result<RunReport>
    where
        L: RunListener + 'static,
    {
        self.start_string(code, scratch_dir, request, listener)?
            .wait()
            .await
    }
}

fn spawn_child(script: &Path, interpreter: &Path, working_dir: Option<&Path>) -> Result<Child> {
    if !script.is_file() {
        return Err(ShellError::FileNotFound(script.to_path_buf()));
    }
    let script = std::path::absolute(script)?;

    let mut command = Command::new(interpreter);
    command
        .arg("-u")
        .arg(&script)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = working_dir {
        if !dir.is_dir() {
            return Err(ShellError::FileNotFound(dir.to_path_buf()));
        }
        command.current_dir(dir);
    }

    command.spawn().map_err(|source| ShellError::Spawn {
        program: interpreter.to_path_buf(),
        source,
    })
}

/// Owns a run from spawn to terminal event.
struct Supervisor {
    id: RunId,
    pid: Option<u32>,
    echo: bool,
    hooks: Vec<TerminalHook>,
    in_flight: InFlight,
    listener: Arc<dyn RunListener>,
    state: watch::Sender<RunState>,
}

impl Supervisor {
    async fn run(self, mut child: Child, kill_rx: oneshot::Receiver<()>) -> RunReport {
        let stdout = child.stdout.take().map(|stdout| {
            tokio::spawn(forward_lines(stdout, Arc::clone(&self.listener), self.echo))
        });
        let stderr = child.stderr.take().map(|stderr| tokio::spawn(read_all(stderr)));

        let (status, killed) = tokio::select! {
            status = child.wait() => (status, false),
            requested = kill_rx => match requested {
                Ok(()) => {
                    tracing::debug!("Killing {} (pid {:?})", self.id, self.pid);
                    if let Err(e) = child.start_kill() {
                        tracing::warn!("Failed to kill {}: {}", self.id, e);
                    }
                    (child.wait().await, true)
                }
                // Handle dropped without killing
                Err(_) => (child.wait().await, false),
            },
        };

        // A killed child may leave descendants holding the pipes open
        let grace = killed.then_some(KILL_DRAIN_GRACE);
        join_reader(stdout, grace, self.id, "stdout").await;
        let stderr = join_reader(stderr, grace, self.id, "stderr").await;

        let exit_code = match status {
            Ok(status) => status.code(),
            Err(e) => {
                tracing::warn!("Failed to wait for {}: {}", self.id, e);
                None
            }
        };
        let outcome = if killed || !stderr.is_empty() {
            RunOutcome::Failed(RunFailure {
                stderr,
                exit_code,
                killed,
            })
        } else {
            RunOutcome::Completed { exit_code }
        };

        self.finish(outcome)
    }

    fn finish(self, outcome: RunOutcome) -> RunReport {
        if !self.in_flight.remove(self.id) {
            tracing::warn!("{} was not in the in-flight set", self.id);
        }
        RunRequest::run_hooks(self.hooks);

        let (state, event) = match &outcome {
            RunOutcome::Completed { exit_code } => (
                RunState::Completed,
                RunEvent::Completed {
                    exit_code: *exit_code,
                },
            ),
            RunOutcome::Failed(failure) => (RunState::Failed, RunEvent::Failed(failure.clone())),
        };
        tracing::debug!("{} finished: {:?}", self.id, state);
        let _ = self.state.send(state);
        self.listener.on_event(event);

        RunReport {
            id: self.id,
            pid: self.pid,
            outcome,
        }
    }
}

async fn join_reader<T: Default>(
    task: Option<JoinHandle<T>>,
    grace: Option<Duration>,
    id: RunId,
    stream: &str,
) -> T {
    let Some(mut task) = task else {
        return T::default();
    };
    let joined = match grace {
        Some(grace) => match tokio::time::timeout(grace, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                tracing::debug!("Abandoning {} reader for {}", stream, id);
                task.abort();
                return T::default();
            }
        },
        None => task.await,
    };
    joined.unwrap_or_else(|e| {
        tracing::warn!("{} reader for {} failed: {}", stream, id, e);
        T::default()
    })
}

async fn forward_lines<R>(stream: R, listener: Arc<dyn RunListener>, echo: bool)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut echo = echo.then(tokio::io::stdout);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                if let Some(stdout) = echo.as_mut()
                    && let Err(e) = echo_line(stdout, &line).await
                {
                    tracing::debug!("Failed to echo child output: {}", e);
                }
                listener.on_event(RunEvent::Output(line));
            }
            Err(e) => {
                tracing::warn!("Failed to read child stdout: {}", e);
                break;
            }
        }
    }
}

async fn echo_line(stdout: &mut tokio::io::Stdout, line: &str) -> std::io::Result<()> {
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn read_all<R>(mut stream: R) -> String
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Err(e) = stream.read_to_end(&mut buf).await {
        tracing::warn!("Failed to read child stderr: {}", e);
    }
    String::from_utf8_lossy(&buf).into_owned()
}
