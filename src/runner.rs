//! Process lifecycle management.
//!
//! `CommandRunner` owns the registry that maps each running command to its
//! live OS process. It spawns processes through the user's shell, drains their
//! output into an `OutputSink`, watches for exit, and drives every `Command`
//! through its status transitions while reporting to a `Notifier`.
//!
//! Concurrency model:
//! - The registry is a `std::sync::Mutex` that is never held across an
//!   `.await` or any I/O. Lock order is registry first, then a command's
//!   state. `start` reserves the command's slot, opens output and spawns
//!   without the lock, then publishes the entry.
//! - Each process has one drain task (stdout and stderr into the sink) and one
//!   exit watcher task. The watcher owns the `Child` and is the only place that
//!   signals or reaps it.
//! - `terminate` waits for the watcher to confirm exit before returning. It
//!   blocks only the calling task.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command as ProcessCommand};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::command::{Command, CommandId, CommandSpec};
use crate::errors::ShellrackError;
use crate::events::LifecycleEvent;
use crate::notify::Notifier;
use crate::observer::{LineSplitter, OutputObserver};
use crate::output::{OutputHandle, OutputSink, StreamKind};

const DEFAULT_SHELL: &str = "/bin/bash";
const TERM_VALUE: &str = "xterm-256color";
const READ_CHUNK: usize = 8 * 1024;

/// Tunables for a `CommandRunner`.
#[derive(Clone, Default)]
pub struct RunnerOptions {
    /// Shell used to run command lines. Falls back to `$SHELL`, then
    /// `/bin/bash`.
    pub shell: Option<PathBuf>,
    /// Observers that see every output line of every run.
    pub observers: Vec<Arc<dyn OutputObserver>>,
}

/// Result of a `start` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new process was spawned.
    Started { pid: u32 },
    /// The command already had a live process; nothing was spawned.
    AlreadyRunning,
    /// No process could be created. The command is now `failed`.
    Failed { error: String },
}

/// Requests the exit watcher carries out on its child.
#[derive(Debug, Clone, Copy)]
enum ExitControl {
    /// Ask the process to terminate (SIGTERM to its process group).
    Terminate,
    /// Force the process down.
    Kill,
}

/// Sink handle shared by the drain task and `terminate`.
struct OutputSlot {
    handle: Box<dyn OutputHandle>,
    detached: bool,
    write_failed: bool,
}

type SharedOutput = Arc<Mutex<OutputSlot>>;
type SharedStdin = Arc<tokio::sync::Mutex<Option<ChildStdin>>>;

#[derive(Default)]
struct Registry {
    live: HashMap<CommandId, RegistryEntry>,
    /// Commands between the start check and publication of their entry.
    starting: HashSet<CommandId>,
}

struct RegistryEntry {
    run: u64,
    command: Arc<Command>,
    pid: u32,
    drain: JoinHandle<()>,
    output: SharedOutput,
    stdin: SharedStdin,
    control: mpsc::UnboundedSender<ExitControl>,
    exited: watch::Receiver<bool>,
    terminating: bool,
}

/// Process lifecycle manager.
///
/// Cheap to clone; clones share the same registry. All methods must be called
/// from within a Tokio runtime.
#[derive(Clone)]
pub struct CommandRunner {
    inner: Arc<RunnerInner>,
}

struct RunnerInner {
    registry: Mutex<Registry>,
    sink: Arc<dyn OutputSink>,
    notifier: Arc<dyn Notifier>,
    options: RunnerOptions,
    next_run: AtomicU64,
}

impl CommandRunner {
    pub fn new(
        sink: Arc<dyn OutputSink>,
        notifier: Arc<dyn Notifier>,
        options: RunnerOptions,
    ) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                registry: Mutex::new(Registry::default()),
                sink,
                notifier,
                options,
                next_run: AtomicU64::new(1),
            }),
        }
    }

    /// Spawns a process for `command` unless one is already live.
    ///
    /// Returns once the OS spawn call has completed; output draining and exit
    /// detection run on their own tasks. Spawn failures are reported through
    /// the command status and a `FailedToStart` event.
    pub fn start(&self, command: &Arc<Command>) -> StartOutcome {
        {
            let mut registry = self.inner.lock_registry();
            if registry.live.contains_key(command.id())
                || registry.starting.contains(command.id())
                || command.is_running()
            {
                debug!(command = %command.name(), "start ignored; command already running");
                return StartOutcome::AlreadyRunning;
            }
            registry.starting.insert(command.id().clone());
        }

        let run = self.inner.next_run.fetch_add(1, Ordering::Relaxed);
        match self.spawn_run(command, run) {
            Ok((entry, ready)) => {
                let pid = entry.pid;
                {
                    let mut registry = self.inner.lock_registry();
                    registry.starting.remove(command.id());
                    registry.live.insert(command.id().clone(), entry);
                    command.mark_running();
                }
                info!(command = %command.name(), pid, "command started");
                self.inner.notifier.notify(&LifecycleEvent::Started {
                    name: command.name().to_string(),
                    pid,
                });
                // The exit watcher reports nothing until the start is announced.
                let _ = ready.send(());
                StartOutcome::Started { pid }
            }
            Err(err) => {
                self.inner.lock_registry().starting.remove(command.id());
                command.mark_finished(false);
                error!(command = %command.name(), error = %err, "command failed to start");
                let error = err.to_string();
                self.inner.notifier.notify(&LifecycleEvent::FailedToStart {
                    name: command.name().to_string(),
                    error: error.clone(),
                });
                StartOutcome::Failed { error }
            }
        }
    }

    /// Stops a running command and waits until its process has exited.
    ///
    /// On return the registry entry is gone, the output handle is closed and
    /// the command holds a terminal status. No-op for commands without a live
    /// process. There is no upper bound on the wait; see
    /// [`CommandRunner::terminate_with_timeout`].
    pub async fn terminate(&self, command: &Command) -> bool {
        self.terminate_inner(command, None).await
    }

    /// Like [`CommandRunner::terminate`], but force-kills the process if it has
    /// not exited `grace` after the termination request.
    pub async fn terminate_with_timeout(&self, command: &Command, grace: Duration) -> bool {
        self.terminate_inner(command, Some(grace)).await
    }

    /// Terminates every registered command concurrently and returns the number
    /// of commands stopped once all of them have exited.
    pub async fn terminate_all(&self) -> usize {
        self.terminate_all_inner(None).await
    }

    pub async fn terminate_all_with_timeout(&self, grace: Duration) -> usize {
        self.terminate_all_inner(Some(grace)).await
    }

    /// Starts an idle or finished command, stops a running one. Commands that
    /// are already being stopped are left alone.
    pub async fn toggle(&self, command: &Arc<Command>) {
        let state = command.snapshot();
        if state.cancelled {
            debug!(command = %command.name(), "toggle ignored; termination in progress");
            return;
        }
        if self.is_registered(command.id()) {
            self.terminate(command).await;
        } else {
            self.start(command);
        }
    }

    /// Writes `text` verbatim plus a newline to the command's stdin. Returns `false`
    /// when the command has no live process.
    pub async fn send_input(&self, command: &Command, text: &str) -> io::Result<bool> {
        let stdin = {
            let registry = self.inner.lock_registry();
            match registry.live.get(command.id()) {
                Some(entry) => entry.stdin.clone(),
                None => return Ok(false),
            }
        };
        let mut guard = stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Ok(false);
        };
        let mut line = text.to_string();
        line.push('\n');
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        info!(command = %command.name(), "wrote input to process");
        Ok(true)
    }

    pub fn is_registered(&self, id: &CommandId) -> bool {
        self.inner.lock_registry().live.contains_key(id)
    }

    /// True while any command has a live or starting process.
    pub fn is_any_running(&self) -> bool {
        let registry = self.inner.lock_registry();
        !registry.live.is_empty() || !registry.starting.is_empty()
    }

    pub fn pid_of(&self, id: &CommandId) -> Option<u32> {
        self.inner.lock_registry().live.get(id).map(|entry| entry.pid)
    }

    pub fn running_ids(&self) -> Vec<CommandId> {
        let mut ids: Vec<CommandId> = self.inner.lock_registry().live.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Opens output and spawns the process. The returned sender releases the
    /// exit watcher once the entry is published.
    fn spawn_run(
        &self,
        command: &Arc<Command>,
        run: u64,
    ) -> Result<(RegistryEntry, oneshot::Sender<()>), ShellrackError> {
        let mut handle = self.inner.sink.open(command).map_err(ShellrackError::Output)?;
        let mut process = build_process(command.spec(), self.inner.options.shell.as_deref());
        let mut child = match process.spawn() {
            Ok(child) => child,
            Err(err) => {
                handle.close();
                return Err(ShellrackError::Spawn(err));
            }
        };
        let pid = child.id().unwrap_or(0);

        let output: SharedOutput = Arc::new(Mutex::new(OutputSlot {
            handle,
            detached: false,
            write_failed: false,
        }));
        let stdin: SharedStdin = Arc::new(tokio::sync::Mutex::new(child.stdin.take()));
        let drain = tokio::spawn(drain_output(
            command.clone(),
            child.stdout.take(),
            child.stderr.take(),
            output.clone(),
            self.inner.options.observers.clone(),
        ));

        let (control, control_rx) = mpsc::unbounded_channel();
        let (exit_tx, exited) = watch::channel(false);
        let (ready, ready_rx) = oneshot::channel();
        tokio::spawn(watch_exit(
            self.clone(),
            command.clone(),
            run,
            child,
            ready_rx,
            control_rx,
            exit_tx,
        ));

        let entry = RegistryEntry {
            run,
            command: command.clone(),
            pid,
            drain,
            output,
            stdin,
            control,
            exited,
            terminating: false,
        };
        Ok((entry, ready))
    }

    async fn terminate_inner(&self, command: &Command, grace: Option<Duration>) -> bool {
        let (run, output, control, mut exited) = {
            let mut registry = self.inner.lock_registry();
            let Some(entry) = registry.live.get_mut(command.id()) else {
                return false;
            };
            if !entry.terminating {
                entry.terminating = true;
                debug!(command = %command.name(), pid = entry.pid, "preparing to stop command");
                detach_output(&entry.output);
                entry.drain.abort();
                command.mark_cancelled();
                let _ = entry.control.send(ExitControl::Terminate);
            }
            (
                entry.run,
                entry.output.clone(),
                entry.control.clone(),
                entry.exited.clone(),
            )
        };

        match grace {
            None => wait_for_exit(&mut exited).await,
            Some(grace) => {
                if tokio::time::timeout(grace, wait_for_exit(&mut exited)).await.is_err() {
                    warn!(
                        command = %command.name(),
                        grace_ms = grace.as_millis() as u64,
                        "process ignored termination request; killing"
                    );
                    let _ = control.send(ExitControl::Kill);
                    wait_for_exit(&mut exited).await;
                }
            }
        }

        close_output(&output);
        self.inner.remove_entry(command.id(), run);
        info!(command = %command.name(), "command manually stopped");
        true
    }

    async fn terminate_all_inner(&self, grace: Option<Duration>) -> usize {
        let commands: Vec<Arc<Command>> = self
            .inner
            .lock_registry()
            .live
            .values()
            .map(|entry| entry.command.clone())
            .collect();
        if commands.is_empty() {
            return 0;
        }

        let started = Instant::now();
        info!(count = commands.len(), "terminating all running commands");
        let mut tasks = JoinSet::new();
        for command in commands {
            let runner = self.clone();
            tasks.spawn(async move {
                debug!(command = %command.name(), "terminating process");
                runner.terminate_inner(&command, grace).await
            });
        }

        let mut terminated = 0;
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(true) => terminated += 1,
                Ok(false) => {}
                Err(err) => error!(error = %err, "termination task failed"),
            }
        }
        info!(
            terminated,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "all running commands terminated"
        );
        terminated
    }

    /// Termination callback: runs exactly once per process, after it has been
    /// reaped.
    fn handle_exit(&self, command: &Command, run: u64, status: io::Result<ExitStatus>) {
        self.inner.remove_entry(command.id(), run);

        let (success, code) = match &status {
            Ok(status) => (status.success(), status.code()),
            Err(err) => {
                error!(command = %command.name(), error = %err, "failed to wait for process");
                (false, None)
            }
        };
        if success {
            info!(command = %command.name(), "process exited normally");
        } else {
            warn!(command = %command.name(), code, "process exited abnormally");
        }

        // Read before the terminal transition, which clears the flag.
        let event = if command.is_cancelled() {
            LifecycleEvent::Stopped {
                name: command.name().to_string(),
            }
        } else if success {
            LifecycleEvent::Completed {
                name: command.name().to_string(),
            }
        } else {
            LifecycleEvent::Failed {
                name: command.name().to_string(),
                code,
            }
        };
        self.inner.notifier.notify(&event);
        command.mark_finished(success);
    }
}

impl RunnerInner {
    // Entries only hold handles; a poisoned map is still consistent.
    fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove_entry(&self, id: &CommandId, run: u64) {
        let mut registry = self.lock_registry();
        if registry.live.get(id).is_some_and(|entry| entry.run == run) {
            registry.live.remove(id);
        }
    }
}

/// Builds the shell invocation for a command.
fn build_process(spec: &CommandSpec, shell_override: Option<&Path>) -> ProcessCommand {
    let shell = resolve_shell(shell_override);
    let working_dir = expand_home(&spec.working_dir);
    info!(
        command = %spec.name,
        script = %spec.script,
        working_dir = %working_dir.display(),
        shell = %shell.display(),
        "starting command"
    );

    let mut process = ProcessCommand::new(&shell);
    process.args(shell_arguments(&shell, &spec.script));
    process.current_dir(&working_dir);
    if !spec.env.is_empty() {
        process.envs(&spec.env);
    }
    process.env("TERM", TERM_VALUE);
    process
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    process.kill_on_drop(true);

    // Own process group, so termination reaches the shell's children too.
    #[cfg(unix)]
    unsafe {
        process.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }

    process
}

fn resolve_shell(shell_override: Option<&Path>) -> PathBuf {
    if let Some(shell) = shell_override {
        return shell.to_path_buf();
    }
    std::env::var_os("SHELL")
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SHELL))
}

/// zsh only reads the user's init files in interactive mode.
fn shell_arguments(shell: &Path, script: &str) -> Vec<String> {
    let is_zsh = shell
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.contains("zsh"));
    if is_zsh {
        vec!["-i".to_string(), "-c".to_string(), script.to_string()]
    } else {
        vec!["-c".to_string(), script.to_string()]
    }
}

/// Expands a leading `~` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    let rest = if path == "~" {
        Some("")
    } else {
        path.strip_prefix("~/")
    };
    match (rest, dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

async fn watch_exit(
    runner: CommandRunner,
    command: Arc<Command>,
    run: u64,
    mut child: Child,
    ready: oneshot::Receiver<()>,
    mut control: mpsc::UnboundedReceiver<ExitControl>,
    exit_tx: watch::Sender<bool>,
) {
    let _ = ready.await;
    let status = loop {
        let request = tokio::select! {
            status = child.wait() => break status,
            Some(request) = control.recv() => request,
        };
        match request {
            ExitControl::Terminate => request_termination(&mut child, command.name()),
            ExitControl::Kill => {
                if let Err(err) = child.start_kill() {
                    warn!(command = %command.name(), error = %err, "failed to kill process");
                }
            }
        }
    };

    runner.handle_exit(&command, run, status);
    let _ = exit_tx.send(true);
}

#[cfg(unix)]
fn request_termination(child: &mut Child, name: &str) {
    // `id()` is None once the child has been reaped, so a recycled pid is never hit.
    let Some(pid) = child.id() else {
        return;
    };
    debug!(command = %name, pid, "sending SIGTERM");
    unsafe {
        let pid = pid as i32;
        let _ = libc::kill(-pid, libc::SIGTERM);
        let _ = libc::kill(pid, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child, name: &str) {
    if let Err(err) = child.start_kill() {
        warn!(command = %name, error = %err, "failed to stop process");
    }
}

async fn wait_for_exit(exited: &mut watch::Receiver<bool>) {
    // Err means the watcher is gone, which only happens after exit.
    let _ = exited.wait_for(|done| *done).await;
}

async fn drain_output(
    command: Arc<Command>,
    mut stdout: Option<ChildStdout>,
    mut stderr: Option<ChildStderr>,
    output: SharedOutput,
    observers: Vec<Arc<dyn OutputObserver>>,
) {
    let mut out_buf = vec![0u8; READ_CHUNK];
    let mut err_buf = vec![0u8; READ_CHUNK];
    let mut out_lines = LineSplitter::default();
    let mut err_lines = LineSplitter::default();

    while stdout.is_some() || stderr.is_some() {
        let (stream, read) = tokio::select! {
            read = read_chunk(stdout.as_mut(), &mut out_buf) => (StreamKind::Stdout, read),
            read = read_chunk(stderr.as_mut(), &mut err_buf) => (StreamKind::Stderr, read),
        };
        let (buf, lines) = match stream {
            StreamKind::Stdout => (&out_buf, &mut out_lines),
            StreamKind::Stderr => (&err_buf, &mut err_lines),
        };
        let eof = match read {
            Ok(0) => true,
            Ok(n) => {
                let chunk = &buf[..n];
                if !forward_chunk(&output, &command, chunk) {
                    return;
                }
                if !observers.is_empty() {
                    let complete = lines.push(chunk);
                    notify_observers(&observers, &command, &complete);
                }
                false
            }
            Err(err) => {
                debug!(command = %command.name(), ?stream, error = %err, "output stream error");
                true
            }
        };
        if eof {
            if let Some(tail) = lines.finish() {
                notify_observers(&observers, &command, &[tail]);
            }
            match stream {
                StreamKind::Stdout => stdout = None,
                StreamKind::Stderr => stderr = None,
            }
        }
    }

    debug!(command = %command.name(), "output reached end of stream");
    close_output(&output);
}

async fn read_chunk<R>(reader: Option<&mut R>, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match reader {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}

/// Returns `false` once the output has been detached.
fn forward_chunk(output: &SharedOutput, command: &Command, chunk: &[u8]) -> bool {
    let mut slot = output.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.detached {
        return false;
    }
    if let Err(err) = slot.handle.write(chunk) {
        if !slot.write_failed {
            warn!(command = %command.name(), error = %err, "failed to write output; dropping it");
        }
        slot.write_failed = true;
    }
    true
}

fn notify_observers(observers: &[Arc<dyn OutputObserver>], command: &Command, lines: &[String]) {
    for line in lines {
        for observer in observers {
            observer.on_line(command, line);
        }
    }
}

fn detach_output(output: &SharedOutput) {
    output
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .detached = true;
}

fn close_output(output: &SharedOutput) {
    output
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .handle
        .close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandStatus;
    use crate::notify::ChannelNotifier;
    use crate::observer::PromptDetector;
    use crate::output::testing::{BrokenSink, FailingWriteSink, MemorySink};

    struct Harness {
        runner: CommandRunner,
        sink: MemorySink,
        events: mpsc::UnboundedReceiver<LifecycleEvent>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_observers(Vec::new())
        }

        fn with_observers(observers: Vec<Arc<dyn OutputObserver>>) -> Self {
            let sink = MemorySink::default();
            let (notifier, events) = ChannelNotifier::channel();
            let options = RunnerOptions {
                shell: Some(PathBuf::from("/bin/sh")),
                observers,
            };
            let runner = CommandRunner::new(Arc::new(sink.clone()), Arc::new(notifier), options);
            Self {
                runner,
                sink,
                events,
            }
        }

        fn events(&mut self) -> Vec<LifecycleEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }
    }

    fn command(name: &str, script: &str) -> Arc<Command> {
        command_in(name, script, "~/")
    }

    fn command_in(name: &str, script: &str, working_dir: &str) -> Arc<Command> {
        Arc::new(Command::new(CommandSpec {
            name: name.to_string(),
            script: script.to_string(),
            working_dir: working_dir.to_string(),
            env: HashMap::new(),
        }))
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !check() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn wait_finished(command: &Command) {
        wait_until(|| {
            matches!(
                command.status(),
                CommandStatus::Success | CommandStatus::Failed
            )
        })
        .await;
    }

    async fn wait_output_closed(sink: &MemorySink, name: &str) {
        wait_until(|| {
            sink.runs_of(name)
                .last()
                .is_some_and(|run| run.lock().unwrap().closes > 0)
        })
        .await;
    }

    #[tokio::test]
    async fn echo_completes_and_writes_output() {
        let mut h = Harness::new();
        let cmd = command("echo", "echo hello");

        assert!(matches!(h.runner.start(&cmd), StartOutcome::Started { .. }));
        assert_eq!(cmd.status(), CommandStatus::Running);

        wait_finished(&cmd).await;
        wait_output_closed(&h.sink, "echo").await;

        assert_eq!(cmd.status(), CommandStatus::Success);
        assert!(!h.runner.is_registered(cmd.id()));
        assert_eq!(h.sink.output_of("echo"), b"hello\n");
        let events = h.events();
        assert!(matches!(events[0], LifecycleEvent::Started { .. }));
        assert_eq!(
            events[1],
            LifecycleEvent::Completed {
                name: "echo".into()
            }
        );
    }

    #[tokio::test]
    async fn non_zero_exit_reports_code() {
        let mut h = Harness::new();
        let cmd = command("seven", "exit 7");

        h.runner.start(&cmd);
        wait_finished(&cmd).await;

        assert_eq!(cmd.status(), CommandStatus::Failed);
        assert_eq!(
            h.events().last(),
            Some(&LifecycleEvent::Failed {
                name: "seven".into(),
                code: Some(7)
            })
        );
    }

    #[tokio::test]
    async fn terminate_waits_for_exit_and_reports_stop() {
        let mut h = Harness::new();
        let cmd = command("sleeper", "sleep 5");

        h.runner.start(&cmd);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        assert!(h.runner.terminate(&cmd).await);
        assert!(started.elapsed() < Duration::from_secs(4));

        let state = cmd.snapshot();
        assert!(matches!(
            state.status,
            CommandStatus::Success | CommandStatus::Failed
        ));
        assert!(!state.cancelled);
        assert!(!h.runner.is_registered(cmd.id()));
        assert!(h.sink.runs_of("sleeper")[0].lock().unwrap().closes >= 1);
        assert_eq!(
            h.events().last(),
            Some(&LifecycleEvent::Stopped {
                name: "sleeper".into()
            })
        );
    }

    #[tokio::test]
    async fn terminate_without_process_is_a_no_op() {
        let mut h = Harness::new();
        let cmd = command("idle", "true");

        assert!(!h.runner.terminate(&cmd).await);
        assert_eq!(cmd.status(), CommandStatus::Idle);
        assert!(h.events().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn double_start_spawns_one_process() {
        let h = Harness::new();
        let cmd = command("once", "sleep 5");

        let first = {
            let runner = h.runner.clone();
            let cmd = cmd.clone();
            tokio::spawn(async move { runner.start(&cmd) })
        };
        let second = h.runner.start(&cmd);
        let first = first.await.unwrap();

        let outcomes = [first, second];
        let started = outcomes
            .iter()
            .filter(|o| matches!(o, StartOutcome::Started { .. }))
            .count();
        assert_eq!(started, 1);
        assert!(outcomes.contains(&StartOutcome::AlreadyRunning));
        assert_eq!(h.sink.runs_of("once").len(), 1);
        assert_eq!(h.runner.running_ids(), vec![cmd.id().clone()]);

        h.runner.terminate(&cmd).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn terminate_all_stops_everything() {
        let h = Harness::new();
        let commands: Vec<_> = (0..3)
            .map(|i| command(&format!("svc {i}"), "sleep 5"))
            .collect();
        for cmd in &commands {
            assert!(matches!(h.runner.start(cmd), StartOutcome::Started { .. }));
        }
        assert!(h.runner.is_any_running());

        assert_eq!(h.runner.terminate_all().await, 3);

        assert!(!h.runner.is_any_running());
        for cmd in &commands {
            assert_ne!(cmd.status(), CommandStatus::Running);
            assert!(!cmd.is_cancelled());
        }
        assert_eq!(h.runner.terminate_all().await, 0);
    }

    #[tokio::test]
    async fn missing_working_dir_fails_to_start() {
        let mut h = Harness::new();
        let cmd = command_in("lost", "true", "/definitely/not/here");

        let outcome = h.runner.start(&cmd);

        assert!(matches!(outcome, StartOutcome::Failed { .. }));
        assert_eq!(cmd.status(), CommandStatus::Failed);
        assert!(!h.runner.is_registered(cmd.id()));
        assert!(matches!(
            h.events().as_slice(),
            [LifecycleEvent::FailedToStart { .. }]
        ));
    }

    #[tokio::test]
    async fn unavailable_output_fails_to_start() {
        let (notifier, _events) = ChannelNotifier::channel();
        let runner = CommandRunner::new(
            Arc::new(BrokenSink),
            Arc::new(notifier),
            RunnerOptions {
                shell: Some(PathBuf::from("/bin/sh")),
                ..RunnerOptions::default()
            },
        );
        let cmd = command("api", "sleep 5");

        let outcome = runner.start(&cmd);

        assert_eq!(
            outcome,
            StartOutcome::Failed {
                error: "failed to open output: read-only disk".into()
            }
        );
        assert_eq!(cmd.status(), CommandStatus::Failed);
        assert!(!runner.is_any_running());
    }

    #[tokio::test]
    async fn environment_overlay_and_term_reach_the_process() {
        let h = Harness::new();
        let cmd = Arc::new(Command::new(CommandSpec {
            name: "env".into(),
            script: r#"printf '%s %s' "$GREETING" "$TERM""#.into(),
            working_dir: "~/".into(),
            env: HashMap::from([("GREETING".to_string(), "hi".to_string())]),
        }));

        h.runner.start(&cmd);
        wait_finished(&cmd).await;
        wait_output_closed(&h.sink, "env").await;

        assert_eq!(h.sink.output_of("env"), b"hi xterm-256color");
    }

    #[tokio::test]
    async fn stdout_and_stderr_share_the_sink_in_order() {
        let h = Harness::new();
        let cmd = command("lines", "printf 'a\\nb\\nc\\n'; echo oops >&2");

        h.runner.start(&cmd);
        wait_finished(&cmd).await;
        wait_output_closed(&h.sink, "lines").await;

        let output = String::from_utf8(h.sink.output_of("lines")).unwrap();
        assert!(output.contains("a\nb\nc\n"));
        assert!(output.contains("oops\n"));
    }

    #[tokio::test]
    async fn restart_after_finish_opens_a_new_output() {
        let mut h = Harness::new();
        let cmd = command("twice", "echo run");

        h.runner.start(&cmd);
        wait_finished(&cmd).await;
        assert!(matches!(h.runner.start(&cmd), StartOutcome::Started { .. }));
        wait_until(|| !h.runner.is_registered(cmd.id())).await;
        wait_finished(&cmd).await;

        assert_eq!(h.sink.runs_of("twice").len(), 2);
        let started = h
            .events()
            .iter()
            .filter(|e| matches!(e, LifecycleEvent::Started { .. }))
            .count();
        assert_eq!(started, 2);
    }

    #[tokio::test]
    async fn send_input_reaches_stdin() {
        let h = Harness::new();
        let cmd = command("reader", r#"read -r line; printf 'got [%s]\n' "$line""#);

        h.runner.start(&cmd);
        assert!(h.runner.send_input(&cmd, "4  \"2\"").await.unwrap());
        wait_finished(&cmd).await;
        wait_output_closed(&h.sink, "reader").await;

        assert_eq!(cmd.status(), CommandStatus::Success);
        assert_eq!(h.sink.output_of("reader"), b"got [4  \"2\"]\n");
        assert!(!h.runner.send_input(&cmd, "again").await.unwrap());
    }

    #[tokio::test]
    async fn bounded_terminate_escalates_to_kill() {
        let mut h = Harness::new();
        let cmd = command("stubborn", "trap '' TERM; sleep 5");

        h.runner.start(&cmd);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        assert!(
            h.runner
                .terminate_with_timeout(&cmd, Duration::from_millis(200))
                .await
        );
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(cmd.status(), CommandStatus::Failed);
        assert_eq!(
            h.events().last(),
            Some(&LifecycleEvent::Stopped {
                name: "stubborn".into()
            })
        );
    }

    #[tokio::test]
    async fn toggle_starts_then_stops() {
        let h = Harness::new();
        let cmd = command("toggle", "sleep 5");

        h.runner.toggle(&cmd).await;
        assert_eq!(cmd.status(), CommandStatus::Running);
        h.runner.toggle(&cmd).await;
        assert!(!h.runner.is_registered(cmd.id()));
        assert_ne!(cmd.status(), CommandStatus::Running);
    }

    #[tokio::test]
    async fn prompt_detector_sees_output_lines() {
        let (notifier, mut prompts) = ChannelNotifier::channel();
        let detector = PromptDetector::new("enter the code", Arc::new(notifier)).unwrap();
        let h = Harness::with_observers(vec![Arc::new(detector)]);
        let cmd = command("bot", "echo 'Please enter the code you received:'");

        h.runner.start(&cmd);
        wait_finished(&cmd).await;
        wait_output_closed(&h.sink, "bot").await;

        assert_eq!(
            prompts.try_recv().unwrap(),
            LifecycleEvent::InputRequested {
                name: "bot".into(),
                prompt: "Please enter the code you received:".into(),
            }
        );
    }

    /// Delegates to a `MemorySink`, stalling `open` for one command.
    struct SlowSink {
        inner: MemorySink,
        slow: &'static str,
        delay: Duration,
    }

    impl OutputSink for SlowSink {
        fn open(&self, command: &Command) -> io::Result<Box<dyn OutputHandle>> {
            if command.name() == self.slow {
                std::thread::sleep(self.delay);
            }
            self.inner.open(command)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_start_does_not_stall_other_commands() {
        let (notifier, _events) = ChannelNotifier::channel();
        let runner = CommandRunner::new(
            Arc::new(SlowSink {
                inner: MemorySink::default(),
                slow: "slow",
                delay: Duration::from_millis(1500),
            }),
            Arc::new(notifier),
            RunnerOptions {
                shell: Some(PathBuf::from("/bin/sh")),
                ..RunnerOptions::default()
            },
        );
        let fast = command("fast", "sleep 5");
        let slow = command("slow", "sleep 5");
        assert!(matches!(runner.start(&fast), StartOutcome::Started { .. }));

        let pending = {
            let runner = runner.clone();
            let slow = slow.clone();
            tokio::task::spawn_blocking(move || runner.start(&slow))
        };
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(runner.is_any_running());
        assert_eq!(runner.start(&slow), StartOutcome::AlreadyRunning);
        let started = Instant::now();
        assert!(runner.terminate(&fast).await);
        assert!(started.elapsed() < Duration::from_millis(1000));

        assert!(matches!(pending.await.unwrap(), StartOutcome::Started { .. }));
        assert!(runner.is_registered(slow.id()));
        assert!(runner.terminate(&slow).await);
    }

    #[tokio::test]
    async fn nothing_is_forwarded_once_termination_begins() {
        let h = Harness::new();
        let cmd = command("chatty", "trap '' TERM; while :; do echo x; done");

        h.runner.start(&cmd);
        wait_until(|| !h.sink.output_of("chatty").is_empty()).await;

        let check = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let detached_len = h.sink.output_of("chatty").len();
            tokio::time::sleep(Duration::from_millis(200)).await;
            assert_eq!(h.sink.output_of("chatty").len(), detached_len);
        };
        let (stopped, ()) = tokio::join!(
            h.runner
                .terminate_with_timeout(&cmd, Duration::from_millis(500)),
            check
        );

        assert!(stopped);
        let final_len = h.sink.output_of("chatty").len();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.sink.output_of("chatty").len(), final_len);
        assert!(h.sink.runs_of("chatty")[0].lock().unwrap().closes >= 1);
    }

    #[tokio::test]
    async fn output_write_failures_do_not_affect_the_process() {
        let (notifier, mut events) = ChannelNotifier::channel();
        let sink = FailingWriteSink::default();
        let runner = CommandRunner::new(
            Arc::new(sink.clone()),
            Arc::new(notifier),
            RunnerOptions {
                shell: Some(PathBuf::from("/bin/sh")),
                ..RunnerOptions::default()
            },
        );
        let cmd = command("noisy", "echo one; sleep 0.5; echo two");

        assert!(matches!(runner.start(&cmd), StartOutcome::Started { .. }));
        wait_until(|| sink.failed_writes() > 0).await;
        assert_eq!(cmd.status(), CommandStatus::Running);
        assert!(runner.is_registered(cmd.id()));

        wait_finished(&cmd).await;
        assert_eq!(cmd.status(), CommandStatus::Success);
        let mut last = None;
        while let Ok(event) = events.try_recv() {
            last = Some(event);
        }
        assert_eq!(
            last,
            Some(LifecycleEvent::Completed {
                name: "noisy".into()
            })
        );
    }

    #[test]
    fn zsh_gets_interactive_flag() {
        assert_eq!(
            shell_arguments(Path::new("/bin/zsh"), "ls"),
            vec!["-i", "-c", "ls"]
        );
        assert_eq!(shell_arguments(Path::new("/bin/bash"), "ls"), vec!["-c", "ls"]);
    }

    #[test]
    fn shell_override_wins() {
        assert_eq!(
            resolve_shell(Some(Path::new("/bin/dash"))),
            PathBuf::from("/bin/dash")
        );
    }

    #[test]
    fn home_shorthand_is_expanded() {
        let Some(home) = dirs::home_dir() else {
            return;
        };
        assert_eq!(expand_home("~"), home);
        assert_eq!(expand_home("~/projects"), home.join("projects"));
        assert_eq!(expand_home("/srv/~app"), PathBuf::from("/srv/~app"));
        assert_eq!(expand_home("~other/x"), PathBuf::from("~other/x"));
    }
}
