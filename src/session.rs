/// Session lifecycle: validate options, spawn the caffeinate subprocess in
/// its own process group, watch for its exit, and report completion events.
///
/// A session is reusable: after any completed run (explicit stop, timed
/// expiry, watched-process exit) it returns to the inactive state and can be
/// started again. All transitions for one session are serialized behind a
/// single async mutex; different sessions are fully independent.
use crate::exec::Executable;
use crate::opts::{self, Opt, OptKind};
use crate::process::{self, GroupChild};
use crate::registry::Registry;
use chrono::{DateTime, Utc};
use nix::unistd::Pid;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{broadcast, watch, Mutex};

/// Emitted exactly once per completed run, after the subprocess has fully
/// exited and the session has deregistered itself.
#[derive(Debug, Clone, Serialize)]
pub struct RunEnded {
    /// Child PID (for diagnostics).
    pub pid: u32,
    /// Process exit code (None if killed by signal).
    pub exit_code: Option<i32>,
    /// Wall-clock duration of the run in seconds.
    pub duration_secs: f64,
    /// When the run ended.
    pub ended_at: DateTime<Utc>,
}

/// Errors that can occur when starting a session.
#[derive(Debug)]
pub enum SessionError {
    /// start() was called while a subprocess is already running.
    AlreadyActive,
    /// The sleep-prevention executable is missing from its fixed path.
    ExecutableNotFound { path: PathBuf },
    /// Two options of the same kind appear in the configuration.
    DuplicateOptions { kind: OptKind },
    /// The OS spawn call failed; the underlying error is preserved verbatim.
    Spawn { source: std::io::Error },
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::AlreadyActive => {
                write!(f, "session already has a running subprocess")
            }
            SessionError::ExecutableNotFound { path } => {
                write!(
                    f,
                    "sleep-prevention executable not found at {}",
                    path.display()
                )
            }
            SessionError::DuplicateOptions { kind } => {
                write!(f, "duplicate option kind in configuration: {}", kind)
            }
            SessionError::Spawn { source } => {
                write!(f, "failed to spawn sleep-prevention subprocess: {}", source)
            }
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Spawn { source } => Some(source),
            _ => None,
        }
    }
}

/// Outcome of replacing a session's options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigUpdate {
    /// Session was inactive; the new options apply to the next start.
    Applied,
    /// Session is active; the running subprocess keeps its original options
    /// and the new ones take effect on the next start.
    DeferredUntilRestart,
}

/// A running subprocess handle, present only while the session is active.
#[derive(Debug)]
struct Active {
    pid: Pid,
    done: watch::Receiver<bool>,
}

/// State shared between the session handle, its exit watcher, and the
/// registry. The registry holds this weakly so it can stop the run without
/// owning the session.
#[derive(Debug)]
pub(crate) struct Shared {
    state: Mutex<Option<Active>>,
    active: AtomicBool,
    events: broadcast::Sender<RunEnded>,
}

impl Shared {
    fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            state: Mutex::new(None),
            active: AtomicBool::new(false),
            events,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Terminate the running subprocess group, if any, and wait for the run
    /// to wind down completely. No-op when inactive.
    ///
    /// The state lock is held only long enough to signal; waiting happens on
    /// a cloned receiver so the exit watcher can take the lock to clean up.
    pub(crate) async fn stop(&self) {
        let done = {
            let state = self.state.lock().await;
            match state.as_ref() {
                None => return,
                Some(active) => {
                    if let Err(e) = process::terminate_group(active.pid) {
                        tracing::warn!(
                            pid = active.pid.as_raw(),
                            error = %e,
                            "failed to signal subprocess group"
                        );
                    }
                    active.done.clone()
                }
            }
        };
        wait_done(done).await;
    }

    /// Wait for the current run to end without signaling it. Returns
    /// immediately when inactive.
    async fn wait(&self) {
        let done = {
            let state = self.state.lock().await;
            match state.as_ref() {
                None => return,
                Some(active) => active.done.clone(),
            }
        };
        wait_done(done).await;
    }
}

/// Block until the exit watcher flips the done flag. A closed channel means
/// the watcher is gone, which only happens after cleanup.
async fn wait_done(mut done: watch::Receiver<bool>) {
    while !*done.borrow() {
        if done.changed().await.is_err() {
            break;
        }
    }
}

/// A reusable handle for one sleep-prevention run at a time.
pub struct Session {
    opts: Vec<Opt>,
    limit_lifetime: bool,
    intercept_termination: bool,
    capture_output: bool,
    executable: Executable,
    registry: Option<Registry>,
    shared: Arc<Shared>,
}

impl Session {
    /// A session with the given options, targeting the platform caffeinate
    /// binary, with lifetime limiting and termination interception on.
    pub fn new(opts: Vec<Opt>) -> Self {
        Self {
            opts,
            limit_lifetime: true,
            intercept_termination: true,
            capture_output: true,
            executable: Executable::caffeinate(),
            registry: None,
            shared: Arc::new(Shared::new()),
        }
    }

    /// Use an explicitly injected executable instead of the platform one.
    pub fn with_executable(mut self, executable: Executable) -> Self {
        self.executable = executable;
        self
    }

    /// Register with this registry while active (when interception is on).
    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// When on and no process option is present, the child is told to watch
    /// the host PID so it dies with the host even under unmaskable kills.
    pub fn limit_lifetime(mut self, on: bool) -> Self {
        self.limit_lifetime = on;
        self
    }

    /// Whether to register with the registry while active.
    pub fn intercept_termination(mut self, on: bool) -> Self {
        self.intercept_termination = on;
        self
    }

    /// Whether to forward subprocess stdout/stderr through the logger.
    pub fn capture_output(mut self, on: bool) -> Self {
        self.capture_output = on;
        self
    }

    /// Current options.
    pub fn opts(&self) -> &[Opt] {
        &self.opts
    }

    /// Whether a subprocess is currently running for this session.
    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }

    /// Subscribe to run-completion events. Each completed run emits exactly
    /// one [`RunEnded`] to every receiver subscribed at the time.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEnded> {
        self.shared.events.subscribe()
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Replace the option set.
    ///
    /// Always allowed; while a run is active the running subprocess keeps its
    /// original options and the replacement applies to the next start.
    pub fn set_opts(&mut self, opts: Vec<Opt>) -> ConfigUpdate {
        self.opts = opts;
        if self.is_active() {
            tracing::warn!(
                "options changed while a run is active; they take effect on the next start"
            );
            ConfigUpdate::DeferredUntilRestart
        } else {
            ConfigUpdate::Applied
        }
    }

    /// Validate the configuration and spawn the subprocess.
    ///
    /// Preconditions are checked in order, first failure wins: an already
    /// running subprocess, a missing executable, a duplicate option kind.
    /// On success the session registers with the registry (if interception is
    /// on) only after the spawn has succeeded, and an exit watcher transitions
    /// the session back to inactive when the subprocess ends for any reason.
    pub async fn start(&mut self) -> Result<(), SessionError> {
        let mut state = self.shared.state.lock().await;
        if state.is_some() {
            return Err(SessionError::AlreadyActive);
        }
        if !self.executable.exists() {
            return Err(SessionError::ExecutableNotFound {
                path: self.executable.path().to_path_buf(),
            });
        }
        if let Some(kind) = opts::find_duplicate_kind(&self.opts) {
            return Err(SessionError::DuplicateOptions { kind });
        }

        let mut args: Vec<String> = self.opts.iter().flat_map(|o| o.to_args()).collect();
        let watches_a_process = self.opts.iter().any(|o| o.kind() == OptKind::Process);
        if self.limit_lifetime && !watches_a_process {
            // Second line of defense: the child watches the host PID itself,
            // covering kills that never reach the registry's signal path.
            args.push("-w".to_string());
            args.push(std::process::id().to_string());
        }

        tracing::info!(
            executable = %self.executable.path().display(),
            ?args,
            "starting sleep-prevention session"
        );

        let mut child = process::spawn_group(self.executable.path(), &args, self.capture_output)
            .map_err(|e| SessionError::Spawn { source: e })?;
        let pid = child.pid();
        tracing::info!(pid, "sleep-prevention subprocess started");

        if self.capture_output {
            if let Some(stdout) = child.take_stdout() {
                spawn_line_forwarder(stdout, pid, false);
            }
            if let Some(stderr) = child.take_stderr() {
                spawn_line_forwarder(stderr, pid, true);
            }
        }

        let registry = if self.intercept_termination {
            self.registry.clone()
        } else {
            None
        };
        if let Some(registry) = &registry {
            registry.register(&self.shared);
        }

        let (done_tx, done_rx) = watch::channel(false);
        let raw_pid = child.raw_pid();
        let shared = Arc::clone(&self.shared);
        let started = Instant::now();
        tokio::spawn(async move {
            watch_exit(child, shared, registry, done_tx, started).await;
        });

        self.shared.active.store(true, Ordering::SeqCst);
        *state = Some(Active {
            pid: raw_pid,
            done: done_rx,
        });
        Ok(())
    }

    /// Replace the option set, then start.
    pub async fn start_with(&mut self, opts: Vec<Opt>) -> Result<(), SessionError> {
        self.set_opts(opts);
        self.start().await
    }

    /// Terminate the running subprocess and wait for the run to wind down
    /// completely: process exited, session deregistered, completion event
    /// emitted. Idempotent; a no-op when inactive. There is no timeout — a
    /// hung child hangs this call.
    pub async fn stop(&self) {
        self.shared.stop().await;
    }

    /// Wait for the current run to end on its own (timed expiry, watched
    /// process exit). Returns immediately when inactive.
    pub async fn wait(&self) {
        self.shared.wait().await;
    }

    /// Keep sleep prevention active exactly for the duration of `f`: start,
    /// run it, stop, and hand back its result untouched. A start failure
    /// propagates and `f` is never run.
    pub async fn while_active<T>(&mut self, f: impl FnOnce() -> T) -> Result<T, SessionError> {
        self.start().await?;
        let result = f();
        self.stop().await;
        Ok(result)
    }

    /// Like [`while_active`](Self::while_active), but a start failure is
    /// logged and `f` runs without protection. For call sites that must never
    /// be blocked by sleep-prevention unavailability.
    pub async fn while_active_best_effort<T>(&mut self, f: impl FnOnce() -> T) -> T {
        if let Err(e) = self.start().await {
            tracing::warn!(error = %e, "proceeding without sleep prevention");
            return f();
        }
        let result = f();
        self.stop().await;
        result
    }
}

/// Own the child until it exits, then wind the run down: clear the running
/// handle, deregister, emit the completion event, release stop() waiters.
/// That ordering is what makes "stop returned" mean "fully cleaned up".
async fn watch_exit(
    mut child: GroupChild,
    shared: Arc<Shared>,
    registry: Option<Registry>,
    done_tx: watch::Sender<bool>,
    started: Instant,
) {
    let pid = child.pid();
    let exit_code = match child.wait().await {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::error!(pid, error = %e, "failed to wait for subprocess exit");
            None
        }
    };

    // The whole wind-down happens under the state lock, so anyone who
    // observes the session as inactive also observes it deregistered and the
    // completion event emitted. Nothing in here awaits.
    let mut state = shared.state.lock().await;
    *state = None;
    shared.active.store(false, Ordering::SeqCst);
    if let Some(registry) = registry {
        registry.deregister(&shared);
    }

    let ended = RunEnded {
        pid,
        exit_code,
        duration_secs: started.elapsed().as_secs_f64(),
        ended_at: Utc::now(),
    };
    tracing::info!(
        pid,
        exit_code = ?ended.exit_code,
        duration_secs = ended.duration_secs,
        "sleep-prevention session ended"
    );
    // Best-effort: no subscribers is fine.
    let _ = shared.events.send(ended);
    let _ = done_tx.send(true);
}

/// Forward subprocess output line-by-line through the logger. Read errors end
/// the forwarder; they never affect session state.
fn spawn_line_forwarder<R>(reader: R, pid: u32, is_stderr: bool)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if is_stderr {
                        tracing::warn!(pid, "{}", line);
                    } else {
                        tracing::info!(pid, "{}", line);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(pid, error = %e, "error reading subprocess output");
                    break;
                }
            }
        }
    });
}
