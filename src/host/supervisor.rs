//! OS-process lifecycle for one module instance.
//!
//! The supervisor is an actor task owning one child process at a time:
//! it spawns, watches for exits, restarts with a configurable delay, and
//! abandons a module that crash-loops. Shutdown is graceful-then-forced
//! against the whole process tree, because modules may fork helpers.
//!
//! State machine:
//! `Stopped -> Running -> {Sleeping -> Running}* -> (Stopped | Crashed)`
//! and `{Running | Sleeping} -> Stopping -> Stopped`.

use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Uptime after which the crash-loop counter resets: a module that ran
/// this long earned a fresh set of restart attempts.
const CRASH_WINDOW: Duration = Duration::from_secs(60);

const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Stopped,
    Running,
    /// Crashed and waiting out the restart delay.
    Sleeping,
    Stopping,
    /// Terminal: restart attempts exhausted, only `start()` revives it.
    Crashed,
}

/// Read-only view for host-side diagnostics.
#[derive(Debug, Clone)]
pub struct ProcessSnapshot {
    pub id: String,
    pub status: ProcessStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub pid: Option<u32>,
    /// Total crashes over the supervisor's lifetime, not just the window.
    pub crash_count: u32,
}

/// Delay before the next respawn after a crash.
#[derive(Clone)]
pub enum RestartDelay {
    Fixed(Duration),
    /// One entry per attempt; the last entry repeats forever.
    Escalating(Vec<Duration>),
    /// Attempt number (1-based) to delay.
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl RestartDelay {
    fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            RestartDelay::Fixed(delay) => *delay,
            RestartDelay::Escalating(delays) => delays
                .get(attempt.saturating_sub(1) as usize)
                .or_else(|| delays.last())
                .copied()
                .unwrap_or(DEFAULT_RESTART_DELAY),
            RestartDelay::Custom(f) => f(attempt),
        }
    }
}

impl fmt::Debug for RestartDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartDelay::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            RestartDelay::Escalating(d) => f.debug_tuple("Escalating").field(d).finish(),
            RestartDelay::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub delay: RestartDelay,
    /// Restarts allowed inside the crash window; -1 means unlimited.
    pub max_restarts: i32,
    /// Grace period between the polite kill and the forced one.
    /// `None` means never force-kill.
    pub kill_timeout: Option<Duration>,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            delay: RestartDelay::Fixed(DEFAULT_RESTART_DELAY),
            max_restarts: -1,
            kill_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Stdio of a freshly spawned worker, handed to whoever wires the
/// transport. Each respawn produces a new one; never reuse the old.
#[derive(Debug)]
pub struct SpawnedProcess {
    pub pid: u32,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

#[derive(Debug)]
pub enum SupervisorEvent {
    Spawned(SpawnedProcess),
    /// The child went away. `crash` is false only for deliberate stops.
    Exited { code: Option<i32>, crash: bool },
    Sleeping { delay: Duration, attempt: u32 },
    /// Terminal crash-loop abandonment.
    Crashed,
    ForceKilled,
    Stopped,
}

/// Factory producing the spawn command; invoked once per (re)spawn so
/// arguments and environment can differ between attempts.
pub type CommandFactory = Box<dyn FnMut() -> Command + Send>;

enum Cmd {
    Start,
    Stop,
}

/// Handle to the actor task. Dropping the handle force-kills whatever is
/// still running and ends the actor; prefer [`Supervisor::stop`] for a
/// graceful exit.
pub struct Supervisor {
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    status_rx: watch::Receiver<ProcessSnapshot>,
}

impl Supervisor {
    pub fn new(
        id: impl Into<String>,
        factory: CommandFactory,
        policy: RestartPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let id = id.into();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ProcessSnapshot {
            id: id.clone(),
            status: ProcessStatus::Stopped,
            started_at: None,
            pid: None,
            crash_count: 0,
        });

        let actor = Actor {
            id,
            factory,
            policy,
            events: event_tx,
            status: status_tx,
            cmd_rx,
            child_pid: None,
            generation: 0,
            window_restarts: 0,
            spawned_at: None,
            restart_at: None,
            kill_at: None,
        };
        tokio::spawn(actor.run());

        (Self { cmd_tx, status_rx }, event_rx)
    }

    /// Spawn the process. No-op while it is already running or stopping;
    /// from `Crashed` this is the manual restart path and resets the
    /// crash-loop window.
    pub fn start(&self) {
        let _ = self.cmd_tx.send(Cmd::Start);
    }

    /// Stop and wait until the process is gone. Concurrent callers share
    /// the one in-flight stop; nobody sends a second kill.
    pub async fn stop(&self) {
        let _ = self.cmd_tx.send(Cmd::Stop);
        let mut rx = self.status_rx.clone();
        let _ = rx
            .wait_for(|s| matches!(s.status, ProcessStatus::Stopped | ProcessStatus::Crashed))
            .await;
    }

    pub fn snapshot(&self) -> ProcessSnapshot {
        self.status_rx.borrow().clone()
    }

    pub fn status_watch(&self) -> watch::Receiver<ProcessSnapshot> {
        self.status_rx.clone()
    }
}

struct Actor {
    id: String,
    factory: CommandFactory,
    policy: RestartPolicy,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    status: watch::Sender<ProcessSnapshot>,
    cmd_rx: mpsc::UnboundedReceiver<Cmd>,
    child_pid: Option<u32>,
    /// Bumped per spawn; exit notices from stale children are ignored.
    generation: u64,
    window_restarts: u32,
    spawned_at: Option<Instant>,
    restart_at: Option<Instant>,
    kill_at: Option<Instant>,
}

impl Actor {
    async fn run(mut self) {
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel::<(u64, Option<i32>)>();

        loop {
            let restart_at = self.restart_at;
            let kill_at = self.kill_at;

            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Cmd::Start) => self.on_start(&exit_tx),
                    Some(Cmd::Stop) => self.on_stop().await,
                    // handle dropped: tear the child down and end the actor
                    None => {
                        if let Some(pid) = self.child_pid {
                            kill_tree(pid, true).await;
                        }
                        break;
                    }
                },
                Some((generation, code)) = exit_rx.recv() => {
                    if generation == self.generation {
                        self.on_exit(code);
                    } else {
                        debug!("ignoring exit of stale process generation {generation}");
                    }
                },
                _ = sleep_until_opt(restart_at), if restart_at.is_some() => {
                    self.restart_at = None;
                    self.spawn_child(&exit_tx);
                },
                _ = sleep_until_opt(kill_at), if kill_at.is_some() => {
                    self.kill_at = None;
                    self.on_kill_timeout().await;
                },
            }
        }
    }

    fn on_start(&mut self, exit_tx: &mpsc::UnboundedSender<(u64, Option<i32>)>) {
        match self.current_status() {
            ProcessStatus::Running | ProcessStatus::Stopping => {}
            ProcessStatus::Sleeping => {
                // skip the remaining delay
                self.restart_at = None;
                self.spawn_child(exit_tx);
            }
            ProcessStatus::Stopped | ProcessStatus::Crashed => {
                self.window_restarts = 0;
                self.spawn_child(exit_tx);
            }
        }
    }

    fn spawn_child(&mut self, exit_tx: &mpsc::UnboundedSender<(u64, Option<i32>)>) {
        self.generation += 1;
        let generation = self.generation;
        self.spawned_at = Some(Instant::now());

        let mut command = (self.factory)();
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        #[cfg(unix)]
        command.process_group(0);

        match command.spawn() {
            Ok(child) => self.on_spawned(child, generation, exit_tx),
            Err(err) => {
                warn!("spawn of module `{}` failed: {err}", self.id);
                self.on_exit(None);
            }
        }
    }

    fn on_spawned(
        &mut self,
        mut child: Child,
        generation: u64,
        exit_tx: &mpsc::UnboundedSender<(u64, Option<i32>)>,
    ) {
        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();

        self.child_pid = pid;
        self.update(|s| {
            s.status = ProcessStatus::Running;
            s.started_at = Some(Utc::now());
            s.pid = pid;
        });
        info!("module `{}` running (pid {:?})", self.id, pid);

        match (pid, stdin, stdout) {
            (Some(pid), Some(stdin), Some(stdout)) => {
                let _ = self.events.send(SupervisorEvent::Spawned(SpawnedProcess {
                    pid,
                    stdin,
                    stdout,
                }));
            }
            _ => warn!("module `{}` spawned without usable stdio", self.id),
        }

        // the waiter owns the child; it reaps the exit and reports back
        let exit_tx = exit_tx.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(_) => None,
            };
            let _ = exit_tx.send((generation, code));
        });
    }

    fn on_exit(&mut self, code: Option<i32>) {
        let deliberate = self.current_status() == ProcessStatus::Stopping;
        let uptime = self.spawned_at.map(|t| t.elapsed()).unwrap_or_default();
        self.child_pid = None;
        self.kill_at = None;

        let _ = self.events.send(SupervisorEvent::Exited {
            code,
            crash: !deliberate,
        });

        if deliberate {
            self.update(|s| {
                s.status = ProcessStatus::Stopped;
                s.pid = None;
            });
            let _ = self.events.send(SupervisorEvent::Stopped);
            return;
        }

        // crash path
        if uptime >= CRASH_WINDOW {
            self.window_restarts = 0;
        }
        self.update(|s| {
            s.pid = None;
            s.crash_count += 1;
        });

        let max = self.policy.max_restarts;
        if max >= 0 && self.window_restarts >= max as u32 {
            warn!(
                "module `{}` exceeded {} restarts, giving up",
                self.id, max
            );
            self.update(|s| s.status = ProcessStatus::Crashed);
            let _ = self.events.send(SupervisorEvent::Crashed);
            return;
        }

        self.window_restarts += 1;
        let delay = self.policy.delay.delay_for(self.window_restarts);
        debug!(
            "module `{}` crashed (exit {:?}), restart {} in {:?}",
            self.id, code, self.window_restarts, delay
        );
        self.update(|s| s.status = ProcessStatus::Sleeping);
        let _ = self.events.send(SupervisorEvent::Sleeping {
            delay,
            attempt: self.window_restarts,
        });
        self.restart_at = Some(Instant::now() + delay);
    }

    async fn on_stop(&mut self) {
        match self.current_status() {
            ProcessStatus::Stopped | ProcessStatus::Crashed | ProcessStatus::Stopping => {}
            ProcessStatus::Sleeping => {
                // nothing is running; just cancel the pending respawn
                self.restart_at = None;
                self.update(|s| s.status = ProcessStatus::Stopped);
                let _ = self.events.send(SupervisorEvent::Stopped);
            }
            ProcessStatus::Running => {
                self.update(|s| s.status = ProcessStatus::Stopping);
                if let Some(pid) = self.child_pid {
                    kill_tree(pid, false).await;
                }
                if let Some(grace) = self.policy.kill_timeout {
                    self.kill_at = Some(Instant::now() + grace);
                }
            }
        }
    }

    async fn on_kill_timeout(&mut self) {
        if self.current_status() != ProcessStatus::Stopping {
            return;
        }
        if let Some(pid) = self.child_pid {
            warn!("module `{}` ignored the polite kill, forcing", self.id);
            kill_tree(pid, true).await;
            let _ = self.events.send(SupervisorEvent::ForceKilled);
        }
    }

    fn current_status(&self) -> ProcessStatus {
        self.status.borrow().status
    }

    fn update(&self, f: impl FnOnce(&mut ProcessSnapshot)) {
        self.status.send_modify(f);
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// -----------------------------------------------------------------------------
// Process-tree kill
// -----------------------------------------------------------------------------

/// Signal the whole process tree behind `pid`. Modules may fork helpers,
/// so a plain kill of the direct child is not enough.
#[cfg(unix)]
pub async fn kill_tree(pid: u32, force: bool) {
    // children were spawned into their own process group (pgid == pid)
    let signal = if force { "-KILL" } else { "-TERM" };
    let _ = Command::new("kill")
        .arg(signal)
        .arg("--")
        .arg(format!("-{pid}"))
        .output()
        .await;
}

#[cfg(windows)]
pub async fn kill_tree(pid: u32, force: bool) {
    let mut command = Command::new("taskkill");
    command.arg("/PID").arg(pid.to_string()).arg("/T");
    if force {
        command.arg("/F");
    }
    let _ = command.output().await;
}
