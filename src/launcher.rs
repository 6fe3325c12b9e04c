//! Spawning of wallet runtime units
//!
//! The registry talks to runtime units only through [`WorkerLauncher`]: a
//! launch hands back a stream of [`WorkerEvent`]s and a [`Terminator`].
//! [`ProcessLauncher`] implements it with one OS process per wallet.
//!
//! # Process protocol
//!
//! The process is started as `<runtime> <runtime_args..> <boot_script>` (or
//! the boot script alone). Its [`WorkerData`] is written to stdin as a single
//! JSON line, then stdin is closed. The process answers on stdout with one
//! JSON line, either `{"port": 1234}` or `{"error": "..."}`. Other stdout
//! lines and all of stderr are logged. The exit status is reported last.

use crate::config::CloudWalletConfig;
use crate::redact;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// How long to keep reading stdout after the worker process has exited
const STDOUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Startup parameters handed to a runtime unit
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerData {
    /// Capability token of the wallet
    pub seed: String,
    /// Secret the worker must require on every forwarded request
    pub authorization_key: String,
    /// Cookie header of the request that triggered the spawn
    pub cookie: Option<String>,
    /// Local cache directory
    pub cache_container_path: PathBuf,
    /// Anchor id when the wallet was addressed through a cookie binding
    pub wallet_anchor_id: Option<String>,
}

/// Message written by a runtime unit on its stdout
#[derive(Debug, Deserialize, PartialEq)]
pub struct WorkerMessage {
    pub port: Option<u16>,
    pub error: Option<serde_json::Value>,
}

/// Lifecycle notifications from a launched runtime unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// The unit listens on this loopback port
    Ready(u16),
    /// The unit failed to start
    Error(String),
    /// The unit exited; 0 is clean, anything else is abnormal
    Exit(i32),
}

/// Idempotent stop capability for a runtime unit
#[derive(Debug, Clone)]
pub struct Terminator {
    tx: watch::Sender<bool>,
}

impl Terminator {
    /// Create a terminator and the receiver the runtime unit's supervisor watches
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, rx)
    }

    /// Request termination; repeated calls have no further effect
    pub fn terminate(&self) {
        self.tx.send_if_modified(|requested| {
            if *requested {
                false
            } else {
                *requested = true;
                true
            }
        });
    }

    pub fn is_terminated(&self) -> bool {
        *self.tx.borrow()
    }
}

/// A started runtime unit, as seen by the registry
pub struct LaunchedWorker {
    pub events: mpsc::UnboundedReceiver<WorkerEvent>,
    pub terminator: Terminator,
}

/// The external "spawn runtime unit" primitive
pub trait WorkerLauncher: Send + Sync + 'static {
    /// Start a runtime unit. Errors here mean nothing was started.
    fn launch(&self, data: WorkerData) -> anyhow::Result<LaunchedWorker>;
}

/// Launches each wallet worker as a child process running the boot script
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
    env: HashMap<String, String>,
    grace_period: Duration,
}

impl ProcessLauncher {
    pub fn new(config: &CloudWalletConfig) -> Self {
        let boot_script = config.boot_script_path();
        let (program, args) = match config.runtime {
            Some(ref runtime) => {
                let mut args = config.runtime_args.clone();
                args.push(boot_script.to_string_lossy().into_owned());
                (PathBuf::from(runtime), args)
            }
            None => (boot_script, Vec::new()),
        };

        Self {
            program,
            args,
            env: config.env.clone(),
            grace_period: config.shutdown_grace_period(),
        }
    }

    /// The executable and arguments used for every worker
    pub fn command_line(&self) -> (&PathBuf, &[String]) {
        (&self.program, &self.args)
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, data: WorkerData) -> anyhow::Result<LaunchedWorker> {
        let seed = redact(&data.seed);
        debug!(seed = %seed, program = %self.program.display(), "Starting worker process");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.envs(&self.env);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut payload = serde_json::to_vec(&data)?;
        payload.push(b'\n');

        let mut child = cmd.spawn().map_err(|e| {
            anyhow::anyhow!("Failed to spawn worker '{}': {}", self.program.display(), e)
        })?;
        info!(seed = %seed, pid = child.id().unwrap_or(0), "Worker process spawned");

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("Worker stdout not captured"))?;

        if let Some(stderr) = child.stderr.take() {
            let seed = seed.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(seed = %seed, stream = "stderr", "{}", line);
                }
            });
        }

        let (events_tx, events) = mpsc::unbounded_channel();
        let (terminator, terminate_rx) = Terminator::new();
        let grace_period = self.grace_period;

        tokio::spawn(async move {
            let code = supervise(
                child,
                stdin,
                payload,
                stdout,
                &events_tx,
                terminate_rx,
                grace_period,
                &seed,
            )
            .await;
            let _ = events_tx.send(WorkerEvent::Exit(code));
        });

        Ok(LaunchedWorker { events, terminator })
    }
}

/// Parse one stdout line into an event, if it is a worker message
pub fn parse_worker_line(line: &str) -> Option<WorkerEvent> {
    let message: WorkerMessage = serde_json::from_str(line.trim()).ok()?;
    if let Some(error) = message.error {
        let text = match error {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        return Some(WorkerEvent::Error(text));
    }
    message.port.map(WorkerEvent::Ready)
}

fn exit_code(status: ExitStatus) -> i32 {
    // Killed by a signal: no code, counts as abnormal
    status.code().unwrap_or(-1)
}

/// Drive a worker process until it exits, returning its exit code
#[allow(clippy::too_many_arguments)]
async fn supervise(
    mut child: Child,
    stdin: Option<ChildStdin>,
    payload: Vec<u8>,
    stdout: tokio::process::ChildStdout,
    events: &mpsc::UnboundedSender<WorkerEvent>,
    mut terminate_rx: watch::Receiver<bool>,
    grace_period: Duration,
    seed: &str,
) -> i32 {
    if let Some(mut stdin) = stdin {
        let seed = seed.to_string();
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&payload).await {
                warn!(seed = %seed, error = %e, "Failed to send startup data to worker");
            }
            // Dropping stdin closes it so the worker sees EOF
        });
    }

    let mut lines = BufReader::new(stdout).lines();
    let mut stdout_open = true;

    let forward_line = |line: String| match parse_worker_line(&line) {
        Some(event) => {
            let _ = events.send(event);
        }
        None => debug!(seed, stream = "stdout", "{}", line),
    };

    loop {
        tokio::select! {
            line = lines.next_line(), if stdout_open => {
                match line {
                    Ok(Some(line)) => forward_line(line),
                    Ok(None) | Err(_) => stdout_open = false,
                }
            }
            changed = terminate_rx.changed() => {
                if changed.is_err() || *terminate_rx.borrow() {
                    return stop_process(&mut child, grace_period, seed).await;
                }
            }
            status = child.wait() => {
                let code = match status {
                    Ok(status) => exit_code(status),
                    Err(e) => {
                        warn!(seed, error = %e, "Error waiting for worker to exit");
                        -1
                    }
                };

                // Messages written just before exit must be reported before the exit itself
                if stdout_open {
                    let _ = tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, async {
                        while let Ok(Some(line)) = lines.next_line().await {
                            forward_line(line);
                        }
                    })
                    .await;
                }
                return code;
            }
        }
    }
}

/// Stop a worker process: SIGTERM, then SIGKILL after the grace period
async fn stop_process(child: &mut Child, grace_period: Duration, seed: &str) -> i32 {
    if let Some(pid) = child.id() {
        info!(seed, pid, "Sending SIGTERM to worker");

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            info!(seed, ?status, "Worker process exited");
            exit_code(status)
        }
        Ok(Err(e)) => {
            warn!(seed, error = %e, "Error waiting for worker to exit");
            -1
        }
        Err(_) => {
            warn!(
                seed,
                grace_period_secs = grace_period.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            let _ = child.kill().await;
            -1
        }
    }
}
