//! Child-process supervision.
//!
//! The supervisor owns two children, the relay process and the viewer
//! server, and walks a small lifecycle: Init -> Running -> Draining ->
//! Terminated. Teardown is one entry point, `shutdown`, no matter whether
//! it came from the control plane or a signal; repeat calls are no-ops once
//! draining has begun.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Result;
use netvision_core::config::{NetvisionConfig, PRODUCTION_ENV};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Delay between acknowledging shutdown and force-exiting the process.
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(1500);
/// Delay between booting the children and opening the viewer tab.
pub const VIEWER_SETTLE_DELAY: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Init,
    Running,
    Draining,
    Terminated,
}

type ChildHandle = Arc<StdMutex<Option<oneshot::Sender<()>>>>;

pub struct SupervisorOptions {
    pub config: NetvisionConfig,
    /// Directory the viewer server runs in.
    pub project_root: PathBuf,
    pub grace_delay: Duration,
    /// Exit the whole process after the grace delay once draining. Disabled
    /// only by tests.
    pub force_exit: bool,
}

pub struct Supervisor {
    options: SupervisorOptions,
    lifecycle: StdMutex<Lifecycle>,
    relay_kill: ChildHandle,
    viewer_kill: ChildHandle,
}

impl Supervisor {
    pub fn new(options: SupervisorOptions) -> Self {
        Self {
            options,
            lifecycle: StdMutex::new(Lifecycle::Init),
            relay_kill: Arc::new(StdMutex::new(None)),
            viewer_kill: Arc::new(StdMutex::new(None)),
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock().expect("lifecycle mutex poisoned")
    }

    /// Spawn both children. A child that fails to spawn is logged and
    /// skipped; the rest of the tooling keeps running without it.
    pub fn start(&self) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock().expect("lifecycle mutex poisoned");
            if *lifecycle != Lifecycle::Init {
                warn!(state = ?*lifecycle, "Supervisor already started");
                return Ok(());
            }
            *lifecycle = Lifecycle::Running;
        }
        let config = &self.options.config;

        let relay_path = resolve_relay_executable();
        let mut relay_command = Command::new(&relay_path);
        relay_command
            .arg("--ws-port")
            .arg(config.ws_port.to_string())
            .arg("--discovery-port")
            .arg(config.discovery_port.to_string());
        self.spawn_child("relay", relay_command, &self.relay_kill);

        match config.viewer_command().split_first() {
            Some((program, args)) => {
                let mut viewer_command = Command::new(program);
                viewer_command
                    .args(args)
                    .current_dir(&self.options.project_root);
                self.spawn_child("viewer", viewer_command, &self.viewer_kill);
            }
            None => warn!("No viewer command configured"),
        }

        Ok(())
    }

    /// The single teardown entry point. Sends termination to both children
    /// exactly once and, unless disabled, force-exits the process after the
    /// grace delay.
    pub fn shutdown(&self) {
        {
            let mut lifecycle = self.lifecycle.lock().expect("lifecycle mutex poisoned");
            if matches!(*lifecycle, Lifecycle::Draining | Lifecycle::Terminated) {
                debug!("Shutdown already in progress");
                return;
            }
            *lifecycle = Lifecycle::Draining;
        }
        info!("Supervisor draining");

        for (name, handle) in [("relay", &self.relay_kill), ("viewer", &self.viewer_kill)] {
            let kill = handle.lock().expect("child handle mutex poisoned").take();
            match kill {
                Some(kill) => {
                    if kill.send(()).is_err() {
                        debug!(child = name, "Child already gone");
                    }
                }
                None => debug!(child = name, "No child to terminate"),
            }
        }

        *self.lifecycle.lock().expect("lifecycle mutex poisoned") = Lifecycle::Terminated;
        info!("Supervisor terminated");

        if self.options.force_exit {
            let grace = self.options.grace_delay;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                info!("Exiting after shutdown grace period");
                std::process::exit(0);
            });
        }
    }

    fn spawn_child(&self, name: &'static str, mut command: Command, handle: &ChildHandle) {
        if self.options.config.production {
            command.env(PRODUCTION_ENV, "1");
            command.stdout(Stdio::null()).stderr(Stdio::null());
        } else {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
        command.kill_on_drop(true);

        match command.spawn() {
            Ok(mut child) => {
                let pid = child.id().unwrap_or_default();
                info!(child = name, pid, "Child process started");
                if let Some(stdout) = child.stdout.take() {
                    relay_child_output(name, "stdout", stdout);
                }
                if let Some(stderr) = child.stderr.take() {
                    relay_child_output(name, "stderr", stderr);
                }
                let (kill_tx, kill_rx) = oneshot::channel();
                *handle.lock().expect("child handle mutex poisoned") = Some(kill_tx);
                supervise_child(name, pid, child, kill_rx, handle.clone());
            }
            Err(e) => {
                error!(child = name, error = %e, "Failed to start child process");
            }
        }
    }
}

/// Watch one child until it exits or is told to terminate. A natural exit
/// clears the supervisor's handle so shutdown knows there is nothing left
/// to kill.
fn supervise_child(
    name: &'static str,
    pid: u32,
    mut child: Child,
    mut kill_rx: oneshot::Receiver<()>,
    handle: ChildHandle,
) {
    tokio::spawn(async move {
        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) => warn!(child = name, pid, %status, "Child process exited"),
                    Err(e) => error!(child = name, pid, error = %e, "Failed to wait on child process"),
                }
                handle.lock().expect("child handle mutex poisoned").take();
            }
            _ = &mut kill_rx => {
                if let Err(e) = child.start_kill() {
                    warn!(child = name, pid, error = %e, "Failed to terminate child process");
                }
                match child.wait().await {
                    Ok(status) => info!(child = name, pid, %status, "Child process terminated"),
                    Err(e) => error!(child = name, pid, error = %e, "Failed to reap child process"),
                }
            }
        }
    });
}

/// Pipe one child stream into our own log, line by line.
fn relay_child_output(
    name: &'static str,
    stream: &'static str,
    reader: impl AsyncRead + Unpin + Send + 'static,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(child = name, stream, "{}", line);
        }
    });
}

/// Find the relay binary: next to the current executable first, then let
/// PATH resolve the bare name.
fn resolve_relay_executable() -> PathBuf {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let candidate = dir.join(relay_binary_name());
            if candidate.is_file() {
                return candidate;
            }
        }
    }
    PathBuf::from(relay_binary_name())
}

fn relay_binary_name() -> &'static str {
    if cfg!(windows) {
        "netvision-relay.exe"
    } else {
        "netvision-relay"
    }
}
