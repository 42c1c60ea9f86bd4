//! Device bridge tracking over adb.
//!
//! Follows `adb track-devices` and issues `adb reverse` forwards for every
//! configured port whenever a device shows up, so on-device interceptors can
//! reach the relay through localhost. The follower process is supervised:
//! when it dies or its stream closes, it is restarted with bounded
//! exponential backoff.

use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// First restart delay after the follower dies.
pub const RESTART_BASE_DELAY: Duration = Duration::from_millis(1000);
/// Backoff ceiling.
pub const RESTART_MAX_DELAY: Duration = Duration::from_millis(30_000);

#[derive(Debug, Clone)]
pub struct BridgeTrackerOptions {
    /// Bridge executable, resolved through PATH.
    pub adb_path: String,
    /// Ports reverse-forwarded to every attached device.
    pub forward_ports: Vec<u16>,
    pub restart_base_delay: Duration,
    pub restart_max_delay: Duration,
}

impl BridgeTrackerOptions {
    pub fn new(forward_ports: Vec<u16>) -> Self {
        Self {
            adb_path: "adb".to_string(),
            forward_ports,
            restart_base_delay: RESTART_BASE_DELAY,
            restart_max_delay: RESTART_MAX_DELAY,
        }
    }
}

pub struct BridgeTracker {
    options: BridgeTrackerOptions,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl BridgeTracker {
    pub fn new(options: BridgeTrackerOptions) -> Self {
        Self {
            options,
            shutdown_tx: None,
        }
    }

    /// Check whether the bridge executable is usable at all.
    pub async fn probe(adb_path: &str) -> bool {
        match Command::new(adb_path).arg("version").output().await {
            Ok(output) => output.status.success(),
            Err(e) => {
                debug!(adb = adb_path, error = %e, "Bridge executable probe failed");
                false
            }
        }
    }

    /// Start the supervised follower. When the bridge executable is missing
    /// the tracker logs once and stays idle; everything else keeps working
    /// without device forwarding.
    pub async fn start(&mut self) {
        if self.shutdown_tx.is_some() {
            return;
        }
        if !Self::probe(&self.options.adb_path).await {
            warn!(
                adb = %self.options.adb_path,
                "Bridge executable not found, device tracking disabled"
            );
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx);
        let options = self.options.clone();

        tokio::spawn(async move {
            let mut delay = options.restart_base_delay;
            let mut restarts: u32 = 0;
            loop {
                let started = Instant::now();
                tokio::select! {
                    result = Self::follow_devices(&options) => {
                        match result {
                            Ok(()) => info!("Device bridge stream closed"),
                            Err(e) => warn!(error = %e, "Device bridge failed"),
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }

                // A follower that stayed up a while earns a fresh backoff.
                if started.elapsed() >= options.restart_max_delay {
                    delay = options.restart_base_delay;
                    restarts = 0;
                }
                restarts += 1;
                info!(restarts, delay_ms = delay.as_millis() as u64, "Restarting device bridge");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.recv() => break,
                }
                delay = next_restart_delay(delay, options.restart_max_delay);
            }
            info!("Device bridge tracker stopped");
        });
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Run one `track-devices` follower to completion.
    async fn follow_devices(options: &BridgeTrackerOptions) -> Result<()> {
        let mut child = Command::new(&options.adb_path)
            .arg("track-devices")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn device bridge follower")?;
        let stdout = child
            .stdout
            .take()
            .context("device bridge follower has no stdout")?;
        info!("Device bridge follower started");

        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            let Some(serial) = parse_tracked_device(&line) else {
                continue;
            };
            info!(serial, "Device attached, issuing reverse forwards");
            for (serial, port) in plan_reverse_forwards(serial, &options.forward_ports) {
                let adb_path = options.adb_path.clone();
                // Fire and forget: forwards are independent and never
                // retried.
                tokio::spawn(async move {
                    reverse_forward(&adb_path, &serial, port).await;
                });
            }
        }

        let status = child.wait().await?;
        debug!(?status, "Device bridge follower exited");
        Ok(())
    }
}

impl Drop for BridgeTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Parse one follower output line. Lines look like `SERIAL\tdevice`; only
/// the `device` state counts as attached, everything else (offline,
/// unauthorized) is ignored.
pub fn parse_tracked_device(line: &str) -> Option<&str> {
    let mut parts = line.split_whitespace();
    let serial = parts.next()?;
    let state = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    (state == "device").then_some(serial)
}

/// One (serial, port) pair per configured forward.
pub fn plan_reverse_forwards(serial: &str, ports: &[u16]) -> Vec<(String, u16)> {
    ports.iter().map(|&port| (serial.to_string(), port)).collect()
}

/// Arguments for one `adb reverse` invocation.
pub fn reverse_args(serial: &str, port: u16) -> Vec<String> {
    vec![
        "-s".to_string(),
        serial.to_string(),
        "reverse".to_string(),
        format!("tcp:{port}"),
        format!("tcp:{port}"),
    ]
}

/// Doubling backoff with a ceiling.
pub fn next_restart_delay(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

async fn reverse_forward(adb_path: &str, serial: &str, port: u16) {
    match Command::new(adb_path)
        .args(reverse_args(serial, port))
        .output()
        .await
    {
        Ok(output) if output.status.success() => {
            info!(serial, port, "Reverse forward established");
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(serial, port, stderr = %stderr.trim(), "Reverse forward failed");
        }
        Err(e) => {
            warn!(serial, port, error = %e, "Failed to run bridge forward");
        }
    }
}
