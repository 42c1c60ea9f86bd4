//! netvision-trigger - dev-host middleware that launches the debugger
//!
//! A host dev server mounts this as a layer; one `POST /__netvision/open`
//! from on-device tooling brings the whole debugger up. Every other request
//! passes through untouched.
//!
//! # Example
//!
//! ```no_run
//! use axum::{routing::get, Router};
//! use netvision_trigger::{DevHostTrigger, TriggerOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let trigger = DevHostTrigger::new(TriggerOptions::new("."));
//!     let app = trigger.mount(Router::new().route("/", get(|| async { "dev host" })));
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::{Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Router;
use netvision_core::bridge::{BridgeTracker, BridgeTrackerOptions};
use netvision_core::config::{NetvisionConfig, PRODUCTION_ENV};
use netvision_core::launcher::{open_viewer, TabGuard};
use netvision_core::protocol::{READY_BODY, READY_CHECK_PATH};
use once_cell::sync::OnceCell;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Route the middleware intercepts.
pub const TRIGGER_PATH: &str = "/__netvision/open";
/// Delay between spawning the daemon and acknowledging, giving it time to
/// boot before the caller retries anything.
pub const SPAWN_SETTLE_DELAY: Duration = Duration::from_millis(1500);
/// Readiness probe timeout.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(1000);

/// One device bridge per host process, however many triggers are mounted.
static BRIDGE: OnceCell<tokio::sync::Mutex<BridgeTracker>> = OnceCell::new();

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("failed to launch debugger: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct TriggerOptions {
    /// Project root handed to the daemon and searched for config.
    pub project_root: PathBuf,
    pub trigger_path: String,
    pub settle_delay: Duration,
    pub probe_timeout: Duration,
    /// Explicit daemon executable. When unset it is resolved next to the
    /// host binary, then through PATH.
    pub daemon_path: Option<PathBuf>,
}

impl TriggerOptions {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            trigger_path: TRIGGER_PATH.to_string(),
            settle_delay: SPAWN_SETTLE_DELAY,
            probe_timeout: PROBE_TIMEOUT,
            daemon_path: None,
        }
    }
}

enum Launch {
    Reused,
    Starting,
    Spawned,
}

#[derive(Clone)]
pub struct DevHostTrigger {
    inner: Arc<TriggerInner>,
}

struct TriggerInner {
    options: TriggerOptions,
    config: NetvisionConfig,
    http: reqwest::Client,
    tab_guard: TabGuard,
    /// Pid of a daemon we spawned and still believe alive.
    child: StdMutex<Option<u32>>,
}

impl DevHostTrigger {
    /// Build from project config discovered under the project root.
    pub fn new(options: TriggerOptions) -> Self {
        let config = NetvisionConfig::discover(&options.project_root).apply_env();
        Self::with_config(options, config)
    }

    /// Build with an explicit config, skipping discovery.
    pub fn with_config(options: TriggerOptions, config: NetvisionConfig) -> Self {
        let http = match reqwest::Client::builder()
            .timeout(options.probe_timeout)
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "Falling back to default HTTP client");
                reqwest::Client::new()
            }
        };
        Self {
            inner: Arc::new(TriggerInner {
                options,
                config,
                http,
                tab_guard: TabGuard::new(),
                child: StdMutex::new(None),
            }),
        }
    }

    /// Wrap a host router with the trigger middleware.
    pub fn mount(&self, router: Router) -> Router {
        router.layer(axum::middleware::from_fn_with_state(
            self.clone(),
            Self::intercept,
        ))
    }

    async fn intercept(
        State(trigger): State<DevHostTrigger>,
        request: Request,
        next: Next,
    ) -> Response {
        if request.method() == Method::POST
            && request.uri().path() == trigger.inner.options.trigger_path
        {
            return trigger.handle_trigger().await;
        }
        next.run(request).await
    }

    async fn handle_trigger(&self) -> Response {
        self.ensure_bridge();
        match self.ensure_debugger().await {
            Ok(Launch::Reused) => {
                open_viewer(&self.inner.tab_guard, &self.inner.config.viewer_url());
                (StatusCode::OK, "NetVision debugger already running").into_response()
            }
            Ok(Launch::Starting) => {
                (StatusCode::OK, "NetVision debugger starting").into_response()
            }
            Ok(Launch::Spawned) => (StatusCode::OK, "NetVision debugger started").into_response(),
            Err(e) => {
                error!(error = %e, "Failed to launch debugger");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
            }
        }
    }

    /// Start the device bridge tracker exactly once for this process.
    fn ensure_bridge(&self) {
        let options = BridgeTrackerOptions::new(self.inner.config.effective_forward_ports());
        let installed = BRIDGE
            .set(tokio::sync::Mutex::new(BridgeTracker::new(options)))
            .is_ok();
        if installed {
            info!("Starting device bridge tracker");
            tokio::spawn(async {
                if let Some(tracker) = BRIDGE.get() {
                    tracker.lock().await.start().await;
                }
            });
        }
    }

    async fn ensure_debugger(&self) -> Result<Launch, TriggerError> {
        if self.probe_ready().await {
            debug!("Debugger already running");
            return Ok(Launch::Reused);
        }
        if self
            .inner
            .child
            .lock()
            .expect("child handle mutex poisoned")
            .is_some()
        {
            debug!("Debugger still starting");
            return Ok(Launch::Starting);
        }
        self.spawn_daemon().await?;
        Ok(Launch::Spawned)
    }

    /// One-shot readiness probe against the control plane. The body has to
    /// match, a random service squatting the port is not a debugger.
    async fn probe_ready(&self) -> bool {
        let url = format!("{}{}", self.inner.config.control_url(), READY_CHECK_PATH);
        match self.inner.http.get(&url).send().await {
            Ok(response) if response.status().is_success() => match response.text().await {
                Ok(body) => body.trim() == READY_BODY,
                Err(_) => false,
            },
            _ => false,
        }
    }

    async fn spawn_daemon(&self) -> Result<(), TriggerError> {
        let daemon_path = self.resolve_daemon_executable();
        info!(
            daemon = %daemon_path.display(),
            production = self.inner.config.production,
            "Launching debugger supervisor"
        );

        let mut command = Command::new(&daemon_path);
        command
            .arg("--project-root")
            .arg(&self.inner.options.project_root);
        if self.inner.config.production {
            command.env(PRODUCTION_ENV, "1");
            command.stdout(Stdio::null()).stderr(Stdio::null());
        } else {
            command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }

        let mut child = command.spawn()?;
        let pid = child.id().unwrap_or_default();
        *self
            .inner
            .child
            .lock()
            .expect("child handle mutex poisoned") = Some(pid);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!(pid, %status, "Debugger supervisor exited"),
                Err(e) => warn!(pid, error = %e, "Failed to wait on debugger supervisor"),
            }
            // Clearing the handle lets a later trigger relaunch.
            inner
                .child
                .lock()
                .expect("child handle mutex poisoned")
                .take();
        });

        tokio::time::sleep(self.inner.options.settle_delay).await;
        Ok(())
    }

    fn resolve_daemon_executable(&self) -> PathBuf {
        if let Some(path) = &self.inner.options.daemon_path {
            return path.clone();
        }
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                let candidate = dir.join(daemon_binary_name());
                if candidate.is_file() {
                    return candidate;
                }
            }
        }
        PathBuf::from(daemon_binary_name())
    }
}

fn daemon_binary_name() -> &'static str {
    if cfg!(windows) {
        "netvision-daemon.exe"
    } else {
        "netvision-daemon"
    }
}
