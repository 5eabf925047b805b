//! Lifecycle supervision of the backend data platform
//!
//! The platform runs outside of this process and keeps no state we can
//! lock. Its lifecycle state is therefore re-derived on every check from
//! two independent signals: whether the status command reports a reachable
//! API, and whether the database container exists.
//!
//! # Known limitations
//!
//! - Readiness is detected by scanning human-readable status output for
//!   [`RUNNING_MARKER`]. A change in the CLI's output format silently breaks
//!   detection. The check lives behind [`ReadinessProbe`] so a structured
//!   probe can replace it.
//! - Nothing serializes two overlapping runs. Both can observe
//!   `NotRunning` and both will issue `start`. Concurrent orchestration runs
//!   against the same workdir are not supported.
//! - `start` itself has no timeout. A platform CLI that hangs blocks the
//!   caller indefinitely.

use crate::command::{CommandRunner, CommandSpec, ProcessRunner};
use crate::config::PlatformConfig;
use crate::error::ServiceError;
use crate::status::{contains_running_marker, ServiceStatus, RUNNING_MARKER};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Inferred readiness phase of the platform (never stored)
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// No API and no database container
    NotRunning,
    /// Database container exists but the API is not reachable yet
    Starting,
    /// Status output reports the API
    Running,
}

/// Builds and runs platform CLI invocations
#[derive(Clone)]
pub struct PlatformCli {
    program: String,
    base_args: Vec<String>,
    workdir: PathBuf,
    debug_env: String,
    debug: bool,
    runner: Arc<dyn CommandRunner>,
}

impl PlatformCli {
    pub fn new(config: &PlatformConfig, debug: bool, runner: Arc<dyn CommandRunner>) -> Self {
        let mut words = shell_words::split(&config.cli)
            .ok()
            .filter(|w| !w.is_empty())
            .unwrap_or_else(|| vec![config.cli.clone()]);
        let program = words.remove(0);

        Self {
            program,
            base_args: words,
            workdir: config.workdir.clone(),
            debug_env: config.debug_env.clone(),
            debug,
            runner,
        }
    }

    /// Program name used for logging and error messages
    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Describe a platform invocation.
    ///
    /// `subcommand` is split on whitespace. With `in_workdir`, the command
    /// runs inside the project directory and receives `--workdir <path>`.
    pub fn spec(&self, subcommand: &str, in_workdir: bool) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.program)
            .args(self.base_args.iter().cloned())
            .args(subcommand.split_whitespace())
            .env(&self.debug_env, if self.debug { "1" } else { "0" });

        if in_workdir {
            spec = spec
                .arg("--workdir")
                .arg(self.workdir.to_string_lossy())
                .current_dir(&self.workdir);
        }
        spec
    }

    /// Run a platform subcommand and return its trimmed stdout
    pub async fn run(
        &self,
        subcommand: &str,
        in_workdir: bool,
        suppress_errors: bool,
    ) -> Result<String, ServiceError> {
        let spec = self.spec(subcommand, in_workdir).suppress_errors(suppress_errors);
        let output = self.runner.run(&spec).await?;
        Ok(output.stdout)
    }
}

/// Answers "is the platform ready to serve?"
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Never fails; any probe error counts as "not ready"
    async fn probe_ready(&self) -> bool;
}

/// Readiness inferred from the status command's output
pub struct StatusMarkerProbe {
    cli: PlatformCli,
}

impl StatusMarkerProbe {
    pub fn new(cli: PlatformCli) -> Self {
        Self { cli }
    }
}

#[async_trait]
impl ReadinessProbe for StatusMarkerProbe {
    async fn probe_ready(&self) -> bool {
        let output = match self.cli.run("status", true, true).await {
            Ok(output) => output,
            // The marker counts whatever the exit status
            Err(ServiceError::CommandFailed { stdout, .. }) => stdout,
            Err(e) => {
                debug!(error = %e, "Status command failed, treating platform as not running");
                return false;
            }
        };

        let ready = contains_running_marker(&output);
        debug!(ready, marker = RUNNING_MARKER, "Status marker probe");
        ready
    }
}

/// Brings the backend platform to a running state.
///
/// One instance is created by the orchestrator and passed around by
/// reference; all transitions happen in the external platform, the
/// supervisor only issues commands and observes.
pub struct ServiceSupervisor {
    config: PlatformConfig,
    cli: PlatformCli,
    runner: Arc<dyn CommandRunner>,
    probe: Arc<dyn ReadinessProbe>,
}

impl ServiceSupervisor {
    /// Supervisor that runs real child processes
    pub fn new(config: PlatformConfig, debug: bool) -> Self {
        Self::with_runner(config, debug, Arc::new(ProcessRunner))
    }

    /// Supervisor with a custom command runner and the status marker probe
    pub fn with_runner(config: PlatformConfig, debug: bool, runner: Arc<dyn CommandRunner>) -> Self {
        let cli = PlatformCli::new(&config, debug, Arc::clone(&runner));
        let probe: Arc<dyn ReadinessProbe> = Arc::new(StatusMarkerProbe::new(cli.clone()));
        Self {
            config,
            cli,
            runner,
            probe,
        }
    }

    /// Replace the readiness probe
    pub fn with_probe(mut self, probe: Arc<dyn ReadinessProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    /// Whether the platform API is reachable. Never fails.
    pub async fn is_running(&self) -> bool {
        debug!("Checking if the platform is running");
        let running = self.probe.probe_ready().await;
        debug!(running, "Platform readiness checked");
        running
    }

    /// Whether the platform is mid-startup: the database container exists
    /// but the API is not reachable yet.
    ///
    /// Returns `false` when the probe fails or does not finish within
    /// `timeout`. The answer may be stale by the time the caller acts on it.
    pub async fn is_starting(&self, timeout: Duration) -> bool {
        let probe = async {
            let spec = CommandSpec::new(&self.config.container_tool)
                .args(["ps", "--format", "{{.Names}}"])
                .current_dir(&self.config.workdir)
                .suppress_errors(true);

            match self.runner.run(&spec).await {
                Ok(output) => {
                    let container_present = output
                        .stdout
                        .lines()
                        .any(|name| name.trim() == self.config.db_container);
                    container_present && !self.is_running().await
                }
                Err(e) => {
                    debug!(error = %e, "Container probe failed, assuming the platform is not starting");
                    false
                }
            }
        };

        match tokio::time::timeout(timeout, probe).await {
            Ok(starting) => starting,
            Err(_) => {
                debug!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Starting probe timed out, assuming the platform is not starting"
                );
                false
            }
        }
    }

    /// Poll readiness every `poll_interval` until the platform runs or
    /// `timeout` has elapsed.
    pub async fn wait_for_startup(&self, timeout: Duration) -> Result<(), ServiceError> {
        let interval = self.config.poll_interval();
        let start = Instant::now();

        loop {
            if self.is_running().await {
                info!(
                    waited_ms = start.elapsed().as_millis() as u64,
                    "Platform finished starting"
                );
                return Ok(());
            }
            if start.elapsed() >= timeout {
                error!(timeout_secs = timeout.as_secs(), "Timeout waiting for the platform to start");
                return Err(ServiceError::StartupTimeout { waited: timeout });
            }
            debug!(interval_ms = interval.as_millis() as u64, "Platform not ready yet, polling again");
            tokio::time::sleep(interval).await;
        }
    }

    /// Derive the current lifecycle state from both probes
    pub async fn state(&self) -> LifecycleState {
        if self.is_running().await {
            LifecycleState::Running
        } else if self.is_starting(self.config.starting_probe_timeout()).await {
            LifecycleState::Starting
        } else {
            LifecycleState::NotRunning
        }
    }

    /// Verify the CLI, initialize the project if needed, and start the
    /// platform.
    ///
    /// On failure, diagnostics are collected before the original error is
    /// returned.
    pub async fn initialize_and_start(&self, force_restart: bool) -> Result<(), ServiceError> {
        info!(force_restart, "Initializing and starting the platform");

        let result = async {
            self.ensure_cli_available().await?;
            self.initialize_project_if_needed().await?;
            self.start_sequence(force_restart).await
        }
        .await;

        match result {
            Ok(()) => {
                info!("Platform initialization and startup complete");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Failed to initialize and start the platform");
                self.debug_status().await;
                Err(e)
            }
        }
    }

    async fn ensure_cli_available(&self) -> Result<(), ServiceError> {
        match self.cli.run("--version", false, false).await {
            Ok(version) => {
                info!(cli = self.cli.program(), version = %version, "Platform CLI found");
                Ok(())
            }
            Err(e) => Err(ServiceError::ToolUnavailable {
                tool: self.cli.program().to_string(),
                source: Box::new(e),
            }),
        }
    }

    async fn initialize_project_if_needed(&self) -> Result<(), ServiceError> {
        let marker = self.config.config_marker_path();
        let initialized = tokio::fs::try_exists(&marker)
            .await
            .map_err(|e| ServiceError::Io {
                path: marker.clone(),
                source: e,
            })?;

        if initialized {
            info!(marker = %marker.display(), "Platform project already initialized");
            return Ok(());
        }

        info!(workdir = %self.config.workdir.display(), "Platform project not initialized, initializing now");
        tokio::fs::create_dir_all(&self.config.workdir)
            .await
            .map_err(|e| ServiceError::Io {
                path: self.config.workdir.clone(),
                source: e,
            })?;
        self.cli.run("init", true, false).await?;
        info!("Platform project initialized");
        Ok(())
    }

    /// Decide between restart, wait, start and no-op
    async fn start_sequence(&self, force_restart: bool) -> Result<(), ServiceError> {
        if force_restart {
            info!("Stopping platform services for a forced restart");
            self.stop().await;
        } else if self.is_starting(self.config.starting_probe_timeout()).await {
            info!("Platform is already starting, waiting for it to complete");
            return self.wait_for_startup(self.config.startup_timeout()).await;
        } else if !self.is_running().await {
            info!("Platform services are not running, starting them");
            self.stop().await;
        } else {
            info!("Platform services are already running, skipping start");
            return Ok(());
        }

        self.start().await
    }

    /// Start platform services
    pub async fn start(&self) -> Result<(), ServiceError> {
        info!("Starting platform services");
        match self.cli.run("start", true, false).await {
            Ok(_) => {
                info!("Platform services started");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Failed to start platform services");
                Err(e)
            }
        }
    }

    /// Stop platform services. Best effort: failures are logged, not returned.
    pub async fn stop(&self) {
        info!("Stopping platform services");
        match self.cli.run("stop", true, false).await {
            Ok(_) => info!("Platform services stopped"),
            Err(e) => warn!(error = %e, "Failed to stop platform services"),
        }
    }

    /// Run the status command and parse every endpoint and credential.
    ///
    /// Not cached: each call queries the platform again. A non-zero exit
    /// still yields whatever its stdout reports; only a CLI that cannot be
    /// run is an error.
    pub async fn get_status(&self) -> Result<ServiceStatus, ServiceError> {
        let output = match self.cli.run("status", true, false).await {
            Ok(output) => output,
            Err(ServiceError::CommandFailed { code, stdout, .. }) => {
                warn!(code = ?code, "Status command exited unsuccessfully, parsing its output anyway");
                stdout
            }
            Err(e) => return Err(e),
        };
        Ok(ServiceStatus::parse(&output))
    }

    /// Log verbose diagnostics. Every failure is swallowed.
    pub async fn debug_status(&self) {
        info!("Collecting platform diagnostics");

        match self.cli.run("status --debug", true, true).await {
            Ok(status) => info!(output = %status, "Platform status (debug)"),
            Err(e) => warn!(error = %e, "Could not collect debug status"),
        }

        let tool = &self.config.container_tool;
        let container = &self.config.db_container;
        let diagnostics: [(&str, Vec<&str>); 3] = [
            ("Containers", vec!["ps", "-a"]),
            ("Database container logs", vec!["logs", container.as_str()]),
            ("Database container inspect", vec!["inspect", container.as_str()]),
        ];

        for (label, args) in diagnostics {
            let spec = CommandSpec::new(tool)
                .args(args)
                .current_dir(&self.config.workdir)
                .suppress_errors(true);
            match self.runner.run(&spec).await {
                Ok(output) => {
                    info!(output = %output.stdout, "{}", label);
                    if !output.stderr.trim().is_empty() {
                        info!(output = %output.stderr.trim(), "{} (stderr)", label);
                    }
                }
                Err(e) => warn!(error = %e, "Could not collect {}", label.to_lowercase()),
            }
        }
    }
}
