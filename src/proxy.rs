//! Reverse-proxy configuration rendering and child-process supervision
//!
//! The route table is rendered into a Caddyfile and the proxy binary is
//! started against it. The supervisor exclusively owns the child handle;
//! both output streams are forwarded line by line to tracing by background
//! tasks that live as long as the child.
//!
//! [`ProxySupervisor::is_running`] reports whether a handle is held, not
//! whether the OS process is alive. A proxy that crashed keeps reporting
//! running until [`ProxySupervisor::stop`] is called.

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::routes::RouteTable;
use std::fmt::Write as _;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long `stop` waits for the log forwarders before aborting them
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

const INDENT: &str = "    ";

/// Caddy named-matcher for a subdomain
pub fn matcher_name(subdomain: &str) -> String {
    subdomain
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Render the proxy configuration.
///
/// Output is deterministic: an optional global debug block, then one listen
/// block per port. Each block holds one host matcher per unique subdomain,
/// followed by one `reverse_proxy` line per route of that subdomain in
/// table order.
pub fn render_config(routes: &RouteTable, ports: &[u16], debug: bool) -> String {
    let mut out = String::new();

    if debug {
        out.push_str("{\n");
        let _ = writeln!(out, "{}debug", INDENT);
        out.push_str("}\n\n");
    }

    let groups = routes.grouped_by_subdomain();

    for (i, port) in ports.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let _ = writeln!(out, ":{} {{", port);
        for (j, (subdomain, group)) in groups.iter().enumerate() {
            if j > 0 {
                out.push('\n');
            }
            let matcher = matcher_name(subdomain);
            let _ = writeln!(out, "{}@{} host {}", INDENT, matcher, subdomain);
            for route in group {
                let _ = writeln!(out, "{}reverse_proxy @{} {}", INDENT, matcher, route.upstream);
            }
        }
        out.push_str("}\n");
    }

    out
}

/// A spawned proxy and its log forwarders
struct RunningProxy {
    child: Child,
    log_shutdown: watch::Sender<bool>,
    log_tasks: Vec<JoinHandle<()>>,
}

/// Owns the reverse-proxy child process
pub struct ProxySupervisor {
    config: ProxyConfig,
    running: Option<RunningProxy>,
}

impl ProxySupervisor {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            running: None,
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Whether a child handle is held
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// OS pid of the held child, if any
    pub fn pid(&self) -> Option<u32> {
        self.running.as_ref().and_then(|r| r.child.id())
    }

    /// Write the configuration for `routes` and start the proxy.
    ///
    /// Calling this while a proxy is already held is the caller's mistake;
    /// the previous child would be dropped and killed.
    pub async fn setup_and_start(&mut self, routes: &RouteTable, debug: bool) -> Result<(), ProxyError> {
        self.write_config(routes, debug).await?;
        self.start().await
    }

    async fn write_config(&self, routes: &RouteTable, debug: bool) -> Result<(), ProxyError> {
        let path = &self.config.config_path;
        let content = render_config(routes, &self.config.ports, debug);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProxyError::WriteConfig {
                    path: path.clone(),
                    source: e,
                })?;
        }

        for (subdomain, group) in routes.grouped_by_subdomain() {
            for route in group {
                info!(subdomain, upstream = %route.upstream, "Creating proxy route");
            }
        }

        tokio::fs::write(path, content)
            .await
            .map_err(|e| ProxyError::WriteConfig {
                path: path.clone(),
                source: e,
            })?;

        info!(path = %path.display(), "Proxy configuration written");
        Ok(())
    }

    async fn start(&mut self) -> Result<(), ProxyError> {
        let config_path = self.config.config_path.to_string_lossy().into_owned();

        let mut cmd = Command::new(&self.config.binary);
        cmd.args(["run", "--config", config_path.as_str(), "--adapter", self.config.adapter.as_str()]);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        debug!(binary = %self.config.binary, config = %config_path, "Spawning proxy");

        let mut child = cmd.spawn().map_err(|e| ProxyError::Spawn {
            binary: self.config.binary.clone(),
            source: e,
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or(ProxyError::MissingStream { stream: "stdout" })?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ProxyError::MissingStream { stream: "stderr" })?;

        let (log_shutdown, shutdown_rx) = watch::channel(false);
        let log_tasks = vec![
            forward_lines(stdout, "stdout", shutdown_rx.clone()),
            forward_lines(stderr, "stderr", shutdown_rx),
        ];

        info!(pid = child.id().unwrap_or(0), binary = %self.config.binary, "Proxy server started");

        self.running = Some(RunningProxy {
            child,
            log_shutdown,
            log_tasks,
        });
        Ok(())
    }

    /// Stop the proxy. A no-op when nothing is running.
    ///
    /// The handle is released before signalling, so it is cleared even when
    /// termination fails.
    pub async fn stop(&mut self) {
        let Some(mut running) = self.running.take() else {
            return;
        };
        let grace_period = self.config.shutdown_grace_period();

        if let Err(e) = terminate(&mut running.child) {
            warn!(error = %e, "Failed to signal proxy process");
        }

        match tokio::time::timeout(grace_period, running.child.wait()).await {
            Ok(Ok(status)) => info!(?status, "Proxy process exited"),
            Ok(Err(e)) => warn!(error = %e, "Error waiting for proxy process to exit"),
            Err(_) => {
                warn!(
                    grace_period_secs = grace_period.as_secs(),
                    "Grace period exceeded, killing proxy process"
                );
                if let Err(e) = running.child.kill().await {
                    warn!(error = %e, "Failed to kill proxy process");
                }
            }
        }

        let _ = running.log_shutdown.send(true);
        for mut handle in running.log_tasks {
            if tokio::time::timeout(LOG_DRAIN_TIMEOUT, &mut handle).await.is_err() {
                handle.abort();
            }
        }

        info!("Proxy server stopped");
    }

    /// Path the configuration is rendered to
    pub fn config_path(&self) -> &Path {
        &self.config.config_path
    }
}

/// Ask the child to exit: SIGTERM on Unix, kill elsewhere
fn terminate(child: &mut Child) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let result = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if result != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        child.start_kill()
    }
}

/// Forward each line of `reader` to tracing until EOF or shutdown
fn forward_lines<R>(reader: R, stream: &'static str, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!(stream, "Proxy log forwarding stopped");
                    break;
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            let line = line.trim_end();
                            if !line.is_empty() {
                                info!(target: "proxy", stream, "{}", line);
                            }
                        }
                        Ok(None) => {
                            debug!(stream, "Proxy output stream closed");
                            break;
                        }
                        Err(e) => {
                            warn!(stream, error = %e, "Error reading proxy output");
                            break;
                        }
                    }
                }
            }
        }
    })
}
