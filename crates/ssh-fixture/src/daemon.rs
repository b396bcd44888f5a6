//! Ephemeral sshd supervision.
//!
//! Writes a generated server configuration into a pid-named private working
//! directory, spawns `sshd` in the foreground with fully redirected stdio,
//! tracks its liveness, and guarantees termination and artifact archival on
//! disposal. The state machine is
//! `Unconfigured -> Configured -> Starting -> Running -> Stopping -> Stopped`
//! and disposal is idempotent and safe after partial construction.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, error, warn};

use crate::config::TimeoutConfig;
use crate::error::{ProvisionError, Result};

/// Supervisor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    /// No configuration written yet.
    Unconfigured,
    /// Configuration file written into the working directory.
    Configured,
    /// Spawn issued, liveness not yet confirmed.
    Starting,
    /// Daemon subprocess alive and (presumed) listening.
    Running,
    /// Disposal in progress.
    Stopping,
    /// Disposal complete; no further signals are ever sent.
    Stopped,
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unconfigured => "unconfigured",
            Self::Configured => "configured",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Typed builder for the generated `sshd_config`.
///
/// Renders newline-separated `Key=Value` lines; consumed only by the
/// spawned daemon, never parsed back.
#[derive(Debug, Clone)]
pub struct SshdConfig {
    /// Listening port.
    pub port: u16,
    /// Host key file.
    pub host_key: PathBuf,
    /// Authorized-keys file (the user public key).
    pub authorized_keys: PathBuf,
    /// The one login name the daemon accepts.
    pub allow_user: String,
    /// Pid-file path.
    pub pid_file: PathBuf,
    /// Daemon log level.
    pub log_level: SshdLogLevel,
}

/// Log level directive values understood by sshd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshdLogLevel {
    /// No logging.
    Quiet,
    /// Normal operational logging.
    Info,
    /// Protocol-level detail.
    Debug,
}

impl fmt::Display for SshdLogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Quiet => "QUIET",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
        })
    }
}

impl SshdConfig {
    /// Render the directive set.
    #[must_use]
    pub fn render(&self) -> String {
        // '%' is sshd's config-templating escape; paths fed to templated
        // directives must double it.
        let authorized_keys = escape_percents(&self.authorized_keys);
        let mut out = String::new();
        let mut line = |k: &str, v: &str| {
            out.push_str(k);
            out.push('=');
            out.push_str(v);
            out.push('\n');
        };
        line("Port", &self.port.to_string());
        line("ListenAddress", "127.0.0.1");
        line("HostKey", &self.host_key.display().to_string());
        line("AuthorizedKeysFile", &authorized_keys);
        line("AllowUsers", &self.allow_user);
        line("PubkeyAuthentication", "yes");
        line("PasswordAuthentication", "no");
        line("KbdInteractiveAuthentication", "no");
        line("ChallengeResponseAuthentication", "no");
        line("UsePAM", "no");
        line("StrictModes", "no");
        line("AllowTcpForwarding", "yes");
        line("GatewayPorts", "no");
        line("PidFile", &self.pid_file.display().to_string());
        line("LogLevel", &self.log_level.to_string());
        line("PrintMotd", "no");
        line("PrintLastLog", "no");
        line("Banner", "none");
        out
    }
}

fn escape_percents(path: &Path) -> String {
    path.display().to_string().replace('%', "%%")
}

/// Supervises one ephemeral sshd subprocess.
///
/// The owning [`crate::ServerHandle`] holds exclusive rights to signal the
/// daemon and delete its artifacts; no other component may touch them.
#[derive(Debug)]
pub struct DaemonSupervisor {
    state: DaemonState,
    work_dir: PathBuf,
    archive_dir: PathBuf,
    config_path: PathBuf,
    pid_file: PathBuf,
    stdout_path: PathBuf,
    stderr_path: PathBuf,
    timeouts: TimeoutConfig,
    child: Option<Child>,
}

impl DaemonSupervisor {
    /// Create an unconfigured supervisor rooted at `work_dir`, archiving to
    /// `archive_dir` on disposal.
    #[must_use]
    pub fn new(work_dir: PathBuf, archive_dir: PathBuf, timeouts: TimeoutConfig) -> Self {
        Self {
            state: DaemonState::Unconfigured,
            config_path: work_dir.join("sshd_config"),
            pid_file: work_dir.join("sshd.pid"),
            stdout_path: work_dir.join("sshd.out"),
            stderr_path: work_dir.join("sshd.err"),
            work_dir,
            archive_dir,
            timeouts,
            child: None,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> DaemonState {
        self.state
    }

    /// The working directory holding config, pid file, and captures.
    #[must_use]
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Path of the written configuration file.
    #[must_use]
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Write the generated configuration into the working directory.
    ///
    /// # Errors
    ///
    /// An I/O failure is reported and leaves the state at `Unconfigured`.
    pub fn configure(&mut self, config: &SshdConfig) -> Result<()> {
        std::fs::create_dir_all(&self.work_dir)
            .map_err(|e| ProvisionError::io_context("creating daemon working directory", e))?;
        std::fs::write(&self.config_path, config.render())
            .map_err(|e| ProvisionError::io_context("writing sshd_config", e))?;
        debug!(path = %self.config_path.display(), port = config.port, "wrote sshd configuration");
        self.state = DaemonState::Configured;
        Ok(())
    }

    /// Spawn the daemon in foreground/no-detach mode.
    ///
    /// stdin is bound to the null device; stdout/stderr go to capture files
    /// inside the working directory. An immediate exit (e.g. a lost bind
    /// race) is reported as [`ProvisionError::SpawnFailed`].
    ///
    /// # Errors
    ///
    /// Spawn failure is fatal to this backend attempt, not to the program.
    pub async fn start(&mut self, sshd_path: &Path) -> Result<()> {
        if self.state != DaemonState::Configured {
            return Err(ProvisionError::Config {
                message: format!("cannot start daemon from state {}", self.state),
            });
        }
        let stdout = std::fs::File::create(&self.stdout_path)
            .map_err(|e| ProvisionError::io_context("creating sshd.out", e))?;
        let stderr = std::fs::File::create(&self.stderr_path)
            .map_err(|e| ProvisionError::io_context("creating sshd.err", e))?;
        self.state = DaemonState::Starting;

        let mut command = Command::new(sshd_path);
        command
            .arg("-D")
            .arg("-e")
            .arg("-f")
            .arg(&self.config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        debug!(
            sshd = %sshd_path.display(),
            config = %self.config_path.display(),
            "spawning sshd"
        );

        let mut child = command.spawn().map_err(|e| {
            self.state = DaemonState::Configured;
            ProvisionError::SpawnFailed {
                command: sshd_path.display().to_string(),
                source: e,
            }
        })?;

        // Catch instant failures (bad config, lost bind race) before
        // declaring the daemon running.
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Ok(Some(status)) = child.try_wait() {
            self.state = DaemonState::Configured;
            let captured = std::fs::read_to_string(&self.stderr_path).unwrap_or_default();
            warn!(%status, stderr = %captured.trim(), "sshd exited immediately after spawn");
            return Err(ProvisionError::SpawnFailed {
                command: sshd_path.display().to_string(),
                source: std::io::Error::other(format!("sshd exited immediately: {status}")),
            });
        }

        self.child = Some(child);
        self.state = DaemonState::Running;
        Ok(())
    }

    /// True only while `Running` and the subprocess has not exited.
    ///
    /// A daemon that died makes later probes fail with a reported
    /// "server is not running" condition instead of hanging.
    pub fn is_running(&mut self) -> bool {
        if self.state != DaemonState::Running {
            return false;
        }
        match self.child.as_mut().map(Child::try_wait) {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                warn!(%status, "sshd exited unexpectedly");
                false
            }
            Some(Err(err)) => {
                warn!(%err, "failed to poll sshd liveness");
                false
            }
            None => false,
        }
    }

    /// The daemon's process id as recorded in its pid file, falling back to
    /// the direct child id. The pid file wins so the real listener is
    /// targeted even when the direct child is a supervisory wrapper.
    fn target_pid(&self) -> Option<u32> {
        if let Ok(text) = std::fs::read_to_string(&self.pid_file) {
            if let Ok(pid) = text.trim().parse::<u32>() {
                return Some(pid);
            }
        }
        self.child.as_ref().and_then(Child::id)
    }

    /// Stop the daemon and archive its working directory.
    ///
    /// Escalation: TERM up to four times with a short pause, then one KILL
    /// if still alive. Idempotent (once `Stopped`, no further signals are
    /// sent) and safe to invoke after partial construction.
    pub async fn shutdown(&mut self) {
        match self.state {
            DaemonState::Stopped => return,
            DaemonState::Unconfigured => {
                self.state = DaemonState::Stopped;
                return;
            }
            _ => {}
        }
        self.state = DaemonState::Stopping;

        if let Some(mut child) = self.child.take() {
            let pid = self.target_pid();
            let mut gone = false;

            for round in 0..4 {
                if matches!(child.try_wait(), Ok(Some(_))) {
                    gone = true;
                    break;
                }
                debug!(?pid, round, "sending TERM to sshd");
                send_signal(pid, &mut child, false);
                tokio::time::sleep(self.timeouts.term_pause).await;
            }

            if !gone && !matches!(child.try_wait(), Ok(Some(_))) {
                warn!(?pid, "sshd survived TERM sequence, sending KILL");
                send_signal(pid, &mut child, true);
            }

            match tokio::time::timeout(self.timeouts.kill_grace, child.wait()).await {
                Ok(Ok(status)) => debug!(%status, "sshd reaped"),
                Ok(Err(err)) => warn!(%err, "failed to reap sshd"),
                Err(_) => error!("timed out waiting for sshd to exit after KILL"),
            }
        }

        self.archive();
        self.state = DaemonState::Stopped;
    }

    /// Archive the working directory to the fixed `run/last` location.
    /// Best-effort: failures are logged, never fatal.
    fn archive(&self) {
        if !self.work_dir.exists() {
            return;
        }
        if self.archive_dir.exists() {
            if let Err(err) = std::fs::remove_dir_all(&self.archive_dir) {
                warn!(path = %self.archive_dir.display(), %err, "failed to clear previous archive");
                return;
            }
        }
        match std::fs::rename(&self.work_dir, &self.archive_dir) {
            Ok(()) => debug!(
                from = %self.work_dir.display(),
                to = %self.archive_dir.display(),
                "archived daemon working directory"
            ),
            Err(err) => warn!(
                from = %self.work_dir.display(),
                %err,
                "failed to archive daemon working directory"
            ),
        }
    }
}

/// Deliver TERM (or KILL) to the recorded pid, falling back to the tokio
/// child handle where targeted signals are unavailable.
#[cfg(unix)]
#[allow(unsafe_code)]
fn send_signal(pid: Option<u32>, child: &mut Child, kill: bool) {
    let signal = if kill { libc::SIGKILL } else { libc::SIGTERM };
    if let Some(pid) = pid {
        // SAFETY: kill() with an arbitrary pid is memory-safe; a stale pid
        // yields ESRCH which we ignore.
        let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
        if rc == 0 {
            return;
        }
    }
    let _ = child.start_kill();
}

#[cfg(not(unix))]
fn send_signal(_pid: Option<u32>, child: &mut Child, _kill: bool) {
    let _ = child.start_kill();
}

impl Drop for DaemonSupervisor {
    /// Abnormal-disposal safety net: `kill_on_drop` reaps the subprocess,
    /// but the working directory still gets archived. Deterministic
    /// cleanup should go through [`DaemonSupervisor::shutdown`].
    fn drop(&mut self) {
        if self.state == DaemonState::Stopped {
            return;
        }
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
        }
        self.archive();
        self.state = DaemonState::Stopped;
    }
}
