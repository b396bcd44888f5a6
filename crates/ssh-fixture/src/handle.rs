//! The handle returned to callers.
//!
//! A [`ServerHandle`] is the result of a successful provisioning/probe
//! cycle: immutable connection parameters, plus exclusive ownership of the
//! ephemeral daemon when this run provisioned one. Release it with
//! [`ServerHandle::close`] at the end of the owning scope; `Drop` is only
//! the abnormal-exit safety net.

use crate::daemon::DaemonSupervisor;
use crate::endpoint::SshEndpoint;
use crate::error::{ProvisionError, Result};
use crate::probe::ConnectivityProbe;

/// A usable SSH endpoint, optionally owning the daemon that backs it.
#[derive(Debug)]
pub struct ServerHandle {
    endpoint: SshEndpoint,
    daemon: Option<DaemonSupervisor>,
}

impl ServerHandle {
    /// A handle over a server this run does not own (remote or system
    /// daemon).
    #[must_use]
    pub const fn remote(endpoint: SshEndpoint) -> Self {
        Self {
            endpoint,
            daemon: None,
        }
    }

    /// A handle owning a freshly provisioned ephemeral daemon.
    #[must_use]
    pub const fn with_daemon(endpoint: SshEndpoint, daemon: DaemonSupervisor) -> Self {
        Self {
            endpoint,
            daemon: Some(daemon),
        }
    }

    /// The probed connection parameters.
    #[must_use]
    pub const fn endpoint(&self) -> &SshEndpoint {
        &self.endpoint
    }

    /// Whether closing this handle will tear down a daemon.
    #[must_use]
    pub const fn owns_daemon(&self) -> bool {
        self.daemon.is_some()
    }

    /// Execute `command` against this endpoint under its credential.
    ///
    /// When the handle owns a daemon, liveness is checked first: a daemon
    /// that has exited fails here immediately instead of letting the
    /// client spin against a dead port.
    ///
    /// # Errors
    ///
    /// [`ProvisionError::NotRunning`] when the owned daemon has exited,
    /// otherwise whatever [`ConnectivityProbe::probe`] reports.
    pub async fn probe(&mut self, probe: &ConnectivityProbe, command: &str) -> Result<()> {
        if let Some(daemon) = self.daemon.as_mut() {
            if !daemon.is_running() {
                return Err(ProvisionError::NotRunning {
                    target: self.endpoint.to_uri_redacted(),
                });
            }
        }
        probe.probe(&self.endpoint, command).await
    }

    /// Deterministically tear down the owned daemon (if any) and archive
    /// its working directory. Idempotent by construction: consumes the
    /// handle.
    pub async fn close(mut self) {
        if let Some(mut daemon) = self.daemon.take() {
            daemon.shutdown().await;
        }
    }
}
