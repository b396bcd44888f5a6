//! Fixture configuration.
//!
//! An explicit, typed configuration struct: named fields, a validating
//! constructor, no global accessor tables. The only ambient input is the
//! `SSH_FIXTURE_TARGET` environment variable, which forces the backend
//! chain to the explicit remote target it carries.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::BackendKind;
use crate::endpoint::SshEndpoint;
use crate::error::{ProvisionError, Result};

/// Environment variable carrying an explicit target URI.
///
/// When set, only the [`BackendKind::ExplicitRemote`] backend is tried and
/// ephemeral daemon provisioning is disabled.
pub const TARGET_ENV_VAR: &str = "SSH_FIXTURE_TARGET";

/// Timeouts for the bounded waits in a provisioning run.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutConfig {
    /// Bound on a single connectivity probe (spawn to exit).
    pub probe: Duration,
    /// Per-candidate TCP connect timeout during port allocation and
    /// readiness polling.
    pub connect: Duration,
    /// Bound on a `-V` version-probe subprocess.
    pub version_probe: Duration,
    /// How long to wait for a freshly spawned daemon to start listening.
    pub daemon_ready: Duration,
    /// Pause between successive TERM signals during disposal.
    pub term_pause: Duration,
    /// Grace period after the final TERM before escalating to KILL.
    pub kill_grace: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            probe: Duration::from_secs(10),
            connect: Duration::from_millis(250),
            version_probe: Duration::from_secs(2),
            daemon_ready: Duration::from_secs(5),
            term_pause: Duration::from_millis(100),
            kill_grace: Duration::from_millis(500),
        }
    }
}

/// Configuration for acquiring an SSH endpoint.
#[derive(Debug, Clone)]
pub struct FixtureConfig {
    /// Login name override. `None` means the invoking user's name.
    pub username: Option<String>,
    /// Private per-run filesystem root holding keys and daemon artifacts.
    pub private_root: PathBuf,
    /// Ordered backend chain; first success wins, order is never changed.
    pub backends: Vec<BackendKind>,
    /// Explicit remote target, normally injected via [`TARGET_ENV_VAR`].
    pub remote_target: Option<SshEndpoint>,
    /// Timeouts for all bounded waits.
    pub timeouts: TimeoutConfig,
}

impl Default for FixtureConfig {
    fn default() -> Self {
        Self {
            username: None,
            private_root: std::env::temp_dir().join("ssh-fixture"),
            backends: vec![
                BackendKind::ExplicitRemote,
                BackendKind::LocalDaemon,
                BackendKind::EphemeralDaemon,
            ],
            remote_target: None,
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl FixtureConfig {
    /// Build the default configuration, honoring [`TARGET_ENV_VAR`].
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the override variable is present
    /// but does not parse as a target URI.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(uri) = std::env::var(TARGET_ENV_VAR) {
            let target = SshEndpoint::parse_uri(&uri)?;
            tracing::debug!(%target, "using explicit remote target from {TARGET_ENV_VAR}");
            config.remote_target = Some(target);
            // The override disables discovery and provisioning entirely.
            config.backends = vec![BackendKind::ExplicitRemote];
        }
        Ok(config)
    }

    /// Validate field combinations.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an empty backend chain, or an
    /// ExplicitRemote entry with no target to probe.
    pub fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            return Err(ProvisionError::Config {
                message: "backend chain is empty".to_string(),
            });
        }
        if self.backends.contains(&BackendKind::ExplicitRemote) && self.remote_target.is_none() {
            return Err(ProvisionError::Config {
                message: "ExplicitRemote backend configured without a remote target".to_string(),
            });
        }
        Ok(())
    }

    /// Resolve the login name to use: the override, else the invoking
    /// user's name.
    ///
    /// # Errors
    ///
    /// This is the one fatal condition in the crate: with no override and
    /// no determinable user identity there is no default SSH login name.
    pub fn effective_username(&self) -> Result<String> {
        if let Some(name) = &self.username {
            if !name.is_empty() {
                return Ok(name.clone());
            }
        }
        let name = whoami::username();
        if name.is_empty() {
            return Err(ProvisionError::Config {
                message: "cannot determine invoking user's name and no username override given"
                    .to_string(),
            });
        }
        Ok(name)
    }

    /// Directory holding generated key material.
    #[must_use]
    pub fn keys_dir(&self) -> PathBuf {
        self.private_root.join("keys")
    }

    /// Working directory for a daemon owned by the given process.
    #[must_use]
    pub fn run_dir(&self, pid: u32) -> PathBuf {
        self.private_root.join("run").join(pid.to_string())
    }

    /// Archive location a disposed daemon's working directory is renamed to.
    #[must_use]
    pub fn archive_dir(&self) -> PathBuf {
        self.private_root.join("run").join("last")
    }

    /// Replace the private root (used by tests to sandbox a run).
    #[must_use]
    pub fn with_private_root(mut self, root: impl AsRef<Path>) -> Self {
        self.private_root = root.as_ref().to_path_buf();
        self
    }

    /// Replace the backend chain.
    #[must_use]
    pub fn with_backends(mut self, backends: Vec<BackendKind>) -> Self {
        self.backends = backends;
        self
    }

    /// Set the login name override.
    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Credential;

    #[test]
    fn default_chain_order_is_remote_local_ephemeral() {
        let config = FixtureConfig::default();
        assert_eq!(
            config.backends,
            vec![
                BackendKind::ExplicitRemote,
                BackendKind::LocalDaemon,
                BackendKind::EphemeralDaemon,
            ]
        );
    }

    #[test]
    fn empty_chain_is_rejected() {
        let config = FixtureConfig::default().with_backends(vec![]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn explicit_remote_requires_target() {
        let config = FixtureConfig::default().with_backends(vec![BackendKind::ExplicitRemote]);
        assert!(config.validate().is_err());

        let mut config = config;
        config.remote_target = Some(
            SshEndpoint::new(
                "example.com",
                22,
                "alice",
                Credential::Password("pw".to_string()),
            )
            .unwrap(),
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn username_override_wins() {
        let config = FixtureConfig::default().with_username("tester");
        assert_eq!(config.effective_username().unwrap(), "tester");
    }

    #[test]
    fn layout_is_rooted_under_private_root() {
        let config = FixtureConfig::default().with_private_root("/tmp/sandbox");
        assert_eq!(config.keys_dir(), PathBuf::from("/tmp/sandbox/keys"));
        assert_eq!(config.run_dir(42), PathBuf::from("/tmp/sandbox/run/42"));
        assert_eq!(config.archive_dir(), PathBuf::from("/tmp/sandbox/run/last"));
    }
}
