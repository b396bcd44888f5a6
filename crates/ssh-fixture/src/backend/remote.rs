//! Explicit remote target backend.
//!
//! When a target URI is supplied (normally via the environment override),
//! local-daemon discovery and ephemeral provisioning are skipped entirely:
//! only the given target is probed, trying its password (if one was
//! supplied) and then each discovered user key in turn.

use std::net::ToSocketAddrs;

use tracing::{debug, warn};

use crate::backend::{local::discover_user_keys, Backend};
use crate::config::FixtureConfig;
use crate::endpoint::{Credential, SshEndpoint};
use crate::error::{ProvisionError, Result};
use crate::handle::ServerHandle;
use crate::probe::ConnectivityProbe;
use crate::resolver::ExecutableResolver;

/// Backend for an externally supplied target.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExplicitRemote;

impl Backend for ExplicitRemote {
    async fn acquire(&self, config: &FixtureConfig, _username: &str) -> Option<ServerHandle> {
        let Some(target) = &config.remote_target else {
            debug!("no explicit remote target configured");
            return None;
        };

        if let Err(err) = check_reachable(config, target).await {
            // Aborts this backend, never the run.
            warn!(target = %target, %err, "explicit remote target rejected");
            return None;
        }

        let resolver = ExecutableResolver::new(config.timeouts.version_probe);
        let probe = ConnectivityProbe::new(resolver, config.timeouts);

        // The supplied credential first, then discovered keys.
        let mut candidates = vec![target.credential.clone()];
        for key in discover_user_keys() {
            let candidate = Credential::PrivateKey(key);
            if !candidates.contains(&candidate) {
                candidates.push(candidate);
            }
        }

        for credential in candidates {
            let endpoint = SshEndpoint {
                credential,
                ..target.clone()
            };
            match probe.probe(&endpoint, "true").await {
                Ok(()) => return Some(ServerHandle::remote(endpoint)),
                Err(err) => {
                    debug!(target = %endpoint, %err, "remote target rejected credential");
                }
            }
        }
        None
    }
}

/// TCP-level reachability check with the configured connect timeout.
///
/// # Errors
///
/// [`ProvisionError::ProtocolMismatch`] when the target does not resolve
/// or does not accept a TCP connection; the target is rendered redacted.
async fn check_reachable(config: &FixtureConfig, target: &SshEndpoint) -> Result<()> {
    let mismatch = |reason: &str| ProvisionError::ProtocolMismatch {
        target: target.to_uri_redacted(),
        reason: reason.to_string(),
    };
    let address = format!("{}:{}", target.host, target.port);
    let addr = address
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| mismatch("address does not resolve"))?;
    match tokio::time::timeout(
        config.timeouts.connect.max(std::time::Duration::from_secs(1)),
        tokio::net::TcpStream::connect(addr),
    )
    .await
    {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(_)) => Err(mismatch("TCP connect failed")),
        Err(_) => Err(mismatch("TCP connect timed out")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;

    /// A target nothing listens on surfaces as a `ProtocolMismatch` with
    /// the secret redacted out of the rendered target.
    #[tokio::test]
    async fn unreachable_target_reports_protocol_mismatch() {
        let config = FixtureConfig::default();
        let target = SshEndpoint::new(
            "127.0.0.1",
            1, // reserved port, nothing listens here
            "tester",
            Credential::Password("s3cret".to_string()),
        )
        .unwrap();

        let err = check_reachable(&config, &target).await.unwrap_err();
        assert!(matches!(err, ProvisionError::ProtocolMismatch { .. }));
        let rendered = err.to_string();
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("*****"));
    }

    /// With an explicit remote target set, ephemeral provisioning must
    /// never run: no working directory may appear under the private root.
    #[tokio::test]
    async fn unreachable_target_creates_no_working_directory() {
        let root = tempfile::tempdir().unwrap();
        let mut config = FixtureConfig::default()
            .with_private_root(root.path())
            .with_backends(vec![BackendKind::ExplicitRemote]);
        config.remote_target = Some(
            SshEndpoint::new(
                "127.0.0.1",
                1, // reserved port, nothing listens here
                "tester",
                Credential::Password("wrong".to_string()),
            )
            .unwrap(),
        );

        let err = crate::backend::acquire(&config).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::ProvisionError::NoBackendAvailable { tried: 1 }
        ));
        assert!(!root.path().join("run").exists());
        assert!(!root.path().join("keys").exists());
    }
}
