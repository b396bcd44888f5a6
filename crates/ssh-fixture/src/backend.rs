//! Backend selection.
//!
//! A backend is one strategy for obtaining a usable SSH endpoint. The
//! selector tries the configured chain strictly in order and stops at the
//! first backend that produces a successfully probed connection. A backend
//! never errors past its boundary: it yields a handle or nothing, and the
//! selector treats nothing as "try the next one".

pub mod ephemeral;
pub mod local;
pub mod remote;

use std::fmt;

use tracing::{debug, info};

use crate::config::FixtureConfig;
use crate::error::{ProvisionError, Result};
use crate::handle::ServerHandle;

/// Identifier for one backend strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// An externally supplied target URI.
    ExplicitRemote,
    /// A system SSH daemon already listening on the standard port.
    LocalDaemon,
    /// A private daemon provisioned for this test run.
    EphemeralDaemon,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ExplicitRemote => "explicit-remote",
            Self::LocalDaemon => "local-daemon",
            Self::EphemeralDaemon => "ephemeral-daemon",
        })
    }
}

/// Capability interface shared by the backend variants.
///
/// `acquire` returns a populated handle or `None`; internal failures are
/// logged and absorbed at this boundary.
pub trait Backend {
    /// Try to produce a probed endpoint for `username`.
    fn acquire(
        &self,
        config: &FixtureConfig,
        username: &str,
    ) -> impl Future<Output = Option<ServerHandle>>;
}

/// Acquire a working SSH endpoint by walking the configured chain.
///
/// # Errors
///
/// Returns [`ProvisionError::NoBackendAvailable`] when every backend is
/// exhausted; callers should treat that as "skip dependent tests". A
/// configuration error or an undeterminable login name (with no override)
/// is the only other failure mode.
pub async fn acquire(config: &FixtureConfig) -> Result<ServerHandle> {
    config.validate()?;
    let username = config.effective_username()?;

    for (index, kind) in config.backends.iter().enumerate() {
        debug!(backend = %kind, index, "trying backend");
        let acquired = match kind {
            BackendKind::ExplicitRemote => {
                remote::ExplicitRemote.acquire(config, &username).await
            }
            BackendKind::LocalDaemon => local::LocalDaemon.acquire(config, &username).await,
            BackendKind::EphemeralDaemon => {
                ephemeral::EphemeralDaemon.acquire(config, &username).await
            }
        };
        if let Some(handle) = acquired {
            info!(backend = %kind, endpoint = %handle.endpoint(), "backend produced a handle");
            return Ok(handle);
        }
        debug!(backend = %kind, "backend yielded no handle");
    }

    Err(ProvisionError::NoBackendAvailable {
        tried: config.backends.len(),
    })
}
