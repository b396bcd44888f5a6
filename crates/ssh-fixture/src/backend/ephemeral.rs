//! Ephemeral daemon backend.
//!
//! Provisions a private sshd for the duration of one test process: key
//! material, an unused loopback port, a generated configuration, and a
//! supervised subprocess that the resulting handle exclusively owns.
//!
//! Port allocation is advisory, so a daemon that dies immediately after
//! spawn (a lost bind race) is retried with a freshly allocated port a
//! bounded number of times; the daemon's own bind failure stays the final
//! authority.

use tracing::{debug, warn};

use crate::backend::Backend;
use crate::config::FixtureConfig;
use crate::daemon::{DaemonSupervisor, SshdConfig, SshdLogLevel};
use crate::endpoint::{Credential, SshEndpoint};
use crate::handle::ServerHandle;
use crate::keys::KeyMaterialProvisioner;
use crate::port::PortAllocator;
use crate::probe::ConnectivityProbe;
use crate::resolver::ExecutableResolver;

/// Minimum sshd major version this fixture is known to work with.
const MIN_SSHD_MAJOR: u32 = 7;

/// Spawn attempts before giving up on the advisory-port race.
const SPAWN_ATTEMPTS: u32 = 3;

/// Backend that stands up a private daemon instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct EphemeralDaemon;

impl Backend for EphemeralDaemon {
    async fn acquire(&self, config: &FixtureConfig, username: &str) -> Option<ServerHandle> {
        let resolver = ExecutableResolver::new(config.timeouts.version_probe);

        // Resolve executables before touching the filesystem: an
        // unresolvable sshd must leave no working directory behind.
        let sshd = match resolver.resolve_min_version("sshd", MIN_SSHD_MAJOR).await {
            Ok(path) => path,
            Err(err) => {
                warn!(%err, "cannot provision ephemeral daemon");
                return None;
            }
        };

        let keys_dir = config.keys_dir();
        let provisioner = KeyMaterialProvisioner::new(resolver.clone());
        let host_key = match provisioner.ensure_keypair(&keys_dir.join("host_key")).await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(%err, "host key provisioning failed");
                return None;
            }
        };
        let user_key = match provisioner.ensure_keypair(&keys_dir.join("user_key")).await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(%err, "user key provisioning failed");
                return None;
            }
        };

        let allocator = PortAllocator::new(config.timeouts.connect);
        let probe = ConnectivityProbe::new(resolver, config.timeouts);
        let work_dir = config.run_dir(std::process::id());

        for attempt in 0..SPAWN_ATTEMPTS {
            let port = match allocator.find_unused_port().await {
                Ok(port) => port,
                Err(err) => {
                    warn!(%err, "port allocation failed");
                    return None;
                }
            };

            let mut supervisor = DaemonSupervisor::new(
                work_dir.clone(),
                config.archive_dir(),
                config.timeouts,
            );
            let sshd_config = SshdConfig {
                port,
                host_key: host_key.private_path.clone(),
                authorized_keys: user_key.public_path.clone(),
                allow_user: username.to_string(),
                pid_file: work_dir.join("sshd.pid"),
                log_level: SshdLogLevel::Info,
            };
            if let Err(err) = supervisor.configure(&sshd_config) {
                warn!(%err, "writing daemon configuration failed");
                return None;
            }

            match supervisor.start(&sshd).await {
                Ok(()) => {}
                Err(err) => {
                    debug!(%err, attempt, port, "daemon spawn failed, retrying with a new port");
                    supervisor.shutdown().await;
                    continue;
                }
            }

            if !wait_until_listening(&allocator, config, port, &mut supervisor).await {
                warn!(port, attempt, "daemon never started listening");
                supervisor.shutdown().await;
                continue;
            }

            let endpoint = match SshEndpoint::new(
                "127.0.0.1",
                port,
                username,
                Credential::PrivateKey(user_key.private_path.clone()),
            ) {
                Ok(endpoint) => endpoint,
                Err(err) => {
                    warn!(%err, "could not build ephemeral endpoint");
                    supervisor.shutdown().await;
                    return None;
                }
            };

            match probe.probe(&endpoint, "true").await {
                Ok(()) => return Some(ServerHandle::with_daemon(endpoint, supervisor)),
                Err(err) => {
                    warn!(target = %endpoint, %err, "probe of ephemeral daemon failed");
                    supervisor.shutdown().await;
                    return None;
                }
            }
        }

        warn!(attempts = SPAWN_ATTEMPTS, "ephemeral daemon never survived spawn");
        None
    }
}

/// Poll the daemon's port until it accepts connections, the readiness
/// bound elapses, or the daemon dies.
async fn wait_until_listening(
    allocator: &PortAllocator,
    config: &FixtureConfig,
    port: u16,
    supervisor: &mut DaemonSupervisor,
) -> bool {
    let deadline = tokio::time::Instant::now() + config.timeouts.daemon_ready;
    while tokio::time::Instant::now() < deadline {
        if !supervisor.is_running() {
            return false;
        }
        if allocator.is_listening(port).await {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    false
}
