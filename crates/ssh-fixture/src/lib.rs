//! ssh-fixture: provision a working SSH endpoint for a test run.
//!
//! Given a test process that needs a real SSH server to talk to, this crate
//! walks a backend chain until one produces a probed, usable endpoint:
//!
//! 1. **Explicit remote**: a target URI supplied via the
//!    `SSH_FIXTURE_TARGET` environment variable.
//! 2. **Local daemon**: the machine's own sshd on port 22, authenticated
//!    with keys discovered under `~/.ssh`.
//! 3. **Ephemeral daemon**: a private sshd booted solely for this test
//!    process, with generated keys, a synthesized configuration, and a
//!    freshly allocated loopback port, torn down when the handle is closed.
//!
//! Every candidate endpoint is validated by actually executing a trivial
//! remote command under the candidate credential; password authentication
//! is driven through a pseudo-terminal. All waits are bounded and stuck
//! subprocesses are cancelled with escalating signals.
//!
//! # Example
//!
//! ```ignore
//! use ssh_fixture::{acquire, FixtureConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = FixtureConfig::from_env().unwrap();
//!     match acquire(&config).await {
//!         Ok(handle) => {
//!             println!("endpoint: {}", handle.endpoint());
//!             handle.close().await;
//!         }
//!         // "Skip dependent tests", not a defect.
//!         Err(err) => eprintln!("no SSH backend available: {err}"),
//!     }
//! }
//! ```

pub mod backend;
pub mod config;
pub mod daemon;
pub mod endpoint;
pub mod error;
pub mod handle;
pub mod keys;
pub mod port;
pub mod probe;
pub mod resolver;

#[cfg(unix)]
pub mod pty;

pub use backend::{acquire, Backend, BackendKind};
pub use config::{FixtureConfig, TimeoutConfig, TARGET_ENV_VAR};
pub use daemon::{DaemonState, DaemonSupervisor, SshdConfig, SshdLogLevel};
pub use endpoint::{AuthMethod, Credential, ProbeAttempt, SshEndpoint, REDACTED};
pub use error::{ProvisionError, Result};
pub use handle::ServerHandle;
pub use keys::{KeyMaterialProvisioner, KeyPair};
pub use port::PortAllocator;
pub use probe::{ConnectivityProbe, PromptWatcher};
pub use resolver::ExecutableResolver;
